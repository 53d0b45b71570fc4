//! Address labelling (reverse DNS, ASN).
//!
//! Runs beside the probing engine and never blocks it: the worker reads
//! responder addresses out of snapshots and fills a [`LabelCache`] that
//! consumers join against at render time.

pub mod dns;

use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::state::Snapshot;

pub use dns::DnsResolver;

/// Maximum concurrent lookups per worker tick
const MAX_CONCURRENT_LOOKUPS: usize = 10;

const WORKER_TICK: Duration = Duration::from_millis(500);

/// Origin AS of an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsnLabel {
    pub number: u32,
    pub name: String,
    pub prefix: Option<String>,
}

/// Lookup state of one address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Pending,
    Resolved {
        hostname: Option<String>,
        asn: Option<AsnLabel>,
    },
    /// Every lookup failed
    Unresolved,
}

impl Resolution {
    pub fn hostname(&self) -> Option<&str> {
        match self {
            Self::Resolved { hostname, .. } => hostname.as_deref(),
            _ => None,
        }
    }

    pub fn asn(&self) -> Option<&AsnLabel> {
        match self {
            Self::Resolved { asn, .. } => asn.as_ref(),
            _ => None,
        }
    }
}

/// Resolution service
pub trait Resolve: Send + Sync + 'static {
    fn resolve(&self, addr: IpAddr) -> impl Future<Output = Resolution> + Send;
}

/// Resolved labels keyed by address
#[derive(Debug, Default)]
pub struct LabelCache {
    entries: RwLock<HashMap<IpAddr, Resolution>>,
}

impl LabelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, addr: IpAddr) -> Resolution {
        self.entries.read().get(&addr).cloned().unwrap_or(Resolution::Pending)
    }

    pub fn insert(&self, addr: IpAddr, resolution: Resolution) {
        self.entries.write().insert(addr, resolution);
    }

    /// Addresses not looked up yet
    pub fn missing<I>(&self, addrs: I) -> Vec<IpAddr>
    where
        I: IntoIterator<Item = IpAddr>,
    {
        let entries = self.entries.read();
        let mut missing: Vec<IpAddr> = addrs.into_iter().filter(|a| !entries.contains_key(a)).collect();
        missing.sort();
        missing.dedup();
        missing
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Background worker: resolve every new responder address seen in snapshots
pub async fn run_resolution_worker<R, F>(
    resolver: Arc<R>,
    snapshots: F,
    cache: Arc<LabelCache>,
    cancel: CancellationToken,
) where
    R: Resolve,
    F: Fn() -> Arc<Snapshot> + Send,
{
    let mut interval = tokio::time::interval(WORKER_TICK);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let snapshot = snapshots();
                let batch: Vec<IpAddr> = cache
                    .missing(snapshot.addresses())
                    .into_iter()
                    .take(MAX_CONCURRENT_LOOKUPS)
                    .collect();
                if batch.is_empty() {
                    continue;
                }

                let lookups = batch.iter().map(|&addr| {
                    let resolver = resolver.clone();
                    async move { (addr, resolver.resolve(addr).await) }
                });
                for (addr, resolution) in join_all(lookups).await {
                    debug!(%addr, ?resolution, "resolved");
                    cache.insert(addr, resolution);
                }
            }
        }
    }
}

/// Strip control characters so remote-supplied names cannot inject terminal escapes
pub(crate) fn sanitize_display(s: &str) -> String {
    s.chars().filter(|c| !c.is_control()).collect()
}
