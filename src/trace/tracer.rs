//! Session wiring and teardown.

use std::net::IpAddr;
use std::sync::Arc;
use std::thread::JoinHandle as ThreadHandle;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::probe::{Decoder, Encoder, FlowFields, FlowPlan, Transport, detect_source_ip, open_transport};
use crate::state::{HopTable, SessionStatus, Snapshot};
use crate::trace::correlator::Correlator;
use crate::trace::engine::ProbeScheduler;
use crate::trace::pending::{PendingIndex, PendingProbe};
use crate::trace::receiver::{Listener, run_sweeper, spawn_listener};

/// Handle to a running session
pub struct TraceHandle {
    plan: FlowPlan,
    table: Arc<HopTable>,
    stop: CancellationToken,
    supervisor: JoinHandle<Result<()>>,
}

impl TraceHandle {
    /// Latest published hop table
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.table.snapshot()
    }

    /// Hop table as of the last fully resolved round
    pub fn round_snapshot(&self) -> Arc<Snapshot> {
        self.table.round_snapshot()
    }

    /// Shared hop table, for readers that outlive a borrow of the handle
    pub fn table(&self) -> Arc<HopTable> {
        self.table.clone()
    }

    pub fn flows(&self) -> &[FlowFields] {
        self.plan.flows()
    }

    /// Stop emitting probes; outstanding ones still resolve or time out
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Wait for teardown and return the final snapshot
    pub async fn wait(self) -> Result<Arc<Snapshot>> {
        self.supervisor.await.map_err(|e| Error::Task(e.to_string()))??;
        Ok(self.table.snapshot())
    }
}

/// Start a session on real sockets. Must be called inside a tokio runtime.
pub fn start(config: SessionConfig) -> Result<TraceHandle> {
    config.validate()?;
    let plan = FlowPlan::new(&config);
    let src = detect_source_ip(config.target)?;
    let transport = open_transport(&config, &plan)?;
    start_with(config, src, transport)
}

/// Start a session on a caller-supplied transport.
///
/// `src` is the local address used in checksum pseudo-headers.
pub fn start_with(config: SessionConfig, src: IpAddr, transport: Transport) -> Result<TraceHandle> {
    config.validate()?;
    let plan = FlowPlan::new(&config);
    let pending = Arc::new(PendingIndex::new(config.flows));
    let table = Arc::new(HopTable::new(&config));
    let stop = CancellationToken::new();
    let shutdown = CancellationToken::new();

    let decoder = Decoder::new(&config, plan.carrier());
    let correlator = Arc::new(Correlator::new(plan.clone(), config.target, pending.clone()).with_source(src));
    let mut listeners = Vec::with_capacity(transport.sources.len());
    for source in transport.sources {
        let listener = Listener::new(
            source,
            decoder.clone(),
            correlator.clone(),
            table.clone(),
            shutdown.clone(),
        );
        match spawn_listener(listener) {
            Ok(handle) => listeners.push(handle),
            Err(e) => {
                shutdown.cancel();
                return Err(Error::Task(format!("cannot spawn listener: {e}")));
            }
        }
    }

    let sweeper = tokio::spawn(run_sweeper(pending.clone(), table.clone(), shutdown.clone()));
    let scheduler = ProbeScheduler::new(
        config.clone(),
        Encoder::new(&config, plan.clone(), src),
        transport.sender,
        pending.clone(),
        table.clone(),
        stop.clone(),
    );
    let scheduler = tokio::spawn(scheduler.run());

    info!(
        target = %config.target,
        protocol = ?config.protocol,
        algorithm = ?config.algorithm,
        flows = config.flows,
        "session started"
    );

    let supervisor = tokio::spawn(supervise(Teardown {
        config,
        scheduler,
        sweeper,
        listeners,
        pending,
        table: table.clone(),
        stop: stop.clone(),
        shutdown,
    }));

    Ok(TraceHandle {
        plan,
        table,
        stop,
        supervisor,
    })
}

struct Teardown {
    config: SessionConfig,
    scheduler: JoinHandle<u32>,
    sweeper: JoinHandle<()>,
    listeners: Vec<ThreadHandle<Result<()>>>,
    pending: Arc<PendingIndex>,
    table: Arc<HopTable>,
    stop: CancellationToken,
    shutdown: CancellationToken,
}

/// Wait for the scheduler, drain, stop listeners, force-expire leftovers
async fn supervise(t: Teardown) -> Result<()> {
    let scheduled = t.scheduler.await.map_err(|e| Error::Task(e.to_string()));
    t.stop.cancel();
    t.table.set_status(SessionStatus::Draining);

    let deadline = Instant::now() + t.config.drain_deadline();
    loop {
        let notified = t.pending.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if t.pending.outstanding() == 0 {
            break;
        }
        tokio::select! {
            _ = &mut notified => {}
            _ = tokio::time::sleep_until(deadline.into()) => break,
        }
    }

    t.shutdown.cancel();
    if let Err(e) = t.sweeper.await {
        error!(error = %e, "sweeper task failed");
    }

    let mut first_error = None;
    for handle in t.listeners {
        let joined = tokio::task::spawn_blocking(move || handle.join())
            .await
            .map_err(|e| Error::Task(e.to_string()))
            .and_then(|r| r.map_err(|_| Error::Listener("thread panicked".to_string())))
            .and_then(|r| r);
        if let Err(e) = joined {
            error!(error = %e, "listener failed");
            first_error.get_or_insert(e);
        }
    }

    // Nothing can match any more; whatever is left is lost
    let leftover = t.pending.drain_all();
    if !leftover.is_empty() {
        debug!(count = leftover.len(), "force-expiring outstanding probes");
        t.table.apply(leftover.iter().map(PendingProbe::timed_out));
        t.pending.settle(leftover.iter().map(|p| p.round));
    }
    t.table.set_status(SessionStatus::Terminated);

    let rounds = scheduled?;
    info!(rounds, "session terminated");
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
