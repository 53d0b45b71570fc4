//! Per-hop statistics.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

use crate::probe::{MplsLabel, ResponseKind};
use crate::state::nat::NatVerdict;

/// Streaming RTT statistics; memory stays constant regardless of sample count
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RttStats {
    pub count: u64,
    #[serde(with = "opt_duration_micros")]
    pub min: Option<Duration>,
    #[serde(with = "opt_duration_micros")]
    pub max: Option<Duration>,
    /// Welford running mean, microseconds
    pub mean_us: f64,
    /// Welford sum of squared deviations, microseconds squared
    pub m2: f64,
    /// RFC 3550 smoothed jitter, microseconds
    pub jitter_us: f64,
    #[serde(skip)]
    last: Option<Duration>,
}

impl RttStats {
    pub fn record(&mut self, rtt: Duration) {
        self.count += 1;
        let micros = rtt.as_micros() as f64;

        self.min = Some(self.min.map_or(rtt, |m| m.min(rtt)));
        self.max = Some(self.max.map_or(rtt, |m| m.max(rtt)));

        let delta = micros - self.mean_us;
        self.mean_us += delta / self.count as f64;
        self.m2 += delta * (micros - self.mean_us);

        if let Some(last) = self.last {
            let diff = (micros - last.as_micros() as f64).abs();
            self.jitter_us += (diff - self.jitter_us) / 16.0;
        }
        self.last = Some(rtt);
    }

    pub fn mean(&self) -> Option<Duration> {
        (self.count > 0).then(|| Duration::from_micros(self.mean_us as u64))
    }

    /// Population variance in microseconds squared
    pub fn variance(&self) -> f64 {
        if self.count < 2 { 0.0 } else { self.m2 / self.count as f64 }
    }

    pub fn stddev(&self) -> Duration {
        Duration::from_micros(self.variance().sqrt() as u64)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_micros(self.jitter_us as u64)
    }
}

/// Stats for a single responder at a given hop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponderStats {
    pub addr: IpAddr,
    pub received: u64,
    /// Round in which this responder was first seen
    pub first_round: u32,
    pub rtt: RttStats,
}

/// One (flow, hop-limit) cell of the hop table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopRecord {
    pub ttl: u8,
    pub sent: u64,
    pub received: u64,
    pub timeouts: u64,
    /// Distinct responders in first-seen order; never shrinks
    pub responders: Vec<ResponderStats>,
    /// Most frequently seen responder
    pub primary: Option<IpAddr>,
    pub rtt: RttStats,
    /// Sticky: once set it stays set for the session
    pub nat_detected: bool,
    /// Evidence that first set `nat_detected`
    pub nat_reason: Option<NatVerdict>,
    /// Label stack from the most recent response that carried one
    pub mpls: Vec<MplsLabel>,
    pub last_kind: Option<ResponseKind>,
}

impl HopRecord {
    pub fn new(ttl: u8) -> Self {
        Self {
            ttl,
            sent: 0,
            received: 0,
            timeouts: 0,
            responders: Vec::new(),
            primary: None,
            rtt: RttStats::default(),
            nat_detected: false,
            nat_reason: None,
            mpls: Vec::new(),
            last_kind: None,
        }
    }

    pub fn record_sent(&mut self) {
        self.sent += 1;
    }

    pub fn record_answer(&mut self, addr: IpAddr, rtt: Duration, kind: ResponseKind, round: u32) {
        self.received += 1;
        self.rtt.record(rtt);
        self.last_kind = Some(kind);

        let idx = match self.responders.iter().position(|r| r.addr == addr) {
            Some(idx) => idx,
            None => {
                self.responders.push(ResponderStats {
                    addr,
                    received: 0,
                    first_round: round,
                    rtt: RttStats::default(),
                });
                self.responders.len() - 1
            }
        };
        let stats = &mut self.responders[idx];
        stats.received += 1;
        stats.rtt.record(rtt);

        self.primary = self
            .responders
            .iter()
            .max_by_key(|r| r.received)
            .map(|r| r.addr);
    }

    pub fn record_timeout(&mut self) {
        self.timeouts += 1;
    }

    pub fn mark_nat(&mut self, verdict: NatVerdict) {
        if !self.nat_detected {
            self.nat_detected = true;
            self.nat_reason = Some(verdict);
        }
    }

    pub fn set_mpls(&mut self, labels: &[MplsLabel]) {
        self.mpls = labels.to_vec();
    }

    pub fn addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.responders.iter().map(|r| r.addr)
    }

    pub fn responder(&self, addr: IpAddr) -> Option<&ResponderStats> {
        self.responders.iter().find(|r| r.addr == addr)
    }

    /// Loss over resolved probes only; probes still in flight do not count
    pub fn loss_pct(&self) -> f64 {
        let resolved = self.received + self.timeouts;
        if resolved == 0 {
            0.0
        } else {
            self.timeouts as f64 * 100.0 / resolved as f64
        }
    }
}

mod opt_duration_micros {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_micros() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_micros))
    }
}
