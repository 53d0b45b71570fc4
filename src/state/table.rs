//! The hop table: an arena of `flows × max_ttl` hop records.
//!
//! Writers lock a mutex, apply a whole batch of events, and publish a fresh
//! immutable [`Snapshot`]. Readers load the latest snapshot without taking
//! the lock, so they never see half of a batch and never stall the writer.
//! Sends are the exception: they are recorded as they happen and published
//! together.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SessionConfig;
use crate::probe::{MplsLabel, ResponseKind};
use crate::state::hop::HopRecord;
use crate::state::nat::NatVerdict;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    /// Emission stopped; late responses are still collected
    Draining,
    Terminated,
}

/// A correlated answer ready for aggregation
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub flow: u16,
    pub ttl: u8,
    pub round: u32,
    pub responder: IpAddr,
    pub rtt: Duration,
    pub kind: ResponseKind,
    pub nat: Option<NatVerdict>,
    pub mpls: Option<Vec<MplsLabel>>,
}

/// One update to the hop table
#[derive(Debug, Clone, PartialEq)]
pub enum HopEvent {
    Sent { flow: u16, ttl: u8 },
    SendFailed { flow: u16, ttl: u8 },
    Answered(Answer),
    /// No answer before the deadline, or one that arrived after it
    TimedOut { flow: u16, ttl: u8, round: u32 },
    /// Inbound packet that did not parse
    DecodeDiscarded,
    /// Parsed response with no outstanding probe
    Unmatched,
}

impl HopEvent {
    /// Round of the probe this event resolves, if it resolves one
    pub fn resolved_round(&self) -> Option<u32> {
        match self {
            HopEvent::Answered(answer) => Some(answer.round),
            HopEvent::TimedOut { round, .. } => Some(*round),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub sent: u64,
    pub send_failures: u64,
    pub answered: u64,
    pub timed_out: u64,
    pub decode_discarded: u64,
    pub unmatched: u64,
}

/// Hop records of one flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub flow: u16,
    pub target_reached: bool,
    /// Lowest hop-limit at which the target answered
    pub target_ttl: Option<u8>,
    /// Hops 1..=target_ttl (or max_ttl while the target is unreached)
    pub hops: Vec<HopRecord>,
}

impl FlowSnapshot {
    pub fn hop(&self, ttl: u8) -> Option<&HopRecord> {
        ttl.checked_sub(1).and_then(|i| self.hops.get(i as usize))
    }
}

/// Point-in-time copy of the whole table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub target: IpAddr,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub taken_at: DateTime<Utc>,
    /// Round currently being sent (or last sent)
    pub round: u32,
    pub rounds_completed: u32,
    pub flows: Vec<FlowSnapshot>,
    pub counters: Counters,
}

impl Snapshot {
    pub fn flow(&self, flow: u16) -> Option<&FlowSnapshot> {
        self.flows.get(flow as usize)
    }

    /// Every responder address in the table, possibly repeated
    pub fn addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.flows
            .iter()
            .flat_map(|f| f.hops.iter())
            .flat_map(|h| h.addresses())
    }
}

struct TableState {
    target: IpAddr,
    max_ttl: u8,
    flows: u16,
    hops: Vec<HopRecord>,
    target_ttl: Vec<Option<u8>>,
    counters: Counters,
    status: SessionStatus,
    started_at: DateTime<Utc>,
    round: u32,
    rounds_completed: u32,
}

impl TableState {
    fn hop_mut(&mut self, flow: u16, ttl: u8) -> Option<&mut HopRecord> {
        if flow >= self.flows || ttl == 0 || ttl > self.max_ttl {
            return None;
        }
        let idx = flow as usize * self.max_ttl as usize + (ttl as usize - 1);
        self.hops.get_mut(idx)
    }

    fn apply(&mut self, event: HopEvent) {
        match event {
            HopEvent::Sent { flow, ttl } => {
                self.counters.sent += 1;
                if let Some(hop) = self.hop_mut(flow, ttl) {
                    hop.record_sent();
                }
            }
            HopEvent::SendFailed { .. } => self.counters.send_failures += 1,
            HopEvent::Answered(answer) => {
                self.counters.answered += 1;
                let target = self.target;
                let Some(hop) = self.hop_mut(answer.flow, answer.ttl) else {
                    return;
                };
                hop.record_answer(answer.responder, answer.rtt, answer.kind, answer.round);
                if let Some(verdict) = answer.nat {
                    hop.mark_nat(verdict);
                }
                if let Some(labels) = &answer.mpls {
                    hop.set_mpls(labels);
                }
                // Hop-limit alone never decides arrival; ECMP paths differ in length
                if answer.responder == target {
                    let slot = &mut self.target_ttl[answer.flow as usize];
                    *slot = Some(slot.map_or(answer.ttl, |t| t.min(answer.ttl)));
                }
            }
            HopEvent::TimedOut { flow, ttl, .. } => {
                self.counters.timed_out += 1;
                if let Some(hop) = self.hop_mut(flow, ttl) {
                    hop.record_timeout();
                }
            }
            HopEvent::DecodeDiscarded => self.counters.decode_discarded += 1,
            HopEvent::Unmatched => self.counters.unmatched += 1,
        }
    }

    fn snapshot(&self) -> Snapshot {
        let per_flow = self.max_ttl as usize;
        let flows = self
            .hops
            .chunks(per_flow)
            .zip(&self.target_ttl)
            .enumerate()
            .map(|(flow, (hops, target_ttl))| {
                let limit = target_ttl.unwrap_or(self.max_ttl) as usize;
                FlowSnapshot {
                    flow: flow as u16,
                    target_reached: target_ttl.is_some(),
                    target_ttl: *target_ttl,
                    hops: hops[..limit.min(hops.len())].to_vec(),
                }
            })
            .collect();
        Snapshot {
            target: self.target,
            status: self.status,
            started_at: self.started_at,
            taken_at: Utc::now(),
            round: self.round,
            rounds_completed: self.rounds_completed,
            flows,
            counters: self.counters,
        }
    }
}

/// Shared hop table. Cheap to read from any thread.
pub struct HopTable {
    state: Mutex<TableState>,
    latest: ArcSwap<Snapshot>,
    /// Published only when a round completes
    last_round: ArcSwap<Snapshot>,
}

impl HopTable {
    pub fn new(config: &SessionConfig) -> Self {
        let flows = config.flows.max(1);
        let max_ttl = config.max_ttl.max(1);
        let hops = (0..flows)
            .flat_map(|_| (1..=max_ttl).map(HopRecord::new))
            .collect();
        let state = TableState {
            target: config.target,
            max_ttl,
            flows,
            hops,
            target_ttl: vec![None; flows as usize],
            counters: Counters::default(),
            status: SessionStatus::Running,
            started_at: Utc::now(),
            round: 0,
            rounds_completed: 0,
        };
        let initial = Arc::new(state.snapshot());
        Self {
            state: Mutex::new(state),
            latest: ArcSwap::new(initial.clone()),
            last_round: ArcSwap::new(initial),
        }
    }

    /// Apply a batch atomically with respect to readers
    pub fn apply<I>(&self, events: I)
    where
        I: IntoIterator<Item = HopEvent>,
    {
        let mut state = self.state.lock();
        for event in events {
            state.apply(event);
        }
        self.latest.store(Arc::new(state.snapshot()));
    }

    pub fn record(&self, event: HopEvent) {
        self.apply(std::iter::once(event));
    }

    /// Count a send without publishing; pair with [`HopTable::publish`]
    pub fn record_sent(&self, flow: u16, ttl: u8) {
        self.state.lock().apply(HopEvent::Sent { flow, ttl });
    }

    /// Publish whatever has been recorded since the last snapshot
    pub fn publish(&self) {
        let state = self.state.lock();
        self.latest.store(Arc::new(state.snapshot()));
    }

    pub fn begin_round(&self, round: u32) {
        let mut state = self.state.lock();
        state.round = round;
        self.latest.store(Arc::new(state.snapshot()));
    }

    /// Mark a round resolved and publish it as the last complete round
    pub fn complete_round(&self, round: u32) {
        let mut state = self.state.lock();
        state.rounds_completed = state.rounds_completed.max(round + 1);
        let snapshot = Arc::new(state.snapshot());
        self.latest.store(snapshot.clone());
        self.last_round.store(snapshot);
    }

    pub fn set_status(&self, status: SessionStatus) {
        let mut state = self.state.lock();
        state.status = status;
        let snapshot = Arc::new(state.snapshot());
        self.latest.store(snapshot.clone());
        if status == SessionStatus::Terminated {
            self.last_round.store(snapshot);
        }
    }

    /// Hop-limit at which `flow` reached the target, if it has
    pub fn target_ttl(&self, flow: u16) -> Option<u8> {
        self.state.lock().target_ttl.get(flow as usize).copied().flatten()
    }

    /// Latest published state
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.latest.load_full()
    }

    /// State as of the last fully resolved round
    pub fn round_snapshot(&self) -> Arc<Snapshot> {
        self.last_round.load_full()
    }
}
