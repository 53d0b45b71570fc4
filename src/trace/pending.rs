//! Outstanding probe index.
//!
//! The scheduler inserts an entry before each send; listeners claim it when
//! a response matches and the sweeper claims it at its deadline. Each flow
//! owns one shard so unrelated flows never contend for the same lock.
//!
//! Claiming takes the entry out of its shard but leaves it counted. A probe
//! stops counting as outstanding only once its owner calls [`PendingIndex::settle`],
//! after the outcome is in the hop table, so a round never looks resolved
//! before its answers are visible.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::{Notify, futures::Notified};

use crate::probe::ExpectedFields;
use crate::state::HopEvent;

/// A probe that has been sent and is awaiting a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingProbe {
    pub flow: u16,
    pub round: u32,
    pub ttl: u8,
    pub token: u16,
    pub sent_at: Instant,
    pub deadline: Instant,
    /// Identifying fields as sent, for NAT comparison
    pub expected: ExpectedFields,
}

impl PendingProbe {
    pub fn timed_out(&self) -> HopEvent {
        HopEvent::TimedOut {
            flow: self.flow,
            ttl: self.ttl,
            round: self.round,
        }
    }
}

type Shard = Mutex<HashMap<u16, PendingProbe>>;

pub struct PendingIndex {
    shards: Vec<Shard>,
    outstanding: AtomicUsize,
    /// Unsettled probes per round
    in_round: Mutex<HashMap<u32, usize>>,
    resolved: Notify,
}

impl PendingIndex {
    pub fn new(flows: u16) -> Self {
        Self {
            shards: (0..flows.max(1)).map(|_| Mutex::new(HashMap::new())).collect(),
            outstanding: AtomicUsize::new(0),
            in_round: Mutex::new(HashMap::new()),
            resolved: Notify::new(),
        }
    }

    fn shard(&self, flow: u16) -> Option<&Shard> {
        self.shards.get(flow as usize)
    }

    /// Register a probe. Returns false (and keeps the existing entry) if the
    /// token is already outstanding on that flow.
    pub fn insert(&self, probe: PendingProbe) -> bool {
        let Some(shard) = self.shard(probe.flow) else {
            return false;
        };
        let mut map = shard.lock();
        if map.contains_key(&probe.token) {
            return false;
        }
        *self.in_round.lock().entry(probe.round).or_default() += 1;
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        map.insert(probe.token, probe);
        true
    }

    /// Claim by (flow, token)
    pub fn remove(&self, flow: u16, token: u16) -> Option<PendingProbe> {
        self.shard(flow)?.lock().remove(&token)
    }

    pub fn contains(&self, flow: u16, token: u16) -> bool {
        self.shard(flow).is_some_and(|shard| shard.lock().contains_key(&token))
    }

    /// Claim by token alone, only if exactly one flow has it outstanding
    pub fn remove_unique(&self, token: u16) -> Option<PendingProbe> {
        let mut owners = self
            .shards
            .iter()
            .enumerate()
            .filter(|(_, shard)| shard.lock().contains_key(&token))
            .map(|(flow, _)| flow as u16);
        let flow = owners.next()?;
        if owners.next().is_some() {
            return None;
        }
        self.remove(flow, token)
    }

    /// Claim every probe whose deadline is at or before `now`
    pub fn expire(&self, now: Instant) -> Vec<PendingProbe> {
        let mut expired = Vec::new();
        for shard in &self.shards {
            let mut map = shard.lock();
            map.retain(|_, probe| {
                if probe.deadline <= now {
                    expired.push(probe.clone());
                    false
                } else {
                    true
                }
            });
        }
        expired
    }

    /// Claim everything still in the index
    pub fn drain_all(&self) -> Vec<PendingProbe> {
        let mut drained = Vec::new();
        for shard in &self.shards {
            drained.extend(shard.lock().drain().map(|(_, probe)| probe));
        }
        drained
    }

    /// Release claimed probes, one entry per probe naming its round, and wake
    /// anyone waiting on resolution. Call only after their outcome is recorded.
    pub fn settle<I>(&self, rounds: I)
    where
        I: IntoIterator<Item = u32>,
    {
        let mut settled = 0;
        {
            let mut in_round = self.in_round.lock();
            for round in rounds {
                if let Some(count) = in_round.get_mut(&round) {
                    *count -= 1;
                    if *count == 0 {
                        in_round.remove(&round);
                    }
                    settled += 1;
                }
            }
        }
        if settled > 0 {
            self.outstanding.fetch_sub(settled, Ordering::AcqRel);
            self.resolved.notify_waiters();
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn outstanding_in_round(&self, round: u32) -> usize {
        self.in_round.lock().get(&round).copied().unwrap_or(0)
    }

    /// Earliest deadline among outstanding probes
    pub fn next_deadline(&self) -> Option<Instant> {
        self.shards
            .iter()
            .filter_map(|shard| shard.lock().values().map(|p| p.deadline).min())
            .min()
    }

    /// Future completing the next time any probe settles.
    /// Call `enable()` on it before checking the condition being waited for.
    pub fn notified(&self) -> Notified<'_> {
        self.resolved.notified()
    }
}
