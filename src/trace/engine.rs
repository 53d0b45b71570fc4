//! Probe scheduler.
//!
//! Sends rounds of probes: every flow walks hop-limits 1..=max, interleaved
//! round-robin across flows, paced by `send_interval` and capped at
//! `max_in_flight` outstanding probes. A flow stops walking once the target
//! has answered at a lower hop-limit. The next round starts after every
//! probe of the current one has resolved, gated by the round cadence.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{RoundCadence, SessionConfig};
use crate::probe::{Encoder, ProbeSender};
use crate::state::{HopEvent, HopTable};
use crate::trace::pending::{PendingIndex, PendingProbe};

/// Re-check interval while waiting on the pending index
const WAIT_POLL: Duration = Duration::from_millis(50);

pub struct ProbeScheduler {
    config: SessionConfig,
    encoder: Encoder,
    sender: Box<dyn ProbeSender>,
    pending: Arc<PendingIndex>,
    table: Arc<HopTable>,
    stop: CancellationToken,
    pacer: Option<Interval>,
}

impl ProbeScheduler {
    pub fn new(
        config: SessionConfig,
        encoder: Encoder,
        sender: Box<dyn ProbeSender>,
        pending: Arc<PendingIndex>,
        table: Arc<HopTable>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            config,
            encoder,
            sender,
            pending,
            table,
            stop,
            pacer: None,
        }
    }

    /// Run until stopped or `max_rounds` is reached. Returns rounds fully sent.
    pub async fn run(mut self) -> u32 {
        if !self.config.send_interval.is_zero() {
            let mut pacer = tokio::time::interval(self.config.send_interval);
            pacer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.pacer = Some(pacer);
        }

        let mut round: u32 = 0;
        loop {
            if self.stop.is_cancelled() || self.config.max_rounds.is_some_and(|max| round >= max) {
                break;
            }

            let started = Instant::now();
            self.table.begin_round(round);
            debug!(round, "round started");

            let sent_all = self.send_round(round).await;
            self.table.publish();
            if !sent_all {
                break;
            }
            if !wait_until(&self.pending, &self.stop, |pending| pending.outstanding_in_round(round) == 0).await {
                break;
            }
            self.table.complete_round(round);
            debug!(round, elapsed = ?started.elapsed(), "round resolved");
            round = round.wrapping_add(1);

            if let RoundCadence::MinInterval(gap) = self.config.round_cadence {
                tokio::select! {
                    _ = self.stop.cancelled() => break,
                    _ = tokio::time::sleep_until((started + gap).into()) => {}
                }
            }
        }

        info!(rounds = round, "scheduler stopped");
        round
    }

    /// Send one round. Returns false if stopped part-way.
    async fn send_round(&mut self, round: u32) -> bool {
        let flows = self.encoder.plan().len();
        let mut next_ttl = vec![1u8; flows as usize];

        loop {
            let mut any = false;
            for flow in 0..flows {
                let limit = self.table.target_ttl(flow).unwrap_or(self.config.max_ttl);
                let ttl = next_ttl[flow as usize];
                if ttl > limit {
                    continue;
                }
                any = true;
                next_ttl[flow as usize] = ttl + 1;

                if !self.pace().await {
                    return false;
                }
                self.send_probe(flow, round, ttl);
            }
            if !any {
                return true;
            }
        }
    }

    /// Wait for the send gap and for in-flight capacity
    async fn pace(&mut self) -> bool {
        let max = self.config.max_in_flight;
        if !wait_until(&self.pending, &self.stop, |pending| pending.outstanding() < max).await {
            return false;
        }
        if let Some(pacer) = self.pacer.as_mut() {
            tokio::select! {
                _ = self.stop.cancelled() => return false,
                _ = pacer.tick() => {}
            }
        }
        !self.stop.is_cancelled()
    }

    fn send_probe(&mut self, flow: u16, round: u32, ttl: u8) {
        let Some(probe) = self.encoder.encode(flow, round, ttl) else {
            return;
        };

        // Register pending BEFORE sending so a fast response cannot race the insert
        let sent_at = Instant::now();
        let registered = self.pending.insert(PendingProbe {
            flow,
            round,
            ttl,
            token: probe.token,
            sent_at,
            deadline: sent_at + self.config.timeout,
            expected: probe.expected,
        });
        if !registered {
            warn!(flow, ttl, token = probe.token, "token still outstanding, probe skipped");
            self.table.record(HopEvent::SendFailed { flow, ttl });
            return;
        }

        match self.sender.send(&probe) {
            // Published in one step once the round is sent
            Ok(()) => self.table.record_sent(flow, ttl),
            Err(e) => {
                // Remove on failure so it is not later counted as a loss
                if self.pending.remove(flow, probe.token).is_some() {
                    self.pending.settle([round]);
                }
                warn!(flow, ttl, error = %e, "probe send failed");
                self.table.record(HopEvent::SendFailed { flow, ttl });
            }
        }
    }
}

/// Wait until `ready` holds. Returns false if stopped first.
///
/// Free function so the scheduler future only borrows `Sync` parts of itself
/// across the await and stays `Send` with any sender.
async fn wait_until<F>(pending: &PendingIndex, stop: &CancellationToken, ready: F) -> bool
where
    F: Fn(&PendingIndex) -> bool,
{
    loop {
        let notified = pending.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if ready(pending) {
            return true;
        }
        tokio::select! {
            _ = stop.cancelled() => return false,
            _ = &mut notified => {}
            _ = tokio::time::sleep(WAIT_POLL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeProtocol;
    use crate::probe::{EncodedProbe, FlowPlan};
    use parking_lot::Mutex;
    use std::io;
    use std::net::{IpAddr, Ipv4Addr};

    const TARGET: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 4));

    #[derive(Clone, Default)]
    struct Recorder {
        sent: Arc<Mutex<Vec<(u16, u32, u8)>>>,
        fail_ttl: Option<u8>,
    }

    impl ProbeSender for Recorder {
        fn send(&mut self, probe: &EncodedProbe) -> io::Result<()> {
            if self.fail_ttl == Some(probe.ttl) {
                return Err(io::Error::other("no route"));
            }
            self.sent.lock().push((probe.flow, probe.id.seq as u32, probe.ttl));
            Ok(())
        }
    }

    fn config(flows: u16, max_ttl: u8, rounds: u32) -> SessionConfig {
        let mut config = SessionConfig::new(TARGET, ProbeProtocol::Icmp);
        config.flows = flows;
        config.max_ttl = max_ttl;
        config.max_rounds = Some(rounds);
        config.send_interval = Duration::ZERO;
        config.timeout = Duration::from_millis(50);
        config.round_cadence = RoundCadence::AfterResolve;
        config
    }

    fn scheduler(config: &SessionConfig, sender: Recorder) -> (ProbeScheduler, Arc<PendingIndex>, Arc<HopTable>) {
        let plan = FlowPlan::new(config);
        let src = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let pending = Arc::new(PendingIndex::new(config.flows));
        let table = Arc::new(HopTable::new(config));
        let s = ProbeScheduler::new(
            config.clone(),
            Encoder::new(config, plan, src),
            Box::new(sender),
            pending.clone(),
            table.clone(),
            CancellationToken::new(),
        );
        (s, pending, table)
    }

    /// Stand-in for the sweeper: expire everything promptly
    fn expire_all(pending: Arc<PendingIndex>, table: Arc<HopTable>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let expired = pending.drain_all();
                table.apply(expired.iter().map(PendingProbe::timed_out));
                pending.settle(expired.iter().map(|p| p.round));
            }
        })
    }

    #[tokio::test]
    async fn test_rounds_interleave_flows() {
        let config = config(2, 3, 2);
        let recorder = Recorder::default();
        let (s, pending, table) = scheduler(&config, recorder.clone());
        let sweeper = expire_all(pending.clone(), table.clone());

        assert_eq!(s.run().await, 2);
        sweeper.abort();

        let sent = recorder.sent.lock().clone();
        assert_eq!(sent.len(), 12);
        let first: Vec<_> = sent[..6].iter().map(|(f, _, t)| (*f, *t)).collect();
        assert_eq!(first, vec![(0, 1), (1, 1), (0, 2), (1, 2), (0, 3), (1, 3)]);
        assert_eq!(table.snapshot().rounds_completed, 2);
        assert_eq!(table.snapshot().counters.sent, 12);
    }

    #[tokio::test]
    async fn test_send_failure_not_left_pending() {
        let config = config(1, 3, 1);
        let recorder = Recorder {
            fail_ttl: Some(2),
            ..Recorder::default()
        };
        let (s, pending, table) = scheduler(&config, recorder);
        let sweeper = expire_all(pending.clone(), table.clone());
        s.run().await;
        sweeper.abort();

        let snap = table.snapshot();
        assert_eq!(snap.counters.send_failures, 1);
        assert_eq!(snap.counters.sent, 2);
        assert_eq!(snap.flows[0].hop(2).unwrap().timeouts, 0);
        assert_eq!(pending.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_stop_halts_emission() {
        let mut config = config(1, 30, 100);
        config.send_interval = Duration::from_millis(20);
        let recorder = Recorder::default();
        let (s, _pending, _table) = scheduler(&config, recorder.clone());
        let stop = s.stop.clone();

        let task = tokio::spawn(s.run());
        tokio::time::sleep(Duration::from_millis(70)).await;
        stop.cancel();
        let rounds = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(rounds, 0);

        let count = recorder.sent.lock().len();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(recorder.sent.lock().len(), count);
        assert!(count < 30);
    }

    /// `Send` but not `Sync`
    struct CellSender(std::cell::Cell<u32>);

    impl ProbeSender for CellSender {
        fn send(&mut self, _probe: &EncodedProbe) -> io::Result<()> {
            self.0.set(self.0.get() + 1);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_is_send_with_non_sync_sender() {
        let config = config(1, 2, 1);
        let plan = FlowPlan::new(&config);
        let src = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let pending = Arc::new(PendingIndex::new(config.flows));
        let table = Arc::new(HopTable::new(&config));
        let s = ProbeScheduler::new(
            config.clone(),
            Encoder::new(&config, plan, src),
            Box::new(CellSender(std::cell::Cell::new(0))),
            pending.clone(),
            table.clone(),
            CancellationToken::new(),
        );
        let sweeper = expire_all(pending, table.clone());
        let rounds = tokio::spawn(s.run()).await.unwrap();
        sweeper.abort();
        assert_eq!(rounds, 1);
        assert_eq!(table.round_snapshot().counters.sent, 2);
    }

    #[tokio::test]
    async fn test_in_flight_cap() {
        let mut config = config(1, 10, 1);
        config.max_in_flight = 3;
        config.timeout = Duration::from_secs(30);
        let recorder = Recorder::default();
        let (s, pending, _table) = scheduler(&config, recorder.clone());
        let stop = s.stop.clone();
        let task = tokio::spawn(s.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.sent.lock().len(), 3);
        assert_eq!(pending.outstanding(), 3);
        stop.cancel();
        task.await.unwrap();
    }
}
