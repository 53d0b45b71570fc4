//! Listener threads and the timeout sweeper.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::probe::{Decoder, PacketSource};
use crate::state::{HopEvent, HopTable};
use crate::trace::correlator::Correlator;
use crate::trace::pending::{PendingIndex, PendingProbe};

/// Maximum consecutive errors before stopping a listener
const MAX_CONSECUTIVE_ERRORS: u32 = 50;

/// Maximum packets to drain per iteration before publishing the batch
/// Bounds snapshot staleness at high packet rates
const MAX_DRAIN_BATCH: usize = 100;

/// Sweeper wake-up ceiling when nothing is outstanding
const SWEEP_IDLE: Duration = Duration::from_millis(100);

const RECV_BUFFER: usize = 1500;

/// Drains one packet source, correlates, and feeds the hop table
pub struct Listener {
    source: Box<dyn PacketSource>,
    decoder: Decoder,
    correlator: Arc<Correlator>,
    table: Arc<HopTable>,
    shutdown: CancellationToken,
    consecutive_errors: u32,
}

impl Listener {
    pub fn new(
        source: Box<dyn PacketSource>,
        decoder: Decoder,
        correlator: Arc<Correlator>,
        table: Arc<HopTable>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            decoder,
            correlator,
            table,
            shutdown,
            consecutive_errors: 0,
        }
    }

    /// Run on a dedicated thread (blocking I/O) until `shutdown` fires
    pub fn run_blocking(mut self) -> Result<()> {
        let mut buffer = [0u8; RECV_BUFFER];

        while !self.shutdown.is_cancelled() {
            // Drain what is queued, then publish it as one batch
            let mut batch: Vec<HopEvent> = Vec::with_capacity(MAX_DRAIN_BATCH);
            let mut failure = None;
            while batch.len() < MAX_DRAIN_BATCH {
                match self.source.recv(&mut buffer) {
                    Ok(Some(packet)) => {
                        self.consecutive_errors = 0;
                        let received_at = Instant::now();
                        let data = &buffer[..packet.len.min(buffer.len())];
                        let event = match self.decoder.decode(data, packet.source, packet.framing) {
                            None => HopEvent::DecodeDiscarded,
                            Some(response) => self
                                .correlator
                                .correlate(&response, received_at)
                                .unwrap_or(HopEvent::Unmatched),
                        };
                        batch.push(event);
                    }
                    Ok(None) => {
                        self.consecutive_errors = 0;
                        break;
                    }
                    Err(e) => {
                        self.consecutive_errors += 1;
                        warn!(
                            error = %e,
                            count = self.consecutive_errors,
                            max = MAX_CONSECUTIVE_ERRORS,
                            "receive error"
                        );
                        if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                            failure = Some(Error::Listener(format!(
                                "{} consecutive errors (last: {e})",
                                self.consecutive_errors
                            )));
                        }
                        break;
                    }
                }
            }

            if !batch.is_empty() {
                // Settle only once the outcomes are visible, so a round never
                // completes ahead of its own answers
                let rounds: Vec<u32> = batch.iter().filter_map(HopEvent::resolved_round).collect();
                self.table.apply(batch);
                self.correlator.pending().settle(rounds);
            }
            if let Some(e) = failure {
                return Err(e);
            }
        }

        debug!("listener stopped");
        Ok(())
    }
}

/// Spawn a listener on its own OS thread, converting panics into errors
pub fn spawn_listener(listener: Listener) -> std::io::Result<JoinHandle<Result<()>>> {
    std::thread::Builder::new()
        .name("hoptrace-listener".into())
        .spawn(move || {
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener.run_blocking())) {
                Ok(result) => result,
                Err(payload) => {
                    let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = payload.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "unknown panic".to_string()
                    };
                    Err(Error::Listener(format!("panicked: {msg}")))
                }
            }
        })
}

/// Expire overdue probes as losses until `shutdown` fires
pub async fn run_sweeper(pending: Arc<PendingIndex>, table: Arc<HopTable>, shutdown: CancellationToken) {
    loop {
        let wake = pending
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + SWEEP_IDLE)
            .min(Instant::now() + SWEEP_IDLE);

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep_until(wake.into()) => {}
        }

        let expired = pending.expire(Instant::now());
        if !expired.is_empty() {
            debug!(count = expired.len(), "probes timed out");
            table.apply(expired.iter().map(PendingProbe::timed_out));
            pending.settle(expired.iter().map(|p| p.round));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProbeProtocol, SessionConfig};
    use crate::probe::{FlowPlan, Framing, RecvPacket};
    use crate::probe::ExpectedFields;
    use std::collections::VecDeque;
    use std::io;
    use std::net::{IpAddr, Ipv4Addr};

    const TARGET: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 3));

    struct Scripted {
        packets: VecDeque<io::Result<Vec<u8>>>,
        shutdown: CancellationToken,
    }

    impl PacketSource for Scripted {
        fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<RecvPacket>> {
            match self.packets.pop_front() {
                Some(Ok(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(Some(RecvPacket {
                        len: bytes.len(),
                        source: TARGET,
                        framing: Framing::IcmpMessage,
                    }))
                }
                Some(Err(e)) => Err(e),
                None => {
                    self.shutdown.cancel();
                    Ok(None)
                }
            }
        }
    }

    fn listener(packets: Vec<io::Result<Vec<u8>>>) -> (Listener, Arc<HopTable>, Arc<PendingIndex>) {
        let mut config = SessionConfig::new(TARGET, ProbeProtocol::Icmp);
        config.identifier_base = 0x3000;
        let plan = FlowPlan::new(&config);
        let pending = Arc::new(PendingIndex::new(1));
        let table = Arc::new(HopTable::new(&config));
        let shutdown = CancellationToken::new();
        let decoder = Decoder::new(&config, plan.carrier());
        let correlator = Arc::new(Correlator::new(plan, TARGET, pending.clone()));
        let source = Scripted {
            packets: packets.into(),
            shutdown: shutdown.clone(),
        };
        (
            Listener::new(Box::new(source), decoder, correlator, table.clone(), shutdown),
            table,
            pending,
        )
    }

    #[test]
    fn test_garbage_counted_as_discarded() {
        let (l, table, _) = listener(vec![Ok(vec![1, 2, 3]), Ok(vec![0xFF; 40])]);
        l.run_blocking().unwrap();
        assert_eq!(table.snapshot().counters.decode_discarded, 2);
    }

    #[test]
    fn test_matched_reply_recorded_then_settled() {
        let mut reply = vec![0, 0, 0, 0, 0x30, 0x00, 0x01, 0x00];
        let cksum = crate::probe::checksum::checksum(&reply);
        reply[2..4].copy_from_slice(&cksum.to_be_bytes());

        let (l, table, pending) = listener(vec![Ok(reply)]);
        let now = Instant::now();
        pending.insert(PendingProbe {
            flow: 0,
            round: 0,
            ttl: 1,
            token: 0x0100,
            sent_at: now,
            deadline: now + Duration::from_secs(5),
            expected: ExpectedFields::default(),
        });
        l.run_blocking().unwrap();

        assert_eq!(pending.outstanding_in_round(0), 0);
        let snap = table.snapshot();
        assert_eq!(snap.counters.answered, 1);
        assert_eq!(snap.flows[0].hop(1).unwrap().received, 1);
    }

    #[test]
    fn test_persistent_errors_stop_listener() {
        let errors = (0..MAX_CONSECUTIVE_ERRORS)
            .map(|_| Err(io::Error::other("boom")))
            .collect();
        let (l, _, _) = listener(errors);
        assert!(matches!(l.run_blocking(), Err(Error::Listener(_))));
    }

    #[test]
    fn test_panic_becomes_error() {
        struct Panicking;
        impl PacketSource for Panicking {
            fn recv(&mut self, _: &mut [u8]) -> io::Result<Option<RecvPacket>> {
                panic!("socket exploded");
            }
        }
        let (mut l, _, _) = listener(vec![]);
        l.source = Box::new(Panicking);
        let result = spawn_listener(l).unwrap().join().unwrap();
        assert!(matches!(result, Err(Error::Listener(msg)) if msg.contains("socket exploded")));
    }

    #[tokio::test]
    async fn test_sweeper_records_timeouts() {
        let config = SessionConfig::new(TARGET, ProbeProtocol::Icmp);
        let pending = Arc::new(PendingIndex::new(1));
        let table = Arc::new(HopTable::new(&config));
        let now = Instant::now();
        pending.insert(PendingProbe {
            flow: 0,
            round: 0,
            ttl: 3,
            token: 0x0300,
            sent_at: now,
            deadline: now + Duration::from_millis(30),
            expected: ExpectedFields::default(),
        });

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_sweeper(pending.clone(), table.clone(), shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(250)).await;
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(pending.outstanding(), 0);
        let snap = table.snapshot();
        assert_eq!(snap.counters.timed_out, 1);
        assert_eq!(snap.flows[0].hop(3).unwrap().timeouts, 1);
    }
}
