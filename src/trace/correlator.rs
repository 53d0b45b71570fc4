//! Matches decoded responses to outstanding probes.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::probe::{FlowPlan, ProbeResponse, checksum};
use crate::state::{Answer, HopEvent, NatDetector, NatVerdict};
use crate::trace::pending::{PendingIndex, PendingProbe};

pub struct Correlator {
    plan: FlowPlan,
    target: IpAddr,
    nat: NatDetector,
    pending: Arc<PendingIndex>,
    /// Local source address, to undo address translation on checksum tokens
    local: Option<IpAddr>,
}

impl Correlator {
    pub fn new(plan: FlowPlan, target: IpAddr, pending: Arc<PendingIndex>) -> Self {
        Self {
            plan,
            target,
            nat: NatDetector::new(target),
            pending,
            local: None,
        }
    }

    pub fn with_source(mut self, local: IpAddr) -> Self {
        self.local = Some(local);
        self
    }

    pub fn pending(&self) -> &PendingIndex {
        &self.pending
    }

    /// Resolve the probe `response` answers, if it is still outstanding.
    ///
    /// Lookup is by (flow, token). When the flow key does not map to a flow
    /// (a NAT rewrote the source port or identifier), the token alone is used
    /// as long as it is unambiguous and the response is plausibly ours.
    ///
    /// A match that arrives after the probe's deadline resolves it as a
    /// timeout. The claimed entry stays counted until the caller settles it.
    pub fn correlate(&self, response: &ProbeResponse, received_at: Instant) -> Option<HopEvent> {
        let flow = self.plan.flow_for_key(response.flow_key);
        let aimed_at_target = match &response.quoted {
            Some(quoted) => quoted.dst == self.target,
            None => response.responder == self.target,
        };

        let mut recovered = false;
        let probe = match flow {
            Some(flow) => self
                .pending
                .remove(flow, response.token)
                .or_else(|| aimed_at_target.then(|| self.pending.remove_unique(response.token)).flatten()),
            None if aimed_at_target => self.pending.remove_unique(response.token),
            None => None,
        }
        .or_else(|| {
            let probe = aimed_at_target.then(|| self.match_rewritten_checksum(response)).flatten();
            recovered = probe.is_some();
            probe
        });

        let Some(probe) = probe else {
            debug!(
                responder = %response.responder,
                flow_key = response.flow_key,
                token = format_args!("{:#06x}", response.token),
                kind = ?response.kind,
                "unmatched response (late, duplicate or foreign)"
            );
            return None;
        };

        if received_at > probe.deadline {
            debug!(
                flow = probe.flow,
                ttl = probe.ttl,
                late_by = ?received_at.duration_since(probe.deadline),
                "response after deadline counted as timeout"
            );
            return Some(probe.timed_out());
        }

        let nat = response.quoted.as_ref().and_then(|quoted| {
            self.nat.inspect(&probe.expected, quoted).or_else(|| {
                recovered.then_some(NatVerdict::ChecksumRewritten {
                    sent: probe.token,
                    seen: quoted.udp_checksum.unwrap_or_default(),
                })
            })
        });
        if let Some(verdict) = &nat {
            debug!(flow = probe.flow, ttl = probe.ttl, ?verdict, "NAT rewrite observed");
        }

        Some(HopEvent::Answered(Answer {
            flow: probe.flow,
            ttl: probe.ttl,
            round: probe.round,
            responder: response.responder,
            rtt: received_at.saturating_duration_since(probe.sent_at),
            kind: response.kind,
            nat,
            mpls: response
                .extensions
                .as_ref()
                .and_then(|ext| ext.mpls_labels())
                .map(<[_]>::to_vec),
        }))
    }

    /// The checksum carrier loses its token when a NAT rewrites the source
    /// port or address and patches the checksum to match. Undo the patch
    /// against each flow's own port and accept it only if one flow matches.
    fn match_rewritten_checksum(&self, response: &ProbeResponse) -> Option<PendingProbe> {
        if !self.plan.carrier().uses_checksum() {
            return None;
        }
        let quoted = response.quoted.as_ref()?;
        let seen_port = quoted.src_port?;
        let seen = quoted.udp_checksum.filter(|c| *c != 0)?;
        let address = self
            .local
            .filter(|local| *local != quoted.src)
            .and_then(|local| address_octets(local, quoted.src));

        let mut owners = self.plan.flows().iter().filter_map(|fields| {
            let sent_port = fields.src_port?;
            let mut token = checksum::undo_rewrite(seen, &sent_port.to_be_bytes(), &seen_port.to_be_bytes());
            if let Some((old, new)) = &address {
                token = checksum::undo_rewrite(token, old, new);
            }
            self.pending.contains(fields.flow, token).then_some((fields.flow, token))
        });
        let (flow, token) = owners.next()?;
        if owners.next().is_some() {
            return None;
        }
        self.pending.remove(flow, token)
    }
}

fn address_octets(old: IpAddr, new: IpAddr) -> Option<(Vec<u8>, Vec<u8>)> {
    match (old, new) {
        (IpAddr::V4(old), IpAddr::V4(new)) => Some((old.octets().to_vec(), new.octets().to_vec())),
        (IpAddr::V6(old), IpAddr::V6(new)) => Some((old.octets().to_vec(), new.octets().to_vec())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MultipathAlgorithm, ProbeProtocol, SessionConfig};
    use crate::probe::{Encoder, ExpectedFields, QuotedProbe, ResponseKind};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    const TARGET: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7));
    const ROUTER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 1, 0, 1));
    const LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const PUBLIC: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5));

    fn answered(event: Option<HopEvent>) -> Answer {
        match event {
            Some(HopEvent::Answered(answer)) => answer,
            other => panic!("expected an answer, got {other:?}"),
        }
    }

    fn setup(flows: u16) -> (Correlator, Arc<PendingIndex>) {
        let mut config = SessionConfig::new(TARGET, ProbeProtocol::Udp);
        config.algorithm = MultipathAlgorithm::Dublin;
        config.flows = flows;
        let pending = Arc::new(PendingIndex::new(flows));
        (Correlator::new(FlowPlan::new(&config), TARGET, pending.clone()), pending)
    }

    fn pend(pending: &PendingIndex, flow: u16, token: u16, sent_at: Instant) {
        pending.insert(PendingProbe {
            flow,
            round: 2,
            ttl: 4,
            token,
            sent_at,
            deadline: sent_at + Duration::from_secs(3),
            expected: ExpectedFields {
                src_port: Some(50000 + flow),
                identifier: None,
                udp_checksum: Some(0xAAAA),
            },
        });
    }

    fn response(flow_key: u16, token: u16, src_port: u16) -> ProbeResponse {
        ProbeResponse {
            responder: ROUTER,
            kind: ResponseKind::TimeExceeded { code: 0 },
            flow_key,
            token,
            quoted: Some(QuotedProbe {
                src: LOCAL,
                dst: TARGET,
                ttl: 1,
                src_port: Some(src_port),
                dst_port: Some(33434),
                identifier: None,
                udp_checksum: Some(0xAAAA),
            }),
            extensions: None,
        }
    }

    #[test]
    fn test_match_computes_rtt() {
        let (c, pending) = setup(2);
        let sent = Instant::now();
        pend(&pending, 1, 0x0405, sent);

        let answer = answered(c.correlate(&response(50001, 0x0405, 50001), sent + Duration::from_millis(12)));
        assert_eq!(answer.flow, 1);
        assert_eq!(answer.ttl, 4);
        assert_eq!(answer.round, 2);
        assert_eq!(answer.rtt, Duration::from_millis(12));
        assert_eq!(answer.nat, None);
        assert!(!pending.contains(1, 0x0405));
        assert_eq!(pending.outstanding(), 1);
        pending.settle([answer.round]);
        assert_eq!(pending.outstanding(), 0);
    }

    #[test]
    fn test_duplicate_is_unmatched() {
        let (c, pending) = setup(1);
        let sent = Instant::now();
        pend(&pending, 0, 0x0401, sent);
        assert!(c.correlate(&response(50000, 0x0401, 50000), sent).is_some());
        assert!(c.correlate(&response(50000, 0x0401, 50000), sent).is_none());
    }

    #[test]
    fn test_nat_rewritten_port_falls_back_to_token() {
        let (c, pending) = setup(2);
        let sent = Instant::now();
        pend(&pending, 0, 0x0400, sent);
        pend(&pending, 1, 0x0401, sent);

        let answer = answered(c.correlate(&response(61000, 0x0401, 61000), sent));
        assert_eq!(answer.flow, 1);
        assert_eq!(
            answer.nat,
            Some(NatVerdict::SourcePortRewritten { sent: 50001, seen: 61000 })
        );
    }

    #[test]
    fn test_foreign_destination_not_matched_by_token() {
        let (c, pending) = setup(1);
        let sent = Instant::now();
        pend(&pending, 0, 0x0400, sent);
        let mut resp = response(40000, 0x0400, 40000);
        if let Some(q) = resp.quoted.as_mut() {
            q.dst = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1));
        }
        assert!(c.correlate(&resp, sent).is_none());
        assert!(pending.contains(0, 0x0400));
    }

    #[test]
    fn test_rtt_never_negative() {
        let (c, pending) = setup(1);
        let sent = Instant::now();
        pend(&pending, 0, 0x0400, sent + Duration::from_millis(50));
        let answer = answered(c.correlate(&response(50000, 0x0400, 50000), sent));
        assert_eq!(answer.rtt, Duration::ZERO);
    }

    #[test]
    fn test_answer_after_deadline_is_timeout() {
        let (c, pending) = setup(1);
        let sent = Instant::now();
        pend(&pending, 0, 0x0400, sent);

        let late = c.correlate(&response(50000, 0x0400, 50000), sent + Duration::from_secs(4));
        assert_eq!(late, Some(HopEvent::TimedOut { flow: 0, ttl: 4, round: 2 }));
        // Claimed once; the sweeper cannot count it a second time
        assert!(pending.expire(sent + Duration::from_secs(5)).is_empty());
        assert!(c.correlate(&response(50000, 0x0400, 50000), sent).is_none());
    }

    #[test]
    fn test_answer_at_deadline_still_counts() {
        let (c, pending) = setup(1);
        let sent = Instant::now();
        pend(&pending, 0, 0x0400, sent);
        let answer = answered(c.correlate(&response(50000, 0x0400, 50000), sent + Duration::from_secs(3)));
        assert_eq!(answer.rtt, Duration::from_secs(3));
    }

    /// Paris UDP session with flow 1's hop 5 outstanding; returns the datagram as sent
    fn paris_setup() -> (Correlator, Arc<PendingIndex>, crate::probe::EncodedProbe, Instant) {
        let mut config = SessionConfig::new(TARGET, ProbeProtocol::Udp);
        config.flows = 2;
        let plan = FlowPlan::new(&config);
        let pending = Arc::new(PendingIndex::new(2));
        let c = Correlator::new(plan.clone(), TARGET, pending.clone()).with_source(LOCAL);
        let probe = Encoder::new(&config, plan, LOCAL).encode(1, 0, 5).unwrap();
        let sent = Instant::now();
        pending.insert(PendingProbe {
            flow: 1,
            round: 0,
            ttl: 5,
            token: probe.token,
            sent_at: sent,
            deadline: sent + Duration::from_secs(3),
            expected: probe.expected,
        });
        (c, pending, probe, sent)
    }

    /// Quote of the datagram after a NAT moved it to `addr`:`port` and recomputed the checksum
    fn translated(probe: &crate::probe::EncodedProbe, addr: IpAddr, port: u16) -> ProbeResponse {
        let mut datagram = probe.transport.clone();
        datagram[0..2].copy_from_slice(&port.to_be_bytes());
        datagram[6..8].fill(0);
        let pseudo = checksum::pseudo_header_sum(addr, TARGET, 17, datagram.len());
        let cksum = checksum::checksum_with(&datagram, pseudo);

        let mut resp = response(port, cksum, port);
        if let Some(q) = resp.quoted.as_mut() {
            q.src = addr;
            q.udp_checksum = Some(cksum);
        }
        resp
    }

    #[test]
    fn test_paris_token_recovered_after_port_and_address_rewrite() {
        let (c, pending, probe, sent) = paris_setup();
        let resp = translated(&probe, PUBLIC, 61000);
        assert_ne!(resp.token, probe.token);

        let answer = answered(c.correlate(&resp, sent + Duration::from_millis(8)));
        assert_eq!((answer.flow, answer.ttl), (1, 5));
        assert_eq!(
            answer.nat,
            Some(NatVerdict::SourcePortRewritten { sent: 50001, seen: 61000 })
        );
        assert!(!pending.contains(1, probe.token));
    }

    #[test]
    fn test_paris_token_recovered_after_address_rewrite() {
        let (c, _pending, probe, sent) = paris_setup();
        let resp = translated(&probe, PUBLIC, 50001);

        let answer = answered(c.correlate(&resp, sent));
        assert_eq!(answer.flow, 1);
        assert_eq!(
            answer.nat,
            Some(NatVerdict::ChecksumRewritten { sent: probe.token, seen: resp.token })
        );
    }

    #[test]
    fn test_paris_recovery_needs_target_destination() {
        let (c, pending, probe, sent) = paris_setup();
        let mut resp = translated(&probe, PUBLIC, 61000);
        if let Some(q) = resp.quoted.as_mut() {
            q.dst = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1));
        }
        assert!(c.correlate(&resp, sent).is_none());
        assert!(pending.contains(1, probe.token));
    }
}
