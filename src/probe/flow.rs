//! Per-flow identifying fields for ECMP-stable probing.
//!
//! A flow is a set of probes that share every field a router hashes on when
//! picking an equal-cost next hop. Each flow gets its own source port (UDP,
//! TCP) or identifier (ICMP); the per-probe correlation token lives in a
//! field that does not feed the hash.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::config::{MultipathAlgorithm, ProbeProtocol, SessionConfig};

/// Identifies a specific probe for correlation
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProbeId {
    pub ttl: u8,
    pub seq: u8,
}

impl ProbeId {
    pub fn new(ttl: u8, seq: u8) -> Self {
        Self { ttl, seq }
    }

    /// Encode TTL and sequence into a 16-bit value
    pub fn to_sequence(&self) -> u16 {
        ((self.ttl as u16) << 8) | (self.seq as u16)
    }

    /// Decode from a 16-bit value
    pub fn from_sequence(seq: u16) -> Self {
        Self {
            ttl: (seq >> 8) as u8,
            seq: (seq & 0xFF) as u8,
        }
    }
}

/// Per-round sequence byte for a flow.
///
/// Distinct flows in the same round get distinct values, so a token stays
/// unique across the whole session even when NAT rewrites the field that
/// identifies the flow.
pub fn round_sequence(round: u32, flow: u16, flows: u16) -> u8 {
    (round.wrapping_mul(flows as u32).wrapping_add(flow as u32) & 0xFF) as u8
}

/// Where the correlation token travels in the probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenCarrier {
    /// ICMP echo sequence number
    IcmpSequence,
    /// UDP checksum, steered through two payload bytes
    UdpChecksum,
    /// IPv4 identification field
    IpIdentification,
    /// UDP length, as an offset over a fixed minimum payload
    UdpPayloadLength,
    /// Upper 16 bits of the TCP sequence number
    TcpSequence,
}

/// Number of distinct lengths the payload-length carrier uses per hop-limit sweep
const PAYLOAD_LENGTH_ROUNDS: u16 = 4;

impl TokenCarrier {
    /// Wire value of the token for a probe
    pub fn encode(self, id: ProbeId) -> u16 {
        match self {
            // 6 bits of hop-limit, 2 bits of round; offsets stay below 256 bytes
            Self::UdpPayloadLength => {
                ((id.seq as u16 % PAYLOAD_LENGTH_ROUNDS) << 6) | (id.ttl.saturating_sub(1) as u16 & 0x3F)
            }
            _ => id.to_sequence(),
        }
    }

    /// True if the carrier is the UDP checksum itself
    pub fn uses_checksum(self) -> bool {
        matches!(self, Self::UdpChecksum)
    }
}

/// How well a flow pins its ECMP path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EcmpFidelity {
    /// Every hash-relevant field is constant within the flow
    Full,
    /// Only the ICMP identifier is constant; the checksum varies per probe,
    /// so routers hashing on the first transport word may split a flow
    IdentifierOnly,
}

/// Deterministic identifying fields of one flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowFields {
    pub flow: u16,
    /// UDP/TCP source port
    pub src_port: Option<u16>,
    /// UDP/TCP destination port
    pub dst_port: Option<u16>,
    /// ICMP echo identifier
    pub identifier: Option<u16>,
    /// Constant ICMP checksum held across the flow
    pub checksum_seed: Option<u16>,
    pub carrier: TokenCarrier,
}

impl FlowFields {
    /// Field a response must carry back to identify this flow
    pub fn key(&self) -> u16 {
        self.src_port.or(self.identifier).unwrap_or(self.flow)
    }

    pub fn ecmp_fidelity(&self) -> EcmpFidelity {
        if self.identifier.is_some() && self.checksum_seed.is_none() {
            EcmpFidelity::IdentifierOnly
        } else {
            EcmpFidelity::Full
        }
    }
}

/// Flow fields for every flow of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowPlan {
    protocol: ProbeProtocol,
    algorithm: MultipathAlgorithm,
    carrier: TokenCarrier,
    flows: Vec<FlowFields>,
    key_base: u16,
}

impl FlowPlan {
    pub fn new(config: &SessionConfig) -> Self {
        let carrier = select_carrier(config.protocol, config.algorithm, config.target);
        let key_base = match config.protocol {
            ProbeProtocol::Icmp => config.identifier_base,
            _ => config.src_port_base,
        };
        let flows = (0..config.flows)
            .map(|flow| derive_fields(config, carrier, flow))
            .collect();
        Self {
            protocol: config.protocol,
            algorithm: config.algorithm,
            carrier,
            flows,
            key_base,
        }
    }

    pub fn protocol(&self) -> ProbeProtocol {
        self.protocol
    }

    pub fn algorithm(&self) -> MultipathAlgorithm {
        self.algorithm
    }

    pub fn carrier(&self) -> TokenCarrier {
        self.carrier
    }

    pub fn len(&self) -> u16 {
        self.flows.len() as u16
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn flows(&self) -> &[FlowFields] {
        &self.flows
    }

    pub fn flow(&self, flow: u16) -> Option<&FlowFields> {
        self.flows.get(flow as usize)
    }

    /// Probe identity for a (round, flow, hop-limit) triple
    pub fn probe_id(&self, round: u32, flow: u16, ttl: u8) -> ProbeId {
        let seq = match self.carrier {
            // Flows are told apart by source port; only the round needs encoding
            TokenCarrier::UdpPayloadLength => (round & 0xFF) as u8,
            _ => round_sequence(round, flow, self.len()),
        };
        ProbeId::new(ttl, seq)
    }

    /// Map a returned source port / identifier back to its flow.
    /// Keys outside the flow range (NAT rewrites, foreign traffic) map to None.
    pub fn flow_for_key(&self, key: u16) -> Option<u16> {
        let offset = key.checked_sub(self.key_base)?;
        (offset < self.len()).then_some(offset)
    }
}

fn select_carrier(protocol: ProbeProtocol, algorithm: MultipathAlgorithm, target: IpAddr) -> TokenCarrier {
    match (protocol, algorithm, target) {
        (ProbeProtocol::Icmp, _, _) => TokenCarrier::IcmpSequence,
        (ProbeProtocol::Tcp, _, _) => TokenCarrier::TcpSequence,
        (ProbeProtocol::Udp, MultipathAlgorithm::Paris, _) => TokenCarrier::UdpChecksum,
        (ProbeProtocol::Udp, MultipathAlgorithm::Dublin, IpAddr::V4(_)) => TokenCarrier::IpIdentification,
        (ProbeProtocol::Udp, MultipathAlgorithm::Dublin, IpAddr::V6(_)) => TokenCarrier::UdpPayloadLength,
    }
}

fn derive_fields(config: &SessionConfig, carrier: TokenCarrier, flow: u16) -> FlowFields {
    match config.protocol {
        ProbeProtocol::Icmp => {
            let identifier = config.identifier_base.wrapping_add(flow);
            let checksum_seed = match config.algorithm {
                // Any constant works as long as it differs per flow and is never 0xFFFF
                MultipathAlgorithm::Paris => Some(0x4000u16.wrapping_add(flow.wrapping_mul(0x0101))),
                MultipathAlgorithm::Dublin => None,
            };
            FlowFields {
                flow,
                src_port: None,
                dst_port: None,
                identifier: Some(identifier),
                checksum_seed,
                carrier,
            }
        }
        ProbeProtocol::Udp | ProbeProtocol::Tcp => FlowFields {
            flow,
            src_port: Some(config.src_port_base.wrapping_add(flow)),
            dst_port: Some(config.dst_port),
            identifier: None,
            checksum_seed: None,
            carrier,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn config(protocol: ProbeProtocol, algorithm: MultipathAlgorithm, flows: u16) -> SessionConfig {
        let mut config = SessionConfig::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9)), protocol);
        config.algorithm = algorithm;
        config.flows = flows;
        config
    }

    #[test]
    fn test_probe_id_encoding() {
        let id = ProbeId::new(15, 42);
        let decoded = ProbeId::from_sequence(id.to_sequence());
        assert_eq!(decoded, id);
    }

    #[test]
    fn test_carrier_selection() {
        let plan = FlowPlan::new(&config(ProbeProtocol::Udp, MultipathAlgorithm::Paris, 2));
        assert_eq!(plan.carrier(), TokenCarrier::UdpChecksum);

        let plan = FlowPlan::new(&config(ProbeProtocol::Udp, MultipathAlgorithm::Dublin, 2));
        assert_eq!(plan.carrier(), TokenCarrier::IpIdentification);

        let mut v6 = config(ProbeProtocol::Udp, MultipathAlgorithm::Dublin, 2);
        v6.target = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));
        assert_eq!(FlowPlan::new(&v6).carrier(), TokenCarrier::UdpPayloadLength);

        let plan = FlowPlan::new(&config(ProbeProtocol::Tcp, MultipathAlgorithm::Dublin, 1));
        assert_eq!(plan.carrier(), TokenCarrier::TcpSequence);
    }

    #[test]
    fn test_udp_flows_vary_source_port_only() {
        let plan = FlowPlan::new(&config(ProbeProtocol::Udp, MultipathAlgorithm::Paris, 4));
        let ports: Vec<_> = plan.flows().iter().map(|f| f.src_port.unwrap()).collect();
        assert_eq!(ports, vec![50000, 50001, 50002, 50003]);
        assert!(plan.flows().iter().all(|f| f.dst_port == Some(33434)));
    }

    #[test]
    fn test_icmp_fidelity() {
        let paris = FlowPlan::new(&config(ProbeProtocol::Icmp, MultipathAlgorithm::Paris, 2));
        assert!(paris.flows().iter().all(|f| f.ecmp_fidelity() == EcmpFidelity::Full));
        assert_ne!(paris.flows()[0].checksum_seed, paris.flows()[1].checksum_seed);

        let dublin = FlowPlan::new(&config(ProbeProtocol::Icmp, MultipathAlgorithm::Dublin, 2));
        assert!(dublin
            .flows()
            .iter()
            .all(|f| f.ecmp_fidelity() == EcmpFidelity::IdentifierOnly));
    }

    #[test]
    fn test_flow_for_key_rejects_out_of_range() {
        let plan = FlowPlan::new(&config(ProbeProtocol::Udp, MultipathAlgorithm::Paris, 3));
        assert_eq!(plan.flow_for_key(50002), Some(2));
        assert_eq!(plan.flow_for_key(50003), None);
        assert_eq!(plan.flow_for_key(49999), None);
    }

    #[test]
    fn test_payload_length_token_fits_one_byte() {
        let carrier = TokenCarrier::UdpPayloadLength;
        assert_eq!(carrier.encode(ProbeId::new(1, 0)), 0);
        assert_eq!(carrier.encode(ProbeId::new(64, 3)), 255);
        assert_ne!(carrier.encode(ProbeId::new(5, 0)), carrier.encode(ProbeId::new(5, 1)));
    }

    #[test]
    fn test_payload_length_rounds_alternate() {
        let mut cfg = config(ProbeProtocol::Udp, MultipathAlgorithm::Dublin, 4);
        cfg.target = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));
        let plan = FlowPlan::new(&cfg);
        let a = plan.carrier().encode(plan.probe_id(0, 3, 5));
        let b = plan.carrier().encode(plan.probe_id(1, 3, 5));
        assert_ne!(a, b);
    }

    #[test]
    fn test_round_sequence_unique_across_flows() {
        let seqs: Vec<_> = (0..4).map(|flow| round_sequence(7, flow, 4)).collect();
        let mut deduped = seqs.clone();
        deduped.dedup();
        assert_eq!(seqs, deduped);
        assert_ne!(round_sequence(7, 3, 4), round_sequence(8, 3, 4));
    }

    proptest! {
        #[test]
        fn prop_plan_is_deterministic(flows in 1u16..=16, paris in any::<bool>(), proto in 0u8..3) {
            let protocol = [ProbeProtocol::Icmp, ProbeProtocol::Udp, ProbeProtocol::Tcp][proto as usize];
            let algorithm = if paris { MultipathAlgorithm::Paris } else { MultipathAlgorithm::Dublin };
            let cfg = config(protocol, algorithm, flows);
            prop_assert_eq!(FlowPlan::new(&cfg), FlowPlan::new(&cfg));
        }

        #[test]
        fn prop_flow_keys_distinct(flows in 1u16..=16) {
            let plan = FlowPlan::new(&config(ProbeProtocol::Tcp, MultipathAlgorithm::Paris, flows));
            for f in plan.flows() {
                prop_assert_eq!(plan.flow_for_key(f.key()), Some(f.flow));
            }
        }
    }
}
