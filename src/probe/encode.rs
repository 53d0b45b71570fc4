//! Probe serialization: flow fields + probe identity → wire datagram.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::config::{ProbeProtocol, SessionConfig};
use crate::probe::flow::{FlowPlan, ProbeId, TokenCarrier};
use crate::probe::{checksum, icmp, tcp, udp};

/// Identifying fields as sent, kept with the outstanding probe for NAT checks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedFields {
    pub src_port: Option<u16>,
    pub identifier: Option<u16>,
    /// UDP checksum, only when it does not carry the token
    pub udp_checksum: Option<u16>,
}

/// A probe ready for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedProbe {
    pub flow: u16,
    pub id: ProbeId,
    pub ttl: u8,
    /// Correlation token as it appears on the wire
    pub token: u16,
    pub protocol: ProbeProtocol,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub dst_port: u16,
    /// IPv4 identification to use when the transport writes the IP header
    pub ip_id: Option<u16>,
    /// Transport datagram: ICMP message, UDP header + payload, or TCP header
    pub transport: Vec<u8>,
    pub expected: ExpectedFields,
}

impl EncodedProbe {
    /// UDP payload (what a datagram socket sends)
    pub fn udp_payload(&self) -> &[u8] {
        self.transport.get(udp::UDP_HEADER_SIZE..).unwrap_or(&[])
    }
}

/// Builds wire probes for one session
#[derive(Debug, Clone)]
pub struct Encoder {
    plan: FlowPlan,
    src: IpAddr,
    dst: IpAddr,
    payload_size: usize,
}

impl Encoder {
    /// `src` is the local address used in checksum pseudo-headers
    pub fn new(config: &SessionConfig, plan: FlowPlan, src: IpAddr) -> Self {
        Self {
            plan,
            src,
            dst: config.target,
            payload_size: config.payload_size.max(udp::MIN_UDP_PAYLOAD),
        }
    }

    pub fn plan(&self) -> &FlowPlan {
        &self.plan
    }

    /// Minimum payload size; the payload-length carrier adds its offset to this
    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Serialize the probe for `flow` at `ttl` in `round`. None if the flow does not exist.
    pub fn encode(&self, flow: u16, round: u32, ttl: u8) -> Option<EncodedProbe> {
        let fields = *self.plan.flow(flow)?;
        let id = self.plan.probe_id(round, flow, ttl);
        let token = fields.carrier.encode(id);
        let ipv6 = self.dst.is_ipv6();

        let mut probe = EncodedProbe {
            flow,
            id,
            ttl,
            token,
            protocol: self.plan.protocol(),
            src: self.src,
            dst: self.dst,
            dst_port: fields.dst_port.unwrap_or(0),
            ip_id: None,
            transport: Vec::new(),
            expected: ExpectedFields {
                src_port: fields.src_port,
                identifier: fields.identifier,
                udp_checksum: None,
            },
        };

        match self.plan.protocol() {
            ProbeProtocol::Icmp => {
                let identifier = fields.identifier.unwrap_or_default();
                let mut packet = icmp::build_echo_request(identifier, token, self.payload_size, ipv6);
                let pseudo = if ipv6 {
                    checksum::pseudo_header_sum(self.src, self.dst, 58, packet.len())
                } else {
                    0
                };
                icmp::finish_echo_request(&mut packet, pseudo, fields.checksum_seed);
                probe.transport = packet;
            }
            ProbeProtocol::Udp => {
                let src_port = fields.src_port.unwrap_or_default();
                let size = match fields.carrier {
                    TokenCarrier::UdpPayloadLength => self.payload_size + token as usize,
                    _ => self.payload_size,
                };
                let payload = udp::build_udp_payload(size);
                let pinned = fields.carrier.uses_checksum().then_some(token);
                let (datagram, cksum) =
                    udp::build_udp_datagram(src_port, probe.dst_port, &payload, self.src, self.dst, pinned);
                if !fields.carrier.uses_checksum() {
                    probe.expected.udp_checksum = Some(cksum);
                }
                if fields.carrier == TokenCarrier::IpIdentification {
                    probe.ip_id = Some(token);
                }
                probe.transport = datagram;
            }
            ProbeProtocol::Tcp => {
                let src_port = fields.src_port.unwrap_or_default();
                probe.transport = tcp::build_tcp_syn(token, src_port, probe.dst_port, self.src, self.dst);
            }
        }

        Some(probe)
    }
}
