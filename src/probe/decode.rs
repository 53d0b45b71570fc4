//! Inbound packet parsing.
//!
//! Turns raw bytes from a receive socket into a typed [`ProbeResponse`]
//! carrying the correlation token and flow key recovered from either the
//! reply itself (echo reply, TCP SYN-ACK/RST) or from the original probe
//! quoted inside an ICMP error. Anything unparseable yields `None`.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::config::{ProbeProtocol, SessionConfig};
use crate::probe::extension::{Extensions, parse_extensions};
use crate::probe::flow::TokenCarrier;
use crate::probe::{checksum, ipv4, tcp, udp};

// IP protocol numbers
const IPPROTO_ICMP: u8 = 1;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;
const IPPROTO_ICMPV6: u8 = 58;

// ICMPv4 types
const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_DEST_UNREACHABLE: u8 = 3;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_TIME_EXCEEDED: u8 = 11;
const ICMP_FRAG_NEEDED: u8 = 4;

// ICMPv6 types
const ICMPV6_DEST_UNREACHABLE: u8 = 1;
const ICMPV6_PACKET_TOO_BIG: u8 = 2;
const ICMPV6_TIME_EXCEEDED: u8 = 3;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

// IPv6 extension headers we can walk through in a quoted packet
const IPV6_NH_HOP_BY_HOP: u8 = 0;
const IPV6_NH_ROUTING: u8 = 43;
const IPV6_NH_DEST_OPTS: u8 = 60;
const IPV6_HEADER_LEN: usize = 40;

const ICMP_HEADER_LEN: usize = 8;

/// How a receive socket frames the bytes it hands back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Full IPv4 packet (raw IPv4 sockets)
    Ipv4Packet,
    /// ICMP/ICMPv6 message without IP header (raw ICMPv6, datagram ICMP)
    IcmpMessage,
    /// TCP segment without IP header (raw IPv6 TCP)
    TcpSegment,
}

/// Type of response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseKind {
    TimeExceeded { code: u8 },
    DestinationUnreachable { code: u8 },
    /// ICMPv4 fragmentation needed or ICMPv6 packet too big
    PacketTooBig { mtu: u32 },
    EchoReply,
    /// SYN-ACK from the target
    TcpReply,
    /// RST from the target
    TcpRefused,
}

impl ResponseKind {
    /// ICMP error quoting the original probe
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::TimeExceeded { .. } | Self::DestinationUnreachable { .. } | Self::PacketTooBig { .. }
        )
    }
}

/// Fields of the original probe recovered from an ICMP error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotedProbe {
    /// Source address as the responder saw it
    pub src: IpAddr,
    pub dst: IpAddr,
    /// Remaining TTL of the quoted packet
    pub ttl: u8,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub identifier: Option<u16>,
    pub udp_checksum: Option<u16>,
}

/// A decoded response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub responder: IpAddr,
    pub kind: ResponseKind,
    /// Source port or ICMP identifier identifying the flow
    pub flow_key: u16,
    pub token: u16,
    pub quoted: Option<QuotedProbe>,
    pub extensions: Option<Extensions>,
}

/// Session-specific decoder
#[derive(Debug, Clone)]
pub struct Decoder {
    protocol: ProbeProtocol,
    carrier: TokenCarrier,
    payload_size: usize,
}

struct Quoted<'a> {
    src: IpAddr,
    dst: IpAddr,
    ttl: u8,
    ip_id: Option<u16>,
    protocol: u8,
    transport: &'a [u8],
}

impl Decoder {
    pub fn new(config: &SessionConfig, carrier: TokenCarrier) -> Self {
        Self {
            protocol: config.protocol,
            carrier,
            payload_size: config.payload_size.max(udp::MIN_UDP_PAYLOAD),
        }
    }

    /// Parse one received packet
    pub fn decode(&self, data: &[u8], responder: IpAddr, framing: Framing) -> Option<ProbeResponse> {
        match framing {
            Framing::Ipv4Packet => {
                let hlen = ipv4::header_len(data)?;
                match data[9] {
                    IPPROTO_ICMP => self.decode_icmp_v4(&data[hlen..], responder),
                    IPPROTO_TCP => self.decode_tcp_reply(&data[hlen..], responder),
                    _ => None,
                }
            }
            Framing::IcmpMessage => match responder {
                IpAddr::V4(_) => self.decode_icmp_v4(data, responder),
                IpAddr::V6(_) => self.decode_icmp_v6(data, responder),
            },
            Framing::TcpSegment => self.decode_tcp_reply(data, responder),
        }
    }

    fn decode_icmp_v4(&self, msg: &[u8], responder: IpAddr) -> Option<ProbeResponse> {
        if msg.len() < ICMP_HEADER_LEN || !checksum::verify(msg) {
            return None;
        }
        let kind = match (msg[0], msg[1]) {
            (ICMP_ECHO_REPLY, _) => return self.decode_echo_reply(msg, responder),
            (ICMP_TIME_EXCEEDED, code) => ResponseKind::TimeExceeded { code },
            (ICMP_DEST_UNREACHABLE, ICMP_FRAG_NEEDED) => ResponseKind::PacketTooBig {
                mtu: u16::from_be_bytes([msg[6], msg[7]]) as u32,
            },
            (ICMP_DEST_UNREACHABLE, code) => ResponseKind::DestinationUnreachable { code },
            _ => return None,
        };
        let payload = &msg[ICMP_HEADER_LEN..];
        let quoted = parse_quoted_ipv4(payload)?;
        let extensions = parse_extensions(payload, msg[5], 4);
        self.decode_error(kind, quoted, responder, extensions)
    }

    fn decode_icmp_v6(&self, msg: &[u8], responder: IpAddr) -> Option<ProbeResponse> {
        if msg.len() < ICMP_HEADER_LEN {
            return None;
        }
        let kind = match (msg[0], msg[1]) {
            (ICMPV6_ECHO_REPLY, _) => return self.decode_echo_reply(msg, responder),
            (ICMPV6_TIME_EXCEEDED, code) => ResponseKind::TimeExceeded { code },
            (ICMPV6_DEST_UNREACHABLE, code) => ResponseKind::DestinationUnreachable { code },
            (ICMPV6_PACKET_TOO_BIG, _) => ResponseKind::PacketTooBig {
                mtu: u32::from_be_bytes([msg[4], msg[5], msg[6], msg[7]]),
            },
            _ => return None,
        };
        let payload = &msg[ICMP_HEADER_LEN..];
        let quoted = parse_quoted_ipv6(payload)?;
        // Packet Too Big has no length field, the MTU occupies those bytes
        let extensions = match kind {
            ResponseKind::PacketTooBig { .. } => None,
            _ => parse_extensions(payload, msg[4], 8),
        };
        self.decode_error(kind, quoted, responder, extensions)
    }

    fn decode_echo_reply(&self, msg: &[u8], responder: IpAddr) -> Option<ProbeResponse> {
        if self.protocol != ProbeProtocol::Icmp {
            return None;
        }
        let mut identifier = u16::from_be_bytes([msg[4], msg[5]]);
        let sequence = u16::from_be_bytes([msg[6], msg[7]]);
        // Datagram sockets may rewrite the identifier; the payload keeps the original
        if msg.len() >= ICMP_HEADER_LEN + 4 && u16::from_be_bytes([msg[10], msg[11]]) == sequence {
            identifier = u16::from_be_bytes([msg[8], msg[9]]);
        }
        Some(ProbeResponse {
            responder,
            kind: ResponseKind::EchoReply,
            flow_key: identifier,
            token: sequence,
            quoted: None,
            extensions: None,
        })
    }

    fn decode_error(
        &self,
        kind: ResponseKind,
        quoted: Quoted<'_>,
        responder: IpAddr,
        extensions: Option<Extensions>,
    ) -> Option<ProbeResponse> {
        let t = quoted.transport;
        if t.len() < 8 {
            return None;
        }
        let (flow_key, token, probe) = match (self.protocol, quoted.protocol) {
            (ProbeProtocol::Icmp, IPPROTO_ICMP | IPPROTO_ICMPV6) => {
                if t[0] != ICMP_ECHO_REQUEST && t[0] != ICMPV6_ECHO_REQUEST {
                    return None;
                }
                let identifier = u16::from_be_bytes([t[4], t[5]]);
                let sequence = u16::from_be_bytes([t[6], t[7]]);
                let probe = QuotedProbe {
                    src: quoted.src,
                    dst: quoted.dst,
                    ttl: quoted.ttl,
                    src_port: None,
                    dst_port: None,
                    identifier: Some(identifier),
                    udp_checksum: None,
                };
                (identifier, sequence, probe)
            }
            (ProbeProtocol::Udp, IPPROTO_UDP) => {
                let src_port = u16::from_be_bytes([t[0], t[1]]);
                let dst_port = u16::from_be_bytes([t[2], t[3]]);
                let length = u16::from_be_bytes([t[4], t[5]]);
                let cksum = u16::from_be_bytes([t[6], t[7]]);
                let token = match self.carrier {
                    TokenCarrier::UdpChecksum => cksum,
                    TokenCarrier::IpIdentification => quoted.ip_id?,
                    TokenCarrier::UdpPayloadLength => {
                        let offset = (length as usize).checked_sub(udp::UDP_HEADER_SIZE + self.payload_size)?;
                        u16::try_from(offset).ok()?
                    }
                    _ => return None,
                };
                let probe = QuotedProbe {
                    src: quoted.src,
                    dst: quoted.dst,
                    ttl: quoted.ttl,
                    src_port: Some(src_port),
                    dst_port: Some(dst_port),
                    identifier: None,
                    udp_checksum: Some(cksum),
                };
                (src_port, token, probe)
            }
            (ProbeProtocol::Tcp, IPPROTO_TCP) => {
                let src_port = u16::from_be_bytes([t[0], t[1]]);
                let dst_port = u16::from_be_bytes([t[2], t[3]]);
                let seq = u32::from_be_bytes([t[4], t[5], t[6], t[7]]);
                let probe = QuotedProbe {
                    src: quoted.src,
                    dst: quoted.dst,
                    ttl: quoted.ttl,
                    src_port: Some(src_port),
                    dst_port: Some(dst_port),
                    identifier: None,
                    udp_checksum: None,
                };
                (src_port, tcp::sequence_to_token(seq), probe)
            }
            _ => return None,
        };

        Some(ProbeResponse {
            responder,
            kind,
            flow_key,
            token,
            quoted: Some(probe),
            extensions,
        })
    }

    fn decode_tcp_reply(&self, seg: &[u8], responder: IpAddr) -> Option<ProbeResponse> {
        if self.protocol != ProbeProtocol::Tcp || seg.len() < tcp::TCP_HEADER_SIZE {
            return None;
        }
        let dst_port = u16::from_be_bytes([seg[2], seg[3]]);
        let ack = u32::from_be_bytes([seg[8], seg[9], seg[10], seg[11]]);
        let flags = seg[13];
        let kind = if flags & tcp::TCP_FLAG_RST != 0 {
            ResponseKind::TcpRefused
        } else if flags & (tcp::TCP_FLAG_SYN | tcp::TCP_FLAG_ACK) == tcp::TCP_FLAG_SYN | tcp::TCP_FLAG_ACK {
            ResponseKind::TcpReply
        } else {
            return None;
        };
        // Replies acknowledge our sequence number plus one
        Some(ProbeResponse {
            responder,
            kind,
            flow_key: dst_port,
            token: tcp::sequence_to_token(ack.wrapping_sub(1)),
            quoted: None,
            extensions: None,
        })
    }
}

fn parse_quoted_ipv4(data: &[u8]) -> Option<Quoted<'_>> {
    let hlen = ipv4::header_len(data)?;
    let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
    let dst = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
    Some(Quoted {
        src: IpAddr::V4(src),
        dst: IpAddr::V4(dst),
        ttl: data[8],
        ip_id: Some(u16::from_be_bytes([data[4], data[5]])),
        protocol: data[9],
        transport: &data[hlen..],
    })
}

fn parse_quoted_ipv6(data: &[u8]) -> Option<Quoted<'_>> {
    if data.len() < IPV6_HEADER_LEN || data[0] >> 4 != 6 {
        return None;
    }
    let mut src = [0u8; 16];
    src.copy_from_slice(&data[8..24]);
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&data[24..40]);
    let mut next_header = data[6];
    let mut offset = IPV6_HEADER_LEN;
    // Walk variable-length extension headers; fragments and anything else end the walk
    while matches!(next_header, IPV6_NH_HOP_BY_HOP | IPV6_NH_ROUTING | IPV6_NH_DEST_OPTS) {
        if data.len() < offset + 2 {
            return None;
        }
        next_header = data[offset];
        offset += (data[offset + 1] as usize + 1) * 8;
    }
    Some(Quoted {
        src: IpAddr::V6(Ipv6Addr::from(src)),
        dst: IpAddr::V6(Ipv6Addr::from(octets)),
        ttl: data[7],
        ip_id: None,
        protocol: next_header,
        transport: data.get(offset..)?,
    })
}
