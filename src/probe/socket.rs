//! Socket transport behind the [`ProbeSender`] / [`PacketSource`] seams.
//!
//! Privileged sessions send through raw sockets (or per-flow datagram UDP
//! sockets, which keep the source port pinned) and receive every ICMP error
//! on a raw ICMP socket. Unprivileged sessions use datagram sockets only.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{MultipathAlgorithm, PrivilegeMode, ProbeProtocol, SessionConfig};
use crate::error::{Error, Result};
use crate::probe::decode::Framing;
use crate::probe::encode::EncodedProbe;
use crate::probe::flow::FlowPlan;
use crate::probe::{ipv4, udp};

/// Read timeout on receive sockets; bounds how long a listener takes to notice shutdown
pub const LISTENER_READ_TIMEOUT: Duration = Duration::from_millis(100);

const RECV_BUFFER_SIZE: usize = 1024 * 1024;
const IPPROTO_RAW: i32 = 255;

/// Sends encoded probes with the probe's hop-limit
pub trait ProbeSender: Send {
    fn send(&mut self, probe: &EncodedProbe) -> io::Result<()>;
}

/// One received packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvPacket {
    pub len: usize,
    pub source: IpAddr,
    pub framing: Framing,
}

/// Blocking packet source polled by a listener thread.
///
/// `Ok(None)` means the read timed out with nothing to deliver.
pub trait PacketSource: Send {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<RecvPacket>>;
}

/// An opened transport: one sender, one or more receive sources
pub struct Transport {
    pub sender: Box<dyn ProbeSender>,
    pub sources: Vec<Box<dyn PacketSource>>,
}

enum SendPath {
    /// Raw socket for the probe protocol; the kernel writes the IP header
    Raw(Socket),
    /// IPPROTO_RAW socket; we write the IPv4 header (identification carries the token)
    HeaderIncluded(Socket),
    /// One bound datagram socket per flow, pinning the source port or identifier
    PerFlow { sockets: Vec<Socket>, payload_only: bool },
}

/// Socket-backed [`ProbeSender`]
pub struct SocketSender {
    path: SendPath,
    ipv6: bool,
}

impl ProbeSender for SocketSender {
    fn send(&mut self, probe: &EncodedProbe) -> io::Result<()> {
        match &self.path {
            SendPath::Raw(socket) => {
                set_hop_limit(socket, probe.ttl, self.ipv6)?;
                socket.send_to(&probe.transport, &SockAddr::from(SocketAddr::new(probe.dst, 0)))?;
            }
            SendPath::HeaderIncluded(socket) => {
                let (IpAddr::V4(src), IpAddr::V4(dst)) = (probe.src, probe.dst) else {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "header-included send requires IPv4",
                    ));
                };
                let packet = ipv4::build_ipv4_packet(
                    src,
                    dst,
                    probe.ttl,
                    probe.ip_id.unwrap_or_default(),
                    udp::IPPROTO_UDP,
                    &probe.transport,
                );
                socket.send_to(&packet, &SockAddr::from(SocketAddr::new(probe.dst, 0)))?;
            }
            SendPath::PerFlow { sockets, payload_only } => {
                let socket = sockets.get(probe.flow as usize).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, format!("no socket for flow {}", probe.flow))
                })?;
                set_hop_limit(socket, probe.ttl, self.ipv6)?;
                let data = if *payload_only { probe.udp_payload() } else { &probe.transport[..] };
                socket.send_to(data, &SockAddr::from(SocketAddr::new(probe.dst, probe.dst_port)))?;
            }
        }
        Ok(())
    }
}

/// Socket-backed [`PacketSource`]
pub struct SocketSource {
    socket: Socket,
    framing: Framing,
}

impl SocketSource {
    fn new(socket: Socket, framing: Framing) -> io::Result<Self> {
        socket.set_read_timeout(Some(LISTENER_READ_TIMEOUT))?;
        if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
            debug!(error = %e, "could not enlarge receive buffer");
        }
        Ok(Self { socket, framing })
    }
}

impl PacketSource for SocketSource {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<RecvPacket>> {
        // SAFETY: recv_from only writes initialized bytes into the buffer and
        // `buf` is already initialized, so viewing it as MaybeUninit is sound.
        let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
        match self.socket.recv_from(uninit) {
            Ok((len, addr)) => Ok(addr.as_socket().map(|sa| RecvPacket {
                len,
                source: sa.ip(),
                framing: self.framing,
            })),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Open sockets for a validated session
pub fn open_transport(config: &SessionConfig, plan: &FlowPlan) -> Result<Transport> {
    let ipv6 = config.target.is_ipv6();
    let mut sources: Vec<Box<dyn PacketSource>> = Vec::new();

    let path = match (config.privilege, config.protocol) {
        (PrivilegeMode::Privileged, ProbeProtocol::Icmp) => {
            SendPath::Raw(open_err("raw ICMP send socket", raw_socket(ipv6, icmp_protocol(ipv6)))?)
        }
        (PrivilegeMode::Privileged, ProbeProtocol::Tcp) => {
            let recv = open_err("raw TCP receive socket", raw_socket(ipv6, Protocol::TCP))?;
            let framing = if ipv6 { Framing::TcpSegment } else { Framing::Ipv4Packet };
            sources.push(Box::new(source(recv, framing)?));
            SendPath::Raw(open_err("raw TCP send socket", raw_socket(ipv6, Protocol::TCP))?)
        }
        (PrivilegeMode::Privileged, ProbeProtocol::Udp)
            if config.algorithm == MultipathAlgorithm::Dublin && !ipv6 =>
        {
            let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(IPPROTO_RAW)));
            SendPath::HeaderIncluded(open_err("header-included raw socket", socket)?)
        }
        (_, ProbeProtocol::Udp) => SendPath::PerFlow {
            sockets: per_flow_sockets(plan, ipv6, Type::DGRAM, Protocol::UDP)?,
            payload_only: true,
        },
        (PrivilegeMode::Unprivileged, ProbeProtocol::Icmp) => SendPath::PerFlow {
            sockets: per_flow_sockets(plan, ipv6, Type::DGRAM, icmp_protocol(ipv6))?,
            payload_only: false,
        },
        (PrivilegeMode::Unprivileged, ProbeProtocol::Tcp) => {
            return Err(Error::InsufficientPrivilege(
                "TCP probing needs raw sockets".to_string(),
            ));
        }
    };

    // ICMP errors from intermediate routers only arrive on raw ICMP sockets
    let icmp_framing = if ipv6 { Framing::IcmpMessage } else { Framing::Ipv4Packet };
    match raw_socket(ipv6, icmp_protocol(ipv6)) {
        Ok(recv) => sources.push(Box::new(source(recv, icmp_framing)?)),
        Err(e) => match &path {
            SendPath::PerFlow { sockets, payload_only: false } => {
                // Ping sockets deliver echo replies only, so intermediate hops stay silent
                warn!(error = %e, "no raw ICMP receive socket, only the target will answer");
                for socket in sockets {
                    let clone = socket.try_clone().map_err(|e| Error::transport("ping socket clone", e))?;
                    sources.push(Box::new(source(clone, Framing::IcmpMessage)?));
                }
            }
            _ => return Err(privilege_error("raw ICMP receive socket", e)),
        },
    }

    debug!(sources = sources.len(), ?config.protocol, ?config.privilege, "transport open");
    Ok(Transport {
        sender: Box::new(SocketSender { path, ipv6 }),
        sources,
    })
}

/// Local address the kernel would use to reach `target`.
///
/// Connecting a UDP socket sends nothing; it only selects the route.
pub fn detect_source_ip(target: IpAddr) -> Result<IpAddr> {
    let domain = if target.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::transport("route probe socket", e))?;
    socket
        .connect(&SockAddr::from(SocketAddr::new(target, 80)))
        .map_err(|e| Error::transport("route lookup", e))?;
    let local = socket.local_addr().map_err(|e| Error::transport("route lookup", e))?;
    local.as_socket().map(|sa| sa.ip()).ok_or_else(|| {
        Error::transport(
            "route lookup",
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no local address"),
        )
    })
}

fn icmp_protocol(ipv6: bool) -> Protocol {
    if ipv6 { Protocol::ICMPV6 } else { Protocol::ICMPV4 }
}

fn domain(ipv6: bool) -> Domain {
    if ipv6 { Domain::IPV6 } else { Domain::IPV4 }
}

fn raw_socket(ipv6: bool, protocol: Protocol) -> io::Result<Socket> {
    Socket::new(domain(ipv6), Type::RAW, Some(protocol))
}

fn source(socket: Socket, framing: Framing) -> Result<SocketSource> {
    SocketSource::new(socket, framing).map_err(|e| Error::transport("receive socket options", e))
}

/// One datagram socket per flow, bound to the flow's source port or ICMP identifier
fn per_flow_sockets(plan: &FlowPlan, ipv6: bool, ty: Type, protocol: Protocol) -> Result<Vec<Socket>> {
    let unspecified = if ipv6 {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };
    plan.flows()
        .iter()
        .map(|fields| {
            let socket = open_err("datagram probe socket", Socket::new(domain(ipv6), ty, Some(protocol)))?;
            socket
                .bind(&SockAddr::from(SocketAddr::new(unspecified, fields.key())))
                .map_err(|e| Error::transport("bind flow socket", e))?;
            Ok(socket)
        })
        .collect()
}

fn set_hop_limit(socket: &Socket, ttl: u8, ipv6: bool) -> io::Result<()> {
    if ipv6 {
        socket.set_unicast_hops_v6(ttl as u32)
    } else {
        socket.set_ttl(ttl as u32)
    }
}

fn open_err(what: &'static str, result: io::Result<Socket>) -> Result<Socket> {
    result.map_err(|e| privilege_error(what, e))
}

fn privilege_error(what: &'static str, e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::PermissionDenied {
        let binary = std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "hoptrace".to_string());
        Error::InsufficientPrivilege(format!(
            "cannot open {what}: {e}\n\n\
             Fix options:\n\
             \u{2022} Run with sudo\n\
             \u{2022} Add capability: sudo setcap cap_net_raw+ep {binary}\n\
             \u{2022} ICMP only: --unprivileged with net.ipv4.ping_group_range covering your group"
        ))
    } else {
        Error::transport(what, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privilege_error_mapping() {
        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(matches!(
            privilege_error("raw socket", denied),
            Error::InsufficientPrivilege(_)
        ));
        let other = io::Error::from(io::ErrorKind::AddrInUse);
        assert!(matches!(privilege_error("raw socket", other), Error::Transport { .. }));
    }

    #[test]
    fn test_detect_source_ip_loopback() {
        let ip = detect_source_ip(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        assert!(ip.is_loopback());
    }
}
