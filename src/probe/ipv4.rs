//! IPv4 header building for header-included raw sends.

use pnet::packet::ip::IpNextHeaderProtocol;
use pnet::packet::ipv4::{self, Ipv4Flags, Ipv4Packet, MutableIpv4Packet};
use std::net::Ipv4Addr;

pub const IPV4_HEADER_SIZE: usize = 20;

/// Build a complete IPv4 packet around a transport datagram.
/// The identification field is caller-chosen; Dublin probing stores the token there.
pub fn build_ipv4_packet(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    ttl: u8,
    identification: u16,
    protocol: u8,
    transport: &[u8],
) -> Vec<u8> {
    let total = IPV4_HEADER_SIZE + transport.len();
    let mut buffer = vec![0u8; total];
    buffer[IPV4_HEADER_SIZE..].copy_from_slice(transport);

    let Some(mut packet) = MutableIpv4Packet::new(&mut buffer) else {
        return buffer;
    };
    packet.set_version(4);
    packet.set_header_length(5);
    packet.set_total_length(total as u16);
    packet.set_identification(identification);
    packet.set_flags(Ipv4Flags::DontFragment);
    packet.set_ttl(ttl);
    packet.set_next_level_protocol(IpNextHeaderProtocol::new(protocol));
    packet.set_source(src);
    packet.set_destination(dst);
    let cksum = ipv4::checksum(&packet.to_immutable());
    packet.set_checksum(cksum);

    buffer
}

/// Header length in bytes of an IPv4 packet, if the header is well formed
pub fn header_len(data: &[u8]) -> Option<usize> {
    let packet = Ipv4Packet::new(data)?;
    if packet.get_version() != 4 {
        return None;
    }
    let len = packet.get_header_length() as usize * 4;
    (len >= IPV4_HEADER_SIZE && data.len() >= len).then_some(len)
}
