use std::net::IpAddr;

use crate::probe::checksum;

/// UDP protocol number for IPv4/IPv6
pub const IPPROTO_UDP: u8 = 17;
/// UDP header size
pub const UDP_HEADER_SIZE: usize = 8;
/// Minimum UDP payload size (steering word + magic + pad)
pub const MIN_UDP_PAYLOAD: usize = 8;
/// Marks our probes in quoted payloads
pub const PROBE_MAGIC: [u8; 4] = *b"HOPT";

/// Build a UDP probe payload of `size` bytes.
///
/// Bytes 0-1 hold the checksum steering word (zero until steered),
/// bytes 2-5 the probe magic, the rest a fill pattern.
pub fn build_udp_payload(size: usize) -> Vec<u8> {
    let size = size.max(MIN_UDP_PAYLOAD);
    let mut payload = vec![0u8; size];
    payload[2..6].copy_from_slice(&PROBE_MAGIC);
    for (i, byte) in payload[6..].iter_mut().enumerate() {
        *byte = (i & 0xFF) as u8;
    }
    payload
}

/// Build a full UDP datagram (header + payload) with a valid checksum.
///
/// With `pinned` set, the first payload word is rewritten so the checksum
/// equals the pinned value. Returns the datagram and its checksum.
pub fn build_udp_datagram(
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
    src: IpAddr,
    dst: IpAddr,
    pinned: Option<u16>,
) -> (Vec<u8>, u16) {
    let len = UDP_HEADER_SIZE + payload.len();
    let mut datagram = vec![0u8; len];
    datagram[0..2].copy_from_slice(&src_port.to_be_bytes());
    datagram[2..4].copy_from_slice(&dst_port.to_be_bytes());
    datagram[4..6].copy_from_slice(&(len as u16).to_be_bytes());
    datagram[UDP_HEADER_SIZE..].copy_from_slice(payload);
    datagram[UDP_HEADER_SIZE] = 0;
    datagram[UDP_HEADER_SIZE + 1] = 0;

    let pseudo = checksum::pseudo_header_sum(src, dst, IPPROTO_UDP, len);
    let natural = checksum::checksum_with(&datagram, pseudo);
    let cksum = match pinned {
        Some(desired) => {
            let word = checksum::compensate(natural, desired);
            datagram[UDP_HEADER_SIZE..UDP_HEADER_SIZE + 2].copy_from_slice(&word.to_be_bytes());
            desired
        }
        // A computed zero is sent as all ones (RFC 768)
        None if natural == 0 => 0xFFFF,
        None => natural,
    };
    datagram[6..8].copy_from_slice(&cksum.to_be_bytes());
    (datagram, cksum)
}
