use pnet::packet::MutablePacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpCode, IcmpType, IcmpTypes};

use crate::probe::checksum;

/// ICMP header size (fixed)
pub const ICMP_HEADER_SIZE: usize = 8;
/// Minimum payload size (id/seq backup + steering word + pad)
pub const MIN_PAYLOAD_SIZE: usize = 8;
/// ICMPv6 Echo Request type
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
/// Offset of the checksum-steering word within the ICMP message
pub const STEERING_OFFSET: usize = ICMP_HEADER_SIZE + 4;

/// Build an ICMP Echo Request packet.
///
/// Payload layout:
/// - Bytes 0-1: identifier (backup for kernels that rewrite it on datagram sockets)
/// - Bytes 2-3: sequence (backup)
/// - Bytes 4-5: checksum steering word, zero unless a flow checksum is pinned
/// - Bytes 6+: pattern fill
///
/// The checksum is left at zero; see [`finish_echo_request`].
pub fn build_echo_request(identifier: u16, sequence: u16, payload_size: usize, ipv6: bool) -> Vec<u8> {
    let payload_size = payload_size.max(MIN_PAYLOAD_SIZE);
    let mut buffer = vec![0u8; ICMP_HEADER_SIZE + payload_size];

    let Some(mut packet) = MutableEchoRequestPacket::new(&mut buffer) else {
        return buffer;
    };
    if ipv6 {
        packet.set_icmp_type(IcmpType::new(ICMPV6_ECHO_REQUEST));
    } else {
        packet.set_icmp_type(IcmpTypes::EchoRequest);
    }
    packet.set_icmp_code(IcmpCode::new(0));
    packet.set_identifier(identifier);
    packet.set_sequence_number(sequence);

    let payload = packet.payload_mut();
    payload[0..2].copy_from_slice(&identifier.to_be_bytes());
    payload[2..4].copy_from_slice(&sequence.to_be_bytes());
    for (i, byte) in payload[6..].iter_mut().enumerate() {
        *byte = (i & 0xFF) as u8;
    }

    buffer
}

/// Fill in the echo checksum, optionally steering it to a fixed value.
///
/// `pseudo` is the pseudo-header sum (zero for ICMPv4). Returns the final checksum.
pub fn finish_echo_request(packet: &mut [u8], pseudo: u32, pinned: Option<u16>) -> u16 {
    packet[2] = 0;
    packet[3] = 0;
    packet[STEERING_OFFSET] = 0;
    packet[STEERING_OFFSET + 1] = 0;
    let natural = checksum::checksum_with(packet, pseudo);
    let cksum = match pinned {
        Some(desired) => {
            let word = checksum::compensate(natural, desired);
            packet[STEERING_OFFSET..STEERING_OFFSET + 2].copy_from_slice(&word.to_be_bytes());
            desired
        }
        None => natural,
    };
    packet[2..4].copy_from_slice(&cksum.to_be_bytes());
    cksum
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::icmp::IcmpPacket;

    #[test]
    fn test_echo_request_layout() {
        let packet = build_echo_request(0x1234, 0x0501, 56, false);
        assert_eq!(packet.len(), ICMP_HEADER_SIZE + 56);
        assert_eq!(packet[0], 8);
        assert_eq!(&packet[4..8], &[0x12, 0x34, 0x05, 0x01]);
        assert_eq!(&packet[8..12], &[0x12, 0x34, 0x05, 0x01]);
    }

    #[test]
    fn test_minimum_payload_enforced() {
        let packet = build_echo_request(1, 1, 0, false);
        assert_eq!(packet.len(), ICMP_HEADER_SIZE + MIN_PAYLOAD_SIZE);
    }

    #[test]
    fn test_checksum_matches_pnet() {
        let mut packet = build_echo_request(0xBEEF, 0x0102, 32, false);
        let cksum = finish_echo_request(&mut packet, 0, None);
        let view = IcmpPacket::new(&packet).unwrap();
        assert_eq!(pnet::packet::icmp::checksum(&view), cksum);
    }

    #[test]
    fn test_pinned_checksum_constant_across_sequences() {
        let mut sums = Vec::new();
        for seq in [0x0100u16, 0x0201, 0x1f07] {
            let mut packet = build_echo_request(0x4242, seq, 32, false);
            finish_echo_request(&mut packet, 0, Some(0x4101));
            assert!(checksum::verify(&packet));
            sums.push(u16::from_be_bytes([packet[2], packet[3]]));
        }
        assert!(sums.iter().all(|&s| s == 0x4101));
    }
}
