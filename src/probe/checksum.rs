//! RFC 1071 internet checksum helpers.
//!
//! Besides plain checksum calculation this module can *steer* a checksum:
//! given a packet with a spare 16-bit word, [`compensate`] computes the word
//! value that forces the final checksum to a chosen constant. Paris-style
//! probing relies on this to keep a hash-relevant checksum fixed (ICMP) or
//! to smuggle the correlation token through it (UDP).

use std::net::IpAddr;

/// Accumulate 16-bit big-endian words into a 32-bit running sum
pub fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([chunk[0], chunk[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

/// Fold carries back into the low 16 bits
pub fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Ones-complement checksum of `data`, starting from an initial sum
pub fn checksum_with(data: &[u8], initial: u32) -> u16 {
    !fold(sum_words(data, initial))
}

/// Ones-complement checksum of `data`
pub fn checksum(data: &[u8]) -> u16 {
    checksum_with(data, 0)
}

/// True if the data (checksum field included) sums to all ones
pub fn verify(data: &[u8]) -> bool {
    fold(sum_words(data, 0)) == 0xFFFF
}

/// Pseudo-header sum for UDP/TCP/ICMPv6 checksums
pub fn pseudo_header_sum(src: IpAddr, dst: IpAddr, protocol: u8, length: usize) -> u32 {
    let mut sum = 0u32;
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            sum = sum_words(&src.octets(), sum);
            sum = sum_words(&dst.octets(), sum);
            sum = sum.wrapping_add(protocol as u32);
            sum = sum.wrapping_add(length as u32 & 0xFFFF);
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            sum = sum_words(&src.octets(), sum);
            sum = sum_words(&dst.octets(), sum);
            sum = sum.wrapping_add((length as u32) >> 16);
            sum = sum.wrapping_add(length as u32 & 0xFFFF);
            sum = sum.wrapping_add(protocol as u32);
        }
        // Mixed families never occur on the wire; sum nothing
        _ => {}
    }
    sum
}

/// Ones-complement addition
fn ones_add(a: u16, b: u16) -> u16 {
    fold(a as u32 + b as u32)
}

/// Word value that makes the checksum come out as `desired`.
///
/// `current` is the checksum computed with the spare word (and the checksum
/// field) set to zero. Writing the returned word into the spare slot and
/// recomputing yields `desired`, provided `desired` is not 0xFFFF.
pub fn compensate(current: u16, desired: u16) -> u16 {
    ones_add(!desired, current)
}

/// Checksum a datagram had before a middlebox rewrote covered bytes from
/// `old` to `new` and patched the checksum incrementally (RFC 1624).
///
/// Both slices must have the same even length.
pub fn undo_rewrite(checksum: u16, old: &[u8], new: &[u8]) -> u16 {
    // HC' = ~(~HC + ~m + m'), so HC = ~(~HC' + ~m' + m)
    let mut sum = !checksum as u32;
    for chunk in new.chunks_exact(2) {
        sum = sum.wrapping_add(!u16::from_be_bytes([chunk[0], chunk[1]]) as u32);
    }
    !fold(sum_words(old, sum))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_rfc1071_example() {
        // Example from RFC 1071 section 3
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(fold(sum_words(&data, 0)), 0xddf2);
        assert_eq!(checksum(&data), !0xddf2);
    }

    #[test]
    fn test_odd_length_pads_with_zero() {
        assert_eq!(checksum(&[0x12, 0x34, 0x56]), checksum(&[0x12, 0x34, 0x56, 0x00]));
    }

    #[test]
    fn test_verify_accepts_own_checksum() {
        let mut data = vec![0x45, 0x00, 0x00, 0x1c, 0xab, 0xcd, 0x00, 0x00, 0x00, 0x00];
        let cksum = checksum(&data);
        data[8..10].copy_from_slice(&cksum.to_be_bytes());
        assert!(verify(&data));
        data[0] ^= 0x01;
        assert!(!verify(&data));
    }

    #[test]
    fn test_pseudo_header_v4() {
        let src = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let dst = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let sum = pseudo_header_sum(src, dst, 17, 40);
        assert_eq!(sum, 0x0a00 + 0x0001 + 0x0a00 + 0x0002 + 17 + 40);
    }

    #[test]
    fn test_undo_port_and_address_rewrite() {
        let dst = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
        let pseudo = |src: Ipv4Addr| pseudo_header_sum(IpAddr::V4(src), dst, 17, 12);
        let inside = Ipv4Addr::new(10, 0, 0, 1);
        let outside = Ipv4Addr::new(203, 0, 113, 5);
        let mut datagram = vec![0xC3, 0x50, 0x82, 0x9A, 0x00, 0x0C, 0x00, 0x00, 0xde, 0xad, 0xbe, 0xef];
        let sent = checksum_with(&datagram, pseudo(inside));

        datagram[0..2].copy_from_slice(&61000u16.to_be_bytes());
        let seen = checksum_with(&datagram, pseudo(outside));
        assert_ne!(seen, sent);

        let port_undone = undo_rewrite(seen, &50000u16.to_be_bytes(), &61000u16.to_be_bytes());
        assert_eq!(undo_rewrite(port_undone, &inside.octets(), &outside.octets()), sent);
    }

    #[test]
    fn test_undo_without_rewrite_is_identity() {
        assert_eq!(undo_rewrite(0x1234, &[0xAB, 0xCD], &[0xAB, 0xCD]), 0x1234);
    }

    proptest! {
        #[test]
        fn prop_compensate_steers_checksum(
            mut data in proptest::collection::vec(any::<u8>(), 4..64),
            desired in 0u16..0xFFFF,
        ) {
            let len = data.len() & !1;
            data.truncate(len.max(4));
            data[0] = 0;
            data[1] = 0;
            let current = checksum(&data);
            let word = compensate(current, desired);
            data[0..2].copy_from_slice(&word.to_be_bytes());
            prop_assert_eq!(checksum(&data), desired);
        }
    }
}
