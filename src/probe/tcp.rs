//! TCP SYN probe building.
//!
//! Sends TCP SYN packets that trigger ICMP Time Exceeded from intermediate routers.
//! The correlation token is carried in the upper half of the TCP sequence number.

use std::net::IpAddr;

use crate::probe::checksum;

/// TCP protocol number
pub const IPPROTO_TCP: u8 = 6;
/// TCP header size (no options)
pub const TCP_HEADER_SIZE: usize = 20;

pub const TCP_FLAG_FIN: u8 = 0x01;
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_RST: u8 = 0x04;
pub const TCP_FLAG_ACK: u8 = 0x10;

/// Sequence number carrying a token
pub fn token_to_sequence(token: u16) -> u32 {
    (token as u32) << 16
}

/// Token from a quoted sequence number
pub fn sequence_to_token(seq: u32) -> u16 {
    (seq >> 16) as u16
}

/// Build a TCP SYN segment. Returns the raw TCP header (kernel adds the IP header).
pub fn build_tcp_syn(token: u16, src_port: u16, dst_port: u16, src_ip: IpAddr, dst_ip: IpAddr) -> Vec<u8> {
    let mut packet = vec![0u8; TCP_HEADER_SIZE];

    packet[0..2].copy_from_slice(&src_port.to_be_bytes());
    packet[2..4].copy_from_slice(&dst_port.to_be_bytes());
    packet[4..8].copy_from_slice(&token_to_sequence(token).to_be_bytes());
    // Acknowledgment number stays 0 for SYN

    // Data offset = 5 (20 bytes / 4)
    packet[12] = 0x50;
    packet[13] = TCP_FLAG_SYN;
    packet[14..16].copy_from_slice(&65535u16.to_be_bytes());

    let pseudo = checksum::pseudo_header_sum(src_ip, dst_ip, IPPROTO_TCP, packet.len());
    let cksum = checksum::checksum_with(&packet, pseudo);
    packet[16..18].copy_from_slice(&cksum.to_be_bytes());

    packet
}
