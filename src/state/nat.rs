//! NAT detection from quoted probe fields.
//!
//! A router quotes the probe as it arrived there. Any identifying field that
//! differs from what we sent was rewritten on the way, which normal
//! forwarding never does.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::probe::{ExpectedFields, QuotedProbe};

/// Evidence of address or port translation between us and a responder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum NatVerdict {
    SourcePortRewritten { sent: u16, seen: u16 },
    IdentifierRewritten { sent: u16, seen: u16 },
    /// UDP checksum changed: source address rewritten with checksum fix-up
    ChecksumRewritten { sent: u16, seen: u16 },
    DestinationRewritten { sent: IpAddr, seen: IpAddr },
}

#[derive(Debug, Clone, Copy)]
pub struct NatDetector {
    target: IpAddr,
}

impl NatDetector {
    pub fn new(target: IpAddr) -> Self {
        Self { target }
    }

    /// Compare sent fields with the quoted copy; first mismatch wins
    pub fn inspect(&self, expected: &ExpectedFields, quoted: &QuotedProbe) -> Option<NatVerdict> {
        if let (Some(sent), Some(seen)) = (expected.src_port, quoted.src_port)
            && sent != seen
        {
            return Some(NatVerdict::SourcePortRewritten { sent, seen });
        }
        if let (Some(sent), Some(seen)) = (expected.identifier, quoted.identifier)
            && sent != seen
        {
            return Some(NatVerdict::IdentifierRewritten { sent, seen });
        }
        // Zero means the sender skipped the checksum; some middleboxes strip it too
        if let (Some(sent), Some(seen)) = (expected.udp_checksum, quoted.udp_checksum)
            && seen != 0
            && sent != seen
        {
            return Some(NatVerdict::ChecksumRewritten { sent, seen });
        }
        if quoted.dst != self.target {
            return Some(NatVerdict::DestinationRewritten {
                sent: self.target,
                seen: quoted.dst,
            });
        }
        None
    }
}
