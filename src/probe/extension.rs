//! ICMP multi-part message extensions (RFC 4884) and MPLS label stacks (RFC 4950).
//!
//! Malformed or absent extension data is never an error: the parser returns
//! `None` and the response is processed without it.

use serde::{Deserialize, Serialize};

use crate::probe::checksum;

const ICMP_EXT_VERSION: u8 = 2;
const MPLS_LABEL_STACK_CLASS: u8 = 1;
const MPLS_LABEL_STACK_TYPE: u8 = 1;
const EXT_HEADER_LEN: usize = 4;
const OBJECT_HEADER_LEN: usize = 4;

/// Original datagram length assumed by pre-RFC 4884 implementations
pub const LEGACY_ORIGINAL_DATAGRAM: usize = 128;

/// Single MPLS label stack entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MplsLabel {
    /// 20-bit label value
    pub label: u32,
    /// Traffic class / experimental bits
    pub exp: u8,
    /// Bottom of stack flag
    pub bottom: bool,
    pub ttl: u8,
}

impl MplsLabel {
    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        let word = u32::from_be_bytes(*bytes);
        Self {
            label: word >> 12,
            exp: ((word >> 9) & 0x07) as u8,
            bottom: (word >> 8) & 0x01 == 1,
            ttl: (word & 0xFF) as u8,
        }
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        let word = ((self.label & 0xF_FFFF) << 12)
            | ((self.exp as u32 & 0x07) << 9)
            | ((self.bottom as u32) << 8)
            | self.ttl as u32;
        word.to_be_bytes()
    }
}

/// One extension object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtensionObject {
    Mpls(Vec<MplsLabel>),
    Unknown {
        class_num: u8,
        class_subtype: u8,
        bytes: Vec<u8>,
    },
}

/// Decoded extension structure of an ICMP error
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extensions {
    pub objects: Vec<ExtensionObject>,
}

impl Extensions {
    /// Labels of the first MPLS object, if any
    pub fn mpls_labels(&self) -> Option<&[MplsLabel]> {
        self.objects.iter().find_map(|obj| match obj {
            ExtensionObject::Mpls(labels) => Some(labels.as_slice()),
            ExtensionObject::Unknown { .. } => None,
        })
    }
}

/// Parse the extension structure trailing an ICMP error payload.
///
/// `payload` starts right after the 8-byte ICMP header. `length` is the
/// RFC 4884 length field of the ICMP header, counted in `word_size` byte
/// units (4 for ICMPv4, 8 for ICMPv6). A zero length means a legacy
/// sender: extensions, if any, start after 128 bytes of original datagram.
pub fn parse_extensions(payload: &[u8], length: u8, word_size: usize) -> Option<Extensions> {
    let ext_start = if length > 0 {
        length as usize * word_size
    } else {
        LEGACY_ORIGINAL_DATAGRAM
    };
    // RFC 4884 requires at least 128 bytes of original datagram when extensions follow
    if ext_start < LEGACY_ORIGINAL_DATAGRAM || payload.len() < ext_start + EXT_HEADER_LEN {
        return None;
    }

    let ext = &payload[ext_start..];
    if ext[0] >> 4 != ICMP_EXT_VERSION {
        return None;
    }
    let cksum = u16::from_be_bytes([ext[2], ext[3]]);
    if cksum != 0 && !checksum::verify(ext) {
        return None;
    }

    let mut objects = Vec::new();
    let mut offset = EXT_HEADER_LEN;
    while offset + OBJECT_HEADER_LEN <= ext.len() {
        let obj_len = u16::from_be_bytes([ext[offset], ext[offset + 1]]) as usize;
        let class_num = ext[offset + 2];
        let class_subtype = ext[offset + 3];
        if obj_len < OBJECT_HEADER_LEN || offset + obj_len > ext.len() {
            break;
        }
        let body = &ext[offset + OBJECT_HEADER_LEN..offset + obj_len];

        if class_num == MPLS_LABEL_STACK_CLASS && class_subtype == MPLS_LABEL_STACK_TYPE {
            let mut labels = Vec::with_capacity(body.len() / 4);
            for chunk in body.chunks_exact(4) {
                let label = MplsLabel::from_bytes(&[chunk[0], chunk[1], chunk[2], chunk[3]]);
                labels.push(label);
                if label.bottom {
                    break;
                }
            }
            if !labels.is_empty() {
                objects.push(ExtensionObject::Mpls(labels));
            }
        } else {
            objects.push(ExtensionObject::Unknown {
                class_num,
                class_subtype,
                bytes: body.to_vec(),
            });
        }
        offset += obj_len;
    }

    (!objects.is_empty()).then_some(Extensions { objects })
}

/// Encode an extension structure holding one MPLS label stack object.
/// The checksum field is filled in.
pub fn encode_mpls_extension(labels: &[MplsLabel]) -> Vec<u8> {
    let obj_len = OBJECT_HEADER_LEN + labels.len() * 4;
    let mut ext = Vec::with_capacity(EXT_HEADER_LEN + obj_len);
    ext.extend_from_slice(&[ICMP_EXT_VERSION << 4, 0, 0, 0]);
    ext.extend_from_slice(&(obj_len as u16).to_be_bytes());
    ext.push(MPLS_LABEL_STACK_CLASS);
    ext.push(MPLS_LABEL_STACK_TYPE);
    for label in labels {
        ext.extend_from_slice(&label.to_bytes());
    }
    let cksum = checksum::checksum(&ext);
    ext[2..4].copy_from_slice(&cksum.to_be_bytes());
    ext
}
