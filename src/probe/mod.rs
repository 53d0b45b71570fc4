//! Probe construction, response parsing and the socket transport.

pub mod checksum;
pub mod decode;
pub mod encode;
pub mod extension;
pub mod flow;
pub mod icmp;
pub mod ipv4;
pub mod socket;
pub mod tcp;
pub mod udp;

pub use decode::{Decoder, Framing, ProbeResponse, QuotedProbe, ResponseKind};
pub use encode::{EncodedProbe, Encoder, ExpectedFields};
pub use extension::{ExtensionObject, Extensions, MplsLabel};
pub use flow::{EcmpFidelity, FlowFields, FlowPlan, ProbeId, TokenCarrier};
pub use socket::{PacketSource, ProbeSender, RecvPacket, Transport, detect_source_ip, open_transport};
