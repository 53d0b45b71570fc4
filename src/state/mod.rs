pub mod hop;
pub mod nat;
pub mod table;

pub use hop::{HopRecord, ResponderStats, RttStats};
pub use nat::{NatDetector, NatVerdict};
pub use table::{Answer, Counters, FlowSnapshot, HopEvent, HopTable, SessionStatus, Snapshot};
