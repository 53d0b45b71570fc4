pub mod correlator;
pub mod engine;
pub mod pending;
pub mod receiver;
pub mod tracer;

pub use correlator::Correlator;
pub use engine::ProbeScheduler;
pub use pending::{PendingIndex, PendingProbe};
pub use tracer::{TraceHandle, start, start_with};
