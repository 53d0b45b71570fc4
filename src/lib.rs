//! Multi-path traceroute engine.
//!
//! A session sends hop-limited probes over one or more ECMP-stable flows,
//! correlates ICMP/TCP responses back to the probe that triggered them and
//! aggregates per-hop statistics into a shared [`state::HopTable`].

// Public API - configuration, session control, data types and export functions
pub mod config;
pub mod error;
pub mod export;
pub mod lookup;
pub mod probe;
pub mod state;
pub mod trace;

// Binary front-end
pub mod cli;

pub use config::SessionConfig;
pub use error::{Error, Result};
pub use trace::{TraceHandle, start, start_with};
