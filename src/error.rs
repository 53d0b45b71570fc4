use std::io;
use std::net::IpAddr;

use thiserror::Error;

use crate::config::{MultipathAlgorithm, PrivilegeMode, ProbeProtocol};

pub type Result<T> = std::result::Result<T, Error>;

/// Session-start failures. Loss, decode failures and resolution failures
/// are recovered locally and never surface here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    InsufficientPrivilege(String),

    #[error("failed to open {what}: {source}")]
    Transport {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("listener stopped: {0}")]
    Listener(String),

    #[error("session task failed: {0}")]
    Task(String),
}

impl Error {
    pub(crate) fn transport(what: &'static str, source: io::Error) -> Self {
        Self::Transport { what, source }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("flow count must be between 1 and {max}, got {got}")]
    FlowCount { got: u16, max: u16 },

    #[error("max hop-limit must be between 1 and {max}, got {got}")]
    MaxTtl { got: u8, max: u8 },

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("max in-flight probes must be at least 1")]
    ZeroInFlight,

    #[error("source ports {base}..{end} overflow the port range")]
    PortRange { base: u16, end: u32 },

    #[error("target {0} is not a routable unicast address")]
    InvalidTarget(IpAddr),

    #[error("{algorithm:?} {protocol:?} probing over {family} is not supported in {mode:?} mode")]
    Unsupported {
        protocol: ProbeProtocol,
        algorithm: MultipathAlgorithm,
        mode: PrivilegeMode,
        family: &'static str,
    },

    #[error("unknown {kind}: {value}")]
    UnknownValue { kind: &'static str, value: String },
}
