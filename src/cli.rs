use clap::Parser;
use std::net::IpAddr;
use std::time::Duration;

use crate::config::{
    MultipathAlgorithm, PrivilegeMode, ProbeProtocol, RoundCadence, SessionConfig, default_port,
};
use crate::error::ConfigError;

/// Multipath traceroute with flow-stable probing, NAT and MPLS detection
#[derive(Parser, Debug, Clone)]
#[command(name = "hoptrace")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Target host to trace (IP address or hostname)
    pub target: String,

    /// Probe protocol (icmp, udp, tcp)
    #[arg(short = 'p', long = "protocol", default_value = "icmp")]
    pub protocol: String,

    /// ECMP algorithm (paris, dublin)
    #[arg(short = 'a', long = "algorithm", default_value = "paris")]
    pub algorithm: String,

    /// Number of concurrent flows (1 = single path)
    #[arg(long = "flows", default_value = "1")]
    pub flows: u16,

    /// Maximum TTL (hops)
    #[arg(short = 'm', long = "max-ttl", default_value = "30")]
    pub max_ttl: u8,

    /// Minimum time between round starts in seconds (0 = start as soon as a round resolves)
    #[arg(short = 'i', long = "interval", default_value = "1.0")]
    pub interval: f64,

    /// Gap between individual probe sends in milliseconds
    #[arg(long = "send-interval", default_value = "10")]
    pub send_interval_ms: u64,

    /// Probe timeout in seconds
    #[arg(long = "timeout", default_value = "3")]
    pub timeout: f64,

    /// Maximum outstanding probes
    #[arg(long = "max-in-flight", default_value = "64")]
    pub max_in_flight: usize,

    /// Number of rounds to run (0 = until interrupted)
    #[arg(short = 'c', long = "rounds", default_value = "0")]
    pub rounds: u32,

    /// Destination port for UDP/TCP probes
    #[arg(long = "port")]
    pub port: Option<u16>,

    /// Base source port for flow identification
    #[arg(long = "src-port", default_value = "50000")]
    pub src_port: u16,

    /// Use datagram sockets instead of raw sockets
    #[arg(long = "unprivileged")]
    pub unprivileged: bool,

    /// Force IPv4
    #[arg(short = '4', long = "ipv4")]
    pub ipv4: bool,

    /// Force IPv6
    #[arg(short = '6', long = "ipv6")]
    pub ipv6: bool,

    /// Skip reverse DNS lookups
    #[arg(long = "no-dns")]
    pub no_dns: bool,

    /// Skip ASN enrichment
    #[arg(long = "no-asn")]
    pub no_asn: bool,

    /// Print the final snapshot as JSON instead of a report
    #[arg(long = "json")]
    pub json: bool,

    /// Log filter when RUST_LOG is unset (error, warn, info, debug, trace)
    #[arg(long = "log-level", default_value = "warn")]
    pub log_level: String,
}

impl Args {
    /// Get probe timeout as Duration
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }

    /// Round gating policy derived from --interval
    pub fn round_cadence(&self) -> RoundCadence {
        if self.interval == 0.0 {
            RoundCadence::AfterResolve
        } else {
            RoundCadence::MinInterval(Duration::from_secs_f64(self.interval))
        }
    }

    /// Validate arguments that the session config cannot check on its own
    pub fn validate(&self) -> Result<(), String> {
        if self.ipv4 && self.ipv6 {
            return Err("Cannot specify both -4 and -6".into());
        }
        if !self.interval.is_finite() || self.interval < 0.0 {
            return Err("Interval must be zero or positive".into());
        }
        if !self.timeout.is_finite() || self.timeout <= 0.0 {
            return Err("Timeout must be positive".into());
        }
        if self.json && self.rounds == 0 {
            return Err("--json requires -c to be set".into());
        }
        Ok(())
    }

    /// Build the session configuration for an already resolved target
    pub fn session_config(&self, target: IpAddr) -> Result<SessionConfig, ConfigError> {
        let protocol: ProbeProtocol = self.protocol.parse()?;
        let algorithm: MultipathAlgorithm = self.algorithm.parse()?;

        let mut config = SessionConfig::new(target, protocol);
        config.algorithm = algorithm;
        config.flows = self.flows;
        config.max_ttl = self.max_ttl;
        config.send_interval = Duration::from_millis(self.send_interval_ms);
        config.timeout = self.timeout_duration();
        config.max_in_flight = self.max_in_flight;
        config.round_cadence = self.round_cadence();
        config.max_rounds = (self.rounds > 0).then_some(self.rounds);
        config.src_port_base = self.src_port;
        config.dst_port = self.port.unwrap_or_else(|| default_port(protocol));
        config.privilege = if self.unprivileged {
            PrivilegeMode::Unprivileged
        } else {
            PrivilegeMode::Privileged
        };

        config.validate()?;
        Ok(config)
    }
}
