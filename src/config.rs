use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Upper bound on flows; keeps per-round tokens unique within the 8-bit sequence space
pub const MAX_FLOWS: u16 = 16;
/// Upper bound on the hop-limit sweep
pub const MAX_SAFE_TTL: u8 = 64;

/// Probe protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeProtocol {
    #[default]
    Icmp,
    Udp,
    Tcp,
}

impl FromStr for ProbeProtocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "icmp" => Ok(Self::Icmp),
            "udp" => Ok(Self::Udp),
            "tcp" => Ok(Self::Tcp),
            _ => Err(ConfigError::UnknownValue {
                kind: "protocol",
                value: s.to_string(),
            }),
        }
    }
}

/// ECMP flow-stability algorithm, chosen once per session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MultipathAlgorithm {
    /// Hash-relevant fields fixed per flow, token hidden in the transport checksum
    #[default]
    Paris,
    /// Hash-relevant fields fixed per flow, token carried in the IP header
    Dublin,
}

impl FromStr for MultipathAlgorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "paris" => Ok(Self::Paris),
            "dublin" => Ok(Self::Dublin),
            _ => Err(ConfigError::UnknownValue {
                kind: "multipath algorithm",
                value: s.to_string(),
            }),
        }
    }
}

/// Socket privilege level used for the session transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeMode {
    /// Raw sockets (root or CAP_NET_RAW)
    #[default]
    Privileged,
    /// Datagram sockets with hop-limit control only
    Unprivileged,
}

/// When the next round may start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundCadence {
    /// Start as soon as every probe of the previous round has resolved
    AfterResolve,
    /// Start no earlier than this long after the previous round started
    MinInterval(#[serde(with = "duration_serde")] Duration),
}

impl Default for RoundCadence {
    fn default() -> Self {
        Self::MinInterval(Duration::from_secs(1))
    }
}

/// Immutable session configuration, supplied once at session start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Resolved target address
    pub target: IpAddr,
    /// Probe protocol
    pub protocol: ProbeProtocol,
    /// ECMP algorithm variant
    pub algorithm: MultipathAlgorithm,
    /// Number of concurrent flows
    pub flows: u16,
    /// Maximum hop-limit
    pub max_ttl: u8,
    /// Minimum gap between two probe sends
    #[serde(with = "duration_serde")]
    pub send_interval: Duration,
    /// Per-probe timeout
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    /// Extra time listeners keep draining after the last probe timeout
    #[serde(with = "duration_serde")]
    pub drain_grace: Duration,
    /// Maximum outstanding probes across all flows
    pub max_in_flight: usize,
    /// Round gating policy
    pub round_cadence: RoundCadence,
    /// Stop after this many rounds (None = until cancelled)
    pub max_rounds: Option<u32>,
    /// Base source port for UDP/TCP flows
    pub src_port_base: u16,
    /// Destination port for UDP/TCP probes
    pub dst_port: u16,
    /// Base ICMP identifier for ICMP flows
    pub identifier_base: u16,
    /// Transport privilege level
    pub privilege: PrivilegeMode,
    /// UDP/ICMP payload size in bytes
    pub payload_size: usize,
}

impl SessionConfig {
    /// Configuration with defaults for the given target and protocol
    pub fn new(target: IpAddr, protocol: ProbeProtocol) -> Self {
        Self {
            target,
            protocol,
            algorithm: MultipathAlgorithm::default(),
            flows: 1,
            max_ttl: 30,
            send_interval: Duration::from_millis(10),
            timeout: Duration::from_secs(3),
            drain_grace: Duration::from_millis(500),
            max_in_flight: 64,
            round_cadence: RoundCadence::default(),
            max_rounds: None,
            src_port_base: 50000,
            dst_port: default_port(protocol),
            identifier_base: (std::process::id() as u16) & 0xFFF0,
            privilege: PrivilegeMode::default(),
            payload_size: 32,
        }
    }

    /// Reject invalid or inconsistent settings before any probe is sent
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flows == 0 || self.flows > MAX_FLOWS {
            return Err(ConfigError::FlowCount {
                got: self.flows,
                max: MAX_FLOWS,
            });
        }
        if self.max_ttl == 0 || self.max_ttl > MAX_SAFE_TTL {
            return Err(ConfigError::MaxTtl {
                got: self.max_ttl,
                max: MAX_SAFE_TTL,
            });
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("timeout"));
        }
        if let RoundCadence::MinInterval(d) = self.round_cadence
            && d.is_zero()
        {
            return Err(ConfigError::ZeroDuration("round interval"));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::ZeroInFlight);
        }

        let end = self.src_port_base as u32 + self.flows as u32;
        if self.protocol != ProbeProtocol::Icmp && (self.src_port_base == 0 || end > 65536) {
            return Err(ConfigError::PortRange {
                base: self.src_port_base,
                end,
            });
        }
        if self.protocol == ProbeProtocol::Icmp && self.identifier_base as u32 + self.flows as u32 > 65536 {
            return Err(ConfigError::PortRange {
                base: self.identifier_base,
                end: self.identifier_base as u32 + self.flows as u32,
            });
        }

        if self.target.is_unspecified() || self.target.is_multicast() {
            return Err(ConfigError::InvalidTarget(self.target));
        }
        if let IpAddr::V4(v4) = self.target
            && v4.is_broadcast()
        {
            return Err(ConfigError::InvalidTarget(self.target));
        }

        let unsupported = match (self.privilege, self.protocol, self.algorithm, self.target) {
            // Raw TCP segments and header-included IPv4 both need raw sockets
            (PrivilegeMode::Unprivileged, ProbeProtocol::Tcp, _, _) => true,
            (PrivilegeMode::Unprivileged, ProbeProtocol::Udp, MultipathAlgorithm::Dublin, IpAddr::V4(_)) => true,
            _ => false,
        };
        if unsupported {
            return Err(ConfigError::Unsupported {
                protocol: self.protocol,
                algorithm: self.algorithm,
                mode: self.privilege,
                family: if self.target.is_ipv6() { "IPv6" } else { "IPv4" },
            });
        }

        Ok(())
    }

    /// Deadline after which listeners stop collecting late responses
    pub fn drain_deadline(&self) -> Duration {
        self.timeout + self.drain_grace
    }
}

/// Default destination port per protocol
pub fn default_port(protocol: ProbeProtocol) -> u16 {
    match protocol {
        ProbeProtocol::Udp => 33434,
        ProbeProtocol::Tcp => 80,
        ProbeProtocol::Icmp => 0,
    }
}

/// Serde helper for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn v4_config(protocol: ProbeProtocol) -> SessionConfig {
        SessionConfig::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), protocol)
    }

    #[test]
    fn test_defaults_validate() {
        for protocol in [ProbeProtocol::Icmp, ProbeProtocol::Udp, ProbeProtocol::Tcp] {
            assert_eq!(v4_config(protocol).validate(), Ok(()));
        }
    }

    #[test]
    fn test_flow_count_bounds() {
        let mut config = v4_config(ProbeProtocol::Udp);
        config.flows = 0;
        assert!(matches!(config.validate(), Err(ConfigError::FlowCount { .. })));
        config.flows = MAX_FLOWS + 1;
        assert!(matches!(config.validate(), Err(ConfigError::FlowCount { .. })));
        config.flows = MAX_FLOWS;
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_max_ttl_bounds() {
        let mut config = v4_config(ProbeProtocol::Icmp);
        config.max_ttl = 0;
        assert!(matches!(config.validate(), Err(ConfigError::MaxTtl { .. })));
        config.max_ttl = MAX_SAFE_TTL + 1;
        assert!(matches!(config.validate(), Err(ConfigError::MaxTtl { .. })));
    }

    #[test]
    fn test_port_range_overflow() {
        let mut config = v4_config(ProbeProtocol::Udp);
        config.src_port_base = 65530;
        config.flows = 8;
        assert!(matches!(config.validate(), Err(ConfigError::PortRange { .. })));
    }

    #[test]
    fn test_invalid_targets() {
        let mut config = v4_config(ProbeProtocol::Icmp);
        config.target = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTarget(_))));
        config.target = IpAddr::V4(Ipv4Addr::BROADCAST);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTarget(_))));
        config.target = IpAddr::V6(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1));
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTarget(_))));
    }

    #[test]
    fn test_unprivileged_combinations() {
        let mut config = v4_config(ProbeProtocol::Tcp);
        config.privilege = PrivilegeMode::Unprivileged;
        assert!(matches!(config.validate(), Err(ConfigError::Unsupported { .. })));

        let mut config = v4_config(ProbeProtocol::Udp);
        config.privilege = PrivilegeMode::Unprivileged;
        config.algorithm = MultipathAlgorithm::Dublin;
        assert!(matches!(config.validate(), Err(ConfigError::Unsupported { .. })));

        // IPv6 dublin carries the token in the payload length, no raw socket needed
        config.target = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_zero_durations_rejected() {
        let mut config = v4_config(ProbeProtocol::Icmp);
        config.timeout = Duration::ZERO;
        assert_eq!(config.validate(), Err(ConfigError::ZeroDuration("timeout")));

        let mut config = v4_config(ProbeProtocol::Icmp);
        config.round_cadence = RoundCadence::MinInterval(Duration::ZERO);
        assert_eq!(config.validate(), Err(ConfigError::ZeroDuration("round interval")));
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!("UDP".parse::<ProbeProtocol>(), Ok(ProbeProtocol::Udp));
        assert_eq!("dublin".parse::<MultipathAlgorithm>(), Ok(MultipathAlgorithm::Dublin));
        assert!("sctp".parse::<ProbeProtocol>().is_err());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let mut config = v4_config(ProbeProtocol::Udp);
        config.round_cadence = RoundCadence::MinInterval(Duration::from_millis(250));
        config.max_rounds = Some(3);

        let json = serde_json::to_string(&config).unwrap();
        let restored: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, config);
    }
}
