//! Process-wide control-plane configuration

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::error::{GateError, Result};

// =============================================================================
// Default value functions for serde
// =============================================================================

const fn default_hub_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

const fn default_tunnel_port_range() -> (u16, u16) {
    (7000, 7999)
}

const fn default_https_port_range() -> (u16, u16) {
    (8000, 8999)
}

const fn default_handshake_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

const fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(90)
}

const fn default_reconnect_base() -> Duration {
    Duration::from_secs(1)
}

const fn default_reconnect_cap() -> Duration {
    Duration::from_secs(60)
}

const fn default_port_quarantine() -> Duration {
    Duration::from_secs(30)
}

const fn default_quarantine_sweep_interval() -> Duration {
    Duration::from_secs(10)
}

const fn default_revalidate_interval() -> Duration {
    Duration::from_secs(60)
}

const fn default_max_tunnels() -> usize {
    1000
}

// =============================================================================
// Gate Configuration
// =============================================================================

/// Control-plane configuration, loaded once at init
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Hub address used as the destination of implied tunnel access paths
    #[serde(default = "default_hub_addr")]
    pub hub_addr: IpAddr,

    /// Remote-port range for system and terminal tunnels (inclusive)
    #[serde(default = "default_tunnel_port_range")]
    pub tunnel_port_range: (u16, u16),

    /// Remote-port range for HTTPS tunnels (inclusive, disjoint from the
    /// tunnel range)
    #[serde(default = "default_https_port_range")]
    pub https_port_range: (u16, u16),

    /// Bound on the transport handshake wait
    #[serde(default = "default_handshake_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// Heartbeat sweep interval
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Node silence beyond this closes its tunnels
    #[serde(default = "default_heartbeat_timeout", with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// Initial reconnect backoff
    #[serde(default = "default_reconnect_base", with = "humantime_serde")]
    pub reconnect_base: Duration,

    /// Reconnect backoff cap
    #[serde(default = "default_reconnect_cap", with = "humantime_serde")]
    pub reconnect_cap: Duration,

    /// Cooldown before a released port may be reallocated
    #[serde(default = "default_port_quarantine", with = "humantime_serde")]
    pub port_quarantine: Duration,

    /// Interval of the quarantine eviction sweep
    #[serde(
        default = "default_quarantine_sweep_interval",
        with = "humantime_serde"
    )]
    pub quarantine_sweep_interval: Duration,

    /// Interval of the backstop ACL revalidation sweep
    #[serde(default = "default_revalidate_interval", with = "humantime_serde")]
    pub revalidate_interval: Duration,

    /// Maximum concurrent non-closed tunnels
    #[serde(default = "default_max_tunnels")]
    pub max_tunnels: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            hub_addr: default_hub_addr(),
            tunnel_port_range: default_tunnel_port_range(),
            https_port_range: default_https_port_range(),
            handshake_timeout: default_handshake_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_timeout: default_heartbeat_timeout(),
            reconnect_base: default_reconnect_base(),
            reconnect_cap: default_reconnect_cap(),
            port_quarantine: default_port_quarantine(),
            quarantine_sweep_interval: default_quarantine_sweep_interval(),
            revalidate_interval: default_revalidate_interval(),
            max_tunnels: default_max_tunnels(),
        }
    }
}

impl GateConfig {
    /// Create a config with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a config from TOML text and validate it
    ///
    /// # Errors
    ///
    /// Returns an error if the text fails to parse or the parsed config
    /// violates a constraint.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| GateError::config(format!("parse error: {e}")))?;
        config.validate().map_err(GateError::config)?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error string if:
    /// - either port range is inverted or starts below 1024
    /// - the two port ranges overlap
    /// - `heartbeat_timeout` <= `heartbeat_interval`
    /// - `reconnect_cap` < `reconnect_base`
    /// - `handshake_timeout` is zero
    /// - `max_tunnels` is 0
    pub fn validate(&self) -> std::result::Result<(), String> {
        for (name, (start, end)) in [
            ("tunnel_port_range", self.tunnel_port_range),
            ("https_port_range", self.https_port_range),
        ] {
            if start > end {
                return Err(format!("{name} start ({start}) must be <= end ({end})"));
            }
            if start < 1024 {
                return Err(format!(
                    "{name} start ({start}) must be >= 1024 (privileged ports)"
                ));
            }
        }

        let (ts, te) = self.tunnel_port_range;
        let (hs, he) = self.https_port_range;
        if ts <= he && hs <= te {
            return Err(format!(
                "tunnel_port_range ({ts}-{te}) and https_port_range ({hs}-{he}) must be disjoint"
            ));
        }

        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(format!(
                "heartbeat_timeout ({:?}) must be > heartbeat_interval ({:?})",
                self.heartbeat_timeout, self.heartbeat_interval
            ));
        }

        if self.reconnect_cap < self.reconnect_base {
            return Err(format!(
                "reconnect_cap ({:?}) must be >= reconnect_base ({:?})",
                self.reconnect_cap, self.reconnect_base
            ));
        }

        if self.handshake_timeout.is_zero() {
            return Err("handshake_timeout must be > 0".to_string());
        }

        if self.max_tunnels == 0 {
            return Err("max_tunnels must be > 0".to_string());
        }

        Ok(())
    }
}

// =============================================================================
// humantime_serde module for Duration serialization
// =============================================================================

mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = if duration.subsec_millis() > 0 {
            format!("{}ms", duration.as_millis())
        } else {
            format!("{}s", duration.as_secs())
        };
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();

        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        let (number, unit): (&str, fn(u64) -> Duration) =
            if let Some(n) = s.strip_suffix("ms") {
                (n, Duration::from_millis)
            } else if let Some(n) = s.strip_suffix('s') {
                (n, Duration::from_secs)
            } else if let Some(n) = s.strip_suffix('m') {
                (n, |v| Duration::from_secs(v * 60))
            } else if let Some(n) = s.strip_suffix('h') {
                (n, |v| Duration::from_secs(v * 3600))
            } else {
                return Err(format!("invalid duration format: {s}"));
            };

        let value: u64 = number
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration number: {number}"))?;
        Ok(unit(value))
    }
}
