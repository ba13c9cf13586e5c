//! Tunnel records, states, and admin-facing views

pub mod manager;

pub use manager::TunnelManager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::acl::{ConnectionRequest, Protocol};

// =============================================================================
// Tunnel Class
// =============================================================================

/// Class of a reverse tunnel
///
/// System and terminal tunnels draw remote ports from one range, HTTPS
/// tunnels from a second, disjoint range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelClass {
    /// Hub-managed control/system tunnel
    System,
    /// Interactive terminal (SSH) tunnel
    Terminal,
    /// HTTPS service tunnel
    Https,
}

// =============================================================================
// Tunnel State
// =============================================================================

/// Lifecycle state of a tunnel
///
/// `Pending -> Connecting -> Active <-> Error -> Closed`; `Error` loops
/// back to `Connecting` while auto-reconnect is on. `Closed` is terminal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelState {
    /// Record created, transport not yet instructed
    #[default]
    Pending,
    /// Waiting for the transport handshake
    Connecting,
    /// Transport established and healthy
    Active,
    /// Transport failed; recoverable while auto-reconnect is on
    Error(String),
    /// Terminal state; the remote port has been released
    Closed,
}

impl TunnelState {
    /// Check whether the tunnel has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Check whether the tunnel counts against live-port uniqueness
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.is_closed()
    }

    /// Check whether the transport is established
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

// =============================================================================
// Close Reason
// =============================================================================

/// Why a tunnel was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    /// Explicit administrative close
    #[serde(rename = "admin_close")]
    AdminClose,
    /// A rule change made the tunnel's access path evaluate to DENY
    #[serde(rename = "access_revoked")]
    AccessRevoked,
    /// The owning node went silent past the heartbeat timeout
    #[serde(rename = "heartbeat_timeout")]
    HeartbeatTimeout,
}

impl CloseReason {
    /// Wire name of the reason
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AdminClose => "admin_close",
            Self::AccessRevoked => "access_revoked",
            Self::HeartbeatTimeout => "heartbeat_timeout",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Create Request
// =============================================================================

/// Request to create a tunnel for an edge node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTunnelRequest {
    /// Owning node
    pub node_id: String,
    /// Node's address, the source of the implied access path
    pub node_addr: IpAddr,
    /// Tunnel class
    pub class: TunnelClass,
    /// Port of the exposed service behind the tunnel
    pub local_port: u16,
    /// Pin a specific remote port (None = lowest free in the class range)
    #[serde(default)]
    pub remote_port: Option<u16>,
    /// Reconnect automatically after transport failures
    #[serde(default)]
    pub auto_reconnect: bool,
}

impl CreateTunnelRequest {
    /// Create a request with auto-assigned remote port and no reconnect
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        node_addr: IpAddr,
        class: TunnelClass,
        local_port: u16,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_addr,
            class,
            local_port,
            remote_port: None,
            auto_reconnect: false,
        }
    }

    /// Pin a specific remote port
    #[must_use]
    pub const fn with_remote_port(mut self, port: u16) -> Self {
        self.remote_port = Some(port);
        self
    }

    /// Enable automatic reconnection
    #[must_use]
    pub const fn with_auto_reconnect(mut self) -> Self {
        self.auto_reconnect = true;
        self
    }

    /// The implied access path this tunnel represents
    ///
    /// Tunnels carry node-to-hub traffic, so the ACL gate evaluates the
    /// node address against the hub address at the exposed service port.
    #[must_use]
    pub fn implied_access(&self, hub_addr: IpAddr) -> ConnectionRequest {
        ConnectionRequest::new(self.node_addr, hub_addr, Protocol::Tcp, self.local_port)
    }
}

// =============================================================================
// Tunnel Record
// =============================================================================

/// A tunnel as tracked by the manager
#[derive(Debug, Clone)]
pub struct Tunnel {
    /// Unique tunnel identifier
    pub id: Uuid,
    /// Owning node
    pub node_id: String,
    /// Tunnel class
    pub class: TunnelClass,
    /// Port of the exposed service behind the tunnel
    pub local_port: u16,
    /// Allocated remote listener port, unique across live tunnels
    pub remote_port: u16,
    /// Current lifecycle state
    pub state: TunnelState,
    /// Reconnect automatically after transport failures
    pub auto_reconnect: bool,
    /// Wall-clock creation time
    pub created_at: DateTime<Utc>,
    /// Monotonic creation time, for uptime
    pub created_mono: Instant,
    /// Last heartbeat observed from the owning node
    pub last_heartbeat_at: Option<Instant>,
    /// Reconnect attempts in the current outage (reset on success)
    pub reconnect_attempts: u32,
    /// Most recent transport error
    pub last_error: Option<String>,
    /// Access-path template re-evaluated on reconnect and revocation sweeps
    pub access: ConnectionRequest,
}

// =============================================================================
// Admin Views
// =============================================================================

/// Summary view of a tunnel for listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelInfo {
    /// Unique tunnel identifier
    pub id: Uuid,
    /// Owning node
    pub node_id: String,
    /// Tunnel class
    pub class: TunnelClass,
    /// Port of the exposed service behind the tunnel
    pub local_port: u16,
    /// Allocated remote listener port
    pub remote_port: u16,
    /// Current lifecycle state
    pub state: TunnelState,
    /// Reconnect automatically after transport failures
    pub auto_reconnect: bool,
    /// Wall-clock creation time
    pub created_at: DateTime<Utc>,
    /// Reconnect attempts in the current outage
    pub reconnect_attempts: u32,
    /// Most recent transport error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<&Tunnel> for TunnelInfo {
    fn from(tunnel: &Tunnel) -> Self {
        Self {
            id: tunnel.id,
            node_id: tunnel.node_id.clone(),
            class: tunnel.class,
            local_port: tunnel.local_port,
            remote_port: tunnel.remote_port,
            state: tunnel.state.clone(),
            auto_reconnect: tunnel.auto_reconnect,
            created_at: tunnel.created_at,
            reconnect_attempts: tunnel.reconnect_attempts,
            last_error: tunnel.last_error.clone(),
        }
    }
}

/// Point-in-time statistics for a tunnel
#[derive(Debug, Clone)]
pub struct TunnelStats {
    /// Unique tunnel identifier
    pub id: Uuid,
    /// Current lifecycle state
    pub state: TunnelState,
    /// Allocated remote listener port
    pub remote_port: u16,
    /// Time since the record was created
    pub uptime: Duration,
    /// Time since the owning node last heartbeated, if it ever did
    pub last_heartbeat_age: Option<Duration>,
    /// Reconnect attempts in the current outage
    pub reconnect_attempts: u32,
    /// Most recent transport error
    pub last_error: Option<String>,
}

/// Filter for tunnel listings
#[derive(Debug, Clone, Default)]
pub struct TunnelFilter {
    /// Only tunnels owned by this node
    pub node_id: Option<String>,
    /// Only tunnels of this class
    pub class: Option<TunnelClass>,
    /// Exclude closed tunnels
    pub live_only: bool,
}

impl TunnelFilter {
    /// Match everything
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Restrict to one node
    #[must_use]
    pub fn for_node(node_id: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            ..Self::default()
        }
    }

    /// Restrict to one class
    #[must_use]
    pub fn with_class(mut self, class: TunnelClass) -> Self {
        self.class = Some(class);
        self
    }

    /// Exclude closed tunnels
    #[must_use]
    pub const fn live(mut self) -> Self {
        self.live_only = true;
        self
    }

    /// Check a tunnel against the filter
    #[must_use]
    pub fn matches(&self, tunnel: &Tunnel) -> bool {
        if let Some(ref node_id) = self.node_id {
            if &tunnel.node_id != node_id {
                return false;
            }
        }
        if let Some(class) = self.class {
            if tunnel.class != class {
                return false;
            }
        }
        if self.live_only && !tunnel.state.is_live() {
            return false;
        }
        true
    }
}
