//! Structured control-plane events for the external audit/notification sink

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Kind of a control-plane event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// A tunnel record was created and is awaiting its transport
    #[serde(rename = "tunnel.created")]
    TunnelCreated,
    /// A tunnel's transport handshake completed
    #[serde(rename = "tunnel.active")]
    TunnelActive,
    /// A tunnel was closed
    #[serde(rename = "tunnel.closed")]
    TunnelClosed,
    /// A tunnel's transport failed
    #[serde(rename = "tunnel.error")]
    TunnelError,
    /// An explicit DENY rule rejected a connection
    #[serde(rename = "acl.denied")]
    AclDenied,
    /// No rule matched; the Zero-Trust default denied the connection
    #[serde(rename = "acl.default_deny")]
    AclDefaultDeny,
}

impl EventKind {
    /// Wire name of the event kind
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TunnelCreated => "tunnel.created",
            Self::TunnelActive => "tunnel.active",
            Self::TunnelClosed => "tunnel.closed",
            Self::TunnelError => "tunnel.error",
            Self::AclDenied => "acl.denied",
            Self::AclDefaultDeny => "acl.default_deny",
        }
    }
}

/// A structured event destined for the external audit/notification service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event kind
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Tunnel the event concerns, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<Uuid>,
    /// Rule the event concerns, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<Uuid>,
    /// Node the event concerns, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// Human-readable detail
    #[serde(default)]
    pub details: String,
}

impl Event {
    /// Create an event stamped with the current time
    #[must_use]
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            tunnel_id: None,
            rule_id: None,
            node_id: None,
            timestamp: Utc::now(),
            details: String::new(),
        }
    }

    /// Attach a tunnel id
    #[must_use]
    pub const fn with_tunnel(mut self, id: Uuid) -> Self {
        self.tunnel_id = Some(id);
        self
    }

    /// Attach a rule id
    #[must_use]
    pub const fn with_rule(mut self, id: Uuid) -> Self {
        self.rule_id = Some(id);
        self
    }

    /// Attach a node id
    #[must_use]
    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Attach a detail string
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

/// Best-effort sender for control-plane events
///
/// Events are pushed into a bounded channel consumed by the external
/// audit/notification collaborator. Emission never blocks the control
/// plane: a full or closed channel drops the event with a warning. Every
/// event is also traced, so the log stream stays complete even when the
/// sink is saturated.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<Event>>,
}

impl EventSink {
    /// Create a sink backed by a channel
    #[must_use]
    pub const fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Create a sink that only traces events
    #[must_use]
    pub const fn disabled() -> Self {
        Self { tx: None }
    }

    /// Create a channel-backed sink along with its receiver
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Emit an event (best-effort, non-blocking)
    pub fn emit(&self, event: Event) {
        tracing::debug!(
            kind = event.kind.as_str(),
            tunnel_id = ?event.tunnel_id,
            rule_id = ?event.rule_id,
            node_id = ?event.node_id,
            details = %event.details,
            "event"
        );

        if let Some(ref tx) = self.tx {
            if let Err(e) = tx.try_send(event) {
                tracing::warn!(error = %e, "event sink saturated, dropping event");
            }
        }
    }
}
