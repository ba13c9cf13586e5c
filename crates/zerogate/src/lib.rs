//! `ZeroGate` - Zero-Trust access control plane for reverse-tunnel edge nodes
//!
//! Edge nodes reach the hub over outbound-only reverse tunnels; every tunnel
//! is gated by an ordered ACL before its remote port is opened, and absence
//! of an explicit ALLOW is a DENY. The crate provides:
//!
//! - **ACL engine** - priority-ordered rule matching over CIDR, protocol,
//!   port, and time-window predicates, evaluated against immutable rule
//!   snapshots with a deterministic default-deny.
//! - **Port allocator** - collision-free remote-port allocation from
//!   per-class ranges, with a quarantine cooldown on released ports.
//! - **Tunnel manager** - lifecycle orchestration with handshake watchdogs,
//!   jittered reconnect backoff, and proactive revocation when rules change.
//! - **Heartbeat monitor** - node liveness tracking that reclaims the
//!   tunnels of silent nodes.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use zerogate::{
//!     AccessRule, AclEngine, CreateTunnelRequest, EventSink, GateConfig,
//!     PortAllocator, Protocol, RuleAction, RuleStore, TunnelClass, TunnelManager,
//! };
//!
//! #[tokio::main]
//! async fn main() -> zerogate::Result<()> {
//!     let config = GateConfig::default();
//!     let (events, _audit_rx) = EventSink::channel(256);
//!
//!     let store = Arc::new(RuleStore::new());
//!     store.upsert_rule(
//!         AccessRule::new(10, RuleAction::Allow, "10.0.0.0/8", "0.0.0.0/0")
//!             .with_protocol(Protocol::Tcp),
//!     )?;
//!
//!     let acl = Arc::new(AclEngine::new(Arc::clone(&store), events.clone()));
//!     let allocator = Arc::new(PortAllocator::from_config(&config));
//!     let manager = Arc::new(TunnelManager::new(config, acl, allocator, events));
//!
//!     let tunnel = manager.create_tunnel(CreateTunnelRequest::new(
//!         "edge-1",
//!         "10.1.2.3".parse().unwrap(),
//!         TunnelClass::Terminal,
//!         22,
//!     ))?;
//!     manager.handshake_established(tunnel.id)?;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod acl;
pub mod config;
pub mod error;
pub mod event;
pub mod heartbeat;
pub mod ports;
pub mod tunnel;

// Re-export main types at crate root
pub use acl::{
    AccessRule, AclEngine, ConnectionRequest, Decision, Protocol, RuleAction, RuleSnapshot,
    RuleStore, TimeWindow,
};
pub use config::GateConfig;
pub use error::{GateError, Result};
pub use event::{Event, EventKind, EventSink};
pub use heartbeat::{HeartbeatMonitor, NodeLiveness};
pub use ports::PortAllocator;
pub use tunnel::{
    CloseReason, CreateTunnelRequest, TunnelClass, TunnelFilter, TunnelInfo, TunnelManager,
    TunnelState, TunnelStats,
};
