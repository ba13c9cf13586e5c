//! Node liveness tracking and heartbeat-timeout sweeps
//!
//! Edge nodes post periodic heartbeats through the (externally
//! authenticated) ingress. The monitor records last-seen times and a
//! periodic sweep closes every tunnel of a node that has gone silent past
//! the timeout.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::tunnel::{CloseReason, TunnelManager};

/// Liveness record for one node
#[derive(Debug, Clone)]
pub struct NodeLiveness {
    /// Node identifier
    pub node_id: String,
    /// Timestamp the node reported in its latest heartbeat
    pub reported_at: DateTime<Utc>,
    /// Local monotonic instant the heartbeat was received
    pub seen_at: Instant,
}

/// Receives heartbeats and reclaims tunnels of silent nodes
///
/// Timeout decisions use the local receive instant, never the
/// node-reported timestamp; edge clocks only order out-of-order
/// heartbeats.
pub struct HeartbeatMonitor {
    manager: Arc<TunnelManager>,
    nodes: DashMap<String, NodeLiveness>,
    timeout: Duration,
}

impl HeartbeatMonitor {
    /// Create a monitor over a tunnel manager
    #[must_use]
    pub fn new(manager: Arc<TunnelManager>, timeout: Duration) -> Self {
        Self {
            manager,
            nodes: DashMap::new(),
            timeout,
        }
    }

    /// Record a heartbeat from a node
    ///
    /// Advances the node's liveness and the heartbeat clocks of its live
    /// tunnels. A stale heartbeat (reported timestamp older than the one
    /// already recorded) is ignored; returns whether the heartbeat was
    /// accepted.
    pub fn receive_heartbeat(&self, node_id: &str, reported_at: DateTime<Utc>) -> bool {
        let mut accepted = true;
        let now = Instant::now();

        self.nodes
            .entry(node_id.to_string())
            .and_modify(|liveness| {
                if reported_at < liveness.reported_at {
                    tracing::debug!(node_id = %node_id, "ignoring stale heartbeat");
                    accepted = false;
                } else {
                    liveness.reported_at = reported_at;
                    liveness.seen_at = now;
                }
            })
            .or_insert_with(|| NodeLiveness {
                node_id: node_id.to_string(),
                reported_at,
                seen_at: now,
            });

        if accepted {
            self.manager.touch_node(node_id);
        }
        accepted
    }

    /// Number of tracked nodes
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Liveness record for a node
    #[must_use]
    pub fn liveness(&self, node_id: &str) -> Option<NodeLiveness> {
        self.nodes.get(node_id).map(|l| l.clone())
    }

    /// Check whether a node has heartbeated within the timeout
    #[must_use]
    pub fn is_alive(&self, node_id: &str) -> bool {
        self.nodes
            .get(node_id)
            .is_some_and(|l| l.seen_at.elapsed() <= self.timeout)
    }

    /// Close tunnels of every node silent past the timeout
    ///
    /// Timed-out nodes are dropped from the liveness table; a later
    /// heartbeat re-registers them. Returns the ids of the swept nodes.
    pub fn sweep(&self) -> Vec<String> {
        let expired: Vec<String> = self
            .nodes
            .iter()
            .filter(|item| item.value().seen_at.elapsed() > self.timeout)
            .map(|item| item.key().clone())
            .collect();

        for node_id in &expired {
            self.nodes.remove(node_id);
            let tunnels = self.manager.tunnels_for_node(node_id);
            tracing::warn!(
                node_id = %node_id,
                tunnels = tunnels.len(),
                "node heartbeat timed out, reclaiming tunnels"
            );
            for tunnel_id in tunnels {
                if let Err(e) = self
                    .manager
                    .close_tunnel(tunnel_id, CloseReason::HeartbeatTimeout)
                {
                    tracing::warn!(tunnel_id = %tunnel_id, error = %e, "failed to close tunnel");
                }
            }
        }

        expired
    }

    /// Spawn the periodic timeout sweep
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                monitor.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{AccessRule, AclEngine, Protocol, RuleAction, RuleStore};
    use crate::config::GateConfig;
    use crate::error::Result;
    use crate::event::EventSink;
    use crate::ports::PortAllocator;
    use crate::tunnel::{CreateTunnelRequest, TunnelClass, TunnelInfo, TunnelState};

    fn build_manager() -> Arc<TunnelManager> {
        let config = GateConfig {
            hub_addr: "10.40.0.1".parse().unwrap(),
            tunnel_port_range: (7000, 7009),
            https_port_range: (8000, 8009),
            ..Default::default()
        };
        let store = Arc::new(RuleStore::new());
        store
            .upsert_rule(
                AccessRule::new(10, RuleAction::Allow, "10.0.0.0/24", "10.40.0.0/16")
                    .with_protocol(Protocol::Tcp),
            )
            .unwrap();
        let acl = Arc::new(AclEngine::new(store, EventSink::disabled()));
        let allocator = Arc::new(PortAllocator::from_config(&config));
        Arc::new(TunnelManager::new(
            config,
            acl,
            allocator,
            EventSink::disabled(),
        ))
    }

    fn create_tunnel(manager: &Arc<TunnelManager>, node_id: &str) -> Result<TunnelInfo> {
        manager.create_tunnel(CreateTunnelRequest::new(
            node_id,
            "10.0.0.5".parse::<std::net::IpAddr>().unwrap(),
            TunnelClass::Terminal,
            22,
        ))
    }

    #[test]
    fn test_receive_heartbeat_registers_node() {
        let monitor = HeartbeatMonitor::new(build_manager(), Duration::from_secs(90));

        assert!(monitor.receive_heartbeat("edge-1", Utc::now()));

        assert_eq!(monitor.node_count(), 1);
        assert!(monitor.is_alive("edge-1"));
        assert!(!monitor.is_alive("edge-2"));
    }

    #[test]
    fn test_repeated_heartbeats_advance_timestamp() {
        let monitor = HeartbeatMonitor::new(build_manager(), Duration::from_secs(90));

        let first = Utc::now();
        let second = first + chrono::Duration::seconds(30);

        assert!(monitor.receive_heartbeat("edge-1", first));
        assert!(monitor.receive_heartbeat("edge-1", second));

        assert_eq!(monitor.liveness("edge-1").unwrap().reported_at, second);
        assert_eq!(monitor.node_count(), 1);
    }

    #[test]
    fn test_stale_heartbeat_ignored() {
        let monitor = HeartbeatMonitor::new(build_manager(), Duration::from_secs(90));

        let now = Utc::now();
        let earlier = now - chrono::Duration::seconds(60);

        assert!(monitor.receive_heartbeat("edge-1", now));
        assert!(!monitor.receive_heartbeat("edge-1", earlier));

        assert_eq!(monitor.liveness("edge-1").unwrap().reported_at, now);
    }

    #[tokio::test]
    async fn test_heartbeat_touches_node_tunnels() {
        let manager = build_manager();
        let monitor = HeartbeatMonitor::new(Arc::clone(&manager), Duration::from_secs(90));

        let info = create_tunnel(&manager, "edge-1").unwrap();
        manager.handshake_established(info.id).unwrap();

        monitor.receive_heartbeat("edge-1", Utc::now());

        let stats = manager.tunnel_stats(info.id).unwrap();
        assert!(stats.last_heartbeat_age.unwrap() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_sweep_closes_tunnels_of_silent_node() {
        let manager = build_manager();
        let monitor = HeartbeatMonitor::new(Arc::clone(&manager), Duration::from_millis(20));

        let t1 = create_tunnel(&manager, "edge-1").unwrap();
        let t2 = create_tunnel(&manager, "edge-1").unwrap();
        let t3 = create_tunnel(&manager, "edge-2").unwrap();

        monitor.receive_heartbeat("edge-1", Utc::now());
        monitor.receive_heartbeat("edge-2", Utc::now());

        // Only edge-2 keeps heartbeating
        tokio::time::sleep(Duration::from_millis(40)).await;
        monitor.receive_heartbeat("edge-2", Utc::now());

        let expired = monitor.sweep();
        assert_eq!(expired, vec!["edge-1".to_string()]);
        assert_eq!(monitor.node_count(), 1);

        assert_eq!(manager.get_tunnel(t1.id).unwrap().state, TunnelState::Closed);
        assert_eq!(manager.get_tunnel(t2.id).unwrap().state, TunnelState::Closed);
        assert_ne!(manager.get_tunnel(t3.id).unwrap().state, TunnelState::Closed);
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let manager = build_manager();
        let monitor = HeartbeatMonitor::new(Arc::clone(&manager), Duration::from_millis(10));

        let info = create_tunnel(&manager, "edge-1").unwrap();
        monitor.receive_heartbeat("edge-1", Utc::now());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(monitor.sweep().len(), 1);
        // Node already dropped; nothing left to sweep
        assert!(monitor.sweep().is_empty());

        assert_eq!(manager.get_tunnel(info.id).unwrap().state, TunnelState::Closed);
    }

    #[tokio::test]
    async fn test_spawned_sweep_reclaims() {
        let manager = build_manager();
        let monitor = Arc::new(HeartbeatMonitor::new(
            Arc::clone(&manager),
            Duration::from_millis(20),
        ));

        let info = create_tunnel(&manager, "edge-1").unwrap();
        monitor.receive_heartbeat("edge-1", Utc::now());

        let sweep = monitor.spawn(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(manager.get_tunnel(info.id).unwrap().state, TunnelState::Closed);
        sweep.abort();
    }
}
