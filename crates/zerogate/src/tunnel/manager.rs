//! Tunnel lifecycle orchestration
//!
//! The [`TunnelManager`] drives every tunnel through
//! `Pending -> Connecting -> Active <-> Error -> Closed`, gating creation
//! and every reconnect through the ACL engine, drawing remote ports from
//! the allocator, and closing tunnels on revocation or heartbeat timeout.
//! No tunnel record exists without a prior ALLOW decision.

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

use super::{
    CloseReason, CreateTunnelRequest, Tunnel, TunnelFilter, TunnelInfo, TunnelState, TunnelStats,
};
use crate::acl::{AclEngine, ConnectionRequest};
use crate::config::GateConfig;
use crate::error::{GateError, Result};
use crate::event::{Event, EventKind, EventSink};
use crate::ports::PortAllocator;

/// Per-tunnel record behind its own lock
///
/// The per-entry mutex serializes competing writers (heartbeat sweep vs.
/// explicit close vs. retry task), so a port can never be released twice.
/// The lock is never held across an await point.
struct TunnelEntry {
    state: Mutex<Tunnel>,
}

/// Orchestrates tunnel creation, supervision, and teardown
pub struct TunnelManager {
    config: GateConfig,
    acl: Arc<AclEngine>,
    allocator: Arc<PortAllocator>,
    tunnels: DashMap<Uuid, Arc<TunnelEntry>>,
    /// At most one pending timer task (handshake watchdog or retry) per tunnel
    pending_tasks: DashMap<Uuid, AbortHandle>,
    events: EventSink,
}

impl TunnelManager {
    /// Create a manager over an ACL engine and port allocator
    #[must_use]
    pub fn new(
        config: GateConfig,
        acl: Arc<AclEngine>,
        allocator: Arc<PortAllocator>,
        events: EventSink,
    ) -> Self {
        Self {
            config,
            acl,
            allocator,
            tunnels: DashMap::new(),
            pending_tasks: DashMap::new(),
            events,
        }
    }

    /// The ACL engine gating this manager
    #[must_use]
    pub fn acl(&self) -> &Arc<AclEngine> {
        &self.acl
    }

    /// The port allocator backing this manager
    #[must_use]
    pub fn allocator(&self) -> &Arc<PortAllocator> {
        &self.allocator
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Create a tunnel for an edge node
    ///
    /// The implied access path is evaluated first; a DENY means no port is
    /// allocated and no record is created. On ALLOW the remote port is
    /// drawn from the class range, the record enters `Connecting`, a
    /// `tunnel.created` event is emitted, and a handshake watchdog bounds
    /// the transport wait. The caller instructs the remote agent using the
    /// returned descriptor.
    ///
    /// # Errors
    ///
    /// - [`GateError::AtCapacity`] when the non-closed tunnel count is at
    ///   the configured ceiling
    /// - [`GateError::AccessDenied`] when the ACL gate denies the path
    /// - [`GateError::RangeExhausted`] / [`GateError::PortUnavailable`]
    ///   when no remote port can be allocated
    pub fn create_tunnel(self: &Arc<Self>, request: CreateTunnelRequest) -> Result<TunnelInfo> {
        if self.live_count() >= self.config.max_tunnels {
            return Err(GateError::AtCapacity {
                limit: self.config.max_tunnels,
            });
        }

        let access = request.implied_access(self.config.hub_addr);
        let decision = self.acl.evaluate(&access);
        if !decision.is_allow() {
            tracing::info!(
                node_id = %request.node_id,
                class = ?request.class,
                matched_rule = ?decision.matched_rule,
                "tunnel creation denied"
            );
            return Err(GateError::AccessDenied {
                rule_id: decision.matched_rule,
            });
        }

        let remote_port = match request.remote_port {
            Some(port) => self.allocator.allocate_specific(request.class, port)?,
            None => self.allocator.allocate(request.class)?,
        };

        let tunnel = Tunnel {
            id: Uuid::new_v4(),
            node_id: request.node_id,
            class: request.class,
            local_port: request.local_port,
            remote_port,
            state: TunnelState::Pending,
            auto_reconnect: request.auto_reconnect,
            created_at: chrono::Utc::now(),
            created_mono: Instant::now(),
            last_heartbeat_at: None,
            reconnect_attempts: 0,
            last_error: None,
            access,
        };
        let id = tunnel.id;
        let node_id = tunnel.node_id.clone();

        let entry = Arc::new(TunnelEntry {
            state: Mutex::new(tunnel),
        });
        self.tunnels.insert(id, Arc::clone(&entry));

        let info = {
            let mut tunnel = entry.state.lock();
            tunnel.state = TunnelState::Connecting;
            TunnelInfo::from(&*tunnel)
        };

        tracing::info!(
            tunnel_id = %id,
            node_id = %node_id,
            class = ?info.class,
            remote_port = remote_port,
            "tunnel created"
        );
        self.events.emit(
            Event::new(EventKind::TunnelCreated)
                .with_tunnel(id)
                .with_node(node_id)
                .with_details(format!("remote_port={remote_port}")),
        );

        self.spawn_handshake_watchdog(id);

        Ok(info)
    }

    // =========================================================================
    // Agent protocol surface
    // =========================================================================

    /// Record a completed transport handshake
    ///
    /// Moves the tunnel to `Active`, resets its heartbeat clock and
    /// reconnect counter, and cancels the pending watchdog. A handshake
    /// arriving after closure is ignored with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if no tunnel with the given id exists.
    pub fn handshake_established(&self, id: Uuid) -> Result<()> {
        let entry = self.entry(id)?;

        let activated = {
            let mut tunnel = entry.state.lock();
            match tunnel.state {
                TunnelState::Pending | TunnelState::Connecting | TunnelState::Error(_) => {
                    tunnel.state = TunnelState::Active;
                    tunnel.last_heartbeat_at = Some(Instant::now());
                    tunnel.reconnect_attempts = 0;
                    tunnel.last_error = None;
                    true
                }
                TunnelState::Active | TunnelState::Closed => false,
            }
        };

        if activated {
            self.abort_pending(id);
            tracing::info!(tunnel_id = %id, "tunnel active");
            self.events.emit(Event::new(EventKind::TunnelActive).with_tunnel(id));
        } else {
            tracing::warn!(tunnel_id = %id, "late handshake ignored");
        }

        Ok(())
    }

    /// Record a transport failure
    ///
    /// Moves the tunnel to `Error` and, when auto-reconnect is on,
    /// schedules a retry with exponential backoff and full jitter. Every
    /// retry re-runs the ACL gate before reconnecting; a rule change during
    /// the tunnel's life can deny the reconnect, which closes the tunnel.
    ///
    /// # Errors
    ///
    /// Returns an error if no tunnel with the given id exists.
    pub fn transport_failed(self: &Arc<Self>, id: Uuid, error: impl Into<String>) -> Result<()> {
        self.entry(id)?;
        self.fail_transport(id, error.into());
        Ok(())
    }

    /// Shared failure path for external reports and watchdog timeouts
    fn fail_transport(self: &Arc<Self>, id: Uuid, error: String) {
        let Some(entry) = self.tunnels.get(&id).map(|e| Arc::clone(&e)) else {
            return;
        };

        let retry = {
            let mut tunnel = entry.state.lock();
            match tunnel.state {
                TunnelState::Pending | TunnelState::Connecting | TunnelState::Active => {
                    tunnel.state = TunnelState::Error(error.clone());
                    tunnel.last_error = Some(error.clone());
                    tunnel.auto_reconnect
                }
                // Already failed or closed; nothing to do
                TunnelState::Error(_) | TunnelState::Closed => return,
            }
        };

        tracing::warn!(tunnel_id = %id, error = %error, "tunnel transport failed");
        self.events.emit(
            Event::new(EventKind::TunnelError)
                .with_tunnel(id)
                .with_details(error),
        );

        if retry {
            self.schedule_retry(id);
        }
    }

    // =========================================================================
    // Closure
    // =========================================================================

    /// Close a tunnel and release its remote port
    ///
    /// Idempotent: closing a closed tunnel is a no-op. The state
    /// transition happens under the per-tunnel lock, so a concurrent sweep
    /// and an explicit close release the port exactly once. Any pending
    /// watchdog or retry task is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if no tunnel with the given id exists.
    pub fn close_tunnel(&self, id: Uuid, reason: CloseReason) -> Result<()> {
        let entry = self.entry(id)?;

        let released = {
            let mut tunnel = entry.state.lock();
            if tunnel.state.is_closed() {
                None
            } else {
                tunnel.state = TunnelState::Closed;
                Some((tunnel.class, tunnel.remote_port, tunnel.node_id.clone()))
            }
        };

        let Some((class, port, node_id)) = released else {
            return Ok(());
        };

        self.abort_pending(id);
        self.allocator.release(class, port);

        tracing::info!(
            tunnel_id = %id,
            node_id = %node_id,
            reason = %reason,
            remote_port = port,
            "tunnel closed"
        );
        self.events.emit(
            Event::new(EventKind::TunnelClosed)
                .with_tunnel(id)
                .with_node(node_id)
                .with_details(reason.as_str()),
        );

        Ok(())
    }

    // =========================================================================
    // Revalidation
    // =========================================================================

    /// Re-evaluate every non-closed tunnel's access path
    ///
    /// Tunnels whose implied request now evaluates to DENY are closed with
    /// [`CloseReason::AccessRevoked`] and their ports released. Returns the
    /// closed tunnel ids.
    pub fn revalidate_active(&self) -> Vec<Uuid> {
        let live: Vec<(Uuid, ConnectionRequest)> = self
            .tunnels
            .iter()
            .filter_map(|item| {
                let tunnel = item.value().state.lock();
                tunnel
                    .state
                    .is_live()
                    .then(|| (tunnel.id, tunnel.access.clone()))
            })
            .collect();

        let mut revoked = Vec::new();
        for (id, access) in live {
            if !self.acl.evaluate(&access.restamped()).is_allow() {
                tracing::info!(tunnel_id = %id, "access revoked by rule change");
                if self.close_tunnel(id, CloseReason::AccessRevoked).is_ok() {
                    revoked.push(id);
                }
            }
        }
        revoked
    }

    /// Spawn the watcher that revalidates on every rule-store write
    pub fn spawn_revocation_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut revisions = self.acl.store().subscribe();
        tokio::spawn(async move {
            while revisions.changed().await.is_ok() {
                let revoked = manager.revalidate_active();
                if !revoked.is_empty() {
                    tracing::info!(count = revoked.len(), "rule change revoked tunnels");
                }
            }
        })
    }

    /// Spawn the periodic backstop revalidation sweep
    pub fn spawn_revalidation_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = self.config.revalidate_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.revalidate_active();
            }
        })
    }

    // =========================================================================
    // Liveness integration
    // =========================================================================

    /// Advance the heartbeat clock on all live tunnels of a node
    pub fn touch_node(&self, node_id: &str) {
        let now = Instant::now();
        for item in &self.tunnels {
            let mut tunnel = item.value().state.lock();
            if tunnel.node_id == node_id && tunnel.state.is_live() {
                tunnel.last_heartbeat_at = Some(now);
            }
        }
    }

    /// Ids of a node's live tunnels
    #[must_use]
    pub fn tunnels_for_node(&self, node_id: &str) -> Vec<Uuid> {
        self.tunnels
            .iter()
            .filter_map(|item| {
                let tunnel = item.value().state.lock();
                (tunnel.node_id == node_id && tunnel.state.is_live()).then_some(tunnel.id)
            })
            .collect()
    }

    // =========================================================================
    // Admin surface
    // =========================================================================

    /// List tunnels matching a filter
    #[must_use]
    pub fn list_tunnels(&self, filter: &TunnelFilter) -> Vec<TunnelInfo> {
        self.tunnels
            .iter()
            .filter_map(|item| {
                let tunnel = item.value().state.lock();
                filter.matches(&tunnel).then(|| TunnelInfo::from(&*tunnel))
            })
            .collect()
    }

    /// Get a tunnel by id
    #[must_use]
    pub fn get_tunnel(&self, id: Uuid) -> Option<TunnelInfo> {
        self.tunnels
            .get(&id)
            .map(|entry| TunnelInfo::from(&*entry.state.lock()))
    }

    /// Point-in-time statistics for a tunnel
    ///
    /// # Errors
    ///
    /// Returns an error if no tunnel with the given id exists.
    pub fn tunnel_stats(&self, id: Uuid) -> Result<TunnelStats> {
        let entry = self.entry(id)?;
        let tunnel = entry.state.lock();
        Ok(TunnelStats {
            id: tunnel.id,
            state: tunnel.state.clone(),
            remote_port: tunnel.remote_port,
            uptime: tunnel.created_mono.elapsed(),
            last_heartbeat_age: tunnel.last_heartbeat_at.map(|at| at.elapsed()),
            reconnect_attempts: tunnel.reconnect_attempts,
            last_error: tunnel.last_error.clone(),
        })
    }

    /// Number of tracked tunnels, closed included
    #[must_use]
    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    /// Number of non-closed tunnels
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.tunnels
            .iter()
            .filter(|item| item.value().state.lock().state.is_live())
            .count()
    }

    /// Number of active tunnels
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.tunnels
            .iter()
            .filter(|item| item.value().state.lock().state.is_active())
            .count()
    }

    /// Drop closed tunnel records, returning how many were removed
    pub fn prune_closed(&self) -> usize {
        let before = self.tunnels.len();
        self.tunnels
            .retain(|_, entry| entry.state.lock().state.is_live());
        before - self.tunnels.len()
    }

    /// Abort all pending watchdog and retry tasks
    pub fn shutdown(&self) {
        for item in &self.pending_tasks {
            item.value().abort();
        }
        self.pending_tasks.clear();
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn entry(&self, id: Uuid) -> Result<Arc<TunnelEntry>> {
        self.tunnels
            .get(&id)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| GateError::not_found(format!("tunnel {id}")))
    }

    fn abort_pending(&self, id: Uuid) {
        if let Some((_, handle)) = self.pending_tasks.remove(&id) {
            handle.abort();
        }
    }

    fn replace_pending(&self, id: Uuid, handle: AbortHandle) {
        if let Some(old) = self.pending_tasks.insert(id, handle) {
            old.abort();
        }
    }

    /// Bound the transport handshake wait
    ///
    /// If the tunnel is still `Connecting` when the timer fires, the
    /// transport is treated as failed, which feeds the normal retry path.
    fn spawn_handshake_watchdog(self: &Arc<Self>, id: Uuid) {
        let manager = Arc::clone(self);
        let timeout = self.config.handshake_timeout;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            manager.pending_tasks.remove(&id);

            let timed_out = manager
                .tunnels
                .get(&id)
                .is_some_and(|entry| {
                    let tunnel = entry.state.lock();
                    matches!(tunnel.state, TunnelState::Connecting | TunnelState::Pending)
                });

            if timed_out {
                tracing::warn!(tunnel_id = %id, "handshake timed out");
                manager.fail_transport(id, GateError::HandshakeTimeout.to_string());
            }
        });

        self.replace_pending(id, handle.abort_handle());
    }

    /// Schedule a reconnect attempt with exponential backoff and full jitter
    fn schedule_retry(self: &Arc<Self>, id: Uuid) {
        let Some(entry) = self.tunnels.get(&id).map(|e| Arc::clone(&e)) else {
            return;
        };

        let (attempt, access) = {
            let mut tunnel = entry.state.lock();
            tunnel.reconnect_attempts += 1;
            (tunnel.reconnect_attempts, tunnel.access.clone())
        };

        let delay = backoff_delay(
            attempt,
            self.config.reconnect_base,
            self.config.reconnect_cap,
        );
        tracing::info!(
            tunnel_id = %id,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.pending_tasks.remove(&id);

            // Zero-Trust re-verification: every reconnect passes the ACL
            // gate again, so a rule change during the outage denies it.
            let decision = manager.acl.evaluate(&access.restamped());
            if !decision.is_allow() {
                tracing::info!(tunnel_id = %id, "reconnect denied, closing tunnel");
                let _ = manager.close_tunnel(id, CloseReason::AccessRevoked);
                return;
            }

            let reconnecting = {
                let Some(entry) = manager.tunnels.get(&id).map(|e| Arc::clone(&e)) else {
                    return;
                };
                let mut tunnel = entry.state.lock();
                if matches!(tunnel.state, TunnelState::Error(_)) {
                    tunnel.state = TunnelState::Connecting;
                    true
                } else {
                    false
                }
            };

            if reconnecting {
                manager.events.emit(
                    Event::new(EventKind::TunnelCreated)
                        .with_tunnel(id)
                        .with_details(format!("reconnect attempt {attempt}")),
                );
                manager.spawn_handshake_watchdog(id);
            }
        });

        self.replace_pending(id, handle.abort_handle());
    }
}

impl Drop for TunnelManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Exponential backoff with full jitter
///
/// The deterministic ceiling doubles per attempt from `base` up to `cap`;
/// the actual delay is drawn uniformly from `[0, ceiling]`.
fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let ceiling = base.saturating_mul(1 << shift).min(cap);
    let max_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
