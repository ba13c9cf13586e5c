//! Remote-port allocation for tunnel classes
//!
//! Two disjoint ranges back the allocator: one shared by system and
//! terminal tunnels, one for HTTPS tunnels. Released ports sit in a
//! quarantine window before becoming reallocatable, so a fresh tunnel never
//! races the lingering socket state of a just-closed one.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::config::GateConfig;
use crate::error::{GateError, Result};
use crate::tunnel::TunnelClass;

// =============================================================================
// Port Pool
// =============================================================================

/// A single port range with allocation and quarantine tracking
#[derive(Debug)]
struct PortPool {
    /// Start of the range (inclusive)
    range_start: u16,
    /// End of the range (inclusive)
    range_end: u16,
    /// Currently allocated ports
    allocated: HashSet<u16>,
    /// Released ports and the instant they become eligible again
    quarantine: HashMap<u16, Instant>,
}

impl PortPool {
    fn new(start: u16, end: u16) -> Self {
        Self {
            range_start: start,
            range_end: end,
            allocated: HashSet::new(),
            quarantine: HashMap::new(),
        }
    }

    /// Drop quarantine entries whose cooldown has elapsed
    fn evict_expired(&mut self, now: Instant) {
        self.quarantine.retain(|_, eligible_at| *eligible_at > now);
    }

    /// Allocate the lowest free, non-quarantined port
    fn allocate(&mut self, now: Instant) -> Option<u16> {
        self.evict_expired(now);
        for port in self.range_start..=self.range_end {
            if !self.allocated.contains(&port) && !self.quarantine.contains_key(&port) {
                self.allocated.insert(port);
                return Some(port);
            }
        }
        None
    }

    /// Allocate a specific port if it is free
    fn allocate_specific(&mut self, port: u16, now: Instant) -> bool {
        self.evict_expired(now);
        if port < self.range_start || port > self.range_end {
            return false;
        }
        if self.allocated.contains(&port) || self.quarantine.contains_key(&port) {
            return false;
        }
        self.allocated.insert(port);
        true
    }

    /// Release a port into quarantine; false if it was not allocated
    fn release(&mut self, port: u16, eligible_at: Instant) -> bool {
        if !self.allocated.remove(&port) {
            return false;
        }
        self.quarantine.insert(port, eligible_at);
        true
    }

    fn available_count(&self, now: Instant) -> usize {
        let total = usize::from(self.range_end - self.range_start) + 1;
        let cooling = self
            .quarantine
            .values()
            .filter(|eligible_at| **eligible_at > now)
            .count();
        total.saturating_sub(self.allocated.len() + cooling)
    }
}

// =============================================================================
// Port Allocator
// =============================================================================

/// Collision-free remote-port allocator, one pool per class group
///
/// Allocation is atomic under a per-pool mutex: two concurrent `allocate`
/// calls can never return the same port. The allocated sets are process
/// state only; on restart they are re-derived from the live tunnel set.
#[derive(Debug)]
pub struct PortAllocator {
    /// Pool shared by system and terminal tunnels
    tunnel_pool: Mutex<PortPool>,
    /// Pool for HTTPS tunnels
    https_pool: Mutex<PortPool>,
    /// Cooldown applied to released ports
    quarantine: Duration,
}

impl PortAllocator {
    /// Create an allocator over two disjoint ranges
    #[must_use]
    pub fn new(
        tunnel_range: (u16, u16),
        https_range: (u16, u16),
        quarantine: Duration,
    ) -> Self {
        Self {
            tunnel_pool: Mutex::new(PortPool::new(tunnel_range.0, tunnel_range.1)),
            https_pool: Mutex::new(PortPool::new(https_range.0, https_range.1)),
            quarantine,
        }
    }

    /// Create an allocator from the process config
    #[must_use]
    pub fn from_config(config: &GateConfig) -> Self {
        Self::new(
            config.tunnel_port_range,
            config.https_port_range,
            config.port_quarantine,
        )
    }

    fn pool(&self, class: TunnelClass) -> &Mutex<PortPool> {
        match class {
            TunnelClass::System | TunnelClass::Terminal => &self.tunnel_pool,
            TunnelClass::Https => &self.https_pool,
        }
    }

    /// Allocate the lowest free port for a class
    ///
    /// # Errors
    ///
    /// Returns [`GateError::RangeExhausted`] when no free, non-quarantined
    /// port remains in the class range. This is a retryable condition, not
    /// a fault: callers may retry once tunnels close.
    pub fn allocate(&self, class: TunnelClass) -> Result<u16> {
        let port = self.pool(class).lock().allocate(Instant::now());
        match port {
            Some(port) => {
                tracing::debug!(class = ?class, port = port, "port allocated");
                Ok(port)
            }
            None => Err(GateError::RangeExhausted { class }),
        }
    }

    /// Allocate a specific port for a class
    ///
    /// # Errors
    ///
    /// Returns [`GateError::PortUnavailable`] if the port is outside the
    /// class range, already allocated, or quarantined.
    pub fn allocate_specific(&self, class: TunnelClass, port: u16) -> Result<u16> {
        if self.pool(class).lock().allocate_specific(port, Instant::now()) {
            tracing::debug!(class = ?class, port = port, "specific port allocated");
            Ok(port)
        } else {
            Err(GateError::PortUnavailable { port })
        }
    }

    /// Release a port back into its class pool
    ///
    /// The port enters quarantine and becomes reallocatable once the
    /// cooldown elapses. Releasing a port that is not allocated is a
    /// logged no-op.
    pub fn release(&self, class: TunnelClass, port: u16) {
        let eligible_at = Instant::now() + self.quarantine;
        if self.pool(class).lock().release(port, eligible_at) {
            tracing::debug!(class = ?class, port = port, "port released into quarantine");
        } else {
            tracing::warn!(class = ?class, port = port, "duplicate release of unallocated port");
        }
    }

    /// Mark a port allocated during state restore
    ///
    /// Used when rebuilding allocator state from the live tunnel set after
    /// a restart; allocation state is not persisted on its own.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::PortUnavailable`] if the port is outside the
    /// class range or already allocated.
    pub fn mark_allocated(&self, class: TunnelClass, port: u16) -> Result<()> {
        if self.pool(class).lock().allocate_specific(port, Instant::now()) {
            Ok(())
        } else {
            Err(GateError::PortUnavailable { port })
        }
    }

    /// Check whether a port is currently allocated in a class pool
    #[must_use]
    pub fn is_allocated(&self, class: TunnelClass, port: u16) -> bool {
        self.pool(class).lock().allocated.contains(&port)
    }

    /// Number of ports currently allocatable for a class
    #[must_use]
    pub fn available(&self, class: TunnelClass) -> usize {
        self.pool(class).lock().available_count(Instant::now())
    }

    /// Number of ports currently cooling down for a class
    #[must_use]
    pub fn quarantined(&self, class: TunnelClass) -> usize {
        let now = Instant::now();
        self.pool(class)
            .lock()
            .quarantine
            .values()
            .filter(|eligible_at| **eligible_at > now)
            .count()
    }

    /// Spawn the background quarantine eviction sweep
    ///
    /// Allocation also evicts lazily, so the sweep only bounds how long
    /// expired entries linger; aborting the returned handle stops it.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let allocator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                allocator.tunnel_pool.lock().evict_expired(now);
                allocator.https_pool.lock().evict_expired(now);
            }
        })
    }
}
