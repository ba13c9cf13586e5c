//! In-memory rule store with immutable evaluation snapshots
//!
//! The [`RuleStore`] is the mutation-safe collection behind the ACL engine.
//! Every mutation rebuilds an immutable, pre-sorted snapshot behind an
//! atomically swapped pointer, so evaluation never observes a half-updated
//! rule set. A `watch` channel carries a revision counter that the tunnel
//! manager subscribes to for revocation sweeps.

use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use super::rule::{AccessRule, Predicates};
use crate::error::{GateError, Result};

/// A rule as held in an evaluation snapshot
///
/// `predicates` is `None` when the rule's CIDR/port text failed to compile;
/// such rules never match and are skipped with a warning.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    /// The administrator-supplied rule
    pub rule: AccessRule,
    /// Creation sequence, the stable tie-break for equal priorities
    pub seq: u64,
    /// Parsed predicates, or `None` for a malformed rule
    pub predicates: Option<Predicates>,
    /// Times this rule has won an evaluation (shared across snapshots)
    pub matches: Arc<AtomicU64>,
}

/// Immutable, pre-sorted view of the enabled rules
pub type RuleSnapshot = Arc<Vec<CompiledRule>>;

struct StoredRule {
    rule: AccessRule,
    seq: u64,
    predicates: Option<Predicates>,
    matches: Arc<AtomicU64>,
}

struct StoreInner {
    rules: HashMap<Uuid, StoredRule>,
    next_seq: u64,
}

/// Mutation-safe ACL rule collection
///
/// Reads are lock-free after the snapshot pointer clone; writes are
/// administrative and infrequent, so they pay the full rebuild cost.
pub struct RuleStore {
    inner: RwLock<StoreInner>,
    snapshot: RwLock<RuleSnapshot>,
    revision_tx: watch::Sender<u64>,
}

impl RuleStore {
    /// Create an empty store at revision 0
    #[must_use]
    pub fn new() -> Self {
        let (revision_tx, _) = watch::channel(0);
        Self {
            inner: RwLock::new(StoreInner {
                rules: HashMap::new(),
                next_seq: 0,
            }),
            snapshot: RwLock::new(Arc::new(Vec::new())),
            revision_tx,
        }
    }

    /// Insert or replace a rule
    ///
    /// A rule whose CIDR or port text does not compile is still stored (the
    /// store mirrors the backing persistent data), flagged malformed, and
    /// skipped by evaluation. Re-upserting an existing id keeps its original
    /// creation sequence so priority ties do not reorder on edit.
    ///
    /// # Errors
    ///
    /// Returns an error if `priority` is outside 1-100.
    pub fn upsert_rule(&self, rule: AccessRule) -> Result<()> {
        if rule.priority == 0 || rule.priority > 100 {
            return Err(GateError::config(format!(
                "rule priority must be 1-100, got {}",
                rule.priority
            )));
        }

        let predicates = match Predicates::compile(&rule) {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::warn!(rule_id = %rule.id, error = %e, "storing malformed rule, it will never match");
                None
            }
        };

        {
            let mut inner = self.inner.write();
            let inner = &mut *inner;
            match inner.rules.entry(rule.id) {
                Entry::Occupied(mut entry) => {
                    let stored = entry.get_mut();
                    stored.rule = rule;
                    stored.predicates = predicates;
                }
                Entry::Vacant(entry) => {
                    let seq = inner.next_seq;
                    inner.next_seq += 1;
                    entry.insert(StoredRule {
                        rule,
                        seq,
                        predicates,
                        matches: Arc::new(AtomicU64::new(0)),
                    });
                }
            }
        }

        self.publish();
        Ok(())
    }

    /// Remove a rule
    ///
    /// # Errors
    ///
    /// Returns an error if no rule with the given id exists.
    pub fn delete_rule(&self, id: Uuid) -> Result<AccessRule> {
        let removed = {
            let mut inner = self.inner.write();
            inner
                .rules
                .remove(&id)
                .ok_or_else(|| GateError::not_found(format!("rule {id}")))?
        };

        self.publish();
        Ok(removed.rule)
    }

    /// Enable or disable a rule
    ///
    /// # Errors
    ///
    /// Returns an error if no rule with the given id exists.
    pub fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<()> {
        {
            let mut inner = self.inner.write();
            let stored = inner
                .rules
                .get_mut(&id)
                .ok_or_else(|| GateError::not_found(format!("rule {id}")))?;
            stored.rule.enabled = enabled;
        }

        self.publish();
        Ok(())
    }

    /// Get a rule by id
    #[must_use]
    pub fn get_rule(&self, id: Uuid) -> Option<AccessRule> {
        self.inner.read().rules.get(&id).map(|s| s.rule.clone())
    }

    /// List all rules (enabled and disabled), in evaluation order
    #[must_use]
    pub fn list_rules(&self) -> Vec<AccessRule> {
        let inner = self.inner.read();
        let mut stored: Vec<&StoredRule> = inner.rules.values().collect();
        stored.sort_by_key(|s| (s.rule.priority, s.seq));
        stored.iter().map(|s| s.rule.clone()).collect()
    }

    /// Number of stored rules
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.inner.read().rules.len()
    }

    /// How many times a rule has won an evaluation
    #[must_use]
    pub fn match_count(&self, id: Uuid) -> Option<u64> {
        self.inner
            .read()
            .rules
            .get(&id)
            .map(|s| s.matches.load(Ordering::Relaxed))
    }

    /// Get the current evaluation snapshot
    ///
    /// The snapshot contains only enabled rules, pre-sorted by
    /// `(priority, creation order)`. It is immutable; concurrent mutations
    /// swap in a new snapshot without disturbing in-flight evaluations.
    #[must_use]
    pub fn snapshot(&self) -> RuleSnapshot {
        Arc::clone(&self.snapshot.read())
    }

    /// Current store revision (bumped on every mutation)
    #[must_use]
    pub fn revision(&self) -> u64 {
        *self.revision_tx.borrow()
    }

    /// Subscribe to revision changes
    ///
    /// The tunnel manager uses this to trigger revocation sweeps on every
    /// rule write.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision_tx.subscribe()
    }

    /// Rebuild the snapshot and bump the revision
    fn publish(&self) {
        let rebuilt = {
            let inner = self.inner.read();
            let mut compiled: Vec<CompiledRule> = inner
                .rules
                .values()
                .filter(|s| s.rule.enabled)
                .map(|s| CompiledRule {
                    rule: s.rule.clone(),
                    seq: s.seq,
                    predicates: s.predicates.clone(),
                    matches: Arc::clone(&s.matches),
                })
                .collect();
            compiled.sort_by_key(|c| (c.rule.priority, c.seq));
            Arc::new(compiled)
        };

        *self.snapshot.write() = rebuilt;
        self.revision_tx.send_modify(|rev| *rev += 1);
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}
