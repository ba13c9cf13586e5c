//! ACL decision engine
//!
//! Evaluates a [`ConnectionRequest`] against the current rule snapshot in
//! priority order. The absence of an explicit ALLOW is a DENY: the
//! default-deny fallthrough is the Zero-Trust invariant, not an edge case.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::rule::{ConnectionRequest, Decision, RuleAction};
use super::store::RuleStore;
use crate::event::{Event, EventKind, EventSink};

/// Priority-ordered rule evaluator
///
/// Evaluation is a pure function of the request and one atomically obtained
/// snapshot; concurrent rule edits never produce a half-updated view. The
/// only side effects are the winning rule's match counter and deny events
/// pushed to the audit sink.
pub struct AclEngine {
    store: Arc<RuleStore>,
    events: EventSink,
}

impl AclEngine {
    /// Create an engine over a rule store
    #[must_use]
    pub fn new(store: Arc<RuleStore>, events: EventSink) -> Self {
        Self { store, events }
    }

    /// The underlying rule store
    #[must_use]
    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    /// Evaluate a connection request
    ///
    /// Walks the enabled rules sorted by `(priority, creation order)` and
    /// returns the first full match. Predicates short-circuit in order:
    /// time gates, addresses, protocol, port. Malformed rules are skipped
    /// with a warning and never abort evaluation; the walk always
    /// terminates in a [`Decision`].
    #[must_use]
    pub fn evaluate(&self, request: &ConnectionRequest) -> Decision {
        let snapshot = self.store.snapshot();

        for compiled in snapshot.iter() {
            let rule = &compiled.rule;

            let Some(ref predicates) = compiled.predicates else {
                tracing::warn!(rule_id = %rule.id, "skipping malformed rule");
                continue;
            };

            if !rule.active_at(request.timestamp) {
                continue;
            }
            if !predicates.matches_addrs(request.source_ip, request.dest_ip) {
                continue;
            }
            if !rule.protocol.admits(request.protocol) {
                continue;
            }
            if !predicates.admits_port(request.dest_port) {
                continue;
            }

            compiled.matches.fetch_add(1, Ordering::Relaxed);

            let decision = Decision {
                outcome: rule.action,
                matched_rule: Some(rule.id),
            };

            if rule.action == RuleAction::Deny {
                tracing::debug!(
                    rule_id = %rule.id,
                    priority = rule.priority,
                    source = %request.source_ip,
                    dest = %request.dest_ip,
                    "connection denied by rule"
                );
                self.events.emit(
                    Event::new(EventKind::AclDenied)
                        .with_rule(rule.id)
                        .with_details(format!(
                            "{} -> {}:{} denied",
                            request.source_ip, request.dest_ip, request.dest_port
                        )),
                );
            }

            return decision;
        }

        tracing::debug!(
            source = %request.source_ip,
            dest = %request.dest_ip,
            port = request.dest_port,
            "no rule matched, default deny"
        );
        self.events.emit(Event::new(EventKind::AclDefaultDeny).with_details(format!(
            "{} -> {}:{} fell through to default deny",
            request.source_ip, request.dest_ip, request.dest_port
        )));

        Decision::default_deny()
    }
}
