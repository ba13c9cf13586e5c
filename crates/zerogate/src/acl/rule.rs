//! Access rule data model and match predicates

use chrono::{Datelike, Local, NaiveDateTime, NaiveTime, Weekday};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

use crate::error::{GateError, Result};

// =============================================================================
// Actions and Protocols
// =============================================================================

/// Action a rule takes when it matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleAction {
    /// Permit the connection
    Allow,
    /// Reject the connection
    Deny,
}

/// Protocol selector for a rule or connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP traffic
    Tcp,
    /// UDP traffic
    Udp,
    /// ICMP traffic
    Icmp,
    /// Any protocol (rule-side wildcard)
    All,
}

impl Protocol {
    /// Check whether a rule protocol admits a request protocol
    #[must_use]
    pub fn admits(self, requested: Protocol) -> bool {
        self == Protocol::All || self == requested
    }
}

// =============================================================================
// Time Window
// =============================================================================

/// Wall-clock window during which a rule is active
///
/// The interval is half-open: a window of `09:00..17:00` matches at 09:00
/// and 16:59 but not at 17:00. A window whose `start` is after its `end`
/// wraps across midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Inclusive start of the window
    pub start: NaiveTime,
    /// Exclusive end of the window
    pub end: NaiveTime,
}

impl TimeWindow {
    /// Create a new window
    #[must_use]
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Check whether a time falls inside the window
    #[must_use]
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

// =============================================================================
// Access Rule
// =============================================================================

/// An administrator-supplied access rule
///
/// Network fields are kept in CIDR notation as supplied; they are compiled
/// into parsed predicates when the rule enters the store, so a malformed
/// rule can be stored and reported without ever crashing evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRule {
    /// Opaque rule identifier
    pub id: Uuid,

    /// Evaluation priority, 1-100; lower values are evaluated first.
    /// Ties are broken by creation order.
    pub priority: u8,

    /// Action taken when the rule matches
    pub action: RuleAction,

    /// Source network in CIDR notation (`0.0.0.0/0` or `::/0` = any)
    pub source_net: String,

    /// Destination network in CIDR notation
    pub dest_net: String,

    /// Protocol the rule applies to
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,

    /// Destination port (0 = any port)
    #[serde(default)]
    pub dest_port: u32,

    /// Rule is inactive before this instant
    #[serde(default)]
    pub valid_from: Option<NaiveDateTime>,

    /// Rule is inactive after this instant
    #[serde(default)]
    pub valid_until: Option<NaiveDateTime>,

    /// Weekdays the rule is active on (None = every day)
    #[serde(default)]
    pub days_of_week: Option<Vec<Weekday>>,

    /// Wall-clock window the rule is active in (None = all day)
    #[serde(default)]
    pub time_range: Option<TimeWindow>,

    /// Disabled rules are skipped entirely
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

const fn default_protocol() -> Protocol {
    Protocol::All
}

impl AccessRule {
    /// Create a new rule matching any protocol and any port
    #[must_use]
    pub fn new(
        priority: u8,
        action: RuleAction,
        source_net: impl Into<String>,
        dest_net: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            priority,
            action,
            source_net: source_net.into(),
            dest_net: dest_net.into(),
            protocol: Protocol::All,
            dest_port: 0,
            valid_from: None,
            valid_until: None,
            days_of_week: None,
            time_range: None,
            enabled: true,
        }
    }

    /// Restrict the rule to a protocol
    #[must_use]
    pub const fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Restrict the rule to a destination port
    #[must_use]
    pub const fn with_port(mut self, port: u32) -> Self {
        self.dest_port = port;
        self
    }

    /// Bound the rule's validity to an absolute interval
    #[must_use]
    pub const fn with_validity(
        mut self,
        from: Option<NaiveDateTime>,
        until: Option<NaiveDateTime>,
    ) -> Self {
        self.valid_from = from;
        self.valid_until = until;
        self
    }

    /// Restrict the rule to a set of weekdays
    #[must_use]
    pub fn with_days(mut self, days: Vec<Weekday>) -> Self {
        self.days_of_week = Some(days);
        self
    }

    /// Restrict the rule to a daily wall-clock window
    #[must_use]
    pub const fn with_window(mut self, window: TimeWindow) -> Self {
        self.time_range = Some(window);
        self
    }

    /// Mark the rule disabled
    #[must_use]
    pub const fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Check the time gates against an evaluation instant
    ///
    /// Returns true when the rule is active at `now`: inside its validity
    /// interval, on an allowed weekday, and inside its daily window.
    #[must_use]
    pub fn active_at(&self, now: NaiveDateTime) -> bool {
        if let Some(from) = self.valid_from {
            if now < from {
                return false;
            }
        }
        if let Some(until) = self.valid_until {
            if now > until {
                return false;
            }
        }
        if let Some(ref days) = self.days_of_week {
            if !days.contains(&now.weekday()) {
                return false;
            }
        }
        if let Some(window) = self.time_range {
            if !window.contains(now.time()) {
                return false;
            }
        }
        true
    }
}

// =============================================================================
// Compiled Predicates
// =============================================================================

/// Parsed network/port predicates of a rule
///
/// Compiled once when a rule enters the store. Rules whose text fails to
/// compile are flagged malformed and never match.
#[derive(Debug, Clone)]
pub struct Predicates {
    /// Parsed source network
    pub source_net: IpNet,
    /// Parsed destination network
    pub dest_net: IpNet,
    /// Destination port (None = any)
    pub dest_port: Option<u16>,
}

impl Predicates {
    /// Compile a rule's textual predicates
    ///
    /// # Errors
    ///
    /// Returns [`GateError::MalformedRule`] if a CIDR fails to parse or the
    /// port is outside the 16-bit range.
    pub fn compile(rule: &AccessRule) -> Result<Self> {
        let source_net: IpNet = rule
            .source_net
            .parse()
            .map_err(|e| GateError::malformed(format!("source_net '{}': {e}", rule.source_net)))?;
        let dest_net: IpNet = rule
            .dest_net
            .parse()
            .map_err(|e| GateError::malformed(format!("dest_net '{}': {e}", rule.dest_net)))?;
        let dest_port = match rule.dest_port {
            0 => None,
            p => Some(
                u16::try_from(p)
                    .map_err(|_| GateError::malformed(format!("dest_port {p} out of range")))?,
            ),
        };
        Ok(Self {
            source_net,
            dest_net,
            dest_port,
        })
    }

    /// Check the source/destination address predicates against a request
    #[must_use]
    pub fn matches_addrs(&self, source_ip: IpAddr, dest_ip: IpAddr) -> bool {
        net_matches(&self.source_net, &source_ip) && net_matches(&self.dest_net, &dest_ip)
    }

    /// Check the destination-port predicate against a request
    #[must_use]
    pub fn admits_port(&self, dest_port: u16) -> bool {
        match self.dest_port {
            Some(p) => p == dest_port,
            None => true,
        }
    }
}

/// CIDR containment with wildcard semantics
///
/// A zero-length prefix (`0.0.0.0/0` or `::/0`) matches any address of
/// either family.
fn net_matches(net: &IpNet, ip: &IpAddr) -> bool {
    net.prefix_len() == 0 || net.contains(ip)
}

// =============================================================================
// Connection Request and Decision
// =============================================================================

/// A candidate connection to evaluate against the rule set
///
/// The evaluation time is an explicit field so the engine stays
/// deterministic; [`ConnectionRequest::new`] stamps the current local
/// wall-clock time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRequest {
    /// Concrete source address
    pub source_ip: IpAddr,
    /// Concrete destination address
    pub dest_ip: IpAddr,
    /// Requested protocol
    pub protocol: Protocol,
    /// Requested destination port
    pub dest_port: u16,
    /// Local wall-clock evaluation time
    pub timestamp: NaiveDateTime,
}

impl ConnectionRequest {
    /// Create a request stamped with the current local time
    #[must_use]
    pub fn new(source_ip: IpAddr, dest_ip: IpAddr, protocol: Protocol, dest_port: u16) -> Self {
        Self {
            source_ip,
            dest_ip,
            protocol,
            dest_port,
            timestamp: Local::now().naive_local(),
        }
    }

    /// Override the evaluation time
    #[must_use]
    pub const fn at(mut self, timestamp: NaiveDateTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Re-stamp the request with the current local time
    ///
    /// Used when a retained request template is re-evaluated later in a
    /// tunnel's life.
    #[must_use]
    pub fn restamped(&self) -> Self {
        let mut req = self.clone();
        req.timestamp = Local::now().naive_local();
        req
    }
}

/// Outcome of evaluating a [`ConnectionRequest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// ALLOW or DENY
    pub outcome: RuleAction,
    /// Rule that produced the outcome; `None` for the default-deny
    pub matched_rule: Option<Uuid>,
}

impl Decision {
    /// The Zero-Trust default: deny with no matching rule
    #[must_use]
    pub const fn default_deny() -> Self {
        Self {
            outcome: RuleAction::Deny,
            matched_rule: None,
        }
    }

    /// Check whether the decision permits the connection
    #[must_use]
    pub fn is_allow(&self) -> bool {
        self.outcome == RuleAction::Allow
    }

    /// Check whether this is the default-deny fallback
    #[must_use]
    pub fn is_default_deny(&self) -> bool {
        self.outcome == RuleAction::Deny && self.matched_rule.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
    }

    #[test]
    fn test_time_window_half_open() {
        let window = TimeWindow::new(t(9, 0), t(17, 0));
        assert!(window.contains(t(9, 0)));
        assert!(window.contains(t(16, 59)));
        assert!(!window.contains(t(8, 59)));
        assert!(!window.contains(t(17, 0)));
    }

    #[test]
    fn test_time_window_wraps_midnight() {
        let window = TimeWindow::new(t(22, 0), t(6, 0));
        assert!(window.contains(t(23, 30)));
        assert!(window.contains(t(5, 59)));
        assert!(!window.contains(t(6, 0)));
        assert!(!window.contains(t(12, 0)));
    }

    #[test]
    fn test_protocol_admits() {
        assert!(Protocol::All.admits(Protocol::Tcp));
        assert!(Protocol::All.admits(Protocol::Icmp));
        assert!(Protocol::Tcp.admits(Protocol::Tcp));
        assert!(!Protocol::Tcp.admits(Protocol::Udp));
        assert!(!Protocol::Udp.admits(Protocol::Tcp));
    }

    #[test]
    fn test_rule_active_validity_interval() {
        let rule = AccessRule::new(10, RuleAction::Allow, "10.0.0.0/8", "0.0.0.0/0")
            .with_validity(Some(dt(2026, 3, 1, 0, 0)), Some(dt(2026, 3, 31, 23, 59)));

        assert!(!rule.active_at(dt(2026, 2, 28, 12, 0)));
        assert!(rule.active_at(dt(2026, 3, 15, 12, 0)));
        assert!(!rule.active_at(dt(2026, 4, 1, 0, 0)));
    }

    #[test]
    fn test_rule_active_days_of_week() {
        // 2026-03-02 is a Monday
        let rule = AccessRule::new(10, RuleAction::Allow, "10.0.0.0/8", "0.0.0.0/0")
            .with_days(vec![Weekday::Mon, Weekday::Tue]);

        assert!(rule.active_at(dt(2026, 3, 2, 12, 0)));
        assert!(rule.active_at(dt(2026, 3, 3, 12, 0)));
        assert!(!rule.active_at(dt(2026, 3, 4, 12, 0)));
        assert!(!rule.active_at(dt(2026, 3, 7, 12, 0)));
    }

    #[test]
    fn test_rule_active_time_range() {
        let rule = AccessRule::new(10, RuleAction::Allow, "10.0.0.0/8", "0.0.0.0/0")
            .with_window(TimeWindow::new(t(9, 0), t(17, 0)));

        assert!(rule.active_at(dt(2026, 3, 2, 9, 0)));
        assert!(rule.active_at(dt(2026, 3, 2, 16, 59)));
        assert!(!rule.active_at(dt(2026, 3, 2, 8, 59)));
        assert!(!rule.active_at(dt(2026, 3, 2, 17, 0)));
    }

    #[test]
    fn test_rule_unbounded_is_always_active() {
        let rule = AccessRule::new(10, RuleAction::Allow, "10.0.0.0/8", "0.0.0.0/0");
        assert!(rule.active_at(dt(2026, 3, 2, 0, 0)));
        assert!(rule.active_at(dt(1999, 12, 31, 23, 59)));
    }

    #[test]
    fn test_predicates_compile() {
        let rule = AccessRule::new(10, RuleAction::Allow, "10.0.0.0/8", "192.168.1.0/24")
            .with_port(22);
        let pred = Predicates::compile(&rule).unwrap();
        assert_eq!(pred.dest_port, Some(22));
        assert_eq!(pred.source_net.prefix_len(), 8);
    }

    #[test]
    fn test_predicates_compile_bad_cidr() {
        let rule = AccessRule::new(10, RuleAction::Allow, "10.0.0.0/99", "0.0.0.0/0");
        let err = Predicates::compile(&rule).unwrap_err();
        assert!(err.to_string().contains("source_net"));

        let rule = AccessRule::new(10, RuleAction::Allow, "0.0.0.0/0", "not-a-cidr");
        let err = Predicates::compile(&rule).unwrap_err();
        assert!(err.to_string().contains("dest_net"));
    }

    #[test]
    fn test_predicates_compile_bad_port() {
        let rule = AccessRule::new(10, RuleAction::Allow, "0.0.0.0/0", "0.0.0.0/0")
            .with_port(70000);
        let err = Predicates::compile(&rule).unwrap_err();
        assert!(err.to_string().contains("dest_port"));
    }

    #[test]
    fn test_predicates_address_containment() {
        let rule = AccessRule::new(10, RuleAction::Allow, "10.0.0.0/8", "192.168.1.0/24")
            .with_port(22);
        let pred = Predicates::compile(&rule).unwrap();

        let src: IpAddr = "10.1.2.3".parse().unwrap();
        let dst: IpAddr = "192.168.1.50".parse().unwrap();
        assert!(pred.matches_addrs(src, dst));
        assert!(pred.admits_port(22));

        let outside: IpAddr = "11.0.0.1".parse().unwrap();
        assert!(!pred.matches_addrs(outside, dst));

        let wrong_dst: IpAddr = "192.168.2.1".parse().unwrap();
        assert!(!pred.matches_addrs(src, wrong_dst));

        assert!(!pred.admits_port(80));
    }

    #[test]
    fn test_predicates_any_port() {
        let rule = AccessRule::new(10, RuleAction::Allow, "0.0.0.0/0", "0.0.0.0/0");
        let pred = Predicates::compile(&rule).unwrap();
        assert!(pred.admits_port(1));
        assert!(pred.admits_port(65535));
    }

    #[test]
    fn test_zero_prefix_matches_both_families() {
        let rule = AccessRule::new(10, RuleAction::Allow, "0.0.0.0/0", "0.0.0.0/0");
        let pred = Predicates::compile(&rule).unwrap();

        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        let v4: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(pred.matches_addrs(v6, v4));
        assert!(pred.matches_addrs(v4, v6));
    }

    #[test]
    fn test_family_mismatch_does_not_match() {
        let rule = AccessRule::new(10, RuleAction::Allow, "10.0.0.0/8", "0.0.0.0/0");
        let pred = Predicates::compile(&rule).unwrap();

        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        let v4: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(!pred.matches_addrs(v6, v4));
    }

    #[test]
    fn test_connection_request_at() {
        let src: IpAddr = "10.0.0.1".parse().unwrap();
        let dst: IpAddr = "192.168.1.1".parse().unwrap();
        let when = dt(2026, 3, 2, 10, 30);

        let req = ConnectionRequest::new(src, dst, Protocol::Tcp, 22).at(when);
        assert_eq!(req.timestamp, when);
        assert_eq!(req.dest_port, 22);
    }

    #[test]
    fn test_decision_helpers() {
        let allow = Decision {
            outcome: RuleAction::Allow,
            matched_rule: Some(Uuid::new_v4()),
        };
        assert!(allow.is_allow());
        assert!(!allow.is_default_deny());

        let explicit_deny = Decision {
            outcome: RuleAction::Deny,
            matched_rule: Some(Uuid::new_v4()),
        };
        assert!(!explicit_deny.is_allow());
        assert!(!explicit_deny.is_default_deny());

        let fallback = Decision::default_deny();
        assert!(!fallback.is_allow());
        assert!(fallback.is_default_deny());
    }

    #[test]
    fn test_rule_serde_roundtrip() {
        let rule = AccessRule::new(10, RuleAction::Allow, "10.0.0.0/8", "192.168.1.0/24")
            .with_protocol(Protocol::Tcp)
            .with_port(22)
            .with_days(vec![Weekday::Mon, Weekday::Fri])
            .with_window(TimeWindow::new(t(9, 0), t(17, 0)));

        let json = serde_json::to_string(&rule).expect("serialize");
        let parsed: AccessRule = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(parsed.id, rule.id);
        assert_eq!(parsed.priority, 10);
        assert_eq!(parsed.action, RuleAction::Allow);
        assert_eq!(parsed.protocol, Protocol::Tcp);
        assert_eq!(parsed.dest_port, 22);
        assert_eq!(parsed.days_of_week, Some(vec![Weekday::Mon, Weekday::Fri]));
        assert_eq!(parsed.time_range, rule.time_range);
        assert!(parsed.enabled);
    }

    #[test]
    fn test_rule_serde_defaults() {
        let json = r#"{
            "id": "6dfe6c71-6e8c-4e63-9b72-b8a7a0b5e2a1",
            "priority": 100,
            "action": "DENY",
            "source_net": "0.0.0.0/0",
            "dest_net": "0.0.0.0/0"
        }"#;
        let rule: AccessRule = serde_json::from_str(json).expect("deserialize");
        assert_eq!(rule.protocol, Protocol::All);
        assert_eq!(rule.dest_port, 0);
        assert!(rule.enabled);
        assert!(rule.valid_from.is_none());
        assert!(rule.days_of_week.is_none());
        assert!(rule.time_range.is_none());
    }
}
