//! Error types for control-plane operations

use thiserror::Error;
use uuid::Uuid;

use crate::tunnel::TunnelClass;

/// Errors that can occur during control-plane operations
#[derive(Debug, Error)]
pub enum GateError {
    /// ACL evaluation denied the connection
    #[error("Access denied ({})", denied_source(.rule_id))]
    AccessDenied {
        /// Rule that produced the DENY, or `None` for the default-deny
        rule_id: Option<Uuid>,
    },

    /// No free port remains in the class range
    #[error("Port range exhausted for {class:?} tunnels")]
    RangeExhausted {
        /// Tunnel class whose range is exhausted
        class: TunnelClass,
    },

    /// A requested specific port cannot be allocated
    #[error("Port {port} is not available")]
    PortUnavailable {
        /// The requested port
        port: u16,
    },

    /// A rule contains unparsable CIDR or port data
    #[error("Malformed rule: {message}")]
    MalformedRule {
        /// Description of the malformed field
        message: String,
    },

    /// Transport failed to establish within the handshake bound
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// The non-closed tunnel count reached the configured ceiling
    #[error("Tunnel capacity reached ({limit})")]
    AtCapacity {
        /// Configured `max_tunnels` limit
        limit: usize,
    },

    /// Referenced entity does not exist
    #[error("Not found: {what}")]
    NotFound {
        /// Description of the missing entity
        what: String,
    },

    /// Configuration error (invalid config, missing required field)
    #[error("Configuration error: {message}")]
    Config {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Service is shutting down
    #[error("Service is shutting down")]
    Shutdown,
}

fn denied_source(rule_id: &Option<Uuid>) -> String {
    match rule_id {
        Some(id) => format!("rule {id}"),
        None => "default deny".to_string(),
    }
}

impl GateError {
    /// Create an access-denied error for an explicit DENY rule
    #[must_use]
    pub fn denied_by(rule_id: Uuid) -> Self {
        Self::AccessDenied {
            rule_id: Some(rule_id),
        }
    }

    /// Create an access-denied error for the default-deny fallback
    #[must_use]
    pub fn default_deny() -> Self {
        Self::AccessDenied { rule_id: None }
    }

    /// Create a new malformed-rule error
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedRule {
            message: message.into(),
        }
    }

    /// Create a new not-found error
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a new configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Result type alias for control-plane operations
pub type Result<T> = std::result::Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let id = Uuid::new_v4();
        let err = GateError::denied_by(id);
        assert_eq!(err.to_string(), format!("Access denied (rule {id})"));

        let err = GateError::default_deny();
        assert_eq!(err.to_string(), "Access denied (default deny)");

        let err = GateError::RangeExhausted {
            class: TunnelClass::Https,
        };
        assert_eq!(err.to_string(), "Port range exhausted for Https tunnels");

        let err = GateError::malformed("bad CIDR: 10.0.0.0/99");
        assert_eq!(err.to_string(), "Malformed rule: bad CIDR: 10.0.0.0/99");

        let err = GateError::not_found("tunnel 42");
        assert_eq!(err.to_string(), "Not found: tunnel 42");

        let err = GateError::config("hub_addr missing");
        assert_eq!(err.to_string(), "Configuration error: hub_addr missing");

        let err = GateError::HandshakeTimeout;
        assert_eq!(err.to_string(), "Handshake timed out");

        let err = GateError::Shutdown;
        assert_eq!(err.to_string(), "Service is shutting down");
    }
}
