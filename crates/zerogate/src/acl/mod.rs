//! ACL rule model, store, and decision engine

pub mod engine;
pub mod rule;
pub mod store;

pub use engine::AclEngine;
pub use rule::{
    AccessRule, ConnectionRequest, Decision, Predicates, Protocol, RuleAction, TimeWindow,
};
pub use store::{CompiledRule, RuleSnapshot, RuleStore};
