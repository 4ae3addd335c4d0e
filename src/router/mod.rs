//! Routing Policy Layer
//!
//! Responsibilities:
//! - Map a destination host to a routing `Strategy`
//! - NO IO operations
//! - NO async operations
//!
//! A policy is a pure function: host -> Strategy. Anything it does not
//! explicitly match is `AutoTry`, which hands the decision to the learned
//! statistics.

pub mod rule_policy;

pub use rule_policy::{Rule, RulePolicy};

use serde::{Deserialize, Serialize};

/// How a destination should be reached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    /// Decide from accumulated visit statistics
    #[default]
    #[serde(rename = "auto")]
    AutoTry,
    /// Always go through the relay
    #[serde(rename = "proxy")]
    AlwaysProxy,
    /// Always connect directly, never fall back
    #[serde(rename = "direct")]
    AlwaysDirect,
}

impl Strategy {
    /// Forced strategies bypass the learned heuristic and never feed it
    pub fn is_forced(&self) -> bool {
        !matches!(self, Strategy::AutoTry)
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::AutoTry => write!(f, "auto"),
            Strategy::AlwaysProxy => write!(f, "proxy"),
            Strategy::AlwaysDirect => write!(f, "direct"),
        }
    }
}

/// Routing policy trait - pure function for routing decisions
///
/// IMPORTANT: a policy must NOT perform any IO or async operations, and must
/// return `Strategy::AutoTry` for every host it has no rule for.
pub trait RoutingPolicy: Send + Sync {
    fn get_rule(&self, host: &str) -> Strategy;
}

/// Policy that always returns the same strategy
pub struct StaticPolicy {
    strategy: Strategy,
}

impl StaticPolicy {
    pub fn new(strategy: Strategy) -> Self {
        Self { strategy }
    }
}

impl RoutingPolicy for StaticPolicy {
    fn get_rule(&self, _host: &str) -> Strategy {
        self.strategy
    }
}

impl Default for StaticPolicy {
    fn default() -> Self {
        Self::new(Strategy::AutoTry)
    }
}
