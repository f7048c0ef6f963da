//! Task routing
//!
//! Exactly one target pool per task, chosen by a closed set of strategies
//! over the pools the latest health snapshot calls eligible.

mod router;
mod strategy;

pub use router::{RouterConfig, RoutingDecision, TaskRouter};
pub use strategy::{fnv1a_64, RoutingStrategy};
