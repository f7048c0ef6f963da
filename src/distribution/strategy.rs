//! Distribution strategies and plans

use crate::core::{OrchestratorError, PoolId, Result, Task};
use crate::routing::RoutingStrategy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a task is fanned out over pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStrategy {
    /// Identical copy to every eligible pool
    Broadcast,
    /// Split, run subtasks round-robin, reduce in split order
    MapReduce,
    /// Chunks assigned by the round-robin router rule
    RoundRobin,
    /// Chunks assigned uniformly at random
    Random,
    /// Chunks assigned to the least loaded pool, counting chunks already planned
    LeastLoaded,
    /// Copy to every eligible pool; the first success wins and the rest are cancelled
    Hedged,
}

impl DistributionStrategy {
    /// Every strategy
    pub const ALL: [DistributionStrategy; 6] = [
        DistributionStrategy::Broadcast,
        DistributionStrategy::MapReduce,
        DistributionStrategy::RoundRobin,
        DistributionStrategy::Random,
        DistributionStrategy::LeastLoaded,
        DistributionStrategy::Hedged,
    ];

    /// snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            DistributionStrategy::Broadcast => "broadcast",
            DistributionStrategy::MapReduce => "map_reduce",
            DistributionStrategy::RoundRobin => "round_robin",
            DistributionStrategy::Random => "random",
            DistributionStrategy::LeastLoaded => "least_loaded",
            DistributionStrategy::Hedged => "hedged",
        }
    }

    /// Aggregation mode the strategy runs under
    pub fn default_mode(&self) -> AggregationMode {
        match self {
            DistributionStrategy::MapReduce => AggregationMode::Reduce,
            DistributionStrategy::Hedged => AggregationMode::FirstSuccess,
            DistributionStrategy::Broadcast
            | DistributionStrategy::RoundRobin
            | DistributionStrategy::Random
            | DistributionStrategy::LeastLoaded => AggregationMode::All,
        }
    }

    /// Router rule used to assign chunks, for the chunked strategies
    pub(crate) fn routing_rule(&self) -> Option<RoutingStrategy> {
        match self {
            DistributionStrategy::RoundRobin => Some(RoutingStrategy::RoundRobin),
            DistributionStrategy::Random => Some(RoutingStrategy::Random),
            DistributionStrategy::LeastLoaded => Some(RoutingStrategy::LeastLoaded),
            DistributionStrategy::Broadcast
            | DistributionStrategy::MapReduce
            | DistributionStrategy::Hedged => None,
        }
    }
}

impl fmt::Display for DistributionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistributionStrategy {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == normalized)
            .ok_or_else(|| {
                OrchestratorError::invalid_config(
                    "strategy",
                    format!("unknown distribution strategy '{}'", s),
                )
            })
    }
}

/// How target outcomes combine into one answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode {
    /// Succeeds as soon as one target succeeds
    FirstSuccess,
    /// Succeeds only if every target succeeds
    All,
    /// Every target must succeed; outputs are folded in plan order
    Reduce,
}

impl AggregationMode {
    /// snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationMode::FirstSuccess => "first_success",
            AggregationMode::All => "all",
            AggregationMode::Reduce => "reduce",
        }
    }
}

impl fmt::Display for AggregationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `(pool, subtask or copy)` pair
#[derive(Debug, Clone, Serialize)]
pub struct Assignment {
    /// Position in the plan
    pub index: usize,
    /// Target pool
    pub pool_id: PoolId,
    /// Target pool name
    pub pool_name: String,
    /// Subtask or copy sent to the pool
    pub task: Task,
}

/// Ordered assignments plus the aggregation mode
#[derive(Debug, Clone, Serialize)]
pub struct DistributionPlan {
    /// Task the plan was built from
    pub task_id: String,
    /// Strategy that built it
    pub strategy: DistributionStrategy,
    /// How outcomes combine
    pub mode: AggregationMode,
    /// Targets in chunk order
    pub assignments: Vec<Assignment>,
}

impl DistributionPlan {
    /// Number of targets
    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    /// Whether the plan has no target
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Distinct pools the plan touches, in first-use order
    pub fn pools(&self) -> Vec<PoolId> {
        let mut seen = Vec::new();
        for assignment in &self.assignments {
            if !seen.contains(&assignment.pool_id) {
                seen.push(assignment.pool_id);
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_modes() {
        assert_eq!(
            "map-reduce".parse::<DistributionStrategy>().unwrap(),
            DistributionStrategy::MapReduce
        );
        assert_eq!(
            "Broadcast".parse::<DistributionStrategy>().unwrap(),
            DistributionStrategy::Broadcast
        );
        assert_eq!("affinity".parse::<DistributionStrategy>().unwrap_err().code(), "INVALID_CONFIG");

        assert_eq!(DistributionStrategy::Broadcast.default_mode(), AggregationMode::All);
        assert_eq!(DistributionStrategy::MapReduce.default_mode(), AggregationMode::Reduce);
        assert_eq!(DistributionStrategy::Hedged.default_mode(), AggregationMode::FirstSuccess);
        assert_eq!(AggregationMode::FirstSuccess.to_string(), "first_success");
    }

    #[test]
    fn test_routing_rules() {
        assert_eq!(
            DistributionStrategy::LeastLoaded.routing_rule(),
            Some(RoutingStrategy::LeastLoaded)
        );
        assert_eq!(DistributionStrategy::Broadcast.routing_rule(), None);
        for strategy in DistributionStrategy::ALL {
            assert_eq!(strategy.as_str().parse::<DistributionStrategy>().unwrap(), strategy);
        }
    }
}
