//! Single-target task routing

use super::strategy::{select, RoutingStrategy, Selection, SelectionState};
use crate::core::{OrchestratorError, PoolId, Result, Task};
use crate::health::HealthSnapshot;
use crate::pool::PoolHealth;
use crate::tracing::metrics;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Router configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Strategy used when a call does not name one
    pub default_strategy: RoutingStrategy,
}

impl RouterConfig {
    /// Set the default strategy
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_default_strategy(mut self, strategy: RoutingStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }
}

/// Where a task should go
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDecision {
    /// Chosen pool
    pub pool_id: PoolId,
    /// Chosen pool name
    pub pool_name: String,
    /// Strategy that actually decided (affinity may fall back)
    pub strategy_used: RoutingStrategy,
    /// Load of the chosen pool when decided
    pub score: f64,
    /// Eligible pools considered
    pub candidates_considered: usize,
}

/// Picks one pool per task from a health snapshot
///
/// The router keeps only its round-robin cursor and affinity cache; it never
/// mutates pools.
#[derive(Debug, Default)]
pub struct TaskRouter {
    config: RouterConfig,
    state: SelectionState,
}

impl TaskRouter {
    /// Create a router
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            state: SelectionState::default(),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Route `task` over the eligible pools of `snapshot`
    ///
    /// `strategy` defaults to the configured one. Fails `NoEligiblePool`
    /// when no pool is healthy.
    pub fn route(
        &self,
        snapshot: &HealthSnapshot,
        task: &Task,
        strategy: Option<RoutingStrategy>,
    ) -> Result<RoutingDecision> {
        let candidates = snapshot.eligible();
        let strategy = strategy.unwrap_or(self.config.default_strategy);
        let selection = self
            .select(strategy, &candidates, task, &HashMap::new())
            .ok_or_else(|| OrchestratorError::no_eligible_pool(snapshot.pools.len()))?;

        let pool = candidates[selection.index];
        metrics::record_route(selection.strategy_used.as_str(), candidates.len());
        debug!(
            task_id = task.task_id(),
            pool = %pool.name,
            strategy = %selection.strategy_used,
            score = selection.score,
            "task routed"
        );
        Ok(RoutingDecision {
            pool_id: pool.pool_id,
            pool_name: pool.name.clone(),
            strategy_used: selection.strategy_used,
            score: selection.score,
            candidates_considered: candidates.len(),
        })
    }

    /// Selection over an explicit candidate list, counting `planned` work
    pub(crate) fn select(
        &self,
        strategy: RoutingStrategy,
        candidates: &[&PoolHealth],
        task: &Task,
        planned: &HashMap<PoolId, usize>,
    ) -> Option<Selection> {
        select(strategy, candidates, task, &self.state, planned)
    }

    /// Drop the cached pool for an affinity key
    pub fn forget_affinity(&self, key: &str) -> bool {
        self.state.forget(key)
    }

    /// Pool an affinity key is currently mapped to
    pub fn affinity_of(&self, key: &str) -> Option<PoolId> {
        self.state.cached(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::synthetic_pool;
    use crate::pool::PoolStatus;
    use serde_json::json;

    #[test]
    fn test_least_loaded_scenario() {
        let p1 = synthetic_pool("p1", PoolStatus::Healthy, 1, 5);
        let p2 = synthetic_pool("p2", PoolStatus::Healthy, 4, 5);
        let snapshot = HealthSnapshot::capture(vec![p2, p1]);

        let decision = TaskRouter::default()
            .route(&snapshot, &Task::new("x", json!(null)), None)
            .unwrap();
        assert_eq!(decision.pool_name, "p1");
        assert_eq!(decision.strategy_used, RoutingStrategy::LeastLoaded);
        assert!((decision.score - 0.2).abs() < 1e-9);
        assert_eq!(decision.candidates_considered, 2);
    }

    #[test]
    fn test_ineligible_pools_are_skipped() {
        let snapshot = HealthSnapshot::capture(vec![
            synthetic_pool("down", PoolStatus::Degraded, 0, 4),
            synthetic_pool("up", PoolStatus::Healthy, 3, 4),
        ]);
        let router = TaskRouter::new(RouterConfig::default().with_default_strategy(RoutingStrategy::RoundRobin));
        for _ in 0..3 {
            let decision = router.route(&snapshot, &Task::new("x", json!(null)), None).unwrap();
            assert_eq!(decision.pool_name, "up");
            assert_eq!(decision.candidates_considered, 1);
        }
    }

    #[test]
    fn test_no_eligible_pool() {
        let snapshot = HealthSnapshot::capture(vec![synthetic_pool("c", PoolStatus::Closed, 0, 1)]);
        let err = TaskRouter::default()
            .route(&snapshot, &Task::new("x", json!(null)), Some(RoutingStrategy::Random))
            .unwrap_err();
        assert_eq!(err.code(), "NO_ELIGIBLE_POOL");
        assert!(err.to_string().contains("1 registered"));
    }

    #[test]
    fn test_affinity_cache_is_exposed() {
        let snapshot = HealthSnapshot::capture(vec![
            synthetic_pool("a", PoolStatus::Healthy, 0, 1),
            synthetic_pool("b", PoolStatus::Healthy, 0, 1),
        ]);
        let router = TaskRouter::default();
        let task = Task::new("x", json!(null)).with_affinity_key("tenant-7");
        let decision = router
            .route(&snapshot, &task, Some(RoutingStrategy::Affinity))
            .unwrap();
        assert_eq!(router.affinity_of("tenant-7"), Some(decision.pool_id));
        assert!(router.forget_affinity("tenant-7"));
        assert_eq!(router.affinity_of("tenant-7"), None);
    }
}
