//! Fan-out execution and aggregation

use super::functions::{TaskReducer, TaskSplitter};
use super::strategy::{AggregationMode, Assignment, DistributionPlan, DistributionStrategy};
use crate::core::duration_millis;
use crate::core::{
    CancellationReason, CancellationToken, OrchestratorError, Outcome, PartialFailureReport, PoolId,
    Result, TargetOutcome, Task, TaskResult,
};
use crate::health::HealthSnapshot;
use crate::pool::PoolHealth;
use crate::registry::PoolRegistry;
use crate::routing::TaskRouter;
use crate::tracing::metrics;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Distributor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributorConfig {
    /// Overall bound when the task has no deadline
    #[serde(with = "duration_millis")]
    pub default_timeout: Duration,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
        }
    }
}

impl DistributorConfig {
    /// Set the overall bound used when a task has no deadline
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.default_timeout.is_zero() {
            return Err(OrchestratorError::invalid_config(
                "default_timeout",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Outcome of a successful fan-out
#[derive(Debug, Clone, Serialize)]
pub struct DistributionReport {
    /// Task that was distributed
    pub task_id: String,
    /// Strategy used
    pub strategy: DistributionStrategy,
    /// Aggregation mode applied
    pub mode: AggregationMode,
    /// Every target outcome, in plan order
    pub outcomes: Vec<TargetOutcome>,
    /// Folded output, for `reduce`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduced: Option<Value>,
    /// Wall time of the whole fan-out
    pub elapsed_ms: u64,
}

impl DistributionReport {
    /// Results of the targets that succeeded, in plan order
    pub fn results(&self) -> Vec<&TaskResult> {
        self.outcomes
            .iter()
            .filter_map(|target| match &target.outcome {
                Outcome::Succeeded { result } => Some(result),
                _ => None,
            })
            .collect()
    }
}

/// Fans tasks out over the pools of a registry
///
/// Plans are built from a health snapshot; execution looks each target pool
/// up again so a pool that left the registry fails its own target only.
/// Subtasks are never retried.
pub struct TaskDistributor {
    config: DistributorConfig,
    registry: Arc<PoolRegistry>,
    router: Arc<TaskRouter>,
}

impl std::fmt::Debug for TaskDistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDistributor")
            .field("config", &self.config)
            .field("pools", &self.registry.len())
            .finish()
    }
}

impl TaskDistributor {
    /// Create a distributor; chunk assignment shares `router`'s cursor
    pub fn new(config: DistributorConfig, registry: Arc<PoolRegistry>, router: Arc<TaskRouter>) -> Self {
        Self {
            config,
            registry,
            router,
        }
    }

    /// Active configuration
    pub fn config(&self) -> &DistributorConfig {
        &self.config
    }

    /// Build the plan for `task` without running it
    ///
    /// Broadcast and hedged copies keep the task id; split chunks are
    /// `"{task_id}#{index}"`. Map-reduce requires a splitter; the chunked
    /// strategies treat the whole task as one chunk without one.
    pub fn plan(
        &self,
        snapshot: &HealthSnapshot,
        task: &Task,
        strategy: DistributionStrategy,
        splitter: Option<&dyn TaskSplitter>,
    ) -> Result<DistributionPlan> {
        let eligible = snapshot.eligible();
        if eligible.is_empty() {
            return Err(OrchestratorError::no_eligible_pool(snapshot.pools.len()));
        }

        let assign = |index: usize, pool: &PoolHealth, task: Task| Assignment {
            index,
            pool_id: pool.pool_id,
            pool_name: pool.name.clone(),
            task,
        };

        let assignments: Vec<Assignment> = match strategy {
            DistributionStrategy::Broadcast | DistributionStrategy::Hedged => eligible
                .iter()
                .enumerate()
                .map(|(index, pool)| assign(index, *pool, task.clone()))
                .collect(),
            DistributionStrategy::MapReduce => {
                let splitter = splitter.ok_or_else(|| {
                    OrchestratorError::invalid_config("split_fn", "map_reduce needs a split function")
                })?;
                splitter
                    .split(task)?
                    .into_iter()
                    .enumerate()
                    .map(|(index, payload)| {
                        let pool = eligible[index % eligible.len()];
                        assign(index, pool, task.subtask(index, payload))
                    })
                    .collect()
            }
            DistributionStrategy::RoundRobin
            | DistributionStrategy::Random
            | DistributionStrategy::LeastLoaded => {
                let chunks: Vec<Task> = match splitter {
                    Some(splitter) => splitter
                        .split(task)?
                        .into_iter()
                        .enumerate()
                        .map(|(index, payload)| task.subtask(index, payload))
                        .collect(),
                    None => vec![task.clone()],
                };
                let rule = strategy.routing_rule().unwrap_or_default();
                let mut planned: HashMap<PoolId, usize> = HashMap::new();
                let mut assignments = Vec::with_capacity(chunks.len());
                for (index, chunk) in chunks.into_iter().enumerate() {
                    let selection = self
                        .router
                        .select(rule, &eligible, &chunk, &planned)
                        .ok_or_else(|| OrchestratorError::no_eligible_pool(snapshot.pools.len()))?;
                    let pool = eligible[selection.index];
                    *planned.entry(pool.pool_id).or_insert(0) += 1;
                    assignments.push(assign(index, pool, chunk));
                }
                assignments
            }
        };

        Ok(DistributionPlan {
            task_id: task.task_id().to_string(),
            strategy,
            mode: strategy.default_mode(),
            assignments,
        })
    }

    /// Run a plan and aggregate per its mode
    ///
    /// The overall bound is the task deadline, or `default_timeout`. Targets
    /// still running when it elapses are cancelled and reported `TimedOut`
    /// inside `PartialFailure`. Under `reduce` the first failure cancels the
    /// remaining subtasks; under `first_success` the first success does.
    pub async fn execute_plan(
        &self,
        plan: DistributionPlan,
        reducer: Option<&dyn TaskReducer>,
    ) -> Result<DistributionReport> {
        if plan.mode == AggregationMode::Reduce && reducer.is_none() {
            return Err(OrchestratorError::invalid_config(
                "reduce_fn",
                format!("{} needs a reduce function", plan.strategy),
            ));
        }

        let limit = match plan.assignments.first().and_then(|a| a.task.remaining()) {
            Some(remaining) if remaining.is_zero() => {
                return Err(OrchestratorError::timeout(
                    format!("task {} deadline", plan.task_id),
                    Duration::ZERO,
                ));
            }
            Some(remaining) => remaining,
            None => self.config.default_timeout,
        };

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + limit;
        let parent = CancellationToken::new();
        let mut outcomes: Vec<Option<Outcome>> = vec![None; plan.assignments.len()];
        let mut running = FuturesUnordered::new();

        for (position, assignment) in plan.assignments.iter().enumerate() {
            match self.registry.get(assignment.pool_id) {
                Ok(pool) => {
                    let token = parent.child();
                    let task = assignment.task.clone();
                    running.push(async move { (position, pool.execute_with_token(task, token).await) });
                }
                Err(e) => {
                    warn!(
                        task_id = %assignment.task.task_id(),
                        pool = %assignment.pool_name,
                        "target pool left the registry before dispatch"
                    );
                    outcomes[position] = Some(Outcome::from_error(&e));
                    if plan.mode == AggregationMode::Reduce && !parent.is_cancelled() {
                        parent.cancel_with_reason(CancellationReason::SiblingFailed(
                            assignment.task.task_id().to_string(),
                        ));
                    }
                }
            }
        }

        let mut timed_out = false;
        while !running.is_empty() {
            match tokio::time::timeout_at(deadline, running.next()).await {
                Ok(Some((position, result))) => {
                    let outcome = classify(result, &parent);
                    let task_id = plan.assignments[position].task.task_id();
                    match plan.mode {
                        AggregationMode::FirstSuccess if outcome.is_success() => {
                            if !parent.is_cancelled() {
                                debug!(task_id, "hedged target won; cancelling the rest");
                                parent.cancel_with_reason(CancellationReason::Manual);
                            }
                        }
                        AggregationMode::Reduce if !outcome.is_success() => {
                            if !parent.is_cancelled() {
                                debug!(task_id, "subtask failed; cancelling siblings");
                                parent.cancel_with_reason(CancellationReason::SiblingFailed(
                                    task_id.to_string(),
                                ));
                            }
                        }
                        _ => {}
                    }
                    outcomes[position] = Some(outcome);
                }
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    parent.cancel_with_reason(CancellationReason::Timeout(limit));
                    break;
                }
            }
        }

        if timed_out {
            warn!(
                task_id = %plan.task_id,
                strategy = %plan.strategy,
                pending = running.len(),
                ?limit,
                "distribution timed out"
            );
            // Cancelled dispatches return promptly; draining lets each pool
            // run its own cleanup for the abandoned worker.
            while let Some((position, result)) = running.next().await {
                outcomes[position] = Some(match result {
                    Ok(result) => Outcome::Succeeded { result },
                    Err(_) => Outcome::TimedOut,
                });
            }
        }

        let outcomes: Vec<TargetOutcome> = plan
            .assignments
            .iter()
            .zip(outcomes)
            .map(|(assignment, outcome)| TargetOutcome {
                index: assignment.index,
                pool_id: assignment.pool_id,
                pool_name: assignment.pool_name.clone(),
                task_id: assignment.task.task_id().to_string(),
                outcome: outcome.unwrap_or(Outcome::TimedOut),
            })
            .collect();

        self.aggregate(plan, outcomes, reducer, started.elapsed())
    }

    fn aggregate(
        &self,
        plan: DistributionPlan,
        outcomes: Vec<TargetOutcome>,
        reducer: Option<&dyn TaskReducer>,
        elapsed: Duration,
    ) -> Result<DistributionReport> {
        let (succeeded, unsuccessful): (Vec<&TargetOutcome>, Vec<&TargetOutcome>) =
            outcomes.iter().partition(|target| target.outcome.is_success());
        let completed: Vec<usize> = succeeded.iter().map(|target| target.index).collect();
        let failed: Vec<usize> = unsuccessful.iter().map(|target| target.index).collect();
        metrics::record_distribution(plan.strategy.as_str(), outcomes.len(), failed.len(), elapsed);

        let succeeded = match plan.mode {
            AggregationMode::FirstSuccess => !completed.is_empty() || outcomes.is_empty(),
            AggregationMode::All | AggregationMode::Reduce => failed.is_empty(),
        };
        if !succeeded {
            warn!(
                task_id = %plan.task_id,
                strategy = %plan.strategy,
                completed = completed.len(),
                failed = failed.len(),
                "distribution partially failed"
            );
            return Err(OrchestratorError::partial_failure(PartialFailureReport {
                operation: plan.strategy.as_str().to_string(),
                completed,
                failed,
                outcomes,
            }));
        }

        let reduced = match (plan.mode, reducer) {
            (AggregationMode::Reduce, Some(reducer)) => {
                let outputs = outcomes
                    .iter()
                    .filter_map(|target| match &target.outcome {
                        Outcome::Succeeded { result } => Some(result.output.clone()),
                        _ => None,
                    })
                    .collect();
                Some(reducer.reduce(outputs)?)
            }
            _ => None,
        };

        info!(
            task_id = %plan.task_id,
            strategy = %plan.strategy,
            targets = outcomes.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "distribution completed"
        );
        Ok(DistributionReport {
            task_id: plan.task_id,
            strategy: plan.strategy,
            mode: plan.mode,
            outcomes,
            reduced,
            elapsed_ms: elapsed.as_millis() as u64,
        })
    }

    /// Plan and run `task` in one call
    pub async fn distribute(
        &self,
        snapshot: &HealthSnapshot,
        task: &Task,
        strategy: DistributionStrategy,
        splitter: Option<&dyn TaskSplitter>,
        reducer: Option<&dyn TaskReducer>,
    ) -> Result<DistributionReport> {
        if task.is_expired() {
            return Err(OrchestratorError::timeout(
                format!("task {} deadline", task.task_id()),
                Duration::ZERO,
            ));
        }
        let plan = self.plan(snapshot, task, strategy, splitter)?;
        debug!(
            task_id = task.task_id(),
            strategy = %strategy,
            targets = plan.len(),
            pools = plan.pools().len(),
            "distribution planned"
        );
        self.execute_plan(plan, reducer).await
    }

    /// Identical copy to every eligible pool; every copy must succeed
    pub async fn broadcast(&self, snapshot: &HealthSnapshot, task: &Task) -> Result<DistributionReport> {
        self.distribute(snapshot, task, DistributionStrategy::Broadcast, None, None)
            .await
    }

    /// Split, run round-robin, reduce in split order
    pub async fn map_reduce(
        &self,
        snapshot: &HealthSnapshot,
        task: &Task,
        splitter: &dyn TaskSplitter,
        reducer: &dyn TaskReducer,
    ) -> Result<DistributionReport> {
        self.distribute(
            snapshot,
            task,
            DistributionStrategy::MapReduce,
            Some(splitter),
            Some(reducer),
        )
        .await
    }
}

/// Outcome of one finished target; cancellations caused by the fan-out itself
/// are reported as `Cancelled` rather than as failures of their own
fn classify(result: Result<TaskResult>, parent: &CancellationToken) -> Outcome {
    match result {
        Ok(result) => Outcome::Succeeded { result },
        Err(OrchestratorError::Cancelled { .. }) if parent.is_cancelled() => Outcome::Cancelled,
        Err(e) => Outcome::from_error(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendFactory, BackendType, FnExecutor, TaskExecutor};
    use crate::bus::MessageBus;
    use crate::distribution::functions::{CollectReducer, ItemsSplitter, SumReducer};
    use crate::pool::{Pool, PoolConfig};
    use futures::FutureExt;
    use serde_json::json;

    /// Items finish in reverse order: larger `n` sleeps less
    fn reversed_executor() -> Arc<dyn TaskExecutor> {
        Arc::new(FnExecutor::new(|_worker, task| {
            async move {
                let payload = task.payload();
                if payload.get("fail").and_then(Value::as_bool) == Some(true) {
                    return Err(OrchestratorError::task_failed(task.task_id(), "asked to fail"));
                }
                if let Some(ms) = payload.get("sleep_ms").and_then(Value::as_u64) {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                match payload.as_i64() {
                    Some(n) => {
                        tokio::time::sleep(Duration::from_millis((10 - n.min(10)) as u64 * 5)).await;
                        if n < 0 {
                            return Err(OrchestratorError::task_failed(task.task_id(), "negative"));
                        }
                        Ok(json!(n * 10))
                    }
                    None => Ok(payload.clone()),
                }
            }
            .boxed()
        }))
    }

    fn failing_remote() -> Arc<dyn TaskExecutor> {
        Arc::new(FnExecutor::new(|_worker, task| {
            async move { Err::<Value, _>(OrchestratorError::task_failed(task.task_id(), "remote rejected")) }
                .boxed()
        }))
    }

    async fn setup(pools: &[(&str, usize)]) -> (Arc<PoolRegistry>, TaskDistributor) {
        let factory = BackendFactory::new(reversed_executor()).with_endpoint("bad", failing_remote());
        let registry = Arc::new(PoolRegistry::new(Arc::new(MessageBus::default()), factory));
        for (name, max) in pools {
            let mut config = PoolConfig::new(*name, BackendType::Local).with_workers(1, *max);
            if name.starts_with("remote") {
                config = PoolConfig::new(*name, BackendType::Delegated)
                    .with_workers(1, *max)
                    .with_option("endpoint", "bad");
            }
            registry.register(config).await.unwrap();
        }
        let distributor = TaskDistributor::new(
            DistributorConfig::default(),
            Arc::clone(&registry),
            Arc::new(TaskRouter::default()),
        );
        (registry, distributor)
    }

    fn snapshot(registry: &PoolRegistry) -> HealthSnapshot {
        HealthSnapshot::capture(registry.list(None).iter().map(Pool::health).collect())
    }

    #[tokio::test]
    async fn test_broadcast_all_succeed() {
        let (registry, distributor) = setup(&[("p1", 2), ("p2", 2), ("p3", 2)]).await;
        let task = Task::with_id("b1", "echo", json!({"hello": "world"}));
        let report = distributor.broadcast(&snapshot(&registry), &task).await.unwrap();

        assert_eq!(report.mode, AggregationMode::All);
        assert_eq!(report.outcomes.len(), 3);
        let names: Vec<&str> = report.outcomes.iter().map(|o| o.pool_name.as_str()).collect();
        assert_eq!(names, vec!["p1", "p2", "p3"]);
        assert!(report.outcomes.iter().all(|o| o.task_id == "b1"));
        assert_eq!(report.results().len(), 3);
    }

    #[tokio::test]
    async fn test_broadcast_partial_failure() {
        let (registry, distributor) = setup(&[("p1", 1), ("remote-p2", 1)]).await;
        let task = Task::with_id("b2", "echo", json!({}));
        let err = distributor.broadcast(&snapshot(&registry), &task).await.unwrap_err();

        assert_eq!(err.code(), "PARTIAL_FAILURE");
        let report = err.partial_report().unwrap();
        assert_eq!(report.operation, "broadcast");
        assert_eq!(report.completed, vec![0]);
        assert_eq!(report.failed, vec![1]);
        assert!(report.outcomes[0].outcome.is_success());
        assert!(matches!(
            &report.outcomes[1].outcome,
            Outcome::Failed { code, .. } if code == "TASK_FAILED"
        ));
    }

    #[tokio::test]
    async fn test_map_reduce_keeps_split_order() {
        let (registry, distributor) = setup(&[("p1", 2), ("p2", 2)]).await;
        let task = Task::with_id("mr", "double", json!({"items": [1, 2, 3, 4]}));
        let plan = distributor
            .plan(&snapshot(&registry), &task, DistributionStrategy::MapReduce, Some(&ItemsSplitter))
            .unwrap();
        let pools: Vec<&str> = plan.assignments.iter().map(|a| a.pool_name.as_str()).collect();
        assert_eq!(pools, vec!["p1", "p2", "p1", "p2"]);
        assert_eq!(plan.assignments[3].task.task_id(), "mr#3");

        let report = distributor.execute_plan(plan, Some(&CollectReducer)).await.unwrap();
        assert_eq!(report.reduced, Some(json!([10, 20, 30, 40])));

        let summed = distributor
            .map_reduce(&snapshot(&registry), &task, &ItemsSplitter, &SumReducer)
            .await
            .unwrap();
        assert_eq!(summed.reduced, Some(json!(100)));
    }

    #[tokio::test]
    async fn test_map_reduce_failure_short_circuits() {
        let (registry, distributor) = setup(&[("p1", 1), ("p2", 1)]).await;
        // -1 fails quickly-ish; item 0 sleeps long enough to be cancelled
        let task = Task::with_id("mr", "double", json!({"items": [{"sleep_ms": 2000}, -1]}));
        let err = distributor
            .map_reduce(&snapshot(&registry), &task, &ItemsSplitter, &CollectReducer)
            .await
            .unwrap_err();

        let report = err.partial_report().unwrap();
        assert_eq!(report.operation, "map_reduce");
        assert!(report.completed.is_empty());
        assert_eq!(report.failed, vec![0, 1]);
        assert!(matches!(report.outcomes[0].outcome, Outcome::Cancelled));
        assert!(matches!(report.outcomes[1].outcome, Outcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_map_reduce_requires_functions() {
        let (registry, distributor) = setup(&[("p1", 1)]).await;
        let task = Task::with_id("mr", "x", json!({"items": [1]}));
        let err = distributor
            .distribute(&snapshot(&registry), &task, DistributionStrategy::MapReduce, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");

        let err = distributor
            .distribute(
                &snapshot(&registry),
                &task,
                DistributionStrategy::MapReduce,
                Some(&ItemsSplitter),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");
    }

    #[tokio::test]
    async fn test_least_loaded_chunks_spread() {
        let (registry, distributor) = setup(&[("p1", 2), ("p2", 2)]).await;
        let task = Task::with_id("ll", "x", json!({"items": [1, 2, 3, 4]}));
        let plan = distributor
            .plan(&snapshot(&registry), &task, DistributionStrategy::LeastLoaded, Some(&ItemsSplitter))
            .unwrap();
        let pools: Vec<&str> = plan.assignments.iter().map(|a| a.pool_name.as_str()).collect();
        assert_eq!(pools, vec!["p1", "p2", "p1", "p2"]);

        let single = distributor
            .plan(&snapshot(&registry), &task, DistributionStrategy::RoundRobin, None)
            .unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single.assignments[0].task.task_id(), "ll");
    }

    #[tokio::test]
    async fn test_hedged_first_success_wins() {
        let (registry, distributor) = setup(&[("p1", 1), ("remote-p2", 1)]).await;
        let task = Task::with_id("h", "x", json!({"ok": true}));
        let report = distributor
            .distribute(&snapshot(&registry), &task, DistributionStrategy::Hedged, None, None)
            .await
            .unwrap();
        assert_eq!(report.mode, AggregationMode::FirstSuccess);
        assert_eq!(report.results().len(), 1);
        assert_eq!(report.results()[0].output, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_overall_timeout_marks_unfinished_targets() {
        let (registry, _) = setup(&[("p1", 1), ("p2", 1)]).await;
        let distributor = TaskDistributor::new(
            DistributorConfig::default().with_default_timeout(Duration::from_millis(100)),
            Arc::clone(&registry),
            Arc::new(TaskRouter::default()),
        );
        let task = Task::with_id("slow", "x", json!({"items": [5, {"sleep_ms": 5000}]}));
        let err = distributor
            .distribute(
                &snapshot(&registry),
                &task,
                DistributionStrategy::RoundRobin,
                Some(&ItemsSplitter),
                None,
            )
            .await
            .unwrap_err();

        let report = err.partial_report().unwrap();
        assert_eq!(report.completed, vec![0]);
        assert_eq!(report.failed, vec![1]);
        assert!(matches!(report.outcomes[1].outcome, Outcome::TimedOut));
    }

    #[tokio::test]
    async fn test_no_eligible_pool_and_expired_task() {
        let (registry, distributor) = setup(&[]).await;
        let task = Task::with_id("t", "x", json!({}));
        let err = distributor.broadcast(&snapshot(&registry), &task).await.unwrap_err();
        assert_eq!(err.code(), "NO_ELIGIBLE_POOL");

        let (registry, distributor) = setup(&[("p1", 1)]).await;
        let expired = task.with_deadline(chrono::Utc::now() - chrono::Duration::seconds(1));
        let err = distributor.broadcast(&snapshot(&registry), &expired).await.unwrap_err();
        assert_eq!(err.code(), "TIMEOUT");
    }

    #[tokio::test]
    async fn test_trimmed_plan_keeps_assignment_indices() {
        let (registry, distributor) = setup(&[("p1", 2), ("p2", 2)]).await;
        let task = Task::with_id("trim", "double", json!({"items": [1, 2, 3]}));
        let mut plan = distributor
            .plan(&snapshot(&registry), &task, DistributionStrategy::MapReduce, Some(&ItemsSplitter))
            .unwrap();
        plan.assignments.remove(0);

        let report = distributor.execute_plan(plan, Some(&CollectReducer)).await.unwrap();
        let indices: Vec<usize> = report.outcomes.iter().map(|o| o.index).collect();
        assert_eq!(indices, vec![1, 2]);
        assert_eq!(report.reduced, Some(json!([20, 30])));

        let failing = Task::with_id("trim", "double", json!({"items": [1, -1, 3]}));
        let mut plan = distributor
            .plan(&snapshot(&registry), &failing, DistributionStrategy::MapReduce, Some(&ItemsSplitter))
            .unwrap();
        plan.assignments.remove(0);
        let err = distributor.execute_plan(plan, Some(&CollectReducer)).await.unwrap_err();
        let report = err.partial_report().unwrap();
        assert_eq!(report.outcomes.len(), 2);
        assert!(report.failed.contains(&1));
        assert!(report.completed.iter().chain(&report.failed).all(|i| [1, 2].contains(i)));
    }

    #[tokio::test]
    async fn test_pool_removed_after_planning() {
        let (registry, distributor) = setup(&[("p1", 1), ("p2", 1)]).await;
        let task = Task::with_id("gone", "x", json!({}));
        let plan = distributor
            .plan(&snapshot(&registry), &task, DistributionStrategy::Broadcast, None)
            .unwrap();
        let p2 = registry.get_by_name("p2").unwrap().id();
        registry.unregister(p2).await.unwrap();

        let err = distributor.execute_plan(plan, None).await.unwrap_err();
        let report = err.partial_report().unwrap();
        assert_eq!(report.completed, vec![0]);
        assert!(matches!(
            &report.outcomes[1].outcome,
            Outcome::Failed { code, .. } if code == "POOL_NOT_FOUND"
        ));
    }
}
