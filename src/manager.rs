//! Single entry point composing every component

use crate::backend::{BackendFactory, PoolBackend};
use crate::bus::{BusConfig, MessageBus, Subscription, Topic};
use crate::core::{
    CancellationReason, CancellationToken, OrchestratorError, PoolId, Result, Task, TaskResult,
};
use crate::distribution::{
    DistributionPlan, DistributionReport, DistributionStrategy, DistributorConfig,
    FunctionRegistry, TaskDistributor, TaskReducer, TaskSplitter,
};
use crate::health::{HealthMonitor, HealthSnapshot, MonitorConfig, PollReport, SystemHealth};
use crate::pool::{Pool, PoolConfig, PoolHealth, ScaleReport};
use crate::registry::{DiscoveryReport, DiscoverySource, PoolRegistry};
use crate::routing::{RouterConfig, RoutingDecision, RoutingStrategy, TaskRouter};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Rebalance configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalanceConfig {
    /// A pool is imbalanced when its utilization differs from the mean by more than this
    pub threshold: f64,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self { threshold: 0.25 }
    }
}

impl RebalanceConfig {
    /// Set the imbalance threshold
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        validate_threshold(self.threshold)
    }
}

fn validate_threshold(threshold: f64) -> Result<()> {
    if !threshold.is_finite() || threshold <= 0.0 || threshold > 1.0 {
        return Err(OrchestratorError::invalid_config(
            "threshold",
            format!("{} is not in (0, 1]", threshold),
        ));
    }
    Ok(())
}

/// Configuration for every component the manager owns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Message bus
    pub bus: BusConfig,
    /// Health monitor
    pub monitor: MonitorConfig,
    /// Router
    pub router: RouterConfig,
    /// Distributor
    pub distributor: DistributorConfig,
    /// Rebalance
    pub rebalance: RebalanceConfig,
}

impl ManagerConfig {
    /// Set the bus configuration
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_bus(mut self, bus: BusConfig) -> Self {
        self.bus = bus;
        self
    }

    /// Set the monitor configuration
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    /// Set the router configuration
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_router(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }

    /// Set the distributor configuration
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_distributor(mut self, distributor: DistributorConfig) -> Self {
        self.distributor = distributor;
        self
    }

    /// Set the rebalance configuration
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_rebalance(mut self, rebalance: RebalanceConfig) -> Self {
        self.rebalance = rebalance;
        self
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.bus.validate()?;
        self.monitor.validate()?;
        self.distributor.validate()?;
        self.rebalance.validate()
    }
}

/// Recommended resize for one pool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebalanceAction {
    /// Pool to resize
    pub pool_id: PoolId,
    /// Pool name
    pub name: String,
    /// Utilization when measured
    pub utilization: f64,
    /// Running tasks when measured
    pub active_tasks: usize,
    /// Live workers when measured
    pub current_workers: usize,
    /// Recommended worker count
    pub target_workers: usize,
    /// Result of the resize, when applied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scaled: Option<ScaleReport>,
    /// Why the resize failed, when applied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Rebalance recommendations across the eligible pools
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebalanceReport {
    /// Strategy the recommendations equalize for
    pub strategy: RoutingStrategy,
    /// Threshold used
    pub threshold: f64,
    /// Mean utilization over eligible pools
    pub mean_utilization: f64,
    /// Pools considered
    pub pools_considered: usize,
    /// Resizes recommended
    pub actions: Vec<RebalanceAction>,
    /// Whether the resizes were executed
    pub applied: bool,
}

struct Background {
    shutdown: CancellationToken,
    monitor: JoinHandle<()>,
}

/// Root of the orchestrator
///
/// Built once and shared; owns the bus, registry, health monitor, router,
/// distributor and the named split/reduce functions.
///
/// ```rust
/// use pool_orchestrator::prelude::*;
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let manager = PoolManager::new(ManagerConfig::default())?;
/// manager
///     .register(PoolConfig::new("p1", BackendType::Local).with_workers(1, 3))
///     .await?;
///
/// let result = manager.submit(Task::new("echo", json!({"n": 1})), None).await?;
/// assert_eq!(result.output, json!({"n": 1}));
/// manager.shutdown().await?;
/// # Ok::<(), OrchestratorError>(())
/// # }).unwrap();
/// ```
pub struct PoolManager {
    config: ManagerConfig,
    bus: Arc<MessageBus>,
    registry: Arc<PoolRegistry>,
    monitor: Arc<HealthMonitor>,
    router: Arc<TaskRouter>,
    distributor: TaskDistributor,
    functions: RwLock<FunctionRegistry>,
    background: Mutex<Option<Background>>,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("pools", &self.registry.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl PoolManager {
    /// Manager whose local and cluster workers echo their payload
    pub fn new(config: ManagerConfig) -> Result<Self> {
        Self::with_factory(config, BackendFactory::default())
    }

    /// Manager building backends with `factory`
    pub fn with_factory(config: ManagerConfig, factory: BackendFactory) -> Result<Self> {
        config.validate()?;
        let bus = Arc::new(MessageBus::new(config.bus.clone()));
        let registry = Arc::new(PoolRegistry::new(Arc::clone(&bus), factory));
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            config.monitor.clone(),
        ));
        let router = Arc::new(TaskRouter::new(config.router.clone()));
        let distributor = TaskDistributor::new(
            config.distributor.clone(),
            Arc::clone(&registry),
            Arc::clone(&router),
        );

        Ok(Self {
            config,
            bus,
            registry,
            monitor,
            router,
            distributor,
            functions: RwLock::new(FunctionRegistry::default()),
            background: Mutex::new(None),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Event bus
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Pool registry
    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    /// Health monitor
    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Router
    pub fn router(&self) -> &Arc<TaskRouter> {
        &self.router
    }

    /// Distributor
    pub fn distributor(&self) -> &TaskDistributor {
        &self.distributor
    }

    /// Start the background health monitor
    ///
    /// Must be called from within a tokio runtime. Calling it again while
    /// running does nothing.
    pub fn start(&self) -> Result<()> {
        let mut background = self.background.lock();
        if background.is_some() {
            return Ok(());
        }
        let shutdown = CancellationToken::new();
        let monitor = Arc::clone(&self.monitor).spawn(shutdown.clone());
        *background = Some(Background { shutdown, monitor });
        info!(pools = self.registry.len(), "Pool manager started");
        Ok(())
    }

    /// Whether the background monitor runs
    pub fn is_running(&self) -> bool {
        self.background.lock().is_some()
    }

    /// Stop the monitor and drain every pool
    ///
    /// Returns the first unregister failure after attempting every pool.
    pub async fn shutdown(&self) -> Result<()> {
        let background = self.background.lock().take();
        if let Some(background) = background {
            background
                .shutdown
                .cancel_with_reason(CancellationReason::Shutdown);
            if let Err(e) = background.monitor.await {
                warn!(error = %e, "Health monitor task ended abnormally");
            }
        }

        let pools = self.registry.list(None);
        let count = pools.len();
        let results = join_all(pools.iter().map(|pool| self.registry.unregister(pool.id()))).await;
        self.monitor.refresh();
        info!(pools = count, "Pool manager shut down");
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    /// Register a pool built by the manager's backend factory
    pub async fn register(&self, config: PoolConfig) -> Result<PoolId> {
        let id = self.registry.register(config).await?;
        self.monitor.refresh();
        Ok(id)
    }

    /// Register a pool over an already built backend
    pub async fn register_with_backend(
        &self,
        config: PoolConfig,
        backend: Arc<dyn PoolBackend>,
    ) -> Result<PoolId> {
        let id = self.registry.register_with_backend(config, backend).await?;
        self.monitor.refresh();
        Ok(id)
    }

    /// Drain and remove a pool; unknown ids are ignored
    pub async fn unregister(&self, pool_id: PoolId) -> Result<()> {
        let result = self.registry.unregister(pool_id).await;
        self.monitor.refresh();
        result
    }

    /// Look a pool up by id or name
    pub fn resolve(&self, id_or_name: &str) -> Result<Pool> {
        self.registry.resolve(id_or_name)
    }

    /// Pools in registration order, optionally only those tagged `tag`
    pub fn list(&self, tag: Option<&str>) -> Vec<Pool> {
        self.registry.list(tag)
    }

    /// Scan a discovery source
    pub async fn discover(
        &self,
        source: &dyn DiscoverySource,
        auto_register: bool,
    ) -> Result<DiscoveryReport> {
        let report = self.registry.discover(source, auto_register).await?;
        if !report.registered.is_empty() {
            self.monitor.refresh();
        }
        Ok(report)
    }

    /// Run `task` on one named pool, bypassing routing
    pub async fn execute(&self, pool_id: PoolId, task: Task) -> Result<TaskResult> {
        self.registry.get(pool_id)?.execute(task).await
    }

    /// Pick a pool for `task` without running it
    pub fn route(&self, task: &Task, strategy: Option<RoutingStrategy>) -> Result<RoutingDecision> {
        self.router
            .route(&self.monitor.fresh_snapshot(), task, strategy)
    }

    /// Route `task` and run it on the chosen pool
    pub async fn submit(&self, task: Task, strategy: Option<RoutingStrategy>) -> Result<TaskResult> {
        let decision = self.route(&task, strategy)?;
        self.registry.get(decision.pool_id)?.execute(task).await
    }

    /// Register a named split function
    pub fn register_splitter(&self, name: impl Into<String>, splitter: Arc<dyn TaskSplitter>) {
        self.functions.write().register_splitter(name, splitter);
    }

    /// Register a named reduce function
    pub fn register_reducer(&self, name: impl Into<String>, reducer: Arc<dyn TaskReducer>) {
        self.functions.write().register_reducer(name, reducer);
    }

    fn splitter(&self, reference: Option<&str>) -> Result<Option<Arc<dyn TaskSplitter>>> {
        reference
            .map(|name| self.functions.read().splitter(name))
            .transpose()
    }

    fn reducer(&self, reference: Option<&str>) -> Result<Option<Arc<dyn TaskReducer>>> {
        reference
            .map(|name| self.functions.read().reducer(name))
            .transpose()
    }

    /// Build the fan-out plan for `task` without running it
    pub fn plan(
        &self,
        task: &Task,
        strategy: DistributionStrategy,
        split_fn: Option<&str>,
    ) -> Result<DistributionPlan> {
        let splitter = self.splitter(split_fn)?;
        self.distributor.plan(
            &self.monitor.fresh_snapshot(),
            task,
            strategy,
            splitter.as_deref(),
        )
    }

    /// Fan `task` out, resolving split and reduce functions by name
    pub async fn distribute(
        &self,
        task: &Task,
        strategy: DistributionStrategy,
        split_fn: Option<&str>,
        reduce_fn: Option<&str>,
    ) -> Result<DistributionReport> {
        let splitter = self.splitter(split_fn)?;
        let reducer = self.reducer(reduce_fn)?;
        let snapshot = self.monitor.fresh_snapshot();
        self.distributor
            .distribute(
                &snapshot,
                task,
                strategy,
                splitter.as_deref(),
                reducer.as_deref(),
            )
            .await
    }

    /// Resize one pool
    pub async fn scale(&self, pool_id: PoolId, target: usize) -> Result<ScaleReport> {
        let report = self.registry.get(pool_id)?.scale(target).await?;
        self.monitor.refresh();
        Ok(report)
    }

    /// Current health of one pool
    pub fn pool_health(&self, pool_id: PoolId) -> Result<PoolHealth> {
        Ok(self.registry.get(pool_id)?.health())
    }

    /// Snapshot routers read, refreshed when stale
    pub fn snapshot(&self) -> Arc<HealthSnapshot> {
        self.monitor.fresh_snapshot()
    }

    /// Aggregated health across every pool
    pub fn health(&self) -> SystemHealth {
        self.monitor.refresh().system_health()
    }

    /// Poll every pool now instead of waiting for the monitor
    pub async fn check_health(&self) -> PollReport {
        self.monitor.poll_once().await
    }

    /// Subscribe to events; an empty slice means every topic
    pub fn subscribe(&self, topics: &[Topic]) -> Subscription {
        self.bus.subscribe(topics)
    }

    /// Recommend worker counts that move pools toward the mean utilization
    ///
    /// Only `least_loaded` is supported. A pool is imbalanced when its
    /// utilization differs from the mean by more than `threshold` (defaults
    /// to the configured one); its target is
    /// `ceil(active / (limit * max(mean, threshold)))` clamped to its worker
    /// bounds. With `apply` every recommendation is executed through
    /// `scale`; a failed resize is recorded on its action.
    pub async fn rebalance(
        &self,
        strategy: RoutingStrategy,
        threshold: Option<f64>,
        apply: bool,
    ) -> Result<RebalanceReport> {
        if strategy != RoutingStrategy::LeastLoaded {
            return Err(OrchestratorError::invalid_config(
                "strategy",
                format!("rebalance supports least_loaded, not {}", strategy),
            ));
        }
        let threshold = threshold.unwrap_or(self.config.rebalance.threshold);
        validate_threshold(threshold)?;

        let snapshot = self.monitor.refresh();
        let eligible = snapshot.eligible();
        let mean = if eligible.is_empty() {
            0.0
        } else {
            eligible.iter().map(|pool| pool.utilization).sum::<f64>() / eligible.len() as f64
        };
        let floor = mean.max(threshold);

        let mut actions = Vec::new();
        for health in &eligible {
            if (health.utilization - mean).abs() <= threshold {
                continue;
            }
            let Ok(pool) = self.registry.get(health.pool_id) else {
                continue;
            };
            let limit = pool.config().settings.per_worker_concurrency_limit.max(1);
            let wanted = (health.active_tasks as f64 / (limit as f64 * floor)).ceil() as usize;
            let target = wanted.clamp(health.min_workers, health.max_workers);
            let current = health.total_workers;
            if target == current {
                continue;
            }
            actions.push(RebalanceAction {
                pool_id: health.pool_id,
                name: health.name.clone(),
                utilization: health.utilization,
                active_tasks: health.active_tasks,
                current_workers: current,
                target_workers: target,
                scaled: None,
                error: None,
            });
        }

        if apply {
            for action in &mut actions {
                match self.scale(action.pool_id, action.target_workers).await {
                    Ok(report) => action.scaled = Some(report),
                    Err(e) => {
                        warn!(pool = %action.name, error = %e, "Rebalance resize failed");
                        action.error = Some(e.to_string());
                    }
                }
            }
        }

        info!(
            pools = eligible.len(),
            mean_utilization = mean,
            actions = actions.len(),
            applied = apply,
            "Rebalance computed"
        );
        Ok(RebalanceReport {
            strategy,
            threshold,
            mean_utilization: mean,
            pools_considered: eligible.len(),
            actions,
            applied: apply,
        })
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        // Pools are drained by `shutdown`; here only the monitor is stopped
        if let Some(background) = self.background.get_mut().take() {
            background
                .shutdown
                .cancel_with_reason(CancellationReason::Shutdown);
        }
    }
}
