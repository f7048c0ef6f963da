//! Periodic pool polling

use super::snapshot::HealthSnapshot;
use crate::core::{CancellationToken, OrchestratorError, PoolId, Result};
use crate::pool::PoolStatus;
use crate::registry::PoolRegistry;
use crate::tracing::metrics;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Health monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Base polling interval
    #[serde(with = "crate::core::duration_millis")]
    pub interval: Duration,
    /// Interval jitter as a fraction (0.2 is ±20%)
    pub jitter: f64,
    /// Bound on one pool's `check_health`
    #[serde(with = "crate::core::duration_millis")]
    pub poll_timeout: Duration,
    /// Consecutive missed polls before a pool is degraded
    pub missed_poll_threshold: u32,
    /// Time a degraded pool may keep missing polls before it is closed
    #[serde(with = "crate::core::duration_millis")]
    pub degraded_grace: Duration,
    /// Age after which routers refresh the snapshot from pool state
    #[serde(with = "crate::core::duration_millis")]
    pub max_staleness: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            jitter: 0.2,
            poll_timeout: Duration::from_secs(5),
            missed_poll_threshold: 3,
            degraded_grace: Duration::from_secs(30),
            max_staleness: Duration::from_secs(2),
        }
    }
}

impl MonitorConfig {
    /// Set the polling interval
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the jitter fraction
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the per-pool poll timeout
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set missed polls tolerated before degrading
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_missed_poll_threshold(mut self, threshold: u32) -> Self {
        self.missed_poll_threshold = threshold;
        self
    }

    /// Set how long a degraded pool may stay unreachable
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_degraded_grace(mut self, grace: Duration) -> Self {
        self.degraded_grace = grace;
        self
    }

    /// Set the snapshot staleness bound
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_max_staleness(mut self, staleness: Duration) -> Self {
        self.max_staleness = staleness;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(OrchestratorError::invalid_config("interval", "must be non-zero"));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(OrchestratorError::invalid_config(
                "jitter",
                format!("{} outside [0, 1)", self.jitter),
            ));
        }
        if self.poll_timeout.is_zero() {
            return Err(OrchestratorError::invalid_config("poll_timeout", "must be non-zero"));
        }
        if self.missed_poll_threshold == 0 {
            return Err(OrchestratorError::invalid_config(
                "missed_poll_threshold",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// A pool status change made by the monitor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusChange {
    /// Pool
    pub pool_id: PoolId,
    /// Pool name
    pub name: String,
    /// Old status
    pub from: PoolStatus,
    /// New status
    pub to: PoolStatus,
}

/// What one polling round did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PollReport {
    /// Pools polled
    pub polled: usize,
    /// Polls that failed or timed out
    pub missed: usize,
    /// Status changes applied
    pub transitions: Vec<StatusChange>,
}

#[derive(Debug, Default)]
struct PollTracking {
    missed: u32,
    degraded_since: Option<Instant>,
}

/// Samples every pool and maintains the shared snapshot
pub struct HealthMonitor {
    config: MonitorConfig,
    registry: Arc<PoolRegistry>,
    snapshot: RwLock<Arc<HealthSnapshot>>,
    tracking: Mutex<HashMap<PoolId, PollTracking>>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("snapshot_age", &self.snapshot.read().age())
            .finish()
    }
}

impl HealthMonitor {
    /// Create a monitor over `registry`
    pub fn new(registry: Arc<PoolRegistry>, config: MonitorConfig) -> Self {
        Self {
            config,
            registry,
            snapshot: RwLock::new(Arc::new(HealthSnapshot::empty())),
            tracking: Mutex::new(HashMap::new()),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<HealthSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Rebuild the snapshot from in-memory pool state and publish it
    pub fn refresh(&self) -> Arc<HealthSnapshot> {
        let pools = self
            .registry
            .list(None)
            .iter()
            .map(|pool| pool.health())
            .collect();
        let snapshot = Arc::new(HealthSnapshot::capture(pools));
        *self.snapshot.write() = Arc::clone(&snapshot);
        snapshot
    }

    /// Latest snapshot, refreshed first when older than `max_staleness`
    pub fn fresh_snapshot(&self) -> Arc<HealthSnapshot> {
        let current = self.snapshot();
        if current.age() > self.config.max_staleness {
            self.refresh()
        } else {
            current
        }
    }

    /// Poll every open pool once
    ///
    /// Pools missing `missed_poll_threshold` polls in a row become degraded;
    /// degraded pools that keep missing past `degraded_grace` are closed.
    /// A degraded pool that answers again is healthy.
    pub async fn poll_once(&self) -> PollReport {
        let started = Instant::now();
        let pools: Vec<_> = self
            .registry
            .list(None)
            .into_iter()
            .filter(|pool| matches!(pool.status(), PoolStatus::Healthy | PoolStatus::Degraded))
            .collect();

        let checks = pools
            .iter()
            .map(|pool| tokio::time::timeout(self.config.poll_timeout, pool.check_health()));
        let results = join_all(checks).await;

        let mut report = PollReport {
            polled: pools.len(),
            ..PollReport::default()
        };
        let mut pending = Vec::new();
        {
            let mut tracking = self.tracking.lock();
            tracking.retain(|id, _| pools.iter().any(|pool| pool.id() == *id));

            for (pool, result) in pools.iter().zip(results) {
                let entry = tracking.entry(pool.id()).or_default();
                let failure = match result {
                    Ok(Ok(_)) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => Some(format!("poll timed out after {:?}", self.config.poll_timeout)),
                };

                match failure {
                    None => {
                        entry.missed = 0;
                        entry.degraded_since = None;
                        if pool.status() == PoolStatus::Degraded {
                            pending.push((pool.clone(), PoolStatus::Healthy));
                        }
                    }
                    Some(reason) => {
                        report.missed += 1;
                        entry.missed += 1;
                        warn!(pool = %pool.name(), missed = entry.missed, reason = %reason, "Health poll missed");
                        if entry.missed < self.config.missed_poll_threshold {
                            continue;
                        }
                        match (pool.status(), entry.degraded_since) {
                            (PoolStatus::Healthy, _) => {
                                entry.degraded_since = Some(Instant::now());
                                pending.push((pool.clone(), PoolStatus::Degraded));
                            }
                            (PoolStatus::Degraded, Some(since))
                                if since.elapsed() >= self.config.degraded_grace =>
                            {
                                pending.push((pool.clone(), PoolStatus::Closed));
                            }
                            (PoolStatus::Degraded, None) => {
                                entry.degraded_since = Some(Instant::now());
                            }
                            _ => {}
                        }
                    }
                }
            }
        }

        for (pool, target) in pending {
            let previous = match target {
                PoolStatus::Closed => pool.mark_backend_lost(),
                PoolStatus::Degraded => pool.transition_status(target, "missed health polls"),
                _ => pool.transition_status(target, "health polls recovered"),
            };
            if let Some(from) = previous {
                report.transitions.push(StatusChange {
                    pool_id: pool.id(),
                    name: pool.name().to_string(),
                    from,
                    to: target,
                });
            }
        }

        self.refresh();
        metrics::record_poll(report.polled, report.missed, started.elapsed());
        debug!(polled = report.polled, missed = report.missed, "health poll finished");
        report
    }

    /// Delay before the next poll, jittered around `interval`
    pub fn next_delay(&self) -> Duration {
        let spread = self.config.jitter * (fastrand::f64() * 2.0 - 1.0);
        self.config.interval.mul_f64((1.0 + spread).max(0.0))
    }

    /// Poll in the background until `shutdown` fires
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval = ?self.config.interval, "Health monitor started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.next_delay()) => {}
                }
                self.poll_once().await;
            }
            info!("Health monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendFactory, BackendOptions, BackendType, PoolBackend};
    use crate::bus::{MessageBus, Topic};
    use crate::core::Task;
    use crate::pool::{PoolConfig, WorkerHandle};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct FlakyBackend {
        down: AtomicBool,
    }

    #[async_trait]
    impl PoolBackend for FlakyBackend {
        fn backend_type(&self) -> BackendType {
            BackendType::Delegated
        }

        async fn spawn_worker(&self, pool_id: PoolId, _options: &BackendOptions) -> Result<WorkerHandle> {
            Ok(WorkerHandle::new(pool_id))
        }

        async fn terminate_worker(&self, _worker: &WorkerHandle) -> Result<()> {
            Ok(())
        }

        async fn dispatch(&self, _worker: &WorkerHandle, task: &Task) -> Result<Value> {
            Ok(task.payload().clone())
        }

        async fn probe_health(&self, _worker: &WorkerHandle) -> Result<bool> {
            if self.down.load(Ordering::SeqCst) {
                Err(OrchestratorError::backend_unavailable("flaky", "connection refused"))
            } else {
                Ok(true)
            }
        }
    }

    async fn setup(config: MonitorConfig) -> (Arc<HealthMonitor>, Arc<PoolRegistry>, Arc<FlakyBackend>, PoolId) {
        let registry = Arc::new(PoolRegistry::new(
            Arc::new(MessageBus::default()),
            BackendFactory::default(),
        ));
        let backend = Arc::new(FlakyBackend::default());
        let id = registry
            .register_with_backend(
                PoolConfig::new("flaky", BackendType::Delegated),
                backend.clone(),
            )
            .await
            .unwrap();
        let monitor = Arc::new(HealthMonitor::new(Arc::clone(&registry), config));
        (monitor, registry, backend, id)
    }

    #[tokio::test]
    async fn test_healthy_poll_updates_snapshot() {
        let (monitor, _registry, _backend, id) = setup(MonitorConfig::default()).await;
        assert!(monitor.snapshot().pools.is_empty());

        let report = monitor.poll_once().await;
        assert_eq!((report.polled, report.missed), (1, 0));
        let snapshot = monitor.snapshot();
        let pool = snapshot.get(id).unwrap();
        assert_eq!(pool.status, PoolStatus::Healthy);
        assert!(pool.last_health_check.is_some());
    }

    #[tokio::test]
    async fn test_missed_polls_degrade_then_recover() {
        let config = MonitorConfig::default().with_missed_poll_threshold(2);
        let (monitor, registry, backend, id) = setup(config).await;
        let mut events = registry.bus().subscribe(&[Topic::PoolHealthChanged]);

        backend.down.store(true, Ordering::SeqCst);
        assert!(monitor.poll_once().await.transitions.is_empty());
        let report = monitor.poll_once().await;
        assert_eq!(report.transitions.len(), 1);
        assert_eq!(report.transitions[0].to, PoolStatus::Degraded);
        assert!(monitor.snapshot().eligible().is_empty());

        let event = events.recv().await.unwrap();
        assert_eq!(event.pool_id, Some(id));
        assert_eq!(event.payload["to"], "degraded");

        backend.down.store(false, Ordering::SeqCst);
        let report = monitor.poll_once().await;
        assert_eq!(report.transitions[0].to, PoolStatus::Healthy);
        assert_eq!(monitor.snapshot().eligible().len(), 1);
    }

    #[tokio::test]
    async fn test_degraded_pool_closes_after_grace() {
        let config = MonitorConfig::default()
            .with_missed_poll_threshold(1)
            .with_degraded_grace(Duration::ZERO);
        let (monitor, registry, backend, id) = setup(config).await;

        backend.down.store(true, Ordering::SeqCst);
        monitor.poll_once().await;
        let report = monitor.poll_once().await;
        assert_eq!(report.transitions[0].to, PoolStatus::Closed);

        let pool = registry.get(id).unwrap();
        let err = pool.execute(Task::new("x", Value::Null)).await.unwrap_err();
        assert_eq!(err.code(), "BACKEND_UNAVAILABLE");

        // Closed pools are no longer polled
        assert_eq!(monitor.poll_once().await.polled, 0);
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let registry = Arc::new(PoolRegistry::new(
            Arc::new(MessageBus::default()),
            BackendFactory::default(),
        ));
        let monitor = HealthMonitor::new(registry, MonitorConfig::default());
        for _ in 0..100 {
            let delay = monitor.next_delay();
            assert!(delay >= Duration::from_secs(4) && delay <= Duration::from_secs(6));
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(MonitorConfig::default().validate().is_ok());
        assert!(MonitorConfig::default().with_jitter(1.5).validate().is_err());
        assert!(MonitorConfig::default()
            .with_missed_poll_threshold(0)
            .validate()
            .is_err());
    }

    #[tokio::test]
    async fn test_background_loop_stops_on_shutdown() {
        let config = MonitorConfig::default().with_interval(Duration::from_millis(10));
        let (monitor, _registry, _backend, id) = setup(config).await;
        let shutdown = CancellationToken::new();
        let handle = Arc::clone(&monitor).spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(monitor.snapshot().get(id).is_some());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
