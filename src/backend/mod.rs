//! Execution backends
//!
//! A [`PoolBackend`] creates and manages workers for one environment. The
//! pool owns its backend as a trait object chosen at registration time.
//! What a worker actually does with a task is delegated to a
//! [`TaskExecutor`]; the orchestrator never looks inside payloads.

mod cluster;
mod delegated;
mod local;

pub use cluster::ClusterBackend;
pub use delegated::DelegatedBackend;
pub use local::LocalBackend;

use crate::core::{OrchestratorError, PoolId, Result, Task};
use crate::pool::{PoolConfig, WorkerHandle};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Opaque backend options from the pool configuration
pub type BackendOptions = BTreeMap<String, Value>;

/// Backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    /// In-process workers
    #[default]
    Local,
    /// Workers leased from a remote endpoint
    Delegated,
    /// Workers placed on cluster nodes
    Cluster,
}

impl BackendType {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Local => "local",
            BackendType::Delegated => "delegated",
            BackendType::Cluster => "cluster",
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendType {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(BackendType::Local),
            "delegated" => Ok(BackendType::Delegated),
            "cluster" => Ok(BackendType::Cluster),
            other => Err(OrchestratorError::invalid_config(
                "backend_type",
                format!("unknown backend '{}'", other),
            )),
        }
    }
}

/// Environment-specific worker management
///
/// Every method is called with an explicit timeout by the owning pool.
#[async_trait]
pub trait PoolBackend: Send + Sync {
    /// Backend kind
    fn backend_type(&self) -> BackendType;

    /// Create one worker for `pool_id`
    async fn spawn_worker(&self, pool_id: PoolId, options: &BackendOptions)
        -> Result<WorkerHandle>;

    /// Tear a worker down
    async fn terminate_worker(&self, worker: &WorkerHandle) -> Result<()>;

    /// Run a task on a worker, returning its output
    async fn dispatch(&self, worker: &WorkerHandle, task: &Task) -> Result<Value>;

    /// Whether the worker is healthy
    ///
    /// `Err(BackendUnavailable)` means the backend itself cannot be reached.
    async fn probe_health(&self, worker: &WorkerHandle) -> Result<bool>;

    /// Ask the worker to abandon a task
    async fn cancel(&self, _worker: &WorkerHandle, _task_id: &str) -> Result<()> {
        Ok(())
    }
}

/// The logic a worker runs for a task
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute `task` on `worker`
    async fn execute(&self, worker: &WorkerHandle, task: &Task) -> Result<Value>;

    /// Whether the executor (or the endpoint behind it) is reachable
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Executor that returns the payload unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(&self, _worker: &WorkerHandle, task: &Task) -> Result<Value> {
        Ok(task.payload().clone())
    }
}

/// Executor backed by a closure
///
/// ```rust
/// use pool_orchestrator::backend::FnExecutor;
/// use serde_json::json;
///
/// let executor = FnExecutor::new(|_worker, task| {
///     Box::pin(async move { Ok(json!({"seen": task.task_id()})) })
/// });
/// # let _ = executor;
/// ```
pub struct FnExecutor<F> {
    f: F,
}

impl<F> FnExecutor<F>
where
    F: Fn(WorkerHandle, Task) -> BoxFuture<'static, Result<Value>> + Send + Sync,
{
    /// Wrap a closure
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> TaskExecutor for FnExecutor<F>
where
    F: Fn(WorkerHandle, Task) -> BoxFuture<'static, Result<Value>> + Send + Sync,
{
    async fn execute(&self, worker: &WorkerHandle, task: &Task) -> Result<Value> {
        (self.f)(worker.clone(), task.clone()).await
    }
}

/// Builds backends from pool configurations
#[derive(Clone)]
pub struct BackendFactory {
    executor: Arc<dyn TaskExecutor>,
    endpoints: HashMap<String, Arc<dyn TaskExecutor>>,
    fallback_remote: Option<Arc<dyn TaskExecutor>>,
}

impl fmt::Debug for BackendFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut endpoints: Vec<_> = self.endpoints.keys().collect();
        endpoints.sort();
        f.debug_struct("BackendFactory")
            .field("endpoints", &endpoints)
            .field("fallback_remote", &self.fallback_remote.is_some())
            .finish()
    }
}

impl Default for BackendFactory {
    fn default() -> Self {
        Self::new(Arc::new(EchoExecutor))
    }
}

impl BackendFactory {
    /// Factory whose local and cluster workers run `executor`
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            executor,
            endpoints: HashMap::new(),
            fallback_remote: None,
        }
    }

    /// Register a remote endpoint for delegated pools
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_endpoint(mut self, name: impl Into<String>, remote: Arc<dyn TaskExecutor>) -> Self {
        self.endpoints.insert(name.into(), remote);
        self
    }

    /// Executor used for delegated endpoints that were not registered by name
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_fallback_remote(mut self, remote: Arc<dyn TaskExecutor>) -> Self {
        self.fallback_remote = Some(remote);
        self
    }

    /// Build the backend for `config`
    pub fn create(&self, config: &PoolConfig) -> Result<Arc<dyn PoolBackend>> {
        match config.backend_type {
            BackendType::Local => Ok(Arc::new(LocalBackend::new(Arc::clone(&self.executor)))),
            BackendType::Delegated => {
                let endpoint = option_str(&config.options, "endpoint").ok_or_else(|| {
                    OrchestratorError::invalid_config(
                        "options.endpoint",
                        "delegated pools need an endpoint",
                    )
                })?;
                let remote = self
                    .endpoints
                    .get(endpoint)
                    .or(self.fallback_remote.as_ref())
                    .ok_or_else(|| {
                        OrchestratorError::backend_unavailable(
                            endpoint,
                            "no remote executor registered for this endpoint",
                        )
                    })?;
                Ok(Arc::new(DelegatedBackend::new(endpoint, Arc::clone(remote))))
            }
            BackendType::Cluster => Ok(Arc::new(ClusterBackend::from_options(
                Arc::clone(&self.executor),
                &config.options,
            )?)),
        }
    }
}

pub(crate) fn option_str<'a>(options: &'a BackendOptions, key: &str) -> Option<&'a str> {
    options.get(key).and_then(Value::as_str)
}

pub(crate) fn option_usize(options: &BackendOptions, key: &str) -> Result<Option<usize>> {
    match options.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|v| Some(v as usize))
            .ok_or_else(|| {
                OrchestratorError::invalid_config(
                    format!("options.{}", key),
                    "must be a non-negative integer",
                )
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_backend_type_parse() {
        assert_eq!("Local".parse::<BackendType>().unwrap(), BackendType::Local);
        assert_eq!("cluster".parse::<BackendType>().unwrap(), BackendType::Cluster);
        assert!("k8s".parse::<BackendType>().is_err());
        assert_eq!(BackendType::Delegated.to_string(), "delegated");
    }

    #[test]
    fn test_factory_builds_each_backend() {
        let factory = BackendFactory::default().with_endpoint("remote-a", Arc::new(EchoExecutor));

        let local = factory
            .create(&PoolConfig::new("l", BackendType::Local))
            .unwrap();
        assert_eq!(local.backend_type(), BackendType::Local);

        let delegated = factory
            .create(
                &PoolConfig::new("d", BackendType::Delegated).with_option("endpoint", "remote-a"),
            )
            .unwrap();
        assert_eq!(delegated.backend_type(), BackendType::Delegated);

        let cluster = factory
            .create(
                &PoolConfig::new("c", BackendType::Cluster)
                    .with_option("nodes", json!(["n1", "n2"])),
            )
            .unwrap();
        assert_eq!(cluster.backend_type(), BackendType::Cluster);
    }

    #[test]
    fn test_factory_rejects_unknown_endpoint() {
        let factory = BackendFactory::default();
        let missing = factory
            .create(&PoolConfig::new("d", BackendType::Delegated))
            .err()
            .unwrap();
        assert_eq!(missing.code(), "INVALID_CONFIG");

        let unknown = factory
            .create(&PoolConfig::new("d", BackendType::Delegated).with_option("endpoint", "nope"))
            .err()
            .unwrap();
        assert_eq!(unknown.code(), "BACKEND_UNAVAILABLE");

        let fallback = BackendFactory::default()
            .with_fallback_remote(Arc::new(EchoExecutor))
            .create(&PoolConfig::new("d", BackendType::Delegated).with_option("endpoint", "nope"))
            .unwrap();
        assert_eq!(fallback.backend_type(), BackendType::Delegated);
    }

    #[tokio::test]
    async fn test_echo_and_fn_executors() {
        let worker = WorkerHandle::new(PoolId::new());
        let task = Task::with_id("t1", "echo", json!({"x": 1}));
        assert_eq!(
            EchoExecutor.execute(&worker, &task).await.unwrap(),
            json!({"x": 1})
        );

        let doubled = FnExecutor::new(|_worker, task: Task| {
            Box::pin(async move {
                let x = task.payload()["x"].as_i64().unwrap_or(0);
                Ok(json!(x * 2))
            })
        });
        assert_eq!(doubled.execute(&worker, &task).await.unwrap(), json!(2));
    }
}
