//! Workers leased from a remote endpoint

use super::{option_usize, BackendOptions, BackendType, PoolBackend, TaskExecutor};
use crate::core::{OrchestratorError, PoolId, Result, Task, WorkerId};
use crate::pool::WorkerHandle;
use async_trait::async_trait;
use dashmap::DashSet;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Backend forwarding every dispatch to a remote [`TaskExecutor`]
///
/// A worker here is a lease on the endpoint. Reachability is tracked from
/// every call; while the endpoint is down, spawns and probes fail with
/// `BackendUnavailable`.
pub struct DelegatedBackend {
    endpoint: String,
    remote: Arc<dyn TaskExecutor>,
    leases: DashSet<WorkerId>,
    reachable: AtomicBool,
}

impl std::fmt::Debug for DelegatedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegatedBackend")
            .field("endpoint", &self.endpoint)
            .field("leases", &self.leases.len())
            .field("reachable", &self.is_reachable())
            .finish()
    }
}

impl DelegatedBackend {
    /// Create a backend for `endpoint`
    pub fn new(endpoint: impl Into<String>, remote: Arc<dyn TaskExecutor>) -> Self {
        Self {
            endpoint: endpoint.into(),
            remote,
            leases: DashSet::new(),
            reachable: AtomicBool::new(true),
        }
    }

    /// Whether the last call reached the endpoint
    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Relaxed)
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        match &result {
            Err(OrchestratorError::BackendUnavailable { .. }) => {
                if self.reachable.swap(false, Ordering::Relaxed) {
                    warn!(endpoint = %self.endpoint, "remote endpoint became unreachable");
                }
            }
            _ => {
                self.reachable.store(true, Ordering::Relaxed);
            }
        }
        result
    }

    async fn ping(&self) -> Result<()> {
        let result = self.remote.ping().await.map_err(|e| match e {
            OrchestratorError::BackendUnavailable { .. } => e,
            other => OrchestratorError::backend_unavailable(&self.endpoint, other.to_string()),
        });
        self.observe(result)
    }
}

#[async_trait]
impl PoolBackend for DelegatedBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Delegated
    }

    async fn spawn_worker(&self, pool_id: PoolId, options: &BackendOptions) -> Result<WorkerHandle> {
        self.ping().await?;
        if let Some(limit) = option_usize(options, "max_leases")? {
            if self.leases.len() >= limit {
                return Err(OrchestratorError::backend_unavailable(
                    &self.endpoint,
                    format!("lease limit of {} reached", limit),
                ));
            }
        }

        let handle = WorkerHandle::new(pool_id)
            .with_attribute("backend", "delegated")
            .with_attribute("endpoint", self.endpoint.clone());
        self.leases.insert(handle.id);
        Ok(handle)
    }

    async fn terminate_worker(&self, worker: &WorkerHandle) -> Result<()> {
        self.leases.remove(&worker.id);
        Ok(())
    }

    async fn dispatch(&self, worker: &WorkerHandle, task: &Task) -> Result<Value> {
        if !self.leases.contains(&worker.id) {
            return Err(OrchestratorError::worker_terminated(
                worker.id,
                task.task_id(),
                "lease released",
            ));
        }
        let result = self.remote.execute(worker, task).await;
        self.observe(result)
    }

    async fn probe_health(&self, worker: &WorkerHandle) -> Result<bool> {
        self.ping().await?;
        Ok(self.leases.contains(&worker.id))
    }
}
