//! Workers placed on cluster nodes

use super::{option_str, option_usize, BackendOptions, BackendType, PoolBackend, TaskExecutor};
use crate::core::{OrchestratorError, PoolId, Result, Task, WorkerId};
use crate::pool::WorkerHandle;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::info;

const DEFAULT_SLOTS_PER_NODE: usize = 4;

#[derive(Debug, Default)]
struct Placement {
    /// worker -> node
    workers: HashMap<WorkerId, String>,
    cordoned: HashSet<String>,
}

impl Placement {
    fn load(&self, node: &str) -> usize {
        self.workers.values().filter(|n| n.as_str() == node).count()
    }
}

/// Backend placing workers on a fixed node set
///
/// Nodes come from `options.nodes` (array or comma-separated string) and each
/// holds `options.slots_per_node` workers. A new worker goes to the least
/// occupied schedulable node; when none has a free slot the spawn fails with
/// `BackendUnavailable`.
pub struct ClusterBackend {
    executor: Arc<dyn TaskExecutor>,
    nodes: Vec<String>,
    slots_per_node: usize,
    placement: Mutex<Placement>,
}

impl std::fmt::Debug for ClusterBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterBackend")
            .field("nodes", &self.nodes)
            .field("slots_per_node", &self.slots_per_node)
            .finish()
    }
}

impl ClusterBackend {
    /// Create a backend over explicit nodes
    pub fn new(executor: Arc<dyn TaskExecutor>, nodes: Vec<String>, slots_per_node: usize) -> Result<Self> {
        if nodes.is_empty() {
            return Err(OrchestratorError::invalid_config(
                "options.nodes",
                "cluster pools need at least one node",
            ));
        }
        if slots_per_node == 0 {
            return Err(OrchestratorError::invalid_config(
                "options.slots_per_node",
                "must be at least 1",
            ));
        }
        Ok(Self {
            executor,
            nodes,
            slots_per_node,
            placement: Mutex::new(Placement::default()),
        })
    }

    /// Create a backend from pool options
    pub fn from_options(executor: Arc<dyn TaskExecutor>, options: &BackendOptions) -> Result<Self> {
        let nodes = match options.get("nodes") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        OrchestratorError::invalid_config("options.nodes", "node names must be strings")
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            Some(Value::String(_)) => option_str(options, "nodes")
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            Some(_) => {
                return Err(OrchestratorError::invalid_config(
                    "options.nodes",
                    "expected an array or comma-separated string",
                ))
            }
            None => vec!["node-0".to_string()],
        };
        let slots = option_usize(options, "slots_per_node")?.unwrap_or(DEFAULT_SLOTS_PER_NODE);
        Self::new(executor, nodes, slots)
    }

    /// Total worker capacity
    pub fn capacity(&self) -> usize {
        self.nodes.len() * self.slots_per_node
    }

    /// Stop scheduling on `node` and treat its workers as lost
    pub fn cordon(&self, node: &str) {
        info!(node = node, "node cordoned");
        self.placement.lock().cordoned.insert(node.to_string());
    }

    /// Make `node` schedulable again
    pub fn uncordon(&self, node: &str) {
        self.placement.lock().cordoned.remove(node);
    }

    fn node_of(&self, worker: &WorkerHandle) -> Option<(String, bool)> {
        let placement = self.placement.lock();
        placement
            .workers
            .get(&worker.id)
            .map(|node| (node.clone(), placement.cordoned.contains(node)))
    }
}

#[async_trait]
impl PoolBackend for ClusterBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Cluster
    }

    async fn spawn_worker(&self, pool_id: PoolId, _options: &BackendOptions) -> Result<WorkerHandle> {
        let mut placement = self.placement.lock();
        let node = self
            .nodes
            .iter()
            .filter(|node| !placement.cordoned.contains(node.as_str()))
            .map(|node| (placement.load(node), node))
            .filter(|(load, _)| *load < self.slots_per_node)
            .min_by_key(|(load, _)| *load)
            .map(|(_, node)| node.clone())
            .ok_or_else(|| {
                OrchestratorError::backend_unavailable(
                    "cluster",
                    format!("no free slot on {} nodes", self.nodes.len()),
                )
            })?;

        let handle = WorkerHandle::new(pool_id)
            .with_attribute("backend", "cluster")
            .with_attribute("node", node.clone());
        placement.workers.insert(handle.id, node);
        Ok(handle)
    }

    async fn terminate_worker(&self, worker: &WorkerHandle) -> Result<()> {
        self.placement.lock().workers.remove(&worker.id);
        Ok(())
    }

    async fn dispatch(&self, worker: &WorkerHandle, task: &Task) -> Result<Value> {
        match self.node_of(worker) {
            None => Err(OrchestratorError::worker_terminated(
                worker.id,
                task.task_id(),
                "worker not placed",
            )),
            Some((node, true)) => Err(OrchestratorError::backend_unavailable(
                node,
                "node is cordoned",
            )),
            Some((_, false)) => self.executor.execute(worker, task).await,
        }
    }

    async fn probe_health(&self, worker: &WorkerHandle) -> Result<bool> {
        match self.node_of(worker) {
            None => Ok(false),
            Some((node, true)) => Err(OrchestratorError::backend_unavailable(
                node,
                "node is cordoned",
            )),
            Some((_, false)) => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EchoExecutor;
    use serde_json::json;

    fn backend(nodes: Value, slots: usize) -> ClusterBackend {
        let mut options = BackendOptions::new();
        options.insert("nodes".into(), nodes);
        options.insert("slots_per_node".into(), json!(slots));
        ClusterBackend::from_options(Arc::new(EchoExecutor), &options).unwrap()
    }

    #[tokio::test]
    async fn test_spreads_workers_across_nodes() {
        let cluster = backend(json!(["a", "b"]), 2);
        assert_eq!(cluster.capacity(), 4);

        let pool = PoolId::new();
        let mut nodes = Vec::new();
        for _ in 0..4 {
            let worker = cluster.spawn_worker(pool, &BackendOptions::new()).await.unwrap();
            nodes.push(worker.attribute("node").unwrap().to_string());
        }
        nodes.sort();
        assert_eq!(nodes, vec!["a", "a", "b", "b"]);

        let err = cluster
            .spawn_worker(pool, &BackendOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "BACKEND_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_comma_separated_nodes_and_cordon() {
        let cluster = backend(json!("a, b"), 1);
        let pool = PoolId::new();
        let first = cluster.spawn_worker(pool, &BackendOptions::new()).await.unwrap();
        let node = first.attribute("node").unwrap().to_string();

        cluster.cordon(&node);
        assert!(cluster.probe_health(&first).await.is_err());
        let task = Task::with_id("t", "x", json!(1));
        assert_eq!(
            cluster.dispatch(&first, &task).await.unwrap_err().code(),
            "BACKEND_UNAVAILABLE"
        );

        // Only the other node is schedulable now
        let second = cluster.spawn_worker(pool, &BackendOptions::new()).await.unwrap();
        assert_ne!(second.attribute("node"), Some(node.as_str()));
        assert_eq!(cluster.dispatch(&second, &task).await.unwrap(), json!(1));

        cluster.uncordon(&node);
        assert!(cluster.probe_health(&first).await.unwrap());
    }

    #[test]
    fn test_rejects_bad_options() {
        let mut options = BackendOptions::new();
        options.insert("nodes".into(), json!([]));
        assert!(ClusterBackend::from_options(Arc::new(EchoExecutor), &options).is_err());

        options.insert("nodes".into(), json!(5));
        assert!(ClusterBackend::from_options(Arc::new(EchoExecutor), &options).is_err());
    }
}
