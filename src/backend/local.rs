//! In-process workers
//!
//! Each worker is a long-lived tokio task draining its own job channel and
//! running jobs through the shared [`TaskExecutor`]. Jobs on one worker run
//! concurrently, so the pool's per-worker concurrency limit is the only bound.

use super::{BackendOptions, BackendType, PoolBackend, TaskExecutor};
use crate::core::{CancellationReason, CancellationToken, OrchestratorError, PoolId, Result, Task, WorkerId};
use crate::pool::WorkerHandle;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Jobs queued on one worker before `dispatch` waits
const WORKER_CHANNEL_CAPACITY: usize = 64;

struct LocalJob {
    task: Task,
    token: CancellationToken,
    reply: oneshot::Sender<Result<Value>>,
}

struct LocalWorker {
    sender: mpsc::Sender<LocalJob>,
    running: Arc<Mutex<HashMap<String, CancellationToken>>>,
    join: JoinHandle<()>,
}

/// Backend running workers as tokio tasks in this process
pub struct LocalBackend {
    executor: Arc<dyn TaskExecutor>,
    workers: DashMap<WorkerId, LocalWorker>,
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend")
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl LocalBackend {
    /// Create a backend running `executor`
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            executor,
            workers: DashMap::new(),
        }
    }

    /// Number of live worker tasks
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Worker main loop
    ///
    /// Exits once the job channel is closed and every accepted job finished.
    async fn run(
        handle: WorkerHandle,
        executor: Arc<dyn TaskExecutor>,
        mut jobs: mpsc::Receiver<LocalJob>,
        running: Arc<Mutex<HashMap<String, CancellationToken>>>,
    ) {
        debug!(worker = %handle.id, "local worker started");
        let mut active = FuturesUnordered::new();
        let mut open = true;

        loop {
            tokio::select! {
                job = jobs.recv(), if open => match job {
                    Some(job) => {
                        let executor = Arc::clone(&executor);
                        let handle = handle.clone();
                        let running = Arc::clone(&running);
                        active.push(async move {
                            Self::execute_job(&handle, executor.as_ref(), job, &running).await
                        });
                    }
                    None => open = false,
                },
                Some(()) = active.next(), if !active.is_empty() => {}
                else => break,
            }
        }
        debug!(worker = %handle.id, "local worker stopped");
    }

    /// Execute a single job with panic protection
    async fn execute_job(
        handle: &WorkerHandle,
        executor: &dyn TaskExecutor,
        job: LocalJob,
        running: &Mutex<HashMap<String, CancellationToken>>,
    ) {
        let task_id = job.task.task_id().to_string();
        running
            .lock()
            .insert(task_id.clone(), job.token.clone());

        let work = AssertUnwindSafe(executor.execute(handle, &job.task)).catch_unwind();
        let result = tokio::select! {
            outcome = work => match outcome {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    warn!(worker = %handle.id, task_id = %task_id, "executor panicked: {}", message);
                    Err(OrchestratorError::task_failed(&task_id, format!("executor panicked: {}", message)))
                }
            },
            _ = job.token.cancelled() => Err(job.token.to_error(&task_id)),
        };

        running.lock().remove(&task_id);
        // The dispatcher may have given up already
        let _ = job.reply.send(result);
    }
}

#[async_trait]
impl PoolBackend for LocalBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Local
    }

    async fn spawn_worker(&self, pool_id: PoolId, _options: &BackendOptions) -> Result<WorkerHandle> {
        let handle = WorkerHandle::new(pool_id).with_attribute("backend", "local");
        let (sender, receiver) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
        let running = Arc::new(Mutex::new(HashMap::new()));
        let join = tokio::spawn(Self::run(
            handle.clone(),
            Arc::clone(&self.executor),
            receiver,
            Arc::clone(&running),
        ));

        self.workers.insert(
            handle.id,
            LocalWorker {
                sender,
                running,
                join,
            },
        );
        Ok(handle)
    }

    async fn terminate_worker(&self, worker: &WorkerHandle) -> Result<()> {
        if let Some((_, local)) = self.workers.remove(&worker.id) {
            for token in local.running.lock().values() {
                token.cancel_with_reason(CancellationReason::Shutdown);
            }
            drop(local.sender);
            local.join.abort();
        }
        Ok(())
    }

    async fn dispatch(&self, worker: &WorkerHandle, task: &Task) -> Result<Value> {
        let sender = self
            .workers
            .get(&worker.id)
            .map(|local| local.sender.clone())
            .ok_or_else(|| {
                OrchestratorError::worker_terminated(worker.id, task.task_id(), "worker not running")
            })?;

        let (reply, response) = oneshot::channel();
        let job = LocalJob {
            task: task.clone(),
            token: CancellationToken::new(),
            reply,
        };
        sender.send(job).await.map_err(|_| {
            OrchestratorError::worker_terminated(worker.id, task.task_id(), "worker channel closed")
        })?;

        response.await.map_err(|_| {
            OrchestratorError::worker_terminated(worker.id, task.task_id(), "worker stopped mid-task")
        })?
    }

    async fn probe_health(&self, worker: &WorkerHandle) -> Result<bool> {
        Ok(self
            .workers
            .get(&worker.id)
            .map(|local| !local.join.is_finished() && !local.sender.is_closed())
            .unwrap_or(false))
    }

    async fn cancel(&self, worker: &WorkerHandle, task_id: &str) -> Result<()> {
        if let Some(local) = self.workers.get(&worker.id) {
            if let Some(token) = local.running.lock().get(task_id) {
                token.cancel();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EchoExecutor, FnExecutor};
    use serde_json::json;
    use std::time::Duration;

    fn slow_executor() -> Arc<dyn TaskExecutor> {
        Arc::new(FnExecutor::new(|_worker, task: Task| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(task.payload().clone())
            })
        }))
    }

    #[tokio::test]
    async fn test_spawn_dispatch_terminate() {
        let backend = LocalBackend::new(Arc::new(EchoExecutor));
        let worker = backend
            .spawn_worker(PoolId::new(), &BackendOptions::new())
            .await
            .unwrap();
        assert_eq!(worker.attribute("backend"), Some("local"));
        assert!(backend.probe_health(&worker).await.unwrap());

        let task = Task::with_id("t1", "echo", json!({"v": 7}));
        assert_eq!(backend.dispatch(&worker, &task).await.unwrap(), json!({"v": 7}));

        backend.terminate_worker(&worker).await.unwrap();
        assert_eq!(backend.worker_count(), 0);
        assert!(!backend.probe_health(&worker).await.unwrap());
        let err = backend.dispatch(&worker, &task).await.unwrap_err();
        assert_eq!(err.code(), "WORKER_TERMINATED");
    }

    #[tokio::test]
    async fn test_cancel_acknowledged_by_worker() {
        let backend = Arc::new(LocalBackend::new(slow_executor()));
        let worker = backend
            .spawn_worker(PoolId::new(), &BackendOptions::new())
            .await
            .unwrap();

        let task = Task::with_id("slow", "sleep", json!(null));
        let dispatch = {
            let backend = Arc::clone(&backend);
            let worker = worker.clone();
            tokio::spawn(async move { backend.dispatch(&worker, &task).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.cancel(&worker, "slow").await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), dispatch)
            .await
            .expect("cancel should be acknowledged")
            .unwrap();
        assert_eq!(result.unwrap_err().code(), "CANCELLED");
    }

    #[tokio::test]
    async fn test_panicking_executor_reports_failure() {
        let executor: Arc<dyn TaskExecutor> = Arc::new(FnExecutor::new(|_worker, _task: Task| {
            Box::pin(async move {
                if true {
                    panic!("boom");
                }
                Ok(json!(null))
            })
        }));
        let backend = LocalBackend::new(executor);
        let worker = backend
            .spawn_worker(PoolId::new(), &BackendOptions::new())
            .await
            .unwrap();

        let err = backend
            .dispatch(&worker, &Task::with_id("p", "panic", json!(null)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TASK_FAILED");
        assert!(err.to_string().contains("boom"));
        // The worker loop survives the panic
        assert!(backend.probe_health(&worker).await.unwrap());
    }
}
