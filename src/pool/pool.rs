//! Pool runtime
//!
//! A [`Pool`] owns the workers created by one backend. All bookkeeping sits
//! behind one short-held `parking_lot::Mutex` that is never held across an
//! `.await`; backend calls, waits and event publication happen outside it.
//!
//! Dispatch picks the least-recently-used worker with spare capacity. When
//! none is free the caller waits in a bounded priority queue and a released
//! worker is handed straight to the best waiter.

use super::config::{PoolConfig, ScaleDownPolicy};
use super::worker::{
    InFlight, Transition, WorkerHandle, WorkerSlot, WorkerStatSnapshot, WorkerStatus,
};
use crate::backend::{BackendType, PoolBackend};
use crate::bus::{MessageBus, Topic};
use crate::core::{
    CancellationToken, OrchestratorError, PoolId, Priority, Result, Task, TaskResult, WorkerId,
};
use crate::tracing::metrics;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tokio::task::{AbortHandle, JoinError};
use tracing::{debug, error, info, warn, Instrument};

/// Pool lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Spawning its initial workers
    Starting,
    /// Eligible for routing
    Healthy,
    /// Missed health polls; not routed to
    Degraded,
    /// Closing; in-flight work finishes, nothing new is accepted
    Draining,
    /// Terminal
    Closed,
}

impl PoolStatus {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolStatus::Starting => "starting",
            PoolStatus::Healthy => "healthy",
            PoolStatus::Degraded => "degraded",
            PoolStatus::Draining => "draining",
            PoolStatus::Closed => "closed",
        }
    }

    /// Whether routers may pick this pool
    pub fn is_eligible(&self) -> bool {
        matches!(self, PoolStatus::Healthy)
    }

    /// Whether direct execution is accepted
    pub fn accepts_work(&self) -> bool {
        matches!(
            self,
            PoolStatus::Starting | PoolStatus::Healthy | PoolStatus::Degraded
        )
    }
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolHealth {
    /// Pool identifier
    pub pool_id: PoolId,
    /// Pool name
    pub name: String,
    /// Status
    pub status: PoolStatus,
    /// Backend kind
    pub backend_type: BackendType,
    /// Routing tags
    pub tags: Vec<String>,
    /// Workers not yet torn down
    pub total_workers: usize,
    /// Idle workers
    pub idle_workers: usize,
    /// Busy workers
    pub busy_workers: usize,
    /// Unhealthy workers awaiting termination
    pub unhealthy_workers: usize,
    /// Workers being torn down
    pub terminating_workers: usize,
    /// Tasks running
    pub active_tasks: usize,
    /// Tasks waiting for a worker
    pub queued_tasks: usize,
    /// Wait-queue capacity
    pub queue_capacity: usize,
    /// Lower worker bound
    pub min_workers: usize,
    /// Upper worker bound
    pub max_workers: usize,
    /// `active / max_workers`, 1.0 when `max_workers` is 0, clamped to [0, 1]
    pub load_ratio: f64,
    /// `active / (serviceable workers * concurrency limit)`
    pub utilization: f64,
    /// Last completed `check_health`
    pub last_health_check: Option<DateTime<Utc>>,
}

/// What a scale call did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScaleReport {
    /// Live workers before
    pub from: usize,
    /// Live workers after
    pub to: usize,
    /// Workers created
    pub spawned: usize,
    /// Workers terminated after going idle
    pub terminated: usize,
    /// Busy workers terminated when the policy ran out
    pub forced: usize,
}

/// Right to run one dispatch on one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Lease {
    worker_id: WorkerId,
    dispatch_id: u64,
}

type Grant = (Lease, WorkerHandle);

struct Waiter {
    priority: Priority,
    seq: u64,
    task_id: String,
    deadline: Option<DateTime<Utc>>,
    sender: oneshot::Sender<Grant>,
}

// Higher priority first; FIFO within a priority (BinaryHeap is a max-heap)
impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            other => other,
        }
    }
}

enum Release {
    Completed(Duration),
    Failed(Duration),
    Unused,
}

struct PoolState {
    status: PoolStatus,
    backend_lost: bool,
    workers: Vec<WorkerSlot>,
    active_tasks: usize,
    waiters: BinaryHeap<Waiter>,
    pending_spawns: usize,
    /// Shared logical clock for waiter order, dispatch ids and LRU
    clock: u64,
    last_health_check: Option<DateTime<Utc>>,
}

impl PoolState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn slot_mut(&mut self, id: WorkerId) -> Option<&mut WorkerSlot> {
        self.workers.iter_mut().find(|slot| slot.id() == id)
    }

    fn take_slot(&mut self, id: WorkerId) -> Option<WorkerSlot> {
        let index = self.workers.iter().position(|slot| slot.id() == id)?;
        Some(self.workers.remove(index))
    }

    /// Workers counted against `[min_workers, max_workers]`
    fn live(&self) -> usize {
        self.workers
            .iter()
            .filter(|slot| slot.status() != WorkerStatus::Terminating)
            .count()
    }

    fn serviceable(&self) -> usize {
        self.workers
            .iter()
            .filter(|slot| slot.status().is_serviceable())
            .count()
    }

    fn has_capacity(&self, limit: usize) -> bool {
        self.workers.iter().any(|slot| slot.has_capacity(limit))
    }

    /// Reserve the least-recently-used worker with spare capacity
    fn reserve(
        &mut self,
        limit: usize,
        task_id: &str,
        deadline: Option<DateTime<Utc>>,
    ) -> Option<(Grant, Option<Transition>)> {
        let index = self
            .workers
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.has_capacity(limit))
            .min_by_key(|(_, slot)| (slot.in_flight.len(), slot.last_used))
            .map(|(index, _)| index)?;

        let dispatch_id = self.tick();
        let slot = &mut self.workers[index];
        slot.in_flight.insert(
            dispatch_id,
            InFlight {
                task_id: task_id.to_string(),
                deadline,
                abort: None,
            },
        );
        let transition = slot.sync_activity();
        let grant = (
            Lease {
                worker_id: slot.id(),
                dispatch_id,
            },
            slot.handle.clone(),
        );
        self.active_tasks += 1;
        Some((grant, transition))
    }

    fn undo_reserve(&mut self, lease: Lease) {
        if let Some(slot) = self.slot_mut(lease.worker_id) {
            if slot.in_flight.remove(&lease.dispatch_id).is_some() {
                slot.sync_activity();
                self.active_tasks = self.active_tasks.saturating_sub(1);
            }
        }
    }
}

struct PoolInner {
    id: PoolId,
    config: PoolConfig,
    backend: Arc<dyn PoolBackend>,
    bus: Arc<MessageBus>,
    state: Mutex<PoolState>,
    /// Signalled whenever a dispatch finishes or a worker leaves
    released: Notify,
    scale_lock: tokio::sync::Mutex<()>,
    created_at: DateTime<Utc>,
}

/// Cheap, cloneable handle to one pool
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Pool")
            .field("id", &self.inner.id)
            .field("name", &self.inner.config.name)
            .field("status", &state.status)
            .field("workers", &state.workers.len())
            .field("active_tasks", &state.active_tasks)
            .finish()
    }
}

enum Waited {
    Granted(std::result::Result<Grant, oneshot::error::RecvError>),
    TimedOut,
    Cancelled,
}

enum Finished {
    Joined(std::result::Result<(Result<serde_json::Value>, Duration), JoinError>),
    TimedOut,
    Cancelled,
}

impl Pool {
    /// Create a pool; call [`start`](Self::start) to spawn its workers
    pub fn new(
        id: PoolId,
        config: PoolConfig,
        backend: Arc<dyn PoolBackend>,
        bus: Arc<MessageBus>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                id,
                config,
                backend,
                bus,
                state: Mutex::new(PoolState {
                    status: PoolStatus::Starting,
                    backend_lost: false,
                    workers: Vec::new(),
                    active_tasks: 0,
                    waiters: BinaryHeap::new(),
                    pending_spawns: 0,
                    clock: 0,
                    last_health_check: None,
                }),
                released: Notify::new(),
                scale_lock: tokio::sync::Mutex::new(()),
                created_at: Utc::now(),
            }),
        }
    }

    /// Pool identifier
    pub fn id(&self) -> PoolId {
        self.inner.id
    }

    /// Pool name
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Owned configuration
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Backend kind
    pub fn backend_type(&self) -> BackendType {
        self.inner.backend.backend_type()
    }

    /// Current status
    pub fn status(&self) -> PoolStatus {
        self.inner.state.lock().status
    }

    /// Creation time
    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Spawn `min_workers` and become healthy
    ///
    /// On failure every worker spawned so far is terminated and the pool is
    /// left closed.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let (spawned, failure) = inner.spawn_workers(inner.config.min_workers).await;
        if let Some(e) = failure {
            let handles: Vec<WorkerHandle> = {
                let mut state = inner.state.lock();
                state.status = PoolStatus::Closed;
                state.workers.drain(..).map(|slot| slot.handle).collect()
            };
            join_all(handles.iter().map(|h| inner.terminate_handle(h))).await;
            warn!(pool = %inner.config.name, error = %e, "Pool failed to start");
            return Err(e);
        }

        inner.transition_status(PoolStatus::Healthy, "started");
        info!(
            pool = %inner.config.name,
            workers = spawned,
            backend = %inner.backend.backend_type(),
            "Pool started"
        );
        Ok(())
    }

    /// Run one task on this pool
    pub async fn execute(&self, task: Task) -> Result<TaskResult> {
        self.execute_with_token(task, CancellationToken::new()).await
    }

    /// Run one task, abandoning it when `token` fires
    ///
    /// Tasks past their deadline are rejected with `Timeout` and never
    /// dispatched. The client wait is bounded by the deadline, or by
    /// `dispatch_timeout` when there is none. On timeout or cancellation the
    /// backend is asked to cancel; a worker that does not finish within
    /// `cancel_grace` is marked unhealthy and force-terminated.
    pub async fn execute_with_token(
        &self,
        task: Task,
        token: CancellationToken,
    ) -> Result<TaskResult> {
        let wait_limit = match task.remaining() {
            Some(remaining) if remaining.is_zero() => {
                return Err(OrchestratorError::timeout(
                    format!("task {} deadline", task.task_id()),
                    Duration::ZERO,
                ));
            }
            Some(remaining) => remaining,
            None => self.inner.config.settings.dispatch_timeout,
        };
        token.check(task.task_id())?;

        let started = Instant::now();
        let grant = self.inner.acquire(&task, wait_limit, &token).await?;
        let remaining = wait_limit.saturating_sub(started.elapsed());
        self.inner.run_dispatch(grant, task, remaining, token).await
    }

    /// Resize to `target` live workers
    ///
    /// `target` must lie in `[min_workers, max_workers]`. Idle workers are
    /// retired before unhealthy ones, busy ones last; busy victims run until
    /// idle or until the scale-down policy runs out, then are force-terminated.
    /// Calls on one pool are serialized; repeating a call is a no-op.
    pub async fn scale(&self, target: usize) -> Result<ScaleReport> {
        let inner = &self.inner;
        let config = &inner.config;
        if target < config.min_workers || target > config.max_workers {
            return Err(OrchestratorError::invalid_config(
                "target",
                format!(
                    "{} outside [{}, {}] for pool '{}'",
                    target, config.min_workers, config.max_workers, config.name
                ),
            ));
        }

        let _serialized = inner.scale_lock.lock().await;
        let from = {
            let state = inner.state.lock();
            inner.ensure_accepting(&state)?;
            state.live()
        };
        let mut report = ScaleReport {
            from,
            to: from,
            spawned: 0,
            terminated: 0,
            forced: 0,
        };
        if from == target {
            return Ok(report);
        }

        inner.bus.emit(
            Topic::PoolScaling,
            Some(inner.id),
            json!({"phase": "started", "pool": config.name, "from": from, "target": target}),
        );
        info!(pool = %config.name, from = from, target = target, "Scaling pool");

        let mut failure = None;
        if target > from {
            let (spawned, error) = inner.spawn_workers(target - from).await;
            report.spawned = spawned;
            failure = error;
        } else {
            let (terminated, forced) = inner.retire_workers(from - target).await;
            report.terminated = terminated;
            report.forced = forced;
        }
        report.to = inner.state.lock().live();

        inner.bus.emit(
            Topic::PoolScaling,
            Some(inner.id),
            json!({
                "phase": "completed",
                "pool": config.name,
                "from": report.from,
                "to": report.to,
                "spawned": report.spawned,
                "terminated": report.terminated,
                "forced": report.forced,
                "error": failure.as_ref().map(|e| e.to_string()),
            }),
        );
        metrics::record_scale(&config.name, report.from, report.to);

        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Current health view
    pub fn health(&self) -> PoolHealth {
        let inner = &self.inner;
        let config = &inner.config;
        let state = inner.state.lock();

        let (mut idle, mut busy, mut unhealthy, mut terminating) = (0, 0, 0, 0);
        for slot in &state.workers {
            match slot.status() {
                WorkerStatus::Idle | WorkerStatus::Starting => idle += 1,
                WorkerStatus::Busy => busy += 1,
                WorkerStatus::Unhealthy => unhealthy += 1,
                WorkerStatus::Terminating => terminating += 1,
            }
        }

        let active = state.active_tasks;
        let load_ratio = if config.max_workers == 0 {
            1.0
        } else {
            (active as f64 / config.max_workers as f64).clamp(0.0, 1.0)
        };
        let capacity = (idle + busy) * config.settings.per_worker_concurrency_limit;
        let utilization = if capacity == 0 {
            if active > 0 {
                1.0
            } else {
                0.0
            }
        } else {
            (active as f64 / capacity as f64).min(1.0)
        };

        PoolHealth {
            pool_id: inner.id,
            name: config.name.clone(),
            status: state.status,
            backend_type: inner.backend.backend_type(),
            tags: config.tags.iter().cloned().collect(),
            total_workers: state.live(),
            idle_workers: idle,
            busy_workers: busy,
            unhealthy_workers: unhealthy,
            terminating_workers: terminating,
            active_tasks: active,
            queued_tasks: state.waiters.len(),
            queue_capacity: config.queue_capacity(),
            min_workers: config.min_workers,
            max_workers: config.max_workers,
            load_ratio,
            utilization,
            last_health_check: state.last_health_check,
        }
    }

    /// Probe every live worker and replace the ones that keep failing
    ///
    /// A failed probe marks a worker unhealthy; once unhealthy, every further
    /// probe counts toward `unhealthy_threshold`, after which the worker is
    /// terminated and the pool is replenished to `min_workers`. Fails with `BackendUnavailable` when every probe says
    /// the backend cannot be reached; workers are not penalized then.
    pub async fn check_health(&self) -> Result<PoolHealth> {
        let inner = &self.inner;
        let settings = &inner.config.settings;

        let targets: Vec<WorkerHandle> = {
            let state = inner.state.lock();
            if !state.status.accepts_work() {
                drop(state);
                return Ok(self.health());
            }
            state
                .workers
                .iter()
                .filter(|slot| slot.status() != WorkerStatus::Terminating)
                .map(|slot| slot.handle.clone())
                .collect()
        };

        let probes = targets.iter().map(|handle| {
            tokio::time::timeout(settings.probe_timeout, inner.backend.probe_health(handle))
        });
        let results = join_all(probes).await;

        let mut unreachable = None;
        let mut unreachable_count = 0;
        let mut verdicts = Vec::with_capacity(results.len());
        for (handle, result) in targets.iter().zip(results) {
            let healthy = match result {
                Ok(Ok(healthy)) => healthy,
                Ok(Err(e @ OrchestratorError::BackendUnavailable { .. })) => {
                    unreachable_count += 1;
                    unreachable = Some(e);
                    false
                }
                Ok(Err(e)) => {
                    debug!(pool = %inner.config.name, worker = %handle.id, error = %e, "probe failed");
                    false
                }
                Err(_) => {
                    debug!(pool = %inner.config.name, worker = %handle.id, "probe timed out");
                    false
                }
            };
            verdicts.push((handle.id, healthy));
        }

        if !targets.is_empty() && unreachable_count == targets.len() {
            inner.state.lock().last_health_check = Some(Utc::now());
            return Err(unreachable.unwrap_or_else(|| {
                OrchestratorError::backend_unavailable(inner.backend.backend_type().as_str(), "unreachable")
            }));
        }

        let (transitions, doomed) = {
            let mut state = inner.state.lock();
            let mut transitions = Vec::new();
            let mut doomed = Vec::new();
            for (worker_id, healthy) in verdicts {
                let Some(slot) = state.slot_mut(worker_id) else {
                    continue;
                };
                if healthy && slot.status().is_serviceable() {
                    slot.probe_failures = 0;
                    continue;
                }
                // Unhealthy workers never return to service, so every probe counts
                slot.probe_failures += 1;
                if !healthy {
                    transitions.extend(slot.transition(WorkerStatus::Unhealthy, "probe failed"));
                }
                if slot.probe_failures >= settings.unhealthy_threshold {
                    doomed.push(worker_id);
                }
            }
            state.last_health_check = Some(Utc::now());
            (transitions, doomed)
        };
        inner.publish_transitions(transitions);

        if !doomed.is_empty() {
            inner
                .force_remove(&doomed, "unhealthy threshold reached")
                .await;
        }
        inner.replenish().await;
        Ok(self.health())
    }

    /// Drain in-flight work, terminate every worker and close
    ///
    /// Waiters are rejected immediately. Work still running after
    /// `drain_timeout` fails with `WorkerTerminated`. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        let _serialized = inner.scale_lock.lock().await;

        {
            let mut state = inner.state.lock();
            if state.status == PoolStatus::Closed {
                return Ok(());
            }
            // Dropping the senders wakes every waiter with a closed error
            state.waiters.clear();
        }
        inner.transition_status(PoolStatus::Draining, "close requested");
        info!(pool = %inner.config.name, "Draining pool");

        let deadline = Instant::now() + inner.config.settings.drain_timeout;
        loop {
            let notified = inner.released.notified();
            if inner.state.lock().active_tasks == 0 {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                let busy: Vec<WorkerId> = inner
                    .state
                    .lock()
                    .workers
                    .iter()
                    .filter(|slot| !slot.in_flight.is_empty())
                    .map(WorkerSlot::id)
                    .collect();
                inner.force_remove(&busy, "drain timeout").await;
                break;
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }

        let mut transitions = Vec::new();
        let handles: Vec<WorkerHandle> = inner
            .state
            .lock()
            .workers
            .drain(..)
            .map(|mut slot| {
                transitions.extend(slot.transition(WorkerStatus::Terminating, "pool closing"));
                slot.handle
            })
            .collect();
        inner.publish_transitions(transitions);
        join_all(handles.iter().map(|h| inner.terminate_handle(h))).await;

        inner.transition_status(PoolStatus::Closed, "closed");
        info!(pool = %inner.config.name, workers = handles.len(), "Pool closed");
        Ok(())
    }

    /// Per-worker counters
    pub fn worker_stats(&self) -> Vec<WorkerStatSnapshot> {
        self.inner
            .state
            .lock()
            .workers
            .iter()
            .map(|slot| slot.stats.snapshot(slot.id(), slot.status()))
            .collect()
    }

    /// Snapshot of every worker handle
    pub fn workers(&self) -> Vec<WorkerHandle> {
        self.inner
            .state
            .lock()
            .workers
            .iter()
            .map(|slot| slot.handle.clone())
            .collect()
    }

    /// Move to `status`, publishing `pool.health_changed`
    ///
    /// Returns the previous status when something changed. Terminal states
    /// are left alone.
    pub(crate) fn transition_status(&self, status: PoolStatus, reason: &str) -> Option<PoolStatus> {
        self.inner.transition_status(status, reason)
    }

    /// Close the pool because its backend stopped answering
    ///
    /// Callers targeting it see `BackendUnavailable` from then on.
    /// Its workers leave the pool at once; their handles are released in
    /// the background when a runtime is available.
    pub(crate) fn mark_backend_lost(&self) -> Option<PoolStatus> {
        let reason = "backend unreachable";
        {
            let mut state = self.inner.state.lock();
            state.backend_lost = true;
            state.waiters.clear();
        }
        let previous = self.inner.transition_status(PoolStatus::Closed, reason);

        let mut transitions = Vec::new();
        let handles: Vec<WorkerHandle> = {
            let mut state = self.inner.state.lock();
            let slots = std::mem::take(&mut state.workers);
            let mut handles = Vec::with_capacity(slots.len());
            for mut slot in slots {
                transitions.extend(slot.transition(WorkerStatus::Terminating, reason));
                let aborted = slot.abort_in_flight();
                state.active_tasks = state.active_tasks.saturating_sub(aborted.len());
                handles.push(slot.handle);
            }
            handles
        };
        self.inner.publish_transitions(transitions);
        self.inner.released.notify_waiters();

        if !handles.is_empty() {
            warn!(pool = %self.inner.config.name, workers = handles.len(), "Dropping workers of unreachable backend");
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let inner = Arc::clone(&self.inner);
                runtime.spawn(async move {
                    join_all(handles.iter().map(|h| inner.terminate_handle(h))).await;
                });
            }
        }
        previous
    }
}

impl PoolInner {
    fn closed_error(&self, state: &PoolState) -> OrchestratorError {
        if state.backend_lost {
            OrchestratorError::backend_unavailable(
                self.backend.backend_type().as_str(),
                format!("pool '{}' lost its backend", self.config.name),
            )
        } else {
            OrchestratorError::pool_closed(&self.config.name, state.status)
        }
    }

    fn ensure_accepting(&self, state: &PoolState) -> Result<()> {
        if state.status.accepts_work() {
            Ok(())
        } else {
            Err(self.closed_error(state))
        }
    }

    fn transition_status(&self, status: PoolStatus, reason: &str) -> Option<PoolStatus> {
        let previous = {
            let mut state = self.state.lock();
            let current = state.status;
            let allowed = match current {
                PoolStatus::Closed => false,
                PoolStatus::Draining => status == PoolStatus::Closed,
                _ => current != status,
            };
            if !allowed {
                return None;
            }
            state.status = status;
            current
        };

        self.bus.emit(
            Topic::PoolHealthChanged,
            Some(self.id),
            json!({
                "pool": self.config.name,
                "from": previous,
                "to": status,
                "reason": reason,
            }),
        );
        info!(pool = %self.config.name, from = %previous, to = %status, reason = reason, "Pool status changed");
        Some(previous)
    }

    fn publish_transitions(&self, transitions: Vec<Transition>) {
        for t in transitions {
            let worker = t.worker_id.to_string();
            if t.to == WorkerStatus::Unhealthy {
                warn!(pool = %self.config.name, worker = %worker, reason = t.reason, "Worker unhealthy");
            } else {
                debug!(pool = %self.config.name, worker = %worker, from = %t.from, to = %t.to, "worker status changed");
            }
            metrics::record_worker_transition(&self.config.name, &worker, t.from.as_str(), t.to.as_str());
            self.bus.emit(
                Topic::WorkerStatusChanged,
                Some(self.id),
                json!({
                    "worker_id": t.worker_id,
                    "from": t.from,
                    "to": t.to,
                    "reason": t.reason,
                }),
            );
        }
    }

    async fn acquire(
        self: &Arc<Self>,
        task: &Task,
        wait_limit: Duration,
        token: &CancellationToken,
    ) -> Result<Grant> {
        let limit = self.config.settings.per_worker_concurrency_limit;
        let (seq, mut receiver, grow) = {
            let mut state = self.state.lock();
            self.ensure_accepting(&state)?;

            if let Some((grant, transition)) = state.reserve(limit, task.task_id(), task.deadline()) {
                drop(state);
                self.publish_transitions(transition.into_iter().collect());
                return Ok(grant);
            }

            let capacity = self.config.queue_capacity();
            if state.serviceable() == 0 || state.waiters.len() >= capacity {
                metrics::record_rejection(&self.config.name, state.waiters.len());
                return Err(OrchestratorError::no_idle_worker(
                    &self.config.name,
                    state.waiters.len(),
                    capacity,
                ));
            }

            let grow = self.config.settings.scale_on_demand
                && state.live() + state.pending_spawns < self.config.max_workers;
            if grow {
                state.pending_spawns += 1;
            }

            let seq = state.tick();
            let (sender, receiver) = oneshot::channel();
            state.waiters.push(Waiter {
                priority: task.effective_priority(),
                seq,
                task_id: task.task_id().to_string(),
                deadline: task.deadline(),
                sender,
            });
            debug!(
                pool = %self.config.name,
                task_id = task.task_id(),
                queued = state.waiters.len(),
                "task queued"
            );
            (seq, receiver, grow)
        };

        if grow {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                let (_, failure) = inner.spawn_workers(1).await;
                inner.state.lock().pending_spawns -= 1;
                if let Some(e) = failure {
                    warn!(pool = %inner.config.name, error = %e, "On-demand worker spawn failed");
                }
            });
        }

        let waited = tokio::select! {
            granted = &mut receiver => Waited::Granted(granted),
            _ = tokio::time::sleep(wait_limit) => Waited::TimedOut,
            _ = token.cancelled() => Waited::Cancelled,
        };

        match waited {
            Waited::Granted(Ok(grant)) => Ok(grant),
            Waited::Granted(Err(_)) => Err(self.closed_error(&self.state.lock())),
            Waited::TimedOut => {
                self.abandon_wait(seq, receiver);
                Err(OrchestratorError::timeout(
                    format!("waiting for a worker in pool '{}'", self.config.name),
                    wait_limit,
                ))
            }
            Waited::Cancelled => {
                self.abandon_wait(seq, receiver);
                Err(token.to_error(task.task_id()))
            }
        }
    }

    /// Leave the queue; give back a worker that was handed over meanwhile
    fn abandon_wait(self: &Arc<Self>, seq: u64, mut receiver: oneshot::Receiver<Grant>) {
        let still_queued = {
            let mut state = self.state.lock();
            let before = state.waiters.len();
            state.waiters.retain(|waiter| waiter.seq != seq);
            state.waiters.len() != before
        };
        if !still_queued {
            if let Ok((lease, _)) = receiver.try_recv() {
                self.release(lease, Release::Unused);
            }
        }
    }

    /// Hand free workers to waiters, best first
    fn hand_off(&self, state: &mut PoolState, transitions: &mut Vec<Transition>) {
        if !state.status.accepts_work() {
            return;
        }
        let limit = self.config.settings.per_worker_concurrency_limit;
        while !state.waiters.is_empty() && state.has_capacity(limit) {
            let Some(waiter) = state.waiters.pop() else {
                break;
            };
            if waiter.sender.is_closed() {
                continue;
            }
            let Some((grant, transition)) = state.reserve(limit, &waiter.task_id, waiter.deadline)
            else {
                state.waiters.push(waiter);
                break;
            };
            let lease = grant.0;
            match waiter.sender.send(grant) {
                Ok(()) => transitions.extend(transition),
                Err(_) => state.undo_reserve(lease),
            }
        }
    }

    fn release(&self, lease: Lease, outcome: Release) {
        let mut transitions = Vec::new();
        {
            let mut state = self.state.lock();
            let clock = state.tick();
            let Some(slot) = state.slot_mut(lease.worker_id) else {
                return;
            };
            if slot.in_flight.remove(&lease.dispatch_id).is_none() {
                return;
            }
            match outcome {
                Release::Completed(elapsed) => {
                    slot.stats.increment_completed();
                    slot.stats.add_dispatch_time(elapsed.as_micros() as u64);
                }
                Release::Failed(elapsed) => {
                    slot.stats.increment_failed();
                    slot.stats.add_dispatch_time(elapsed.as_micros() as u64);
                }
                Release::Unused => {}
            }
            slot.last_used = clock;
            transitions.extend(slot.sync_activity());
            state.active_tasks = state.active_tasks.saturating_sub(1);
            self.hand_off(&mut state, &mut transitions);
        }
        self.released.notify_waiters();
        self.publish_transitions(transitions);
    }

    fn attach_abort(&self, lease: Lease, abort: AbortHandle) {
        let mut state = self.state.lock();
        let attached = state
            .slot_mut(lease.worker_id)
            .and_then(|slot| slot.in_flight.get_mut(&lease.dispatch_id))
            .map(|flight| flight.abort = Some(abort.clone()))
            .is_some();
        if !attached && state.slot_mut(lease.worker_id).is_none() {
            // Worker was force-terminated before the dispatch got going
            abort.abort();
        }
    }

    async fn run_dispatch(
        self: &Arc<Self>,
        grant: Grant,
        task: Task,
        limit: Duration,
        token: CancellationToken,
    ) -> Result<TaskResult> {
        let (lease, worker) = grant;
        let task = Arc::new(task);
        let task_id = task.task_id().to_string();
        let queued = self.state.lock().waiters.len();

        self.bus.emit(
            Topic::TaskDispatched,
            Some(self.id),
            json!({"task_id": task_id, "task_type": task.task_type(), "worker_id": worker.id}),
        );
        metrics::record_dispatch(&self.config.name, queued);

        let started_at = Utc::now();
        let span = crate::tracing::dispatch_span(&self.config.name, &worker.id.to_string(), &task);
        let mut dispatch = {
            let inner = Arc::clone(self);
            let worker = worker.clone();
            let task = Arc::clone(&task);
            tokio::spawn(
                async move {
                    let begun = Instant::now();
                    let result = inner.backend.dispatch(&worker, &task).await;
                    let elapsed = begun.elapsed();
                    let outcome = if result.is_ok() {
                        Release::Completed(elapsed)
                    } else {
                        Release::Failed(elapsed)
                    };
                    inner.release(lease, outcome);
                    (result, elapsed)
                }
                .instrument(span),
            )
        };
        self.attach_abort(lease, dispatch.abort_handle());

        let finished = tokio::select! {
            joined = &mut dispatch => Finished::Joined(joined),
            _ = tokio::time::sleep(limit) => Finished::TimedOut,
            _ = token.cancelled() => Finished::Cancelled,
        };

        match finished {
            Finished::Joined(Ok((Ok(output), elapsed))) => {
                self.record_completion(&task_id, worker.id, elapsed, None);
                Ok(TaskResult {
                    task_id,
                    pool_id: self.id,
                    worker_id: worker.id,
                    output,
                    started_at,
                    duration_ms: elapsed.as_millis() as u64,
                })
            }
            Finished::Joined(Ok((Err(e), elapsed))) => {
                self.record_completion(&task_id, worker.id, elapsed, Some(&e));
                Err(e)
            }
            Finished::Joined(Err(join_error)) if join_error.is_cancelled() => {
                let e = OrchestratorError::worker_terminated(worker.id, &task_id, "worker force-terminated");
                self.record_completion(&task_id, worker.id, Duration::ZERO, Some(&e));
                Err(e)
            }
            Finished::Joined(Err(join_error)) => {
                self.force_remove(&[worker.id], "dispatch panicked").await;
                let e = OrchestratorError::task_failed(&task_id, format!("dispatch panicked: {}", join_error));
                self.record_completion(&task_id, worker.id, Duration::ZERO, Some(&e));
                Err(e)
            }
            Finished::TimedOut => {
                self.abandon_dispatch(lease, worker, task_id.clone(), dispatch);
                Err(OrchestratorError::timeout(format!("task {}", task_id), limit))
            }
            Finished::Cancelled => {
                self.abandon_dispatch(lease, worker, task_id.clone(), dispatch);
                Err(token.to_error(&task_id))
            }
        }
    }

    fn record_completion(
        &self,
        task_id: &str,
        worker_id: WorkerId,
        elapsed: Duration,
        error: Option<&OrchestratorError>,
    ) {
        metrics::record_completion(&self.config.name, elapsed, error.is_none());
        self.bus.emit(
            Topic::TaskCompleted,
            Some(self.id),
            json!({
                "task_id": task_id,
                "worker_id": worker_id,
                "success": error.is_none(),
                "duration_ms": elapsed.as_millis() as u64,
                "error_code": error.map(|e| e.code()),
                "error": error.map(|e| e.to_string()),
            }),
        );
    }

    /// Ask the backend to cancel and give the worker `cancel_grace` to stop
    fn abandon_dispatch(
        self: &Arc<Self>,
        lease: Lease,
        worker: WorkerHandle,
        task_id: String,
        dispatch: tokio::task::JoinHandle<(Result<serde_json::Value>, Duration)>,
    ) {
        let inner = Arc::clone(self);
        let grace = self.config.settings.cancel_grace;
        tokio::spawn(async move {
            let begun = Instant::now();
            if let Ok(Err(e)) = tokio::time::timeout(grace, inner.backend.cancel(&worker, &task_id)).await {
                debug!(pool = %inner.config.name, task_id = %task_id, error = %e, "backend cancel failed");
            }
            let remaining = grace.saturating_sub(begun.elapsed());
            if tokio::time::timeout(remaining, dispatch).await.is_err() {
                warn!(
                    pool = %inner.config.name,
                    worker = %lease.worker_id,
                    task_id = %task_id,
                    "Worker did not acknowledge cancellation"
                );
                inner
                    .force_remove(&[lease.worker_id], "cancellation not acknowledged")
                    .await;
                inner.replenish().await;
            }
        });
    }

    async fn terminate_handle(&self, handle: &WorkerHandle) {
        let timeout = self.config.settings.terminate_timeout;
        match tokio::time::timeout(timeout, self.backend.terminate_worker(handle)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(pool = %self.config.name, worker = %handle.id, error = %e, "Worker termination failed")
            }
            Err(_) => {
                warn!(pool = %self.config.name, worker = %handle.id, "Worker termination timed out")
            }
        }
    }

    /// Spawn `count` workers concurrently
    ///
    /// Returns how many joined the pool and the first failure, if any.
    async fn spawn_workers(self: &Arc<Self>, count: usize) -> (usize, Option<OrchestratorError>) {
        if count == 0 {
            return (0, None);
        }
        let timeout = self.config.settings.spawn_timeout;
        let spawns = (0..count).map(|_| {
            tokio::time::timeout(timeout, self.backend.spawn_worker(self.id, &self.config.options))
        });

        let mut failure = None;
        let mut spawned = Vec::new();
        for result in join_all(spawns).await {
            match result {
                Ok(Ok(handle)) => spawned.push(handle),
                Ok(Err(e)) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
                Err(_) => {
                    if failure.is_none() {
                        failure = Some(OrchestratorError::timeout("spawn_worker", timeout));
                    }
                }
            }
        }

        let mut transitions = Vec::new();
        let mut surplus = Vec::new();
        let added = {
            let mut state = self.state.lock();
            let mut added = 0;
            for handle in spawned {
                if !state.status.accepts_work() || state.live() >= self.config.max_workers {
                    surplus.push(handle);
                    continue;
                }
                let clock = state.tick();
                let mut slot = WorkerSlot::new(handle, clock);
                transitions.extend(slot.transition(WorkerStatus::Idle, "spawned"));
                state.workers.push(slot);
                added += 1;
            }
            self.hand_off(&mut state, &mut transitions);
            added
        };
        self.publish_transitions(transitions);
        join_all(surplus.iter().map(|h| self.terminate_handle(h))).await;

        (added, failure)
    }

    /// Retire `count` workers per the scale-down policy
    async fn retire_workers(self: &Arc<Self>, count: usize) -> (usize, usize) {
        let policy = self.config.settings.scale_down_policy;
        let now = Instant::now();
        let mut transitions = Vec::new();

        let (idle_handles, mut pending, wait_until) = {
            let mut state = self.state.lock();
            let mut ranked: Vec<(u8, usize, u64, WorkerId)> = state
                .workers
                .iter()
                .filter(|slot| slot.status() != WorkerStatus::Terminating)
                .map(|slot| {
                    let rank = match slot.status() {
                        WorkerStatus::Unhealthy => 1,
                        _ if slot.in_flight.is_empty() => 0,
                        _ => 2,
                    };
                    (rank, slot.in_flight.len(), slot.last_used, slot.id())
                })
                .collect();
            ranked.sort();

            let mut idle_handles = Vec::new();
            let mut pending = Vec::new();
            let mut wait_until = now;
            for (_, _, _, worker_id) in ranked.into_iter().take(count) {
                let Some(slot) = state.slot_mut(worker_id) else {
                    continue;
                };
                transitions.extend(slot.transition(WorkerStatus::Terminating, "scale down"));
                if slot.in_flight.is_empty() {
                    if let Some(slot) = state.take_slot(worker_id) {
                        idle_handles.push(slot.handle);
                    }
                    continue;
                }
                let wait = match policy {
                    ScaleDownPolicy::Immediate => Duration::ZERO,
                    ScaleDownPolicy::Grace { period } => period,
                    ScaleDownPolicy::WaitForDeadline { fallback } => slot
                        .in_flight
                        .values()
                        .map(|flight| match flight.deadline {
                            Some(deadline) => (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO),
                            None => fallback,
                        })
                        .max()
                        .unwrap_or(fallback),
                };
                wait_until = wait_until.max(now + wait);
                pending.push(worker_id);
            }
            (idle_handles, pending, wait_until)
        };
        self.publish_transitions(transitions);

        let mut terminated = idle_handles.len();
        join_all(idle_handles.iter().map(|h| self.terminate_handle(h))).await;

        let mut forced = 0;
        while !pending.is_empty() {
            let notified = self.released.notified();
            let drained: Vec<WorkerHandle> = {
                let mut state = self.state.lock();
                let mut drained = Vec::new();
                pending.retain(|worker_id| {
                    let idle = state
                        .slot_mut(*worker_id)
                        .map_or(true, |slot| slot.in_flight.is_empty());
                    if idle {
                        if let Some(slot) = state.take_slot(*worker_id) {
                            drained.push(slot.handle);
                        }
                    }
                    !idle
                });
                drained
            };
            terminated += drained.len();
            join_all(drained.iter().map(|h| self.terminate_handle(h))).await;

            if pending.is_empty() {
                break;
            }
            let now = Instant::now();
            if now >= wait_until {
                forced = self.force_remove(&pending, "scale-down grace elapsed").await;
                break;
            }
            let _ = tokio::time::timeout(wait_until - now, notified).await;
        }

        if !pending.is_empty() || forced > 0 {
            self.released.notify_waiters();
        }
        (terminated, forced)
    }

    /// Remove workers now, failing their in-flight tasks
    ///
    /// Returns how many workers were removed.
    async fn force_remove(self: &Arc<Self>, worker_ids: &[WorkerId], reason: &'static str) -> usize {
        let mut transitions = Vec::new();
        let removed: Vec<(WorkerHandle, Vec<String>)> = {
            let mut state = self.state.lock();
            let mut removed = Vec::new();
            for worker_id in worker_ids {
                let Some(mut slot) = state.take_slot(*worker_id) else {
                    continue;
                };
                transitions.extend(slot.transition(WorkerStatus::Unhealthy, reason));
                transitions.extend(slot.transition(WorkerStatus::Terminating, reason));
                let aborted = slot.abort_in_flight();
                state.active_tasks = state.active_tasks.saturating_sub(aborted.len());
                removed.push((slot.handle, aborted));
            }
            removed
        };
        self.publish_transitions(transitions);
        self.released.notify_waiters();

        for (handle, aborted) in &removed {
            if !aborted.is_empty() {
                error!(
                    pool = %self.config.name,
                    worker = %handle.id,
                    tasks = ?aborted,
                    reason = reason,
                    "Force-terminating worker with tasks in flight"
                );
                metrics::record_forced_termination(&self.config.name, &handle.id.to_string(), aborted.len());
            }
        }
        join_all(removed.iter().map(|(h, _)| self.terminate_handle(h))).await;
        removed.len()
    }

    /// Spawn replacements up to `min_workers`
    async fn replenish(self: &Arc<Self>) {
        // A running scale call owns the worker count
        let Ok(_serialized) = self.scale_lock.try_lock() else {
            return;
        };
        let missing = {
            let state = self.state.lock();
            if !state.status.accepts_work() {
                return;
            }
            self.config.min_workers.saturating_sub(state.live() + state.pending_spawns)
        };
        if missing > 0 {
            info!(pool = %self.config.name, missing = missing, "Replenishing workers");
            let (_, failure) = self.spawn_workers(missing).await;
            if let Some(e) = failure {
                warn!(pool = %self.config.name, error = %e, "Replenishment failed");
            }
        }
    }
}
