//! Worker handles and the worker lifecycle state machine
//!
//! ```text
//! starting -> idle <-> busy
//!               \      /
//!              unhealthy -> terminating -> (gone)
//! ```
//!
//! Any live state may move straight to `terminating` (scale-down, close).
//! `unhealthy` never returns to `idle`: the pool replaces the worker instead.

use crate::core::{PoolId, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::AbortHandle;

/// Lifecycle state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Being created by the backend
    Starting,
    /// Ready for work
    Idle,
    /// Running at least one task
    Busy,
    /// Failed a probe or a cancellation; never reused
    Unhealthy,
    /// Being torn down
    Terminating,
}

impl WorkerStatus {
    /// Whether `self -> next` is a legal lifecycle step
    pub fn can_transition_to(self, next: WorkerStatus) -> bool {
        use WorkerStatus::*;
        matches!(
            (self, next),
            (Starting, Idle)
                | (Starting, Unhealthy)
                | (Starting, Terminating)
                | (Idle, Busy)
                | (Idle, Unhealthy)
                | (Idle, Terminating)
                | (Busy, Idle)
                | (Busy, Unhealthy)
                | (Busy, Terminating)
                | (Unhealthy, Terminating)
        )
    }

    /// Whether the worker may receive new work
    pub fn is_serviceable(self) -> bool {
        matches!(self, WorkerStatus::Idle | WorkerStatus::Busy)
    }

    /// Lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Unhealthy => "unhealthy",
            WorkerStatus::Terminating => "terminating",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution unit owned by exactly one pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHandle {
    /// Worker identifier
    pub id: WorkerId,
    /// Owning pool (non-owning back reference)
    pub pool_id: PoolId,
    /// Current lifecycle state
    pub status: WorkerStatus,
    /// Task being run, if any
    pub current_task_id: Option<String>,
    /// Backend-specific placement data (node, endpoint, ...)
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl WorkerHandle {
    /// New handle in the `starting` state
    pub fn new(pool_id: PoolId) -> Self {
        Self {
            id: WorkerId::new(),
            pool_id,
            status: WorkerStatus::Starting,
            current_task_id: None,
            attributes: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Attach a backend attribute
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Look up a backend attribute
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Statistics for a worker
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Total number of tasks completed successfully
    pub tasks_completed: AtomicU64,
    /// Total number of tasks that failed
    pub tasks_failed: AtomicU64,
    /// Total time spent in the backend (microseconds)
    pub total_dispatch_time_us: AtomicU64,
}

impl WorkerStats {
    /// Create new worker statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment tasks completed counter
    pub fn increment_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment tasks failed counter
    pub fn increment_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Add dispatch time
    pub fn add_dispatch_time(&self, microseconds: u64) {
        self.total_dispatch_time_us
            .fetch_add(microseconds, Ordering::Relaxed);
    }

    /// Get average dispatch time per finished task in microseconds
    pub fn get_average_dispatch_time_us(&self) -> f64 {
        let total = self.total_dispatch_time_us.load(Ordering::Relaxed);
        let count = self.tasks_completed.load(Ordering::Relaxed)
            + self.tasks_failed.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    /// Point-in-time copy
    pub fn snapshot(&self, worker_id: WorkerId, status: WorkerStatus) -> WorkerStatSnapshot {
        WorkerStatSnapshot {
            worker_id,
            status,
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            average_dispatch_time_us: self.get_average_dispatch_time_us(),
        }
    }
}

/// Serializable copy of [`WorkerStats`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStatSnapshot {
    /// Worker the counters belong to
    pub worker_id: WorkerId,
    /// Status when sampled
    pub status: WorkerStatus,
    /// Tasks completed successfully
    pub tasks_completed: u64,
    /// Tasks that failed
    pub tasks_failed: u64,
    /// Mean backend time per finished task
    pub average_dispatch_time_us: f64,
}

/// A dispatch currently running on a worker
#[derive(Debug)]
pub(crate) struct InFlight {
    pub(crate) task_id: String,
    pub(crate) deadline: Option<DateTime<Utc>>,
    pub(crate) abort: Option<AbortHandle>,
}

/// Pool-side bookkeeping for one worker
#[derive(Debug)]
pub(crate) struct WorkerSlot {
    pub(crate) handle: WorkerHandle,
    /// Keyed by dispatch id
    pub(crate) in_flight: HashMap<u64, InFlight>,
    /// Logical clock of the last release, for LRU selection
    pub(crate) last_used: u64,
    pub(crate) probe_failures: u32,
    pub(crate) stats: Arc<WorkerStats>,
}

/// A validated status change
#[derive(Debug, Clone)]
pub(crate) struct Transition {
    pub(crate) worker_id: WorkerId,
    pub(crate) from: WorkerStatus,
    pub(crate) to: WorkerStatus,
    pub(crate) reason: &'static str,
}

impl WorkerSlot {
    pub(crate) fn new(handle: WorkerHandle, last_used: u64) -> Self {
        Self {
            handle,
            in_flight: HashMap::new(),
            last_used,
            probe_failures: 0,
            stats: Arc::new(WorkerStats::new()),
        }
    }

    pub(crate) fn id(&self) -> WorkerId {
        self.handle.id
    }

    pub(crate) fn status(&self) -> WorkerStatus {
        self.handle.status
    }

    /// Whether another dispatch fits on this worker
    pub(crate) fn has_capacity(&self, limit: usize) -> bool {
        self.status().is_serviceable() && self.in_flight.len() < limit
    }

    /// Apply `next` if the lifecycle allows it
    pub(crate) fn transition(
        &mut self,
        next: WorkerStatus,
        reason: &'static str,
    ) -> Option<Transition> {
        let from = self.handle.status;
        if from == next || !from.can_transition_to(next) {
            return None;
        }
        self.handle.status = next;
        Some(Transition {
            worker_id: self.handle.id,
            from,
            to: next,
            reason,
        })
    }

    /// Refresh `current_task_id` and idle/busy from the in-flight set
    pub(crate) fn sync_activity(&mut self) -> Option<Transition> {
        self.handle.current_task_id = self
            .in_flight
            .iter()
            .min_by_key(|(id, _)| **id)
            .map(|(_, f)| f.task_id.clone());
        match (self.handle.status, self.in_flight.is_empty()) {
            (WorkerStatus::Busy, true) => self.transition(WorkerStatus::Idle, "released"),
            (WorkerStatus::Idle, false) => self.transition(WorkerStatus::Busy, "dispatched"),
            _ => None,
        }
    }

    /// Abort every in-flight dispatch, returning the task ids
    pub(crate) fn abort_in_flight(&mut self) -> Vec<String> {
        self.in_flight
            .drain()
            .map(|(_, flight)| {
                if let Some(abort) = flight.abort {
                    abort.abort();
                }
                flight.task_id
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        use WorkerStatus::*;
        assert!(Starting.can_transition_to(Idle));
        assert!(Idle.can_transition_to(Busy));
        assert!(Busy.can_transition_to(Idle));
        assert!(Busy.can_transition_to(Unhealthy));
        assert!(Unhealthy.can_transition_to(Terminating));

        assert!(!Unhealthy.can_transition_to(Idle));
        assert!(!Terminating.can_transition_to(Idle));
        assert!(!Starting.can_transition_to(Busy));
    }

    #[test]
    fn test_slot_tracks_activity() {
        let mut slot = WorkerSlot::new(WorkerHandle::new(PoolId::new()), 0);
        assert!(slot.transition(WorkerStatus::Idle, "spawned").is_some());
        assert!(slot.has_capacity(1));

        slot.in_flight.insert(
            1,
            InFlight {
                task_id: "t1".into(),
                deadline: None,
                abort: None,
            },
        );
        let change = slot.sync_activity().unwrap();
        assert_eq!((change.from, change.to), (WorkerStatus::Idle, WorkerStatus::Busy));
        assert_eq!(slot.handle.current_task_id.as_deref(), Some("t1"));
        assert!(!slot.has_capacity(1));
        assert!(slot.has_capacity(2));

        slot.in_flight.clear();
        let change = slot.sync_activity().unwrap();
        assert_eq!(change.to, WorkerStatus::Idle);
        assert_eq!(slot.handle.current_task_id, None);
    }

    #[test]
    fn test_unhealthy_slot_is_not_serviceable() {
        let mut slot = WorkerSlot::new(WorkerHandle::new(PoolId::new()), 0);
        slot.transition(WorkerStatus::Idle, "spawned");
        slot.transition(WorkerStatus::Unhealthy, "probe failed");
        assert!(!slot.has_capacity(4));
        assert!(slot.transition(WorkerStatus::Idle, "recovered").is_none());
    }

    #[test]
    fn test_worker_stats_average() {
        let stats = WorkerStats::new();
        assert_eq!(stats.get_average_dispatch_time_us(), 0.0);
        stats.increment_completed();
        stats.increment_failed();
        stats.add_dispatch_time(300);
        let snap = stats.snapshot(WorkerId::new(), WorkerStatus::Idle);
        assert_eq!(snap.tasks_completed, 1);
        assert_eq!(snap.tasks_failed, 1);
        assert_eq!(snap.average_dispatch_time_us, 150.0);
    }
}
