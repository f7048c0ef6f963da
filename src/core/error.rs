//! Error types for the orchestrator

use crate::core::task::TargetOutcome;

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Per-target report carried by [`OrchestratorError::PartialFailure`]
#[derive(Debug, Clone, serde::Serialize)]
pub struct PartialFailureReport {
    /// Operation that fanned out (`broadcast`, `map_reduce`, ...)
    pub operation: String,
    /// Indices of targets that succeeded
    pub completed: Vec<usize>,
    /// Indices of targets that failed, timed out or were cancelled
    pub failed: Vec<usize>,
    /// Every target outcome, in plan order
    pub outcomes: Vec<TargetOutcome>,
}

/// Errors that can occur while orchestrating pools
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum OrchestratorError {
    /// A pool with this name is already registered
    #[error("Pool name '{name}' is already registered")]
    DuplicateName {
        /// Conflicting pool name
        name: String,
    },

    /// Pool lookup failed
    #[error("Pool '{pool}' not found")]
    PoolNotFound {
        /// Identifier or name used for the lookup
        pool: String,
    },

    /// No pool is currently eligible for routing
    #[error("No eligible pool ({registered} registered, none healthy)")]
    NoEligiblePool {
        /// Number of pools registered at decision time
        registered: usize,
    },

    /// Pool has no idle worker and its wait queue is full
    #[error("Pool '{pool_name}' has no idle worker ({queued}/{capacity} tasks queued)")]
    NoIdleWorker {
        /// Name of the saturated pool
        pool_name: String,
        /// Tasks currently waiting
        queued: usize,
        /// Wait-queue capacity
        capacity: usize,
    },

    /// Worker was force-terminated while running the task
    #[error("Worker {worker_id} terminated while running task {task_id}: {reason}")]
    WorkerTerminated {
        /// Terminated worker
        worker_id: String,
        /// Task that was in flight
        task_id: String,
        /// Why the worker was terminated
        reason: String,
    },

    /// Fan-out finished with at least one failed target
    #[error(
        "Partial failure in {}: {}/{} targets succeeded",
        .0.operation,
        .0.completed.len(),
        .0.outcomes.len()
    )]
    PartialFailure(Box<PartialFailureReport>),

    /// Operation exceeded its time bound
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// What timed out
        operation: String,
        /// Bound in milliseconds
        timeout_ms: u64,
    },

    /// Backend cannot be reached
    #[error("Backend '{backend}' unavailable: {message}")]
    BackendUnavailable {
        /// Backend type or endpoint
        backend: String,
        /// Error message
        message: String,
    },

    /// Invalid configuration with parameter
    #[error("Invalid configuration for '{parameter}': {message}")]
    InvalidConfig {
        /// Configuration parameter name
        parameter: String,
        /// Error message
        message: String,
    },

    /// Task payload could not be parsed or is unusable
    #[error("Invalid task: {message}")]
    InvalidTask {
        /// Error message
        message: String,
    },

    /// Task was cancelled with reason
    #[error("Task cancelled (task_id: {task_id}): {reason}")]
    Cancelled {
        /// ID of the cancelled task
        task_id: String,
        /// Reason for cancellation
        reason: String,
    },

    /// Worker reported a failure for the task
    #[error("Task execution failed (task_id: {task_id}): {message}")]
    TaskFailed {
        /// ID of the failed task
        task_id: String,
        /// Error message
        message: String,
    },

    /// Pool is draining or closed
    #[error("Pool '{pool_name}' is {status}")]
    PoolClosed {
        /// Name of the pool
        pool_name: String,
        /// Status at rejection time
        status: String,
    },

    /// Discovery source failed
    #[error("Discovery from '{source_name}' failed: {message}")]
    Discovery {
        /// Source that failed
        source_name: String,
        /// Error message
        message: String,
    },
}

impl OrchestratorError {
    /// Create a duplicate name error
    pub fn duplicate_name(name: impl Into<String>) -> Self {
        OrchestratorError::DuplicateName { name: name.into() }
    }

    /// Create a pool not found error
    pub fn pool_not_found(pool: impl Into<String>) -> Self {
        OrchestratorError::PoolNotFound { pool: pool.into() }
    }

    /// Create a no eligible pool error
    pub fn no_eligible_pool(registered: usize) -> Self {
        OrchestratorError::NoEligiblePool { registered }
    }

    /// Create a backpressure error
    pub fn no_idle_worker(pool_name: impl Into<String>, queued: usize, capacity: usize) -> Self {
        OrchestratorError::NoIdleWorker {
            pool_name: pool_name.into(),
            queued,
            capacity,
        }
    }

    /// Create a worker terminated error
    pub fn worker_terminated(
        worker_id: impl ToString,
        task_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        OrchestratorError::WorkerTerminated {
            worker_id: worker_id.to_string(),
            task_id: task_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a partial failure error
    pub fn partial_failure(report: PartialFailureReport) -> Self {
        OrchestratorError::PartialFailure(Box::new(report))
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        OrchestratorError::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Create a backend unavailable error
    pub fn backend_unavailable(backend: impl Into<String>, message: impl Into<String>) -> Self {
        OrchestratorError::BackendUnavailable {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        OrchestratorError::InvalidConfig {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create an invalid task error
    pub fn invalid_task(message: impl Into<String>) -> Self {
        OrchestratorError::InvalidTask {
            message: message.into(),
        }
    }

    /// Create a cancelled error
    pub fn cancelled(task_id: impl Into<String>, reason: impl Into<String>) -> Self {
        OrchestratorError::Cancelled {
            task_id: task_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a task failed error
    pub fn task_failed(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        OrchestratorError::TaskFailed {
            task_id: task_id.into(),
            message: message.into(),
        }
    }

    /// Create a pool closed error
    pub fn pool_closed(pool_name: impl Into<String>, status: impl ToString) -> Self {
        OrchestratorError::PoolClosed {
            pool_name: pool_name.into(),
            status: status.to_string(),
        }
    }

    /// Create a discovery error
    pub fn discovery(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        OrchestratorError::Discovery {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Stable identifier for this error kind
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::DuplicateName { .. } => "DUPLICATE_NAME",
            OrchestratorError::PoolNotFound { .. } => "POOL_NOT_FOUND",
            OrchestratorError::NoEligiblePool { .. } => "NO_ELIGIBLE_POOL",
            OrchestratorError::NoIdleWorker { .. } => "NO_IDLE_WORKER",
            OrchestratorError::WorkerTerminated { .. } => "WORKER_TERMINATED",
            OrchestratorError::PartialFailure(_) => "PARTIAL_FAILURE",
            OrchestratorError::Timeout { .. } => "TIMEOUT",
            OrchestratorError::BackendUnavailable { .. } => "BACKEND_UNAVAILABLE",
            OrchestratorError::InvalidConfig { .. } => "INVALID_CONFIG",
            OrchestratorError::InvalidTask { .. } => "INVALID_TASK",
            OrchestratorError::Cancelled { .. } => "CANCELLED",
            OrchestratorError::TaskFailed { .. } => "TASK_FAILED",
            OrchestratorError::PoolClosed { .. } => "POOL_CLOSED",
            OrchestratorError::Discovery { .. } => "DISCOVERY_FAILED",
        }
    }

    /// Process exit code used by the command line surface
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::DuplicateName { .. } => 1,
            OrchestratorError::PoolNotFound { .. } => 2,
            OrchestratorError::NoEligiblePool { .. } => 3,
            OrchestratorError::NoIdleWorker { .. } => 4,
            OrchestratorError::WorkerTerminated { .. } => 5,
            OrchestratorError::PartialFailure(_) => 6,
            OrchestratorError::Timeout { .. } => 7,
            OrchestratorError::BackendUnavailable { .. } => 8,
            OrchestratorError::InvalidConfig { .. } => 9,
            OrchestratorError::InvalidTask { .. } => 10,
            OrchestratorError::Cancelled { .. } => 11,
            OrchestratorError::TaskFailed { .. } => 12,
            OrchestratorError::PoolClosed { .. } => 13,
            OrchestratorError::Discovery { .. } => 14,
        }
    }

    /// Partial failure report, if this is a fan-out failure
    pub fn partial_report(&self) -> Option<&PartialFailureReport> {
        match self {
            OrchestratorError::PartialFailure(report) => Some(report),
            _ => None,
        }
    }
}
