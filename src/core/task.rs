//! Tasks, results and per-target outcomes

use crate::core::id::{PoolId, WorkerId};
use crate::core::priority::Priority;
use crate::core::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Unit of work routed to a pool
///
/// Tasks are immutable once built; the payload is opaque to the orchestrator
/// and passed to the backend unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    task_id: String,
    task_type: String,
    payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    affinity_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deadline: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a task with a generated id
    pub fn new(task_type: impl Into<String>, payload: Value) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), task_type, payload)
    }

    /// Create a task with a caller-supplied id
    pub fn with_id(task_id: impl Into<String>, task_type: impl Into<String>, payload: Value) -> Self {
        Self {
            task_id: task_id.into(),
            task_type: task_type.into(),
            payload,
            affinity_key: None,
            priority: None,
            deadline: None,
        }
    }

    /// Parse the wire payload format
    ///
    /// The object must carry string `task_id` and `task_type`; `affinity_key`,
    /// `priority` (integer or level name) and `deadline` (RFC 3339) are
    /// optional. The whole object becomes the task payload.
    pub fn from_payload(payload: Value) -> Result<Self> {
        let object = payload
            .as_object()
            .ok_or_else(|| OrchestratorError::invalid_task("payload must be a JSON object"))?;

        let required = |field: &str| -> Result<String> {
            match object.get(field) {
                Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
                Some(_) => Err(OrchestratorError::invalid_task(format!(
                    "'{}' must be a non-empty string",
                    field
                ))),
                None => Err(OrchestratorError::invalid_task(format!(
                    "missing required field '{}'",
                    field
                ))),
            }
        };
        let task_id = required("task_id")?;
        let task_type = required("task_type")?;

        let affinity_key = match object.get("affinity_key") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => {
                return Err(OrchestratorError::invalid_task(
                    "'affinity_key' must be a string",
                ))
            }
        };

        let priority = match object.get("priority") {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => match n.as_i64() {
                Some(v) => Some(Priority::from_ordinal(v)),
                None => {
                    return Err(OrchestratorError::invalid_task(
                        "'priority' must be an integer",
                    ))
                }
            },
            Some(Value::String(s)) => Some(s.parse::<Priority>()?),
            Some(_) => {
                return Err(OrchestratorError::invalid_task(
                    "'priority' must be an integer or level name",
                ))
            }
        };

        let deadline = match object.get("deadline") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(
                DateTime::parse_from_rfc3339(s)
                    .map_err(|e| {
                        OrchestratorError::invalid_task(format!("invalid deadline '{}': {}", s, e))
                    })?
                    .with_timezone(&Utc),
            ),
            Some(_) => {
                return Err(OrchestratorError::invalid_task(
                    "'deadline' must be an RFC 3339 string",
                ))
            }
        };

        Ok(Self {
            task_id,
            task_type,
            affinity_key,
            priority,
            deadline,
            payload,
        })
    }

    /// Set the affinity key
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_affinity_key(mut self, key: impl Into<String>) -> Self {
        self.affinity_key = Some(key.into());
        self
    }

    /// Set the priority
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set an absolute deadline
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the deadline relative to now
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        let deadline = Utc::now()
            .checked_add_signed(timeout)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.with_deadline(deadline)
    }

    /// Task identifier
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Task type label
    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    /// Opaque payload
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Affinity key, if any
    pub fn affinity_key(&self) -> Option<&str> {
        self.affinity_key.as_deref()
    }

    /// Priority as submitted
    pub fn priority(&self) -> Option<Priority> {
        self.priority
    }

    /// Priority used for queue ordering
    pub fn effective_priority(&self) -> Priority {
        self.priority.unwrap_or_default()
    }

    /// Absolute deadline, if any
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    /// Time left until the deadline
    ///
    /// `None` when the task has no deadline, `Some(ZERO)` once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|deadline| {
            (deadline - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
        })
    }

    /// Whether the deadline has passed
    pub fn is_expired(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }

    /// Derive the subtask for chunk `index`
    ///
    /// The subtask id is `"{task_id}#{index}"`; type, affinity, priority and
    /// deadline are inherited.
    pub fn subtask(&self, index: usize, payload: Value) -> Task {
        Task {
            task_id: format!("{}#{}", self.task_id, index),
            task_type: self.task_type.clone(),
            payload,
            affinity_key: self.affinity_key.clone(),
            priority: self.priority,
            deadline: self.deadline,
        }
    }
}

/// Result of one successful dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Task that produced the output
    pub task_id: String,
    /// Pool that ran it
    pub pool_id: PoolId,
    /// Worker that ran it
    pub worker_id: WorkerId,
    /// Backend output
    pub output: Value,
    /// When the worker started the task
    pub started_at: DateTime<Utc>,
    /// Wall time spent in the backend
    pub duration_ms: u64,
}

/// What happened to one target of a fan-out
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// Dispatch succeeded
    Succeeded {
        /// Result returned by the pool
        result: TaskResult,
    },
    /// Dispatch failed
    Failed {
        /// Stable error code
        code: String,
        /// Error message
        message: String,
    },
    /// Still running when the overall timeout elapsed
    TimedOut,
    /// Cancelled after a sibling failed
    Cancelled,
}

impl Outcome {
    /// Build a failure outcome from an error
    pub fn from_error(error: &OrchestratorError) -> Self {
        Outcome::Failed {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }

    /// Whether the target succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded { .. })
    }
}

/// One `(pool, subtask)` target and its outcome
#[derive(Debug, Clone, Serialize)]
pub struct TargetOutcome {
    /// Position in the plan (chunk order)
    pub index: usize,
    /// Target pool
    pub pool_id: PoolId,
    /// Target pool name
    pub pool_name: String,
    /// Subtask or copy id
    pub task_id: String,
    /// What happened
    pub outcome: Outcome,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_payload_minimal() {
        let task = Task::from_payload(json!({"task_id": "t1", "task_type": "echo"})).unwrap();
        assert_eq!(task.task_id(), "t1");
        assert_eq!(task.task_type(), "echo");
        assert_eq!(task.affinity_key(), None);
        assert_eq!(task.effective_priority(), Priority::Normal);
        assert_eq!(task.remaining(), None);
        assert_eq!(task.payload()["task_id"], "t1");
    }

    #[test]
    fn test_from_payload_optional_fields() {
        let task = Task::from_payload(json!({
            "task_id": "t1",
            "task_type": "index",
            "affinity_key": "tenant-a",
            "priority": "critical",
            "deadline": "2999-01-01T00:00:00Z",
            "items": [1, 2, 3]
        }))
        .unwrap();
        assert_eq!(task.affinity_key(), Some("tenant-a"));
        assert_eq!(task.priority(), Some(Priority::Critical));
        assert!(task.remaining().unwrap() > Duration::from_secs(3600));

        let numeric = Task::from_payload(json!({
            "task_id": "t2", "task_type": "x", "priority": 8
        }))
        .unwrap();
        assert_eq!(numeric.priority(), Some(Priority::High));
    }

    #[test]
    fn test_from_payload_rejects_missing_fields() {
        let err = Task::from_payload(json!({"task_type": "echo"})).unwrap_err();
        assert_eq!(err.code(), "INVALID_TASK");
        assert!(err.to_string().contains("task_id"));

        assert!(Task::from_payload(json!({"task_id": "t", "task_type": 3})).is_err());
        assert!(Task::from_payload(json!([1, 2])).is_err());
        assert!(Task::from_payload(json!({
            "task_id": "t", "task_type": "x", "deadline": "tomorrow"
        }))
        .is_err());
    }

    #[test]
    fn test_expired_deadline() {
        let task = Task::new("echo", json!(null)).with_deadline(Utc::now() - chrono::Duration::seconds(1));
        assert!(task.is_expired());
        assert_eq!(task.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_subtask_inherits_metadata() {
        let task = Task::with_id("job", "sum", json!({"items": [1, 2]}))
            .with_affinity_key("k")
            .with_priority(Priority::High);
        let sub = task.subtask(3, json!(2));
        assert_eq!(sub.task_id(), "job#3");
        assert_eq!(sub.affinity_key(), Some("k"));
        assert_eq!(sub.priority(), Some(Priority::High));
        assert_eq!(sub.payload(), &json!(2));
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let outcome = Outcome::Failed {
            code: "TASK_FAILED".into(),
            message: "boom".into(),
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(serde_json::to_value(Outcome::TimedOut).unwrap()["status"], "timed_out");
    }
}
