//! Core types shared by every component

pub mod cancellation;
pub(crate) mod duration_millis;
pub mod error;
pub mod id;
pub mod priority;
pub mod task;

pub use cancellation::{CancellationReason, CancellationToken};
pub use error::{OrchestratorError, PartialFailureReport, Result};
pub use id::{PoolId, WorkerId};
pub use priority::Priority;
pub use task::{Outcome, TargetOutcome, Task, TaskResult};
