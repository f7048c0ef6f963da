//! # Pool Orchestrator
//!
//! Orchestrates pools of task-executing workers across heterogeneous backends
//! and routes work to the best pool.
//!
//! ## Features
//!
//! - **Pools**: bounded worker sets with LRU dispatch, a priority wait queue and backpressure
//! - **Backends**: local tokio workers, delegated remote endpoints and cluster slots behind one trait
//! - **Routing**: least-loaded, round-robin, random and affinity strategies over healthy pools
//! - **Distribution**: broadcast, map-reduce, hedged and chunked fan-out with per-target outcomes
//! - **Self-healing**: health probes, forced termination of stuck workers and replenishment
//! - **Events**: topic-based message bus for lifecycle and state-change events
//!
//! ## Quick Start
//!
//! ```rust
//! use pool_orchestrator::prelude::*;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<()> {
//! let manager = PoolManager::new(ManagerConfig::default())?;
//! manager
//!     .register(PoolConfig::new("p1", BackendType::Local).with_workers(1, 3))
//!     .await?;
//! manager
//!     .register(PoolConfig::new("p2", BackendType::Local).with_workers(1, 3))
//!     .await?;
//!
//! // Route one task to the least loaded pool
//! let task = Task::new("echo", json!({"n": 1}));
//! let result = manager.submit(task, Some(RoutingStrategy::LeastLoaded)).await?;
//! assert_eq!(result.output, json!({"n": 1}));
//!
//! // Broadcast a copy to every healthy pool
//! let task = Task::new("echo", json!({"ping": true}));
//! let report = manager
//!     .distribute(&task, DistributionStrategy::Broadcast, None, None)
//!     .await?;
//! assert_eq!(report.outcomes.len(), 2);
//!
//! manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Map-Reduce
//!
//! ```rust
//! use pool_orchestrator::prelude::*;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<()> {
//! # let manager = PoolManager::new(ManagerConfig::default())?;
//! # manager.register(PoolConfig::new("p1", BackendType::Local).with_workers(1, 2)).await?;
//! let task = Task::with_id("job-1", "echo", json!({"items": [1, 2, 3]}));
//! let report = manager
//!     .distribute(&task, DistributionStrategy::MapReduce, Some("items"), Some("sum"))
//!     .await?;
//! assert_eq!(report.reduced, Some(json!(6)));
//! # manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Cancellation
//!
//! ```rust
//! use pool_orchestrator::prelude::*;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<()> {
//! # let manager = PoolManager::new(ManagerConfig::default())?;
//! # let id = manager.register(PoolConfig::new("p1", BackendType::Local)).await?;
//! let pool = manager.registry().get(id)?;
//! let token = CancellationToken::new();
//! token.cancel();
//!
//! let err = pool
//!     .execute_with_token(Task::new("echo", json!(null)), token)
//!     .await
//!     .unwrap_err();
//! assert_eq!(err.code(), "CANCELLED");
//! # manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod bus;
#[cfg(feature = "cli")]
pub mod cli;
pub mod core;
pub mod distribution;
pub mod health;
pub mod manager;
pub mod pool;
pub mod prelude;
pub mod registry;
pub mod routing;
pub mod tracing;

pub use crate::core::{CancellationToken, OrchestratorError, PoolId, Result, Task, TaskResult};
pub use manager::{ManagerConfig, PoolManager};
