//! Pools and their workers

pub mod config;
#[allow(clippy::module_inception)]
pub mod pool;
pub mod worker;

pub use config::{PoolConfig, PoolSettings, ScaleDownPolicy};
pub use pool::{Pool, PoolHealth, PoolStatus, ScaleReport};
pub use worker::{WorkerHandle, WorkerStatSnapshot, WorkerStats, WorkerStatus};
