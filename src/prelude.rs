//! Convenient re-exports for common types and traits

pub use crate::backend::{BackendFactory, BackendType, PoolBackend, TaskExecutor};
pub use crate::bus::{Event, MessageBus, Topic};
pub use crate::core::{
    CancellationReason, CancellationToken, OrchestratorError, Outcome, PoolId, Priority, Result,
    Task, TaskResult,
};
pub use crate::distribution::{DistributionReport, DistributionStrategy, TaskReducer, TaskSplitter};
pub use crate::health::{HealthSnapshot, SystemHealth, SystemStatus};
pub use crate::manager::{ManagerConfig, PoolManager, RebalanceConfig};
pub use crate::pool::{Pool, PoolConfig, PoolHealth, PoolSettings, PoolStatus};
pub use crate::registry::{DiscoverySource, PoolRegistry};
pub use crate::routing::{RoutingDecision, RoutingStrategy};
