//! Health aggregation
//!
//! The [`HealthMonitor`] polls every pool in the background and publishes an
//! immutable [`HealthSnapshot`]. Routers read the snapshot and never touch
//! pool state themselves.

mod monitor;
mod snapshot;

pub use monitor::{HealthMonitor, MonitorConfig, PollReport, StatusChange};
pub use snapshot::{HealthSnapshot, SystemHealth, SystemStatus};

#[cfg(test)]
pub(crate) use snapshot::tests::pool as synthetic_pool;
