//! Immutable health snapshots

use crate::core::PoolId;
use crate::pool::{PoolHealth, PoolStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// Every pool's health at one instant
///
/// Snapshots are never mutated; the monitor swaps in a new `Arc` instead.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
    #[serde(skip)]
    captured: Instant,
    /// Pools in registration order
    pub pools: Vec<PoolHealth>,
}

impl HealthSnapshot {
    /// Snapshot of `pools` taken now
    pub fn capture(pools: Vec<PoolHealth>) -> Self {
        Self {
            taken_at: Utc::now(),
            captured: Instant::now(),
            pools,
        }
    }

    /// Snapshot with no pools
    pub fn empty() -> Self {
        Self::capture(Vec::new())
    }

    /// Time since capture
    pub fn age(&self) -> Duration {
        self.captured.elapsed()
    }

    /// Pools routers may pick, in registration order
    pub fn eligible(&self) -> Vec<&PoolHealth> {
        self.pools
            .iter()
            .filter(|pool| pool.status.is_eligible())
            .collect()
    }

    /// Health of one pool
    pub fn get(&self, pool_id: PoolId) -> Option<&PoolHealth> {
        self.pools.iter().find(|pool| pool.pool_id == pool_id)
    }

    /// Aggregate view
    pub fn system_health(&self) -> SystemHealth {
        let mut health = SystemHealth {
            status: SystemStatus::Empty,
            total_pools: self.pools.len(),
            ..SystemHealth::default()
        };

        for pool in &self.pools {
            match pool.status {
                PoolStatus::Starting => health.starting_pools += 1,
                PoolStatus::Healthy => health.healthy_pools += 1,
                PoolStatus::Degraded => health.degraded_pools += 1,
                PoolStatus::Draining => health.draining_pools += 1,
                PoolStatus::Closed => health.closed_pools += 1,
            }
            health.total_workers += pool.total_workers;
            health.idle_workers += pool.idle_workers;
            health.busy_workers += pool.busy_workers;
            health.unhealthy_workers += pool.unhealthy_workers;
            health.terminating_workers += pool.terminating_workers;
            health.active_tasks += pool.active_tasks;
            health.queued_tasks += pool.queued_tasks;
        }

        if !self.pools.is_empty() {
            health.mean_load =
                self.pools.iter().map(|p| p.load_ratio).sum::<f64>() / self.pools.len() as f64;
            health.status = if health.healthy_pools == self.pools.len() {
                SystemStatus::Healthy
            } else if health.healthy_pools == 0 {
                SystemStatus::Critical
            } else {
                SystemStatus::Degraded
            };
        }
        health
    }
}

/// Overall status across pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemStatus {
    /// Every pool is healthy
    Healthy,
    /// Some pools are healthy
    Degraded,
    /// No pool is healthy
    Critical,
    /// No pools registered
    #[default]
    Empty,
}

impl SystemStatus {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemStatus::Healthy => "healthy",
            SystemStatus::Degraded => "degraded",
            SystemStatus::Critical => "critical",
            SystemStatus::Empty => "empty",
        }
    }
}

impl fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts aggregated over every pool
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemHealth {
    /// Overall status
    pub status: SystemStatus,
    /// Pools registered
    pub total_pools: usize,
    /// Pools starting
    pub starting_pools: usize,
    /// Pools healthy
    pub healthy_pools: usize,
    /// Pools degraded
    pub degraded_pools: usize,
    /// Pools draining
    pub draining_pools: usize,
    /// Pools closed
    pub closed_pools: usize,
    /// Live workers
    pub total_workers: usize,
    /// Idle workers
    pub idle_workers: usize,
    /// Busy workers
    pub busy_workers: usize,
    /// Unhealthy workers
    pub unhealthy_workers: usize,
    /// Terminating workers
    pub terminating_workers: usize,
    /// Running tasks
    pub active_tasks: usize,
    /// Waiting tasks
    pub queued_tasks: usize,
    /// Mean `load_ratio`
    pub mean_load: f64,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::BackendType;

    /// Synthetic pool health for selection tests
    pub(crate) fn pool(name: &str, status: PoolStatus, active: usize, max: usize) -> PoolHealth {
        PoolHealth {
            pool_id: PoolId::new(),
            name: name.to_string(),
            status,
            backend_type: BackendType::Local,
            tags: Vec::new(),
            total_workers: max,
            idle_workers: max.saturating_sub(active),
            busy_workers: active.min(max),
            unhealthy_workers: 0,
            terminating_workers: 0,
            active_tasks: active,
            queued_tasks: 0,
            queue_capacity: max * 2,
            min_workers: 0,
            max_workers: max,
            load_ratio: if max == 0 { 1.0 } else { (active as f64 / max as f64).min(1.0) },
            utilization: if max == 0 { 0.0 } else { (active as f64 / max as f64).min(1.0) },
            last_health_check: None,
        }
    }

    #[test]
    fn test_empty_system() {
        let health = HealthSnapshot::empty().system_health();
        assert_eq!(health.status, SystemStatus::Empty);
        assert_eq!(health.total_pools, 0);
    }

    #[test]
    fn test_aggregation_and_status() {
        let snapshot = HealthSnapshot::capture(vec![
            pool("a", PoolStatus::Healthy, 1, 4),
            pool("b", PoolStatus::Degraded, 3, 4),
        ]);
        let health = snapshot.system_health();
        assert_eq!(health.status, SystemStatus::Degraded);
        assert_eq!((health.healthy_pools, health.degraded_pools), (1, 1));
        assert_eq!(health.active_tasks, 4);
        assert!((health.mean_load - 0.5).abs() < f64::EPSILON);
        assert_eq!(snapshot.eligible().len(), 1);

        let all_down = HealthSnapshot::capture(vec![pool("c", PoolStatus::Closed, 0, 1)]);
        assert_eq!(all_down.system_health().status, SystemStatus::Critical);

        let all_up = HealthSnapshot::capture(vec![pool("d", PoolStatus::Healthy, 0, 1)]);
        assert_eq!(all_up.system_health().status, SystemStatus::Healthy);
    }

    #[test]
    fn test_lookup_by_id() {
        let a = pool("a", PoolStatus::Healthy, 0, 1);
        let id = a.pool_id;
        let snapshot = HealthSnapshot::capture(vec![a]);
        assert_eq!(snapshot.get(id).map(|p| p.name.as_str()), Some("a"));
        assert!(snapshot.get(PoolId::new()).is_none());
    }
}
