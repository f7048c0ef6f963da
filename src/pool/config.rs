//! Pool configuration

use crate::backend::{BackendOptions, BackendType};
use crate::core::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;

/// How scale-down treats workers that still run a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ScaleDownPolicy {
    /// Wait for the in-flight task's deadline, or `fallback` if it has none
    WaitForDeadline {
        /// Bound for tasks without a deadline
        #[serde(with = "crate::core::duration_millis")]
        fallback: Duration,
    },
    /// Wait a fixed period
    Grace {
        /// How long a busy victim may keep running
        #[serde(with = "crate::core::duration_millis")]
        period: Duration,
    },
    /// Terminate busy victims right away
    Immediate,
}

impl Default for ScaleDownPolicy {
    fn default() -> Self {
        ScaleDownPolicy::WaitForDeadline {
            fallback: Duration::from_secs(30),
        }
    }
}

/// Per-pool tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Tasks one worker runs at once
    pub per_worker_concurrency_limit: usize,
    /// Wait-queue capacity is `max_workers * queue_multiplier`
    pub queue_multiplier: usize,
    /// Client wait bound for tasks without a deadline
    #[serde(with = "crate::core::duration_millis")]
    pub dispatch_timeout: Duration,
    /// Bound on spawning one worker
    #[serde(with = "crate::core::duration_millis")]
    pub spawn_timeout: Duration,
    /// Bound on terminating one worker
    #[serde(with = "crate::core::duration_millis")]
    pub terminate_timeout: Duration,
    /// Bound on probing one worker
    #[serde(with = "crate::core::duration_millis")]
    pub probe_timeout: Duration,
    /// Time a worker has to acknowledge cancellation
    #[serde(with = "crate::core::duration_millis")]
    pub cancel_grace: Duration,
    /// Consecutive failed probes before termination
    pub unhealthy_threshold: u32,
    /// Spawn a worker (up to `max_workers`) when a task has to queue
    pub scale_on_demand: bool,
    /// Busy-worker policy during scale-down
    pub scale_down_policy: ScaleDownPolicy,
    /// Bound on draining in-flight work during close
    #[serde(with = "crate::core::duration_millis")]
    pub drain_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            per_worker_concurrency_limit: 1,
            queue_multiplier: 2,
            dispatch_timeout: Duration::from_secs(30),
            spawn_timeout: Duration::from_secs(10),
            terminate_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            cancel_grace: Duration::from_secs(2),
            unhealthy_threshold: 3,
            scale_on_demand: true,
            scale_down_policy: ScaleDownPolicy::default(),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolSettings {
    /// Set tasks per worker
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.per_worker_concurrency_limit = limit;
        self
    }

    /// Set the wait-queue multiplier
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_queue_multiplier(mut self, multiplier: usize) -> Self {
        self.queue_multiplier = multiplier;
        self
    }

    /// Set the default dispatch timeout
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    /// Set the spawn timeout
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    /// Set the terminate timeout
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    /// Set the probe timeout
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Set the cancellation grace period
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Set failed probes tolerated before termination
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_unhealthy_threshold(mut self, threshold: u32) -> Self {
        self.unhealthy_threshold = threshold;
        self
    }

    /// Enable or disable on-demand growth
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_scale_on_demand(mut self, enabled: bool) -> Self {
        self.scale_on_demand = enabled;
        self
    }

    /// Set the scale-down policy
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_scale_down_policy(mut self, policy: ScaleDownPolicy) -> Self {
        self.scale_down_policy = policy;
        self
    }

    /// Set the drain timeout
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.per_worker_concurrency_limit == 0 {
            return Err(OrchestratorError::invalid_config(
                "per_worker_concurrency_limit",
                "must be at least 1",
            ));
        }
        if self.unhealthy_threshold == 0 {
            return Err(OrchestratorError::invalid_config(
                "unhealthy_threshold",
                "must be at least 1",
            ));
        }
        for (name, value) in [
            ("dispatch_timeout", self.dispatch_timeout),
            ("spawn_timeout", self.spawn_timeout),
            ("terminate_timeout", self.terminate_timeout),
            ("probe_timeout", self.probe_timeout),
        ] {
            if value.is_zero() {
                return Err(OrchestratorError::invalid_config(name, "must be non-zero"));
            }
        }
        Ok(())
    }
}

/// Creation parameters for a pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Unique pool name
    pub name: String,
    /// Backend kind
    #[serde(default)]
    pub backend_type: BackendType,
    /// Lower worker bound
    #[serde(default)]
    pub min_workers: usize,
    /// Upper worker bound
    pub max_workers: usize,
    /// Tags used by affinity routing
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    /// Opaque backend options
    #[serde(default, skip_serializing_if = "BackendOptions::is_empty")]
    pub options: BackendOptions,
    /// Runtime tunables
    #[serde(default)]
    pub settings: PoolSettings,
}

impl PoolConfig {
    /// Create a configuration with one worker minimum and maximum
    #[must_use]
    pub fn new(name: impl Into<String>, backend_type: BackendType) -> Self {
        Self {
            name: name.into(),
            backend_type,
            min_workers: 1,
            max_workers: 1,
            tags: BTreeSet::new(),
            options: BackendOptions::new(),
            settings: PoolSettings::default(),
        }
    }

    /// Set both worker bounds
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_workers(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    /// Add a routing tag
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Set one backend option
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Replace the runtime settings
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_settings(mut self, settings: PoolSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Wait-queue capacity
    pub fn queue_capacity(&self) -> usize {
        self.max_workers
            .saturating_mul(self.settings.queue_multiplier)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::invalid_config("name", "must not be empty"));
        }
        if self.min_workers > self.max_workers {
            return Err(OrchestratorError::invalid_config(
                "min_workers",
                format!(
                    "min_workers ({}) exceeds max_workers ({})",
                    self.min_workers, self.max_workers
                ),
            ));
        }
        self.settings.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_settings() {
        let settings = PoolSettings::default();
        assert_eq!(settings.per_worker_concurrency_limit, 1);
        assert_eq!(settings.queue_multiplier, 2);
        assert_eq!(settings.dispatch_timeout, Duration::from_secs(30));
        assert_eq!(settings.unhealthy_threshold, 3);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = PoolConfig::new("p1", BackendType::Local)
            .with_workers(1, 3)
            .with_tag("gpu")
            .with_option("nodes", json!(["a", "b"]));
        assert_eq!(config.queue_capacity(), 6);
        assert!(config.tags.contains("gpu"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_bounds() {
        let err = PoolConfig::new("p1", BackendType::Local)
            .with_workers(4, 2)
            .validate()
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");

        assert!(PoolConfig::new(" ", BackendType::Local).validate().is_err());
        assert!(PoolConfig::new("p", BackendType::Local)
            .with_settings(PoolSettings::default().with_concurrency_limit(0))
            .validate()
            .is_err());
    }

    #[test]
    fn test_descriptor_json_uses_millis_and_defaults() {
        let config: PoolConfig = serde_json::from_value(json!({
            "name": "p1",
            "backend_type": "cluster",
            "max_workers": 4,
            "settings": {
                "dispatch_timeout": 1500,
                "scale_down_policy": {"policy": "grace", "period": 250}
            }
        }))
        .unwrap();
        assert_eq!(config.backend_type, BackendType::Cluster);
        assert_eq!(config.min_workers, 0);
        assert_eq!(config.settings.dispatch_timeout, Duration::from_millis(1500));
        assert_eq!(
            config.settings.scale_down_policy,
            ScaleDownPolicy::Grace {
                period: Duration::from_millis(250)
            }
        );
        assert_eq!(config.settings.cancel_grace, Duration::from_secs(2));

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["settings"]["spawn_timeout"], 10_000);
    }
}
