//! Tracing integration for observability.
//!
//! Dispatches run on spawned tokio tasks, so the caller's span is not
//! inherited automatically. [`dispatch_span`] builds the span a pool attaches
//! to each dispatch with `tracing::Instrument`, and [`metrics`] emits the
//! structured `counter.*` / `gauge.*` / `histogram.*` events consumed by
//! metrics exporters.
//!
//! # Example
//!
//! ```rust,ignore
//! use tracing_subscriber::{fmt, prelude::*, EnvFilter};
//!
//! tracing_subscriber::registry()
//!     .with(fmt::layer())
//!     .with(EnvFilter::from_default_env()
//!         .add_directive("pool_orchestrator=debug".parse().unwrap()))
//!     .init();
//! ```

use crate::core::Task;

/// Span covering one dispatch on one worker
pub fn dispatch_span(pool_name: &str, worker: &str, task: &Task) -> ::tracing::Span {
    ::tracing::debug_span!(
        "dispatch",
        pool = pool_name,
        worker = worker,
        task_id = task.task_id(),
        task_type = task.task_type(),
    )
}

/// Metrics recording functions for observability.
pub mod metrics {
    use std::time::Duration;

    /// Records a task dispatched to a worker.
    #[inline]
    pub fn record_dispatch(pool: &str, queue_depth: usize) {
        ::tracing::trace!(
            counter.tasks_dispatched = 1,
            gauge.queue_depth = queue_depth as i64,
            pool = pool,
            "task dispatched"
        );
    }

    /// Records a task rejected by backpressure.
    #[inline]
    pub fn record_rejection(pool: &str, queued: usize) {
        ::tracing::trace!(
            counter.tasks_rejected = 1,
            gauge.queue_depth = queued as i64,
            pool = pool,
            "task rejected"
        );
    }

    /// Records task completion with timing.
    #[inline]
    pub fn record_completion(pool: &str, duration: Duration, success: bool) {
        let duration_ms = duration.as_millis() as u64;
        if success {
            ::tracing::trace!(
                counter.tasks_completed = 1,
                histogram.task_duration_ms = duration_ms,
                pool = pool,
                "task completed successfully"
            );
        } else {
            ::tracing::trace!(
                counter.tasks_failed = 1,
                histogram.task_duration_ms = duration_ms,
                pool = pool,
                "task failed"
            );
        }
    }

    /// Records a worker status transition.
    #[inline]
    pub fn record_worker_transition(pool: &str, worker: &str, from: &str, to: &str) {
        ::tracing::trace!(
            counter.worker_transitions = 1,
            pool = pool,
            worker = worker,
            from = from,
            to = to,
            "worker status changed"
        );
    }

    /// Records a worker force-terminated with work in flight.
    #[inline]
    pub fn record_forced_termination(pool: &str, worker: &str, tasks: usize) {
        ::tracing::trace!(
            counter.workers_forced = 1,
            counter.tasks_terminated = tasks as u64,
            pool = pool,
            worker = worker,
            "worker force-terminated"
        );
    }

    /// Records a completed scale operation.
    #[inline]
    pub fn record_scale(pool: &str, from: usize, to: usize) {
        ::tracing::info!(
            gauge.pool_workers = to as i64,
            pool = pool,
            from = from,
            to = to,
            "pool scaled"
        );
    }

    /// Records a routing decision.
    #[inline]
    pub fn record_route(strategy: &str, candidates: usize) {
        ::tracing::trace!(
            counter.routing_decisions = 1,
            gauge.eligible_pools = candidates as i64,
            strategy = strategy,
            "task routed"
        );
    }

    /// Records a fan-out and how many targets failed.
    #[inline]
    pub fn record_distribution(strategy: &str, targets: usize, failed: usize, duration: Duration) {
        ::tracing::trace!(
            counter.distributions = 1,
            gauge.distribution_targets = targets as i64,
            counter.distribution_failures = failed as i64,
            histogram.distribution_duration_ms = duration.as_millis() as u64,
            strategy = strategy,
            "task distributed"
        );
    }

    /// Records a health poll round.
    #[inline]
    pub fn record_poll(polled: usize, missed: usize, duration: Duration) {
        ::tracing::trace!(
            counter.health_polls = 1,
            gauge.pools_polled = polled as i64,
            gauge.pools_missed = missed as i64,
            histogram.poll_duration_ms = duration.as_millis() as u64,
            "health poll complete"
        );
    }

    /// Records an event a subscriber missed.
    #[inline]
    pub fn record_event_dropped(topic: &str) {
        ::tracing::trace!(counter.events_dropped = 1, topic = topic, "event dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_metrics_functions_dont_panic() {
        metrics::record_dispatch("p1", 3);
        metrics::record_rejection("p1", 6);
        metrics::record_completion("p1", Duration::from_millis(12), true);
        metrics::record_completion("p1", Duration::from_millis(12), false);
        metrics::record_worker_transition("p1", "w-1", "idle", "busy");
        metrics::record_forced_termination("p1", "w-1", 2);
        metrics::record_scale("p1", 1, 3);
        metrics::record_route("least_loaded", 2);
        metrics::record_distribution("broadcast", 3, 1, Duration::from_millis(40));
        metrics::record_poll(4, 1, Duration::from_millis(3));
        metrics::record_event_dropped("task.completed");
    }

    #[test]
    fn test_dispatch_span_builds_without_subscriber() {
        let task = Task::with_id("t1", "echo", json!({}));
        let span = dispatch_span("p1", "w-1", &task);
        let _entered = span.enter();
    }
}
