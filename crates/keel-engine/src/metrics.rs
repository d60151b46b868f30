//! Engine metrics.
//!
//! Recorded through the `metrics` facade; the worker binary installs a
//! Prometheus recorder and serves them on `/metrics`.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `keel_events_applied_total` | Counter | `event_type`, `result` |
//! | `keel_apply_duration_seconds` | Histogram | `event_type` |
//! | `keel_release_targets_changed_total` | Counter | `change` |
//! | `keel_policy_decisions_total` | Counter | `decision` |
//! | `keel_jobs_created_total` | Counter | `status` |
//! | `keel_workqueue_operations_total` | Counter | `operation`, `result` |
//! | `keel_dispatches_total` | Counter | `agent_type`, `result` |
//! | `keel_workspaces_loaded` | Gauge | - |

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names.
pub mod names {
    /// Counter: events applied by type and result.
    pub const EVENTS_APPLIED_TOTAL: &str = "keel_events_applied_total";
    /// Histogram: apply latency in seconds.
    pub const APPLY_DURATION_SECONDS: &str = "keel_apply_duration_seconds";
    /// Counter: release targets added or removed.
    pub const RELEASE_TARGETS_CHANGED_TOTAL: &str = "keel_release_targets_changed_total";
    /// Counter: overall policy decisions.
    pub const POLICY_DECISIONS_TOTAL: &str = "keel_policy_decisions_total";
    /// Counter: jobs created by initial status.
    pub const JOBS_CREATED_TOTAL: &str = "keel_jobs_created_total";
    /// Counter: workqueue operations.
    pub const WORKQUEUE_OPERATIONS_TOTAL: &str = "keel_workqueue_operations_total";
    /// Counter: dispatch outcomes.
    pub const DISPATCHES_TOTAL: &str = "keel_dispatches_total";
    /// Gauge: workspaces held in memory.
    pub const WORKSPACES_LOADED: &str = "keel_workspaces_loaded";
}

/// Label keys.
pub mod labels {
    /// Event type.
    pub const EVENT_TYPE: &str = "event_type";
    /// Outcome (ok, error, skipped).
    pub const RESULT: &str = "result";
    /// `added` or `removed`.
    pub const CHANGE: &str = "change";
    /// Policy decision.
    pub const DECISION: &str = "decision";
    /// Job status.
    pub const STATUS: &str = "status";
    /// Workqueue operation.
    pub const OPERATION: &str = "operation";
    /// Job agent type.
    pub const AGENT_TYPE: &str = "agent_type";
}

/// Records engine metrics with consistent labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineMetrics;

impl EngineMetrics {
    /// Creates a recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Counts one applied event.
    pub fn record_event(&self, event_type: &str, result: &str) {
        counter!(
            names::EVENTS_APPLIED_TOTAL,
            labels::EVENT_TYPE => event_type.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records how long an apply took.
    pub fn observe_apply(&self, event_type: &str, duration: Duration) {
        histogram!(
            names::APPLY_DURATION_SECONDS,
            labels::EVENT_TYPE => event_type.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Counts release target diffs.
    pub fn record_release_targets(&self, added: usize, removed: usize) {
        counter!(names::RELEASE_TARGETS_CHANGED_TOTAL, labels::CHANGE => "added")
            .increment(added as u64);
        counter!(names::RELEASE_TARGETS_CHANGED_TOTAL, labels::CHANGE => "removed")
            .increment(removed as u64);
    }

    /// Counts an overall policy decision.
    pub fn record_decision(&self, decision: &str) {
        counter!(
            names::POLICY_DECISIONS_TOTAL,
            labels::DECISION => decision.to_string(),
        )
        .increment(1);
    }

    /// Counts a created job.
    pub fn record_job_created(&self, status: &str) {
        counter!(
            names::JOBS_CREATED_TOTAL,
            labels::STATUS => status.to_string(),
        )
        .increment(1);
    }

    /// Counts a workqueue operation.
    pub fn record_workqueue(&self, operation: &'static str, result: &'static str) {
        counter!(
            names::WORKQUEUE_OPERATIONS_TOTAL,
            labels::OPERATION => operation,
            labels::RESULT => result,
        )
        .increment(1);
    }

    /// Counts a dispatch outcome.
    pub fn record_dispatch(&self, agent_type: &str, result: &'static str) {
        counter!(
            names::DISPATCHES_TOTAL,
            labels::AGENT_TYPE => agent_type.to_string(),
            labels::RESULT => result,
        )
        .increment(1);
    }

    /// Sets the number of loaded workspaces.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_workspaces_loaded(&self, count: usize) {
        gauge!(names::WORKSPACES_LOADED).set(count as f64);
    }
}

/// Calls `on_drop` with the elapsed time when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Starts timing.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}
