//! Jobs, job agents and verification records.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::impl_entity;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    /// Created, waiting for dispatch.
    Pending,
    /// Accepted by the agent and running.
    InProgress,
    /// Waiting on an operator.
    ActionRequired,
    /// Finished successfully.
    Successful,
    /// Finished with a failure.
    Failure,
    /// Cancelled before completion.
    Cancelled,
    /// Skipped by the agent.
    Skipped,
    /// No usable job agent was configured.
    InvalidJobAgent,
    /// The agent type has no registered implementation.
    InvalidIntegration,
    /// The external run could not be found.
    ExternalRunNotFound,
}

impl JobStatus {
    /// Active statuses hold the single in-flight slot of a release target.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::InProgress | Self::ActionRequired)
    }

    /// Terminal statuses never transition again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Stable camelCase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "inProgress",
            Self::ActionRequired => "actionRequired",
            Self::Successful => "successful",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
            Self::InvalidJobAgent => "invalidJobAgent",
            Self::InvalidIntegration => "invalidIntegration",
            Self::ExternalRunNotFound => "externalRunNotFound",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution of a release by a job agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Stable identifier.
    pub id: String,
    /// Release being executed.
    pub release_id: String,
    /// Agent that runs the job. Empty when none was configured.
    #[serde(default)]
    pub job_agent_id: String,
    /// Merged agent configuration.
    #[serde(default)]
    pub job_agent_config: Map<String, Value>,
    /// Current status.
    pub status: JobStatus,
    /// Human readable status detail.
    #[serde(default)]
    pub message: String,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
    /// When the agent started the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Identifier in the external system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// Agent-reported labels.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Job {
    /// Instant of the last attempt outcome.
    #[must_use]
    pub fn last_attempt_at(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.updated_at)
    }

    /// Applies a status update reported by an agent.
    pub fn apply_update(&mut self, update: &JobUpdate, now: DateTime<Utc>) {
        if let Some(status) = update.status {
            if status == JobStatus::InProgress && self.started_at.is_none() {
                self.started_at = Some(update.started_at.unwrap_or(now));
            }
            if status.is_terminal() && self.completed_at.is_none() {
                self.completed_at = Some(update.completed_at.unwrap_or(now));
            }
            self.status = status;
        }
        if let Some(message) = &update.message {
            self.message.clone_from(message);
        }
        if let Some(external_id) = &update.external_id {
            self.external_id = Some(external_id.clone());
        }
        if let Some(started_at) = update.started_at {
            self.started_at = Some(started_at);
        }
        if let Some(completed_at) = update.completed_at {
            self.completed_at = Some(completed_at);
        }
        for (k, v) in &update.metadata {
            self.metadata.insert(k.clone(), v.clone());
        }
        self.updated_at = now;
    }
}

impl_entity!(Job, "job");

/// Partial job update, carried by `job.updated` and `job.status.changed`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    /// Job being updated.
    #[serde(alias = "jobId")]
    pub id: String,
    /// New status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    /// New message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// External run identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// Start instant override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Completion instant override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Labels merged into the job metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl JobUpdate {
    /// A status-only update.
    #[must_use]
    pub fn status(id: impl Into<String>, status: JobStatus, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: Some(status),
            message: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Configuration of a pluggable dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAgent {
    /// Stable identifier.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Implementation type, e.g. `argo-cd`.
    #[serde(rename = "type")]
    pub agent_type: String,
    /// Agent-level configuration, merged first.
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl_entity!(JobAgent, "job-agent");

/// Verification progress of one metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetricStatus {
    /// Still sampling.
    Running,
    /// Success threshold reached.
    Passed,
    /// Failure limit exceeded or samples exhausted.
    Failed,
}

/// One provider sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    /// Sample instant.
    pub measured_at: DateTime<Utc>,
    /// Whether the sample satisfied the success condition.
    pub passed: bool,
    /// Raw provider result.
    #[serde(default)]
    pub data: Value,
}

/// Samples collected for one named metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMetric {
    /// Metric name from the verification spec.
    pub name: String,
    /// Aggregate status.
    pub status: MetricStatus,
    /// Samples in collection order.
    #[serde(default)]
    pub measurements: Vec<Measurement>,
}

impl VerificationMetric {
    /// Returns true if any sample failed.
    #[must_use]
    pub fn has_failing_measurement(&self) -> bool {
        self.status == MetricStatus::Failed || self.measurements.iter().any(|m| !m.passed)
    }
}

/// Metric-collection record attached to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobVerification {
    /// Stable identifier.
    pub id: String,
    /// Verified job.
    pub job_id: String,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Per-metric results.
    #[serde(default)]
    pub metrics: Vec<VerificationMetric>,
}

impl_entity!(JobVerification, "job-verification");

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn job() -> Job {
        let t = Utc.timestamp_opt(0, 0).unwrap();
        Job {
            id: "j1".into(),
            release_id: "r1".into(),
            job_agent_id: "a1".into(),
            job_agent_config: Map::new(),
            status: JobStatus::Pending,
            message: String::new(),
            created_at: t,
            updated_at: t,
            started_at: None,
            completed_at: None,
            external_id: None,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn active_statuses() {
        assert!(JobStatus::Pending.is_active());
        assert!(JobStatus::ActionRequired.is_active());
        assert!(!JobStatus::InvalidJobAgent.is_active());
        assert!(JobStatus::Failure.is_terminal());
    }

    #[test]
    fn update_sets_lifecycle_timestamps() {
        let mut j = job();
        let t1 = Utc.timestamp_opt(10, 0).unwrap();
        j.apply_update(&JobUpdate::status("j1", JobStatus::InProgress, "running"), t1);
        assert_eq!(j.started_at, Some(t1));
        assert_eq!(j.completed_at, None);

        let t2 = Utc.timestamp_opt(20, 0).unwrap();
        j.apply_update(&JobUpdate::status("j1", JobStatus::Failure, "exit 1"), t2);
        assert_eq!(j.completed_at, Some(t2));
        assert_eq!(j.message, "exit 1");
        assert_eq!(j.last_attempt_at(), t2);
    }

    #[test]
    fn status_serializes_camel_case() {
        let s = serde_json::to_string(&JobStatus::InvalidJobAgent).unwrap();
        assert_eq!(s, "\"invalidJobAgent\"");
    }
}
