//! Policies and their rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobStatus, impl_entity};
use crate::selector::Selector;

/// Selects release targets by their deployment, environment and resource.
///
/// A target selector matches when every present slot matches its entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTargetSelector {
    /// Filter on the deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_selector: Option<Selector>,
    /// Filter on the environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_selector: Option<Selector>,
    /// Filter on the resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_selector: Option<Selector>,
}

/// Backoff growth between retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackoffStrategy {
    /// Constant delay of `backoffSeconds`.
    #[default]
    Linear,
    /// `backoffSeconds * 2^(attempt-1)`.
    Exponential,
}

/// How rollout offsets scale with a target's position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RolloutType {
    /// `position * interval`.
    #[default]
    Linear,
    /// `position / count * interval`.
    LinearNormalized,
}

/// A single rule. Exactly one variant per rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Rule {
    /// At least `minApprovals` distinct approvers.
    #[serde(rename_all = "camelCase")]
    AnyApproval {
        /// Required approver count.
        min_approvals: u32,
    },
    /// A specific user approved.
    #[serde(rename_all = "camelCase")]
    UserApproval {
        /// Required approver.
        user_id: String,
    },
    /// Some member of a role approved.
    #[serde(rename_all = "camelCase")]
    RoleApproval {
        /// Role whose members may approve.
        role_id: String,
    },
    /// Blocks deploys during recurring windows.
    #[serde(rename_all = "camelCase")]
    DenyWindow {
        /// RFC 5545 recurrence rule.
        rrule: String,
        /// IANA timezone the rule is evaluated in.
        #[serde(default = "default_timezone")]
        timezone: String,
        /// Length of each window.
        #[serde(default = "default_window_minutes")]
        duration_minutes: i64,
        /// First occurrence anchor.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dtstart: Option<DateTime<Utc>>,
    },
    /// Caps active jobs per deployment and environment.
    #[serde(rename_all = "camelCase")]
    Concurrency {
        /// Maximum simultaneously active jobs.
        max_concurrent: u32,
    },
    /// Caps consecutive retryable failures of a release.
    #[serde(rename_all = "camelCase")]
    MaxRetries {
        /// Allowed retries after the first attempt.
        max_retries: u32,
    },
    /// Blocks further rollout after failed jobs or verifications.
    #[serde(rename_all = "camelCase")]
    Rollback {
        /// Latest job statuses that block.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_job_statuses: Option<Vec<JobStatus>>,
        /// Block when a verification of the latest job failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_verification_failure: Option<bool>,
    },
    /// Retries failed releases with backoff.
    #[serde(rename_all = "camelCase")]
    Retry {
        /// Allowed retries after the first attempt.
        max_retries: u32,
        /// Statuses counted as retryable.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_on_statuses: Option<Vec<JobStatus>>,
        /// Base backoff.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backoff_seconds: Option<u64>,
        /// Backoff growth.
        #[serde(default)]
        backoff_strategy: BackoffStrategy,
        /// Backoff ceiling.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_backoff_seconds: Option<u64>,
    },
    /// No other active job for the release target.
    ReleaseTargetConcurrency {},
    /// Staggers a version across an environment's targets.
    #[serde(rename_all = "camelCase")]
    EnvironmentVersionRollout {
        /// Offset scaling.
        #[serde(default)]
        rollout_type: RolloutType,
        /// Minutes between consecutive positions.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time_scale_interval_minutes: Option<u64>,
    },
    /// Filters which versions are eligible.
    DeploymentVersionSelector {
        /// Version predicate.
        selector: Selector,
    },
}

fn default_timezone() -> String {
    "UTC".to_string()
}

const fn default_window_minutes() -> i64 {
    60
}

impl Rule {
    /// Tag of the variant.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::AnyApproval { .. } => "anyApproval",
            Self::UserApproval { .. } => "userApproval",
            Self::RoleApproval { .. } => "roleApproval",
            Self::DenyWindow { .. } => "denyWindow",
            Self::Concurrency { .. } => "concurrency",
            Self::MaxRetries { .. } => "maxRetries",
            Self::Rollback { .. } => "rollback",
            Self::Retry { .. } => "retry",
            Self::ReleaseTargetConcurrency {} => "releaseTargetConcurrency",
            Self::EnvironmentVersionRollout { .. } => "environmentVersionRollout",
            Self::DeploymentVersionSelector { .. } => "deploymentVersionSelector",
        }
    }

    /// Rules that permit re-running a release whose last job failed.
    #[must_use]
    pub const fn permits_retry(&self) -> bool {
        matches!(self, Self::Retry { .. } | Self::MaxRetries { .. })
    }
}

/// A rule with its identity inside a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    /// Identifier, unique within the policy.
    #[serde(default)]
    pub id: String,
    /// The rule variant.
    #[serde(flatten)]
    pub rule: Rule,
}

/// Selector set, ordered rules and priority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Stable identifier.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Higher priority policies are evaluated first.
    #[serde(default)]
    pub priority: i64,
    /// Disabled policies never apply.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Target selectors. Empty matches every release target.
    #[serde(default)]
    pub selectors: Vec<PolicyTargetSelector>,
    /// Rules in declaration order.
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    /// Creation instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

const fn default_enabled() -> bool {
    true
}

impl_entity!(Policy, "policy");
