//! Approval records and role membership.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::impl_entity;

/// Outcome recorded by an approver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalStatus {
    /// The user approved the version for the environment.
    Approved,
    /// The user rejected the version for the environment.
    Rejected,
}

/// A user's decision on a `(version, environment)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserApprovalRecord {
    /// Identifier; derived from the pair and user when absent.
    #[serde(default)]
    pub id: String,
    /// Approved version.
    pub version_id: String,
    /// Environment the approval applies to.
    pub environment_id: String,
    /// Approving user.
    pub user_id: String,
    /// Decision.
    pub status: ApprovalStatus,
    /// Optional justification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Instant of the decision.
    pub created_at: DateTime<Utc>,
}

impl UserApprovalRecord {
    /// Identifier derived from `(version, environment, user)`.
    #[must_use]
    pub fn derived_id(&self) -> String {
        format!("{}:{}:{}", self.version_id, self.environment_id, self.user_id)
    }

    /// Secondary index key `(version, environment)`.
    #[must_use]
    pub fn pair_key(&self) -> String {
        format!("{}:{}", self.version_id, self.environment_id)
    }
}

impl_entity!(UserApprovalRecord, "user-approval-record");

/// Membership of a user in a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleBinding {
    /// Stable identifier.
    pub id: String,
    /// Role the user belongs to.
    pub role_id: String,
    /// Bound user.
    pub user_id: String,
}

impl_entity!(RoleBinding, "role-binding");
