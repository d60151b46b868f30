//! Deployments and their immutable versions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::impl_entity;
use crate::selector::Selector;

/// A named deployable, paired with a job agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    /// Stable identifier.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// URL-safe name.
    #[serde(default)]
    pub slug: String,
    /// Owning system.
    pub system_id: String,
    /// Job agent that executes releases of this deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_agent_id: Option<String>,
    /// Deployment-level agent configuration.
    #[serde(default)]
    pub job_agent_config: Map<String, Value>,
    /// Resource filter. Absent means every resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_selector: Option<Selector>,
}

impl_entity!(Deployment, "deployment");

/// Build status of a deployment version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VersionStatus {
    /// Still being built.
    Building,
    /// Eligible for release.
    Ready,
    /// Build failed.
    Failed,
    /// Rejected by an operator.
    Rejected,
}

/// An immutable tag of a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentVersion {
    /// Stable identifier.
    pub id: String,
    /// Deployment this version belongs to.
    pub deployment_id: String,
    /// Version tag, e.g. `v1.4.2`.
    pub tag: String,
    /// Display name, defaults to the tag.
    #[serde(default)]
    pub name: String,
    /// Build status.
    pub status: VersionStatus,
    /// Creation instant. Later versions win.
    pub created_at: DateTime<Utc>,
    /// Arbitrary version configuration.
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Version-level agent configuration, merged last.
    #[serde(default)]
    pub job_agent_config: Map<String, Value>,
    /// Labels.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl DeploymentVersion {
    /// Returns true when the version may be released.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status == VersionStatus::Ready
    }
}

impl_entity!(DeploymentVersion, "deployment-version");
