//! Release targets and releases.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use keel_core::canonical_json::sha256_hex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{DeploymentVersion, Entity, LiteralValue, impl_entity};
use crate::error::Result;

/// Delimiter joining the three IDs of a release target key.
pub const KEY_DELIMITER: char = ':';

/// The derived `(resource, environment, deployment)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseTarget {
    /// Resource being deployed to.
    pub resource_id: String,
    /// Environment scoping the resource.
    pub environment_id: String,
    /// Deployment being released.
    pub deployment_id: String,
}

impl ReleaseTarget {
    /// Creates a release target.
    #[must_use]
    pub fn new(
        resource_id: impl Into<String>,
        environment_id: impl Into<String>,
        deployment_id: impl Into<String>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            environment_id: environment_id.into(),
            deployment_id: deployment_id.into(),
        }
    }

    /// `resource:environment:deployment`.
    #[must_use]
    pub fn key(&self) -> String {
        format!(
            "{}{KEY_DELIMITER}{}{KEY_DELIMITER}{}",
            self.resource_id, self.environment_id, self.deployment_id
        )
    }
}

impl fmt::Display for ReleaseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl Entity for ReleaseTarget {
    const KIND: &'static str = "release-target";

    fn entity_id(&self) -> String {
        self.key()
    }
}

/// A decision binding a release target to a version and variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    /// Content hash of target, version and variables.
    pub id: String,
    /// Target of the release.
    pub release_target: ReleaseTarget,
    /// Version being released.
    pub version: DeploymentVersion,
    /// Resolved variables.
    #[serde(default)]
    pub variables: BTreeMap<String, LiteralValue>,
    /// Instant the decision was made.
    pub created_at: DateTime<Utc>,
}

impl Release {
    /// Builds a release and computes its identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the variables cannot be canonically encoded.
    pub fn new(
        release_target: ReleaseTarget,
        version: DeploymentVersion,
        variables: BTreeMap<String, LiteralValue>,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        let id = Self::compute_id(&release_target, &version.id, &variables)?;
        Ok(Self {
            id,
            release_target,
            version,
            variables,
            created_at,
        })
    }

    /// Stable hash of `(target key, version id, variables)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the variables cannot be canonically encoded.
    pub fn compute_id(
        target: &ReleaseTarget,
        version_id: &str,
        variables: &BTreeMap<String, LiteralValue>,
    ) -> Result<String> {
        Ok(sha256_hex(&json!({
            "releaseTarget": target.key(),
            "versionId": version_id,
            "variables": variables,
        }))?)
    }
}

impl_entity!(Release, "release");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VersionStatus;
    use chrono::TimeZone;
    use serde_json::Map;

    fn version(id: &str) -> DeploymentVersion {
        DeploymentVersion {
            id: id.into(),
            deployment_id: "d1".into(),
            tag: id.into(),
            name: id.into(),
            status: VersionStatus::Ready,
            created_at: Utc.timestamp_opt(0, 0).unwrap(),
            config: Map::new(),
            job_agent_config: Map::new(),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn key_joins_with_colon() {
        assert_eq!(ReleaseTarget::new("r", "e", "d").key(), "r:e:d");
    }

    #[test]
    fn release_id_is_stable_and_ignores_created_at() {
        let rt = ReleaseTarget::new("r", "e", "d");
        let mut vars = BTreeMap::new();
        vars.insert("replicas".to_string(), LiteralValue::Int(3));
        let a = Release::new(rt.clone(), version("v1"), vars.clone(), Utc.timestamp_opt(1, 0).unwrap())
            .unwrap();
        let b = Release::new(rt.clone(), version("v1"), vars, Utc.timestamp_opt(99, 0).unwrap())
            .unwrap();
        assert_eq!(a.id, b.id);

        let c = Release::new(rt, version("v2"), BTreeMap::new(), Utc.timestamp_opt(1, 0).unwrap())
            .unwrap();
        assert_ne!(a.id, c.id);
    }
}
