//! Entity model for a workspace.
//!
//! Every stored entity implements [`Entity`], which names its kind (used in
//! change records, snapshots and metrics) and its stable identifier.

use serde::Serialize;
use serde::de::DeserializeOwned;

pub mod approval;
pub mod deployment;
pub mod environment;
pub mod job;
pub mod policy;
pub mod relationship;
pub mod release;
pub mod resource;
pub mod system;
pub mod variable;

pub use approval::{ApprovalStatus, RoleBinding, UserApprovalRecord};
pub use deployment::{Deployment, DeploymentVersion, VersionStatus};
pub use environment::Environment;
pub use job::{
    Job, JobAgent, JobStatus, JobUpdate, JobVerification, Measurement, MetricStatus,
    VerificationMetric,
};
pub use policy::{
    BackoffStrategy, Policy, PolicyRule, PolicyTargetSelector, RolloutType, Rule,
};
pub use relationship::{PropertyMatcher, RelationshipRule};
pub use release::{Release, ReleaseTarget};
pub use resource::Resource;
pub use system::System;
pub use variable::{
    DeploymentVariable, DeploymentVariableValue, LiteralValue, ResourceVariable, VariableValue,
};

/// A stored, identifiable workspace entity.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Kind label, e.g. `deployment-version`.
    const KIND: &'static str;

    /// Stable identifier within the workspace.
    fn entity_id(&self) -> String;
}

macro_rules! impl_entity {
    ($ty:ty, $kind:literal) => {
        impl $crate::model::Entity for $ty {
            const KIND: &'static str = $kind;

            fn entity_id(&self) -> String {
                self.id.clone()
            }
        }
    };
}

pub(crate) use impl_entity;

/// Serializes an entity into a JSON value for selector evaluation.
///
/// # Errors
///
/// Returns an error if the entity fails to serialize.
pub fn to_json<T: Serialize>(entity: &T) -> crate::error::Result<serde_json::Value> {
    Ok(serde_json::to_value(entity)?)
}
