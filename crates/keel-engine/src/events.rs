//! Event envelope and the closed catalogue of workspace event types.
//!
//! Events are the only way workspace state changes. Each carries a type
//! string such as `resource.upserted` (optionally suffixed with `@v1`), the
//! owning workspace, a JSON payload and a Unix-millisecond timestamp that acts
//! as the logical clock of the apply.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Version suffix accepted on event types.
pub const CURRENT_VERSION: &str = "v1";

/// An event as received from ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    /// Versioned type string.
    pub event_type: String,
    /// Owning workspace.
    pub workspace_id: String,
    /// Type-specific payload.
    #[serde(default)]
    pub data: Value,
    /// Unix milliseconds.
    pub timestamp: i64,
}

impl RawEvent {
    /// Builds an event from a typed payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload fails to serialize.
    pub fn new(
        event_type: EventType,
        workspace_id: impl Into<String>,
        data: &impl Serialize,
        timestamp: i64,
    ) -> Result<Self> {
        Ok(Self {
            event_type: event_type.as_str().to_string(),
            workspace_id: workspace_id.into(),
            data: serde_json::to_value(data)?,
            timestamp,
        })
    }

    /// Decodes the payload.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the payload does not match `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            Error::validation(format!("invalid payload for '{}': {e}", self.event_type))
        })
    }

    /// The event timestamp as a UTC instant.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the timestamp is out of range.
    pub fn occurred_at(&self) -> Result<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp)
            .single()
            .ok_or_else(|| Error::validation(format!("timestamp out of range: {}", self.timestamp)))
    }
}

macro_rules! event_types {
    ($($variant:ident => $name:literal,)+) => {
        /// Every event type the engine understands.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum EventType {
            $(
                #[doc = concat!("`", $name, "`")]
                $variant,
            )+
        }

        impl EventType {
            /// Every event type, in catalogue order.
            pub const ALL: &'static [EventType] = &[$(EventType::$variant,)+];

            /// Unversioned wire name.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }
        }
    };
}

event_types! {
    SystemCreated => "system.created",
    SystemUpdated => "system.updated",
    SystemDeleted => "system.deleted",
    SystemDeploymentLinked => "system.deployment.linked",
    SystemDeploymentUnlinked => "system.deployment.unlinked",
    SystemEnvironmentLinked => "system.environment.linked",
    SystemEnvironmentUnlinked => "system.environment.unlinked",
    DeploymentCreated => "deployment.created",
    DeploymentUpdated => "deployment.updated",
    DeploymentDeleted => "deployment.deleted",
    EnvironmentCreated => "environment.created",
    EnvironmentUpdated => "environment.updated",
    EnvironmentDeleted => "environment.deleted",
    ResourceCreated => "resource.created",
    ResourceUpdated => "resource.updated",
    ResourceUpserted => "resource.upserted",
    ResourceDeleted => "resource.deleted",
    DeploymentVersionCreated => "deployment-version.created",
    DeploymentVersionUpdated => "deployment-version.updated",
    DeploymentVersionDeleted => "deployment-version.deleted",
    DeploymentVariableCreated => "deployment-variable.created",
    DeploymentVariableUpdated => "deployment-variable.updated",
    DeploymentVariableDeleted => "deployment-variable.deleted",
    ResourceVariableCreated => "resource-variable.created",
    ResourceVariableUpdated => "resource-variable.updated",
    ResourceVariableDeleted => "resource-variable.deleted",
    PolicyCreated => "policy.created",
    PolicyUpdated => "policy.updated",
    PolicyDeleted => "policy.deleted",
    JobAgentCreated => "job-agent.created",
    JobAgentUpdated => "job-agent.updated",
    JobAgentDeleted => "job-agent.deleted",
    UserApprovalRecordCreated => "user-approval-record.created",
    UserApprovalRecordUpdated => "user-approval-record.updated",
    UserApprovalRecordDeleted => "user-approval-record.deleted",
    RoleBindingCreated => "role-binding.created",
    RoleBindingDeleted => "role-binding.deleted",
    RelationshipRuleCreated => "relationship-rule.created",
    RelationshipRuleUpdated => "relationship-rule.updated",
    RelationshipRuleDeleted => "relationship-rule.deleted",
    JobStatusChanged => "job.status.changed",
    JobUpdated => "job.updated",
    JobVerificationUpdated => "job-verification.updated",
    WorkspaceTick => "workspace.tick",
    WorkspaceRecover => "workspace.recover",
}

impl EventType {
    /// Events that change entities feeding release-target derivation.
    #[must_use]
    pub const fn affects_release_targets(self) -> bool {
        matches!(
            self,
            Self::SystemDeleted
                | Self::SystemCreated
                | Self::SystemUpdated
                | Self::SystemDeploymentLinked
                | Self::SystemDeploymentUnlinked
                | Self::SystemEnvironmentLinked
                | Self::SystemEnvironmentUnlinked
                | Self::DeploymentCreated
                | Self::DeploymentUpdated
                | Self::DeploymentDeleted
                | Self::EnvironmentCreated
                | Self::EnvironmentUpdated
                | Self::EnvironmentDeleted
                | Self::ResourceCreated
                | Self::ResourceUpdated
                | Self::ResourceUpserted
                | Self::ResourceDeleted
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let name = match s.split_once('@') {
            Some((name, version)) if version == CURRENT_VERSION => name,
            Some(_) => return Err(Error::validation(format!("unsupported event version: {s}"))),
            None => s,
        };
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == name)
            .ok_or_else(|| Error::validation(format!("unknown event type: {s}")))
    }
}

/// Payload of delete events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletePayload {
    /// Identifier of the entity to remove.
    pub id: String,
}

/// Payload of `system.deployment.{linked,unlinked}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentLink {
    /// System.
    pub system_id: String,
    /// Deployment.
    pub deployment_id: String,
}

/// Payload of `system.environment.{linked,unlinked}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentLink {
    /// System.
    pub system_id: String,
    /// Environment.
    pub environment_id: String,
}

/// Payload of `workspace.recover`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverPayload {
    /// Operator note recorded in the status history.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Accepts events for ordered application to their workspace.
///
/// Implemented by the workspace registry. Components outside the apply loop
/// (dispatch, verification) report state changes through a sink instead of
/// mutating stores.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    /// Applies or forwards one event.
    async fn submit(&self, event: RawEvent) -> Result<()>;
}
