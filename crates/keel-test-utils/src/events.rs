//! `RawEvent` factory for one workspace.

use keel_engine::events::{DeletePayload, DeploymentLink, EnvironmentLink, EventType, RawEvent};
use keel_engine::model::{
    Deployment, DeploymentVersion, Environment, JobAgent, JobStatus, JobUpdate, Policy, Resource,
    UserApprovalRecord,
};
use serde::Serialize;

use crate::fixtures;

/// Builds events for one workspace on a logical clock.
///
/// Each event is stamped with the current clock and the clock then advances
/// by `step_millis`, so a sequence of events has strictly increasing
/// timestamps unless the test moves the clock explicitly.
#[derive(Debug, Clone)]
pub struct EventFactory {
    workspace_id: String,
    now_millis: i64,
    step_millis: i64,
}

impl EventFactory {
    /// Starts at t=1000 s, one second per event.
    pub fn new(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            now_millis: 1_000_000,
            step_millis: 1_000,
        }
    }

    /// Workspace the events belong to.
    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// Timestamp the next event will carry.
    pub fn now_millis(&self) -> i64 {
        self.now_millis
    }

    /// Moves the clock to `secs` seconds after the epoch.
    pub fn set_secs(&mut self, secs: i64) -> &mut Self {
        self.now_millis = secs * 1_000;
        self
    }

    /// Moves the clock forward by `secs` seconds.
    pub fn advance_secs(&mut self, secs: i64) -> &mut Self {
        self.now_millis += secs * 1_000;
        self
    }

    /// An event with an arbitrary payload.
    pub fn event(&mut self, event_type: EventType, data: &impl Serialize) -> RawEvent {
        let event = RawEvent::new(event_type, self.workspace_id.clone(), data, self.now_millis)
            .expect("payload serializes");
        self.now_millis += self.step_millis;
        event
    }

    /// An event whose type string is used verbatim.
    pub fn raw(&mut self, event_type: &str, data: serde_json::Value) -> RawEvent {
        let event = RawEvent {
            event_type: event_type.to_string(),
            workspace_id: self.workspace_id.clone(),
            data,
            timestamp: self.now_millis,
        };
        self.now_millis += self.step_millis;
        event
    }

    /// `system.created` for [`fixtures::system`].
    pub fn system(&mut self, id: &str) -> RawEvent {
        self.event(EventType::SystemCreated, &fixtures::system(id))
    }

    /// `environment.created`.
    pub fn environment(&mut self, environment: &Environment) -> RawEvent {
        self.event(EventType::EnvironmentCreated, environment)
    }

    /// `deployment.created`.
    pub fn deployment(&mut self, deployment: &Deployment) -> RawEvent {
        self.event(EventType::DeploymentCreated, deployment)
    }

    /// `resource.upserted`.
    pub fn resource(&mut self, resource: &Resource) -> RawEvent {
        self.event(EventType::ResourceUpserted, resource)
    }

    /// `resource.deleted`.
    pub fn delete_resource(&mut self, id: &str) -> RawEvent {
        self.event(EventType::ResourceDeleted, &DeletePayload { id: id.to_string() })
    }

    /// `deployment-version.created`.
    pub fn version(&mut self, version: &DeploymentVersion) -> RawEvent {
        self.event(EventType::DeploymentVersionCreated, version)
    }

    /// `job-agent.created`.
    pub fn job_agent(&mut self, agent: &JobAgent) -> RawEvent {
        self.event(EventType::JobAgentCreated, agent)
    }

    /// `policy.created`.
    pub fn policy(&mut self, policy: &Policy) -> RawEvent {
        self.event(EventType::PolicyCreated, policy)
    }

    /// `user-approval-record.created`.
    pub fn approval(&mut self, record: &UserApprovalRecord) -> RawEvent {
        self.event(EventType::UserApprovalRecordCreated, record)
    }

    /// `system.deployment.linked` or `unlinked`.
    pub fn link_deployment(&mut self, system_id: &str, deployment_id: &str, linked: bool) -> RawEvent {
        let event_type = if linked {
            EventType::SystemDeploymentLinked
        } else {
            EventType::SystemDeploymentUnlinked
        };
        self.event(
            event_type,
            &DeploymentLink {
                system_id: system_id.to_string(),
                deployment_id: deployment_id.to_string(),
            },
        )
    }

    /// `system.environment.linked` or `unlinked`.
    pub fn link_environment(&mut self, system_id: &str, environment_id: &str, linked: bool) -> RawEvent {
        let event_type = if linked {
            EventType::SystemEnvironmentLinked
        } else {
            EventType::SystemEnvironmentUnlinked
        };
        self.event(
            event_type,
            &EnvironmentLink {
                system_id: system_id.to_string(),
                environment_id: environment_id.to_string(),
            },
        )
    }

    /// `job.updated` setting `status`.
    pub fn job_status(&mut self, job_id: &str, status: JobStatus) -> RawEvent {
        self.event(
            EventType::JobUpdated,
            &JobUpdate::status(job_id, status, format!("set to {status}")),
        )
    }

    /// `workspace.tick`.
    pub fn tick(&mut self) -> RawEvent {
        self.event(EventType::WorkspaceTick, &serde_json::Value::Null)
    }

    /// `workspace.recover`.
    pub fn recover(&mut self, reason: &str) -> RawEvent {
        self.event(EventType::WorkspaceRecover, &serde_json::json!({ "reason": reason }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_advance_per_event() {
        let mut events = EventFactory::new("acme");
        let a = events.system("s1");
        let b = events.tick();
        assert_eq!(b.timestamp - a.timestamp, 1_000);
        events.set_secs(50);
        assert_eq!(events.tick().timestamp, 50_000);
        assert_eq!(a.workspace_id, "acme");
        assert_eq!(a.event_type, "system.created");
    }
}
