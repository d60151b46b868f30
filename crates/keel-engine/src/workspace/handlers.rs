//! Per-event-type store mutations.
//!
//! Handlers validate the payload before touching any repository, so a
//! rejected event leaves the workspace unchanged. Each handler reports which
//! part of the release-target set may have changed and which targets need a
//! fresh desired release.

use chrono::{DateTime, Utc};
use keel_core::id::deterministic_ulid;

use crate::error::{Error, Result};
use crate::events::{DeletePayload, DeploymentLink, EnvironmentLink, EventType, RawEvent};
use crate::model::{
    Deployment, DeploymentVariable, DeploymentVersion, Environment, JobAgent, JobUpdate,
    JobVerification, Policy, RelationshipRule, ReleaseTarget, Resource, ResourceVariable,
    RoleBinding, System, UserApprovalRecord,
};
use crate::policy::validate_policy;
use crate::release_target::ComputeScope;
use crate::store::{Stores, index};

/// Follow-up work after a handler ran.
#[derive(Debug, Default, PartialEq)]
pub struct Effect {
    /// Release-target recomputation needed, if any.
    pub scope: Option<ComputeScope>,
    /// Every target needs a fresh desired release.
    pub taint_all: bool,
    /// Targets needing a fresh desired release.
    pub dirty: Vec<ReleaseTarget>,
}

impl Effect {
    fn scope(scope: ComputeScope) -> Self {
        Self {
            scope: Some(scope),
            ..Self::default()
        }
    }

    fn full() -> Self {
        Self {
            scope: Some(ComputeScope::Full),
            taint_all: true,
            dirty: Vec::new(),
        }
    }

    fn taint_all() -> Self {
        Self {
            taint_all: true,
            ..Self::default()
        }
    }

    fn dirty(dirty: Vec<ReleaseTarget>) -> Self {
        Self {
            dirty,
            ..Self::default()
        }
    }
}

/// Applies `event` of type `event_type` to `stores`.
///
/// `workspace.recover` is a control event handled by the workspace itself and
/// is a no-op here.
///
/// # Errors
///
/// Returns a validation error for malformed payloads or selectors and
/// [`Error::NotFound`] when a referenced entity is missing.
pub fn apply(stores: &Stores, event_type: EventType, event: &RawEvent, now: DateTime<Utc>) -> Result<Effect> {
    use EventType as E;

    match event_type {
        E::SystemCreated | E::SystemUpdated => {
            let system: System = event.parse()?;
            require_id("system", &system.id)?;
            stores.systems.upsert(system)?;
            Ok(Effect::full())
        }
        E::SystemDeleted => {
            let DeletePayload { id } = event.parse()?;
            stores.systems.remove(&id)?;
            Ok(Effect::full())
        }
        E::SystemDeploymentLinked | E::SystemDeploymentUnlinked => {
            let link: DeploymentLink = event.parse()?;
            let mut system = existing_system(stores, &link.system_id)?;
            if event_type == E::SystemDeploymentLinked {
                system.deployment_ids.insert(link.deployment_id.clone());
            } else {
                system.deployment_ids.remove(&link.deployment_id);
            }
            stores.systems.upsert(system)?;
            Ok(Effect::scope(ComputeScope::deployment(link.deployment_id)))
        }
        E::SystemEnvironmentLinked | E::SystemEnvironmentUnlinked => {
            let link: EnvironmentLink = event.parse()?;
            let mut system = existing_system(stores, &link.system_id)?;
            if event_type == E::SystemEnvironmentLinked {
                system.environment_ids.insert(link.environment_id.clone());
            } else {
                system.environment_ids.remove(&link.environment_id);
            }
            stores.systems.upsert(system)?;
            Ok(Effect::scope(ComputeScope::environment(link.environment_id)))
        }
        E::DeploymentCreated | E::DeploymentUpdated => {
            let deployment: Deployment = event.parse()?;
            require_id("deployment", &deployment.id)?;
            if let Some(selector) = &deployment.resource_selector {
                selector.validate()?;
            }
            let previous = stores.deployments.get(&deployment.id)?;
            if let Some(prev) = previous.filter(|p| p.system_id != deployment.system_id) {
                unlink_system(stores, &prev.system_id, |s| {
                    s.deployment_ids.remove(&prev.id);
                })?;
            }
            link_system(stores, &deployment.system_id, |s| {
                s.deployment_ids.insert(deployment.id.clone());
            })?;
            let id = deployment.id.clone();
            stores.deployments.upsert(deployment)?;
            let mut effect = Effect::scope(ComputeScope::deployment(id.clone()));
            effect.dirty = targets_of(stores, index::DEPLOYMENT, &id)?;
            Ok(effect)
        }
        E::DeploymentDeleted => {
            let DeletePayload { id } = event.parse()?;
            if let Some(prev) = stores.deployments.remove(&id)? {
                unlink_system(stores, &prev.system_id, |s| {
                    s.deployment_ids.remove(&prev.id);
                })?;
            }
            Ok(Effect::scope(ComputeScope::deployment(id)))
        }
        E::EnvironmentCreated | E::EnvironmentUpdated => {
            let environment: Environment = event.parse()?;
            require_id("environment", &environment.id)?;
            if let Some(selector) = &environment.resource_selector {
                selector.validate()?;
            }
            let previous = stores.environments.get(&environment.id)?;
            if let Some(prev) = previous.filter(|p| p.system_id != environment.system_id) {
                unlink_system(stores, &prev.system_id, |s| {
                    s.environment_ids.remove(&prev.id);
                })?;
            }
            link_system(stores, &environment.system_id, |s| {
                s.environment_ids.insert(environment.id.clone());
            })?;
            let id = environment.id.clone();
            stores.environments.upsert(environment)?;
            let mut effect = Effect::scope(ComputeScope::environment(id.clone()));
            effect.dirty = targets_of(stores, index::ENVIRONMENT, &id)?;
            Ok(effect)
        }
        E::EnvironmentDeleted => {
            let DeletePayload { id } = event.parse()?;
            if let Some(prev) = stores.environments.remove(&id)? {
                unlink_system(stores, &prev.system_id, |s| {
                    s.environment_ids.remove(&prev.id);
                })?;
            }
            Ok(Effect::scope(ComputeScope::environment(id)))
        }
        E::ResourceCreated | E::ResourceUpdated | E::ResourceUpserted => {
            let resource = upsert_resource(stores, event.parse()?, event.timestamp, now)?;
            let mut effect = Effect::scope(ComputeScope::resource(resource.clone()));
            effect.dirty = targets_of(stores, index::RESOURCE, &resource)?;
            Ok(effect)
        }
        E::ResourceDeleted => {
            let DeletePayload { id } = event.parse()?;
            stores.resources.remove(&id)?;
            Ok(Effect::scope(ComputeScope::resource(id)))
        }
        E::DeploymentVersionCreated | E::DeploymentVersionUpdated => {
            let version: DeploymentVersion = event.parse()?;
            require_id("deployment version", &version.id)?;
            let deployment_id = version.deployment_id.clone();
            stores.deployment_versions.upsert(version)?;
            Ok(Effect::dirty(targets_of(stores, index::DEPLOYMENT, &deployment_id)?))
        }
        E::DeploymentVersionDeleted => {
            let DeletePayload { id } = event.parse()?;
            match stores.deployment_versions.remove(&id)? {
                Some(prev) => Ok(Effect::dirty(targets_of(stores, index::DEPLOYMENT, &prev.deployment_id)?)),
                None => Ok(Effect::default()),
            }
        }
        E::DeploymentVariableCreated | E::DeploymentVariableUpdated => {
            let variable: DeploymentVariable = event.parse()?;
            require_id("deployment variable", &variable.id)?;
            for value in &variable.values {
                if let Some(selector) = &value.resource_selector {
                    selector.validate()?;
                }
            }
            let deployment_id = variable.deployment_id.clone();
            stores.deployment_variables.upsert(variable)?;
            Ok(Effect::dirty(targets_of(stores, index::DEPLOYMENT, &deployment_id)?))
        }
        E::DeploymentVariableDeleted => {
            let DeletePayload { id } = event.parse()?;
            match stores.deployment_variables.remove(&id)? {
                Some(prev) => Ok(Effect::dirty(targets_of(stores, index::DEPLOYMENT, &prev.deployment_id)?)),
                None => Ok(Effect::default()),
            }
        }
        E::ResourceVariableCreated | E::ResourceVariableUpdated => {
            let variable: ResourceVariable = event.parse()?;
            require_id("resource variable", &variable.id)?;
            let resource_id = variable.resource_id.clone();
            stores.resource_variables.upsert(variable)?;
            Ok(Effect::dirty(targets_of(stores, index::RESOURCE, &resource_id)?))
        }
        E::ResourceVariableDeleted => {
            let DeletePayload { id } = event.parse()?;
            match stores.resource_variables.remove(&id)? {
                Some(prev) => Ok(Effect::dirty(targets_of(stores, index::RESOURCE, &prev.resource_id)?)),
                None => Ok(Effect::default()),
            }
        }
        E::PolicyCreated | E::PolicyUpdated => {
            let policy: Policy = event.parse()?;
            validate_policy(&policy)?;
            stores.policies.upsert(policy)?;
            Ok(Effect::taint_all())
        }
        E::PolicyDeleted => {
            let DeletePayload { id } = event.parse()?;
            stores.policies.remove(&id)?;
            Ok(Effect::taint_all())
        }
        E::JobAgentCreated | E::JobAgentUpdated => {
            let agent: JobAgent = event.parse()?;
            require_id("job agent", &agent.id)?;
            stores.job_agents.upsert(agent)?;
            Ok(Effect::default())
        }
        E::JobAgentDeleted => {
            let DeletePayload { id } = event.parse()?;
            stores.job_agents.remove(&id)?;
            Ok(Effect::default())
        }
        E::UserApprovalRecordCreated | E::UserApprovalRecordUpdated => {
            let mut record: UserApprovalRecord = event.parse()?;
            if record.id.is_empty() {
                record.id = record.derived_id();
            }
            stores.user_approval_records.upsert(record)?;
            Ok(Effect::default())
        }
        E::UserApprovalRecordDeleted => {
            let DeletePayload { id } = event.parse()?;
            stores.user_approval_records.remove(&id)?;
            Ok(Effect::default())
        }
        E::RoleBindingCreated => {
            let binding: RoleBinding = event.parse()?;
            require_id("role binding", &binding.id)?;
            stores.role_bindings.upsert(binding)?;
            Ok(Effect::default())
        }
        E::RoleBindingDeleted => {
            let DeletePayload { id } = event.parse()?;
            stores.role_bindings.remove(&id)?;
            Ok(Effect::default())
        }
        E::RelationshipRuleCreated | E::RelationshipRuleUpdated => {
            let rule: RelationshipRule = event.parse()?;
            require_id("relationship rule", &rule.id)?;
            if let Some(selector) = &rule.target {
                selector.validate()?;
            }
            stores.relationship_rules.upsert(rule)?;
            Ok(Effect::taint_all())
        }
        E::RelationshipRuleDeleted => {
            let DeletePayload { id } = event.parse()?;
            stores.relationship_rules.remove(&id)?;
            Ok(Effect::taint_all())
        }
        E::JobStatusChanged | E::JobUpdated => {
            let update: JobUpdate = event.parse()?;
            let mut job = stores
                .jobs
                .get(&update.id)?
                .ok_or_else(|| Error::not_found("job", &update.id))?;
            job.apply_update(&update, now);
            stores.jobs.upsert(job)?;
            Ok(Effect::default())
        }
        E::JobVerificationUpdated => {
            let verification: JobVerification = event.parse()?;
            if !stores.jobs.contains(&verification.job_id)? {
                return Err(Error::not_found("job", verification.job_id));
            }
            stores.job_verifications.upsert(verification)?;
            Ok(Effect::default())
        }
        E::WorkspaceTick | E::WorkspaceRecover => Ok(Effect::default()),
    }
}

fn require_id(what: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::validation(format!("{what} id must not be empty")));
    }
    Ok(())
}

fn existing_system(stores: &Stores, id: &str) -> Result<System> {
    stores
        .systems
        .get(id)?
        .ok_or_else(|| Error::not_found("system", id))
}

/// Adds a link to `system_id` if the system exists.
fn link_system(stores: &Stores, system_id: &str, edit: impl FnOnce(&mut System)) -> Result<()> {
    if let Some(mut system) = stores.systems.get(system_id)? {
        let before = system.clone();
        edit(&mut system);
        if system != before {
            stores.systems.upsert(system)?;
        }
    }
    Ok(())
}

fn unlink_system(stores: &Stores, system_id: &str, edit: impl FnOnce(&mut System)) -> Result<()> {
    link_system(stores, system_id, edit)
}

fn targets_of(stores: &Stores, index: &str, id: &str) -> Result<Vec<ReleaseTarget>> {
    stores.release_targets.lookup(index, id)
}

/// Upserts by `(kind, identifier)`, keeping the stored id and creation time.
///
/// A resource without an id gets one derived from the event clock and its
/// identity, so replays assign the same id.
fn upsert_resource(
    stores: &Stores,
    mut resource: Resource,
    timestamp_ms: i64,
    now: DateTime<Utc>,
) -> Result<String> {
    if resource.kind.is_empty() || resource.identifier.is_empty() {
        return Err(Error::validation("resource kind and identifier are required"));
    }
    match stores.resource_by_identity(&resource.kind, &resource.identifier)? {
        Some(existing) => {
            resource.id = existing.id;
            resource.created_at = existing.created_at;
            resource.updated_at = Some(now);
        }
        None if resource.id.is_empty() => {
            resource.id = deterministic_ulid(timestamp_ms, &resource.identity_key());
        }
        None => {}
    }
    let id = resource.id.clone();
    stores.resources.upsert(resource)?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobStatus, ReleaseTarget};
    use crate::policy::test_support::{at, job};
    use serde_json::json;

    fn event(event_type: EventType, data: serde_json::Value) -> RawEvent {
        RawEvent {
            event_type: event_type.as_str().into(),
            workspace_id: "ws".into(),
            data,
            timestamp: 1_000,
        }
    }

    fn run(stores: &Stores, event_type: EventType, data: serde_json::Value) -> Result<Effect> {
        apply(stores, event_type, &event(event_type, data), at(1))
    }

    #[test]
    fn deployment_creation_links_into_its_system() {
        let stores = Stores::new();
        run(&stores, EventType::SystemCreated, json!({"id": "s1", "name": "payments"})).unwrap();
        let effect = run(
            &stores,
            EventType::DeploymentCreated,
            json!({"id": "d1", "name": "api", "slug": "api", "systemId": "s1"}),
        )
        .unwrap();
        assert_eq!(effect.scope, Some(ComputeScope::deployment("d1")));
        assert!(stores.systems.get("s1").unwrap().unwrap().deployment_ids.contains("d1"));

        run(&stores, EventType::DeploymentDeleted, json!({"id": "d1"})).unwrap();
        assert!(stores.systems.get("s1").unwrap().unwrap().deployment_ids.is_empty());
    }

    #[test]
    fn moving_an_environment_relinks_systems() {
        let stores = Stores::new();
        run(&stores, EventType::SystemCreated, json!({"id": "s1"})).unwrap();
        run(&stores, EventType::SystemCreated, json!({"id": "s2"})).unwrap();
        run(&stores, EventType::EnvironmentCreated, json!({"id": "e1", "systemId": "s1"})).unwrap();
        run(&stores, EventType::EnvironmentUpdated, json!({"id": "e1", "systemId": "s2"})).unwrap();
        assert!(stores.systems.get("s1").unwrap().unwrap().environment_ids.is_empty());
        assert!(stores.systems.get("s2").unwrap().unwrap().environment_ids.contains("e1"));
    }

    #[test]
    fn links_require_an_existing_system() {
        let stores = Stores::new();
        let err = run(
            &stores,
            EventType::SystemDeploymentLinked,
            json!({"systemId": "nope", "deploymentId": "d1"}),
        )
        .unwrap_err();
        assert!(matches!(err, Error::NotFound { entity: "system", .. }));
    }

    #[test]
    fn resource_upsert_preserves_id_by_identity() {
        let stores = Stores::new();
        let first = json!({"id": "r1", "kind": "server", "identifier": "web-1", "createdAt": "2024-01-01T00:00:00Z"});
        run(&stores, EventType::ResourceCreated, first).unwrap();
        let second = json!({
            "id": "other",
            "kind": "server",
            "identifier": "web-1",
            "metadata": {"team": "data"},
            "createdAt": "2024-06-01T00:00:00Z"
        });
        run(&stores, EventType::ResourceUpserted, second).unwrap();

        assert_eq!(stores.resources.len().unwrap(), 1);
        let stored = stores.resources.get("r1").unwrap().unwrap();
        assert_eq!(stored.metadata["team"], "data");
        assert_eq!(stored.created_at.to_rfc3339(), "2024-01-01T00:00:00+00:00");
        assert_eq!(stored.updated_at, Some(at(1)));
    }

    #[test]
    fn resource_without_id_gets_a_replay_stable_id() {
        let a = Stores::new();
        let b = Stores::new();
        let body = json!({"kind": "server", "identifier": "web-1", "createdAt": "2024-01-01T00:00:00Z"});
        run(&a, EventType::ResourceCreated, body.clone()).unwrap();
        run(&b, EventType::ResourceCreated, body).unwrap();
        assert_eq!(a.resources.ids().unwrap(), b.resources.ids().unwrap());
    }

    #[test]
    fn invalid_selector_is_rejected_without_mutation() {
        let stores = Stores::new();
        let err = run(
            &stores,
            EventType::EnvironmentCreated,
            json!({"id": "e1", "systemId": "s1", "resourceSelector": {"cel": "kind == "}}),
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        assert!(stores.environments.is_empty().unwrap());
        assert!(stores.changes().is_empty());
    }

    #[test]
    fn approval_record_id_is_derived() {
        let stores = Stores::new();
        run(
            &stores,
            EventType::UserApprovalRecordCreated,
            json!({
                "versionId": "v1",
                "environmentId": "e1",
                "userId": "alice",
                "status": "approved",
                "createdAt": "2024-01-01T00:00:00Z"
            }),
        )
        .unwrap();
        assert!(stores.user_approval_records.contains("v1:e1:alice").unwrap());
    }

    #[test]
    fn job_updates_apply_in_place() {
        let stores = Stores::new();
        stores.jobs.upsert(job("j1", "rel", 0, JobStatus::Pending)).unwrap();
        run(
            &stores,
            EventType::JobStatusChanged,
            json!({"id": "j1", "status": "successful", "message": "done"}),
        )
        .unwrap();
        let stored = stores.jobs.get("j1").unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Successful);
        assert_eq!(stored.completed_at, Some(at(1)));

        let missing = run(&stores, EventType::JobUpdated, json!({"id": "nope", "status": "failure"}));
        assert!(matches!(missing, Err(Error::NotFound { entity: "job", .. })));
    }

    #[test]
    fn version_events_dirty_deployment_targets() {
        let stores = Stores::new();
        let rt = ReleaseTarget::new("r1", "e1", "d1");
        stores.release_targets.upsert(rt.clone()).unwrap();
        let effect = run(
            &stores,
            EventType::DeploymentVersionCreated,
            json!({"id": "v1", "deploymentId": "d1", "tag": "v1", "status": "ready", "createdAt": "2024-01-01T00:00:00Z"}),
        )
        .unwrap();
        assert_eq!(effect.dirty, vec![rt]);
        assert!(effect.scope.is_none());
    }

    #[test]
    fn policy_with_bad_rule_is_rejected() {
        let stores = Stores::new();
        let err = run(
            &stores,
            EventType::PolicyCreated,
            json!({"id": "p1", "rules": [{"denyWindow": {"rrule": "FREQ=SOMETIMES"}}]}),
        );
        assert!(err.is_err());
        assert!(stores.policies.is_empty().unwrap());
    }
}
