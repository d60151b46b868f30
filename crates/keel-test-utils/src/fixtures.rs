//! Pre-built entities for common test scenarios.
//!
//! Each function returns an entity with sensible defaults; tests adjust the
//! fields they care about.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use keel_engine::model::{
    ApprovalStatus, Deployment, DeploymentVersion, Environment, JobAgent, Policy, PolicyRule,
    PolicyTargetSelector, Resource, Rule, System, UserApprovalRecord, VersionStatus,
};
use keel_engine::selector::Selector;
use serde_json::Map;

/// Agent type handled by [`crate::RecordingJobAgent`].
pub const TEST_AGENT_TYPE: &str = "test-agent";

/// UTC instant `secs` seconds after the epoch.
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
}

/// A system with no members.
pub fn system(id: &str) -> System {
    System::new(id, id)
}

/// An environment of `system_id` selecting resources with `selector` (CEL).
pub fn environment(id: &str, system_id: &str, selector: Option<&str>) -> Environment {
    Environment {
        id: id.to_string(),
        name: id.to_string(),
        system_id: system_id.to_string(),
        resource_selector: selector.map(Selector::cel),
        metadata: BTreeMap::new(),
    }
}

/// A deployment of `system_id` using `job_agent_id`, selecting every resource.
pub fn deployment(id: &str, system_id: &str, job_agent_id: Option<&str>) -> Deployment {
    Deployment {
        id: id.to_string(),
        name: id.to_string(),
        slug: id.to_string(),
        system_id: system_id.to_string(),
        job_agent_id: job_agent_id.map(str::to_string),
        job_agent_config: Map::new(),
        resource_selector: None,
    }
}

/// A resource of `kind` whose identifier is its id.
pub fn resource(id: &str, kind: &str) -> Resource {
    Resource {
        id: id.to_string(),
        name: id.to_string(),
        kind: kind.to_string(),
        identifier: id.to_string(),
        version: "v1".to_string(),
        config: Map::new(),
        metadata: BTreeMap::new(),
        created_at: at(0),
        updated_at: None,
        locked_at: None,
        deleted_at: None,
    }
}

/// [`resource`] with metadata entries.
pub fn resource_with_metadata(id: &str, kind: &str, metadata: &[(&str, &str)]) -> Resource {
    let mut resource = resource(id, kind);
    resource.metadata = metadata
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    resource
}

/// A ready version of `deployment_id` tagged with its id.
pub fn version(id: &str, deployment_id: &str, created_secs: i64) -> DeploymentVersion {
    DeploymentVersion {
        id: id.to_string(),
        deployment_id: deployment_id.to_string(),
        tag: id.to_string(),
        name: id.to_string(),
        status: VersionStatus::Ready,
        created_at: at(created_secs),
        config: Map::new(),
        job_agent_config: Map::new(),
        metadata: BTreeMap::new(),
    }
}

/// A job agent of [`TEST_AGENT_TYPE`].
pub fn job_agent(id: &str) -> JobAgent {
    JobAgent {
        id: id.to_string(),
        name: id.to_string(),
        agent_type: TEST_AGENT_TYPE.to_string(),
        config: Map::new(),
    }
}

/// An enabled policy applying to every release target.
pub fn policy(id: &str, rules: Vec<Rule>) -> Policy {
    Policy {
        id: id.to_string(),
        name: id.to_string(),
        description: None,
        priority: 0,
        enabled: true,
        selectors: Vec::new(),
        rules: rules
            .into_iter()
            .enumerate()
            .map(|(i, rule)| PolicyRule {
                id: format!("{id}-rule-{i}"),
                rule,
            })
            .collect(),
        created_at: Some(at(0)),
    }
}

/// [`policy`] restricted to environments matching `cel`.
pub fn environment_policy(id: &str, cel: &str, rules: Vec<Rule>) -> Policy {
    let mut policy = policy(id, rules);
    policy.selectors = vec![PolicyTargetSelector {
        environment_selector: Some(Selector::cel(cel)),
        ..PolicyTargetSelector::default()
    }];
    policy
}

/// An approval by `user_id` of `version_id` in `environment_id`.
pub fn approval(version_id: &str, environment_id: &str, user_id: &str) -> UserApprovalRecord {
    UserApprovalRecord {
        id: String::new(),
        version_id: version_id.to_string(),
        environment_id: environment_id.to_string(),
        user_id: user_id.to_string(),
        status: ApprovalStatus::Approved,
        reason: None,
        created_at: at(0),
    }
}
