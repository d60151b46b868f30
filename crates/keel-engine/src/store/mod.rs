//! Typed entity repositories for one workspace.

pub mod changeset;
pub mod repository;

use std::collections::BTreeSet;
use std::sync::Arc;

pub use changeset::{Change, ChangeSet, ChangeType};
pub use repository::{AnyRepository, Repository};

use crate::error::{Error, Result};
use crate::model::resource::identity_key;
use crate::model::{
    ApprovalStatus, Deployment, DeploymentVariable, DeploymentVersion, Environment, Job, JobAgent,
    JobVerification, Policy, RelationshipRule, Release, ReleaseTarget, Resource, ResourceVariable,
    RoleBinding, System, UserApprovalRecord,
};

/// Index names.
pub mod index {
    /// Resources by `kind/identifier`.
    pub const IDENTITY: &str = "identity";
    /// Entities by deployment id.
    pub const DEPLOYMENT: &str = "deployment";
    /// Entities by environment id.
    pub const ENVIRONMENT: &str = "environment";
    /// Entities by resource id.
    pub const RESOURCE: &str = "resource";
    /// Releases by release target key.
    pub const TARGET: &str = "target";
    /// Jobs by release id.
    pub const RELEASE: &str = "release";
    /// Approval records by `version:environment`.
    pub const PAIR: &str = "pair";
    /// Role bindings by role id.
    pub const ROLE: &str = "role";
    /// Verifications by job id.
    pub const JOB: &str = "job";
}

/// Every repository of a workspace plus the shared change set.
#[derive(Debug)]
pub struct Stores {
    changes: Arc<ChangeSet>,
    /// Systems.
    pub systems: Repository<System>,
    /// Deployments.
    pub deployments: Repository<Deployment>,
    /// Environments.
    pub environments: Repository<Environment>,
    /// Resources.
    pub resources: Repository<Resource>,
    /// Deployment versions.
    pub deployment_versions: Repository<DeploymentVersion>,
    /// Deployment variables.
    pub deployment_variables: Repository<DeploymentVariable>,
    /// Resource variables.
    pub resource_variables: Repository<ResourceVariable>,
    /// Policies.
    pub policies: Repository<Policy>,
    /// Job agents.
    pub job_agents: Repository<JobAgent>,
    /// User approval records.
    pub user_approval_records: Repository<UserApprovalRecord>,
    /// Role bindings.
    pub role_bindings: Repository<RoleBinding>,
    /// Relationship rules.
    pub relationship_rules: Repository<RelationshipRule>,
    /// Derived release targets.
    pub release_targets: Repository<ReleaseTarget>,
    /// Releases.
    pub releases: Repository<Release>,
    /// Jobs.
    pub jobs: Repository<Job>,
    /// Job verifications.
    pub job_verifications: Repository<JobVerification>,
}

impl Default for Stores {
    fn default() -> Self {
        Self::new()
    }
}

impl Stores {
    /// Creates empty stores.
    #[must_use]
    pub fn new() -> Self {
        let changes = Arc::new(ChangeSet::new());
        let c = || Arc::clone(&changes);
        Self {
            systems: Repository::new(c()),
            deployments: Repository::new(c()),
            environments: Repository::new(c()),
            resources: Repository::new(c())
                .with_index(index::IDENTITY, |r: &Resource| vec![r.identity_key()]),
            deployment_versions: Repository::new(c())
                .with_index(index::DEPLOYMENT, |v: &DeploymentVersion| {
                    vec![v.deployment_id.clone()]
                }),
            deployment_variables: Repository::new(c())
                .with_index(index::DEPLOYMENT, |v: &DeploymentVariable| {
                    vec![v.deployment_id.clone()]
                }),
            resource_variables: Repository::new(c())
                .with_index(index::RESOURCE, |v: &ResourceVariable| vec![v.resource_id.clone()]),
            policies: Repository::new(c()),
            job_agents: Repository::new(c()),
            user_approval_records: Repository::new(c())
                .with_index(index::PAIR, |r: &UserApprovalRecord| vec![r.pair_key()]),
            role_bindings: Repository::new(c())
                .with_index(index::ROLE, |b: &RoleBinding| vec![b.role_id.clone()]),
            relationship_rules: Repository::new(c()),
            release_targets: Repository::new(c())
                .with_index(index::RESOURCE, |t: &ReleaseTarget| vec![t.resource_id.clone()])
                .with_index(index::ENVIRONMENT, |t: &ReleaseTarget| {
                    vec![t.environment_id.clone()]
                })
                .with_index(index::DEPLOYMENT, |t: &ReleaseTarget| {
                    vec![t.deployment_id.clone()]
                }),
            releases: Repository::new(c())
                .with_index(index::TARGET, |r: &Release| vec![r.release_target.key()]),
            jobs: Repository::new(c()).with_index(index::RELEASE, |j: &Job| vec![j.release_id.clone()]),
            job_verifications: Repository::new(c())
                .with_index(index::JOB, |v: &JobVerification| vec![v.job_id.clone()]),
            changes,
        }
    }

    /// The shared change set.
    #[must_use]
    pub fn changes(&self) -> &Arc<ChangeSet> {
        &self.changes
    }

    /// Repositories in snapshot order.
    #[must_use]
    pub fn repositories(&self) -> [&dyn AnyRepository; 16] {
        [
            &self.systems,
            &self.deployments,
            &self.environments,
            &self.resources,
            &self.deployment_versions,
            &self.deployment_variables,
            &self.resource_variables,
            &self.policies,
            &self.job_agents,
            &self.user_approval_records,
            &self.role_bindings,
            &self.relationship_rules,
            &self.release_targets,
            &self.releases,
            &self.jobs,
            &self.job_verifications,
        ]
    }

    /// Finds the repository holding `kind`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown kinds.
    pub fn repository(&self, kind: &str) -> Result<&dyn AnyRepository> {
        self.repositories()
            .into_iter()
            .find(|r| r.kind() == kind)
            .ok_or_else(|| Error::validation(format!("unknown entity kind '{kind}'")))
    }

    /// Applies a recorded change to the matching repository.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown kinds or malformed payloads.
    pub fn replay(&self, change: &Change) -> Result<()> {
        self.repository(&change.kind)?
            .replay(change.change_type, &change.id, &change.payload)
    }

    /// Resource with the given `(kind, identifier)`.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn resource_by_identity(&self, kind: &str, identifier: &str) -> Result<Option<Resource>> {
        Ok(self
            .resources
            .lookup(index::IDENTITY, &identity_key(kind, identifier))?
            .into_iter()
            .next())
    }

    /// Versions of a deployment, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn versions_for_deployment(&self, deployment_id: &str) -> Result<Vec<DeploymentVersion>> {
        let mut versions = self
            .deployment_versions
            .lookup(index::DEPLOYMENT, deployment_id)?;
        versions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(versions)
    }

    /// Jobs whose release targets `rt`, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn jobs_for_release_target(&self, rt: &ReleaseTarget) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for release in self.releases.lookup(index::TARGET, &rt.key())? {
            jobs.extend(self.jobs.lookup(index::RELEASE, &release.id)?);
        }
        sort_newest_first(&mut jobs);
        Ok(jobs)
    }

    /// Jobs of one release, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn jobs_for_release(&self, release_id: &str) -> Result<Vec<Job>> {
        let mut jobs = self.jobs.lookup(index::RELEASE, release_id)?;
        sort_newest_first(&mut jobs);
        Ok(jobs)
    }

    /// Active jobs across every target of `(deployment, environment)`.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn active_jobs_for(&self, deployment_id: &str, environment_id: &str) -> Result<Vec<Job>> {
        let mut out = Vec::new();
        for rt in self.release_targets.lookup(index::DEPLOYMENT, deployment_id)? {
            if rt.environment_id != environment_id {
                continue;
            }
            out.extend(
                self.jobs_for_release_target(&rt)?
                    .into_iter()
                    .filter(|j| j.status.is_active()),
            );
        }
        Ok(out)
    }

    /// Users with an approved record for `(version, environment)`.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn approvers_for(&self, version_id: &str, environment_id: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .user_approval_records
            .lookup(index::PAIR, &format!("{version_id}:{environment_id}"))?
            .into_iter()
            .filter(|r| r.status == ApprovalStatus::Approved)
            .map(|r| r.user_id)
            .collect())
    }

    /// Members of a role.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn role_members(&self, role_id: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .role_bindings
            .lookup(index::ROLE, role_id)?
            .into_iter()
            .map(|b| b.user_id)
            .collect())
    }

    /// Release targets touching an environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn release_targets_for_environment(&self, environment_id: &str) -> Result<Vec<ReleaseTarget>> {
        self.release_targets.lookup(index::ENVIRONMENT, environment_id)
    }

    /// Verifications recorded for a job.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn verifications_for_job(&self, job_id: &str) -> Result<Vec<JobVerification>> {
        self.job_verifications.lookup(index::JOB, job_id)
    }
}

fn sort_newest_first(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobStatus, VersionStatus};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn version() -> DeploymentVersion {
        DeploymentVersion {
            id: "v1".into(),
            deployment_id: "d1".into(),
            tag: "v1".into(),
            name: "v1".into(),
            status: VersionStatus::Ready,
            created_at: Utc.timestamp_opt(0, 0).unwrap(),
            config: serde_json::Map::new(),
            job_agent_config: serde_json::Map::new(),
            metadata: BTreeMap::new(),
        }
    }

    fn job(id: &str, release_id: &str, secs: i64, status: JobStatus) -> Job {
        let t = Utc.timestamp_opt(secs, 0).unwrap();
        Job {
            id: id.into(),
            release_id: release_id.into(),
            job_agent_id: String::new(),
            job_agent_config: serde_json::Map::new(),
            status,
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
    fn jobs_for_release_target_joins_through_releases() {
        let stores = Stores::new();
        let rt = ReleaseTarget::new("r1", "e1", "d1");
        stores.release_targets.upsert(rt.clone()).unwrap();
        let release = Release::new(rt.clone(), version(), BTreeMap::new(), Utc::now()).unwrap();
        stores.releases.upsert(release.clone()).unwrap();
        stores.jobs.upsert(job("j1", &release.id, 1, JobStatus::Failure)).unwrap();
        stores.jobs.upsert(job("j2", &release.id, 2, JobStatus::Pending)).unwrap();
        stores.jobs.upsert(job("j3", "other", 3, JobStatus::Pending)).unwrap();

        let jobs = stores.jobs_for_release_target(&rt).unwrap();
        assert_eq!(jobs.iter().map(|j| j.id.as_str()).collect::<Vec<_>>(), ["j2", "j1"]);
        assert_eq!(stores.active_jobs_for("d1", "e1").unwrap().len(), 1);
        assert_eq!(stores.active_jobs_for("d1", "e2").unwrap().len(), 0);
    }

    #[test]
    fn replay_applies_recorded_changes() {
        let source = Stores::new();
        source.systems.upsert(System::new("s1", "one")).unwrap();
        source.systems.upsert(System::new("s2", "two")).unwrap();
        source.systems.remove("s1").unwrap();

        let target = Stores::new();
        for change in source.changes().drain() {
            target.replay(&change).unwrap();
        }
        assert_eq!(target.systems.ids().unwrap(), vec!["s2".to_string()]);
        assert!(target.changes().is_empty());
        assert!(target.repository("nonsense").is_err());
    }
}
