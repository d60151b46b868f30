//! Job agent dispatch contract and registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::setter::Setter;
use super::verification::VerificationSpec;
use crate::error::{Error, Result, poison_err};
use crate::model::{Deployment, DeploymentVersion, Job, JobAgent, LiteralValue, Release};
use crate::store::Stores;

/// Everything an agent needs to run a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchContext {
    /// Owning workspace.
    pub workspace_id: String,
    /// The job being dispatched.
    pub job: Job,
    /// Release the job executes.
    pub release: Release,
    /// Deployment of the release target.
    pub deployment: Deployment,
    /// Configured agent.
    pub job_agent: JobAgent,
    /// Agent, deployment and version configuration merged in that order.
    pub job_agent_config: Map<String, Value>,
    /// Version being released.
    pub version: DeploymentVersion,
    /// Resolved release variables.
    pub variables: BTreeMap<String, LiteralValue>,
}

impl DispatchContext {
    /// Assembles the context of `job_id` from workspace stores.
    ///
    /// Returns `None` when the job no longer exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the job's release, deployment or agent
    /// is missing.
    pub fn load(stores: &Stores, workspace_id: &str, job_id: &str) -> Result<Option<Self>> {
        let Some(job) = stores.jobs.get(job_id)? else {
            return Ok(None);
        };
        let release = stores
            .releases
            .get(&job.release_id)?
            .ok_or_else(|| Error::not_found("release", &job.release_id))?;
        let deployment_id = &release.release_target.deployment_id;
        let deployment = stores
            .deployments
            .get(deployment_id)?
            .ok_or_else(|| Error::not_found("deployment", deployment_id))?;
        let job_agent = stores
            .job_agents
            .get(&job.job_agent_id)?
            .ok_or_else(|| Error::not_found("job-agent", &job.job_agent_id))?;
        Ok(Some(Self {
            workspace_id: workspace_id.to_string(),
            job_agent_config: job.job_agent_config.clone(),
            version: release.version.clone(),
            variables: release.variables.clone(),
            job,
            release,
            deployment,
            job_agent,
        }))
    }
}

/// A pluggable integration that executes jobs.
///
/// `dispatch` hands the job to the external system. Progress and completion
/// are reported through the [`Setter`]; a returned error is reported by the
/// caller as a `failure` status.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Stable type matched against [`JobAgent::agent_type`].
    fn agent_type(&self) -> &str;

    /// Starts the job.
    async fn dispatch(&self, ctx: &DispatchContext, setter: Arc<dyn Setter>) -> Result<()>;

    /// Verification metrics to sample once the job is dispatched.
    fn verifications(&self, _ctx: &DispatchContext) -> Vec<VerificationSpec> {
        Vec::new()
    }
}

/// Dispatchers keyed by agent type.
#[derive(Default)]
pub struct JobAgentRegistry {
    dispatchers: RwLock<HashMap<String, Arc<dyn JobDispatcher>>>,
}

impl std::fmt::Debug for JobAgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobAgentRegistry")
            .field("types", &self.types().unwrap_or_default())
            .finish()
    }
}

impl JobAgentRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `dispatcher`, replacing any with the same type.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn register(&self, dispatcher: Arc<dyn JobDispatcher>) -> Result<()> {
        let agent_type = dispatcher.agent_type().to_string();
        self.dispatchers
            .write()
            .map_err(poison_err)?
            .insert(agent_type, dispatcher);
        Ok(())
    }

    /// Dispatcher for `agent_type`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn get(&self, agent_type: &str) -> Result<Option<Arc<dyn JobDispatcher>>> {
        Ok(self
            .dispatchers
            .read()
            .map_err(poison_err)?
            .get(agent_type)
            .cloned())
    }

    /// Registered types, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn types(&self) -> Result<Vec<String>> {
        let mut types: Vec<String> = self
            .dispatchers
            .read()
            .map_err(poison_err)?
            .keys()
            .cloned()
            .collect();
        types.sort();
        Ok(types)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::factory::create_job_for_release;
    use crate::model::ReleaseTarget;
    use crate::policy::test_support::{at, release, version};

    struct Noop;

    #[async_trait]
    impl JobDispatcher for Noop {
        fn agent_type(&self) -> &str {
            "noop"
        }

        async fn dispatch(&self, _ctx: &DispatchContext, _setter: Arc<dyn Setter>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn registry_looks_up_by_type() {
        let registry = JobAgentRegistry::new();
        registry.register(Arc::new(Noop)).unwrap();
        assert!(registry.get("noop").unwrap().is_some());
        assert!(registry.get("argo-cd").unwrap().is_none());
        assert_eq!(registry.types().unwrap(), vec!["noop".to_string()]);
    }

    #[test]
    fn context_loads_from_stores() {
        let stores = Stores::new();
        stores
            .deployments
            .upsert(Deployment {
                id: "d1".into(),
                name: "api".into(),
                slug: "api".into(),
                system_id: "s1".into(),
                job_agent_id: Some("a1".into()),
                job_agent_config: Map::new(),
                resource_selector: None,
            })
            .unwrap();
        stores
            .job_agents
            .upsert(JobAgent {
                id: "a1".into(),
                name: "noop".into(),
                agent_type: "noop".into(),
                config: Map::new(),
            })
            .unwrap();
        let rel = release(&ReleaseTarget::new("r1", "e1", "d1"), &version("v1", 0));
        stores.releases.upsert(rel.clone()).unwrap();
        let job = create_job_for_release(&stores, &rel, "j1".into(), at(1)).unwrap();
        stores.jobs.upsert(job).unwrap();

        let ctx = DispatchContext::load(&stores, "ws", "j1").unwrap().unwrap();
        assert_eq!(ctx.job_agent.agent_type, "noop");
        assert_eq!(ctx.version.id, "v1");
        assert_eq!(ctx.release.id, rel.id);
        assert!(DispatchContext::load(&stores, "ws", "missing").unwrap().is_none());
    }
}
