//! Job materialisation for releases.
//!
//! The factory reads stores and returns a [`Job`]; it never writes. The
//! caller persists the job and decides whether to enqueue it for dispatch.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use keel_core::id::deterministic_ulid;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::model::{Job, JobStatus, Release};
use crate::store::Stores;

/// Deep-merges `overlay` into `base`. Nested objects merge recursively;
/// any other value in `overlay` replaces the one in `base`.
pub fn deep_merge(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Job id for the next attempt of `release`.
///
/// Derived from the event clock and the attempt index so replays assign the
/// same ids.
///
/// # Errors
///
/// Returns an error if the jobs repository cannot be read.
pub fn next_job_id(stores: &Stores, release: &Release, now: DateTime<Utc>) -> Result<String> {
    let attempt = stores.jobs_for_release(&release.id)?.len();
    Ok(deterministic_ulid(
        now.timestamp_millis(),
        &format!("{}:{attempt}", release.id),
    ))
}

/// Builds the job that executes `release`.
///
/// Deployments without a usable job agent still get a job, in status
/// `invalidJobAgent`, so the outcome is visible; such jobs are never
/// dispatched.
///
/// # Errors
///
/// Returns [`Error::Internal`] if the release's deployment does not exist.
pub fn create_job_for_release(
    stores: &Stores,
    release: &Release,
    job_id: String,
    now: DateTime<Utc>,
) -> Result<Job> {
    let deployment_id = &release.release_target.deployment_id;
    let deployment = stores.deployments.get(deployment_id)?.ok_or_else(|| {
        Error::internal(format!(
            "release {} refers to missing deployment {deployment_id}",
            release.id
        ))
    })?;

    let mut job = Job {
        id: job_id,
        release_id: release.id.clone(),
        job_agent_id: String::new(),
        job_agent_config: Map::new(),
        status: JobStatus::Pending,
        message: String::new(),
        created_at: now,
        updated_at: now,
        started_at: None,
        completed_at: None,
        external_id: None,
        metadata: BTreeMap::new(),
    };

    let Some(agent_id) = deployment.job_agent_id.filter(|id| !id.is_empty()) else {
        job.status = JobStatus::InvalidJobAgent;
        job.message = format!("deployment {} has no job agent configured", deployment.id);
        return Ok(job);
    };
    job.job_agent_id.clone_from(&agent_id);

    let Some(agent) = stores.job_agents.get(&agent_id)? else {
        job.status = JobStatus::InvalidJobAgent;
        job.message = format!("job agent {agent_id} not found");
        return Ok(job);
    };

    let mut config = agent.config;
    deep_merge(&mut config, &deployment.job_agent_config);
    deep_merge(&mut config, &release.version.job_agent_config);
    job.job_agent_config = config;
    Ok(job)
}
