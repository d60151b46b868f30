//! Job agent and setter doubles that record what they see.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use keel_engine::error::{Error, Result};
use keel_engine::jobs::{DispatchContext, JobDispatcher, Setter};
use keel_engine::model::{JobStatus, JobUpdate};

use crate::fixtures::TEST_AGENT_TYPE;

/// What a [`RecordingJobAgent`] does with a dispatched job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentBehavior {
    /// Accept the job and report nothing.
    Accept,
    /// Report `status` through the setter.
    Report(JobStatus),
    /// Return a dispatch error.
    Fail(String),
}

/// A job agent that records every dispatch.
#[derive(Debug)]
pub struct RecordingJobAgent {
    agent_type: String,
    behavior: Mutex<AgentBehavior>,
    dispatched: Mutex<Vec<DispatchContext>>,
}

impl RecordingJobAgent {
    /// Agent of [`TEST_AGENT_TYPE`] that accepts every job.
    pub fn new() -> Self {
        Self::with_type(TEST_AGENT_TYPE)
    }

    /// Agent of `agent_type` that accepts every job.
    pub fn with_type(agent_type: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            behavior: Mutex::new(AgentBehavior::Accept),
            dispatched: Mutex::new(Vec::new()),
        }
    }

    /// Changes the behavior for subsequent dispatches.
    pub fn set_behavior(&self, behavior: AgentBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Contexts dispatched so far, in order.
    pub fn dispatched(&self) -> Vec<DispatchContext> {
        self.dispatched.lock().unwrap().clone()
    }

    /// Ids of dispatched jobs, in order.
    pub fn dispatched_job_ids(&self) -> Vec<String> {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .map(|ctx| ctx.job.id.clone())
            .collect()
    }
}

impl Default for RecordingJobAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobDispatcher for RecordingJobAgent {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    async fn dispatch(&self, ctx: &DispatchContext, setter: Arc<dyn Setter>) -> Result<()> {
        self.dispatched.lock().unwrap().push(ctx.clone());
        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            AgentBehavior::Accept => Ok(()),
            AgentBehavior::Report(status) => {
                setter
                    .set_status(&ctx.workspace_id, &ctx.job.id, status, format!("agent reported {status}"))
                    .await
            }
            AgentBehavior::Fail(message) => Err(Error::dispatch(message)),
        }
    }
}

/// A setter that records updates instead of applying them.
#[derive(Debug, Default)]
pub struct RecordingSetter {
    updates: Mutex<Vec<(String, JobUpdate)>>,
}

impl RecordingSetter {
    /// Creates an empty setter.
    pub fn new() -> Self {
        Self::default()
    }

    /// `(workspace, update)` pairs received so far.
    pub fn updates(&self) -> Vec<(String, JobUpdate)> {
        self.updates.lock().unwrap().clone()
    }

    /// Last status reported for `job_id`.
    pub fn last_status(&self, job_id: &str) -> Option<JobStatus> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(_, update)| update.id == job_id)
            .and_then(|(_, update)| update.status)
    }
}

#[async_trait]
impl Setter for RecordingSetter {
    async fn set(&self, workspace_id: &str, update: JobUpdate) -> Result<()> {
        self.updates
            .lock()
            .unwrap()
            .push((workspace_id.to_string(), update));
        Ok(())
    }
}
