//! Dispatch worker: drains `job-dispatch` scopes into job agents.
//!
//! The worker claims scopes from the [`Workqueue`], rebuilds each job's
//! [`DispatchContext`] from workspace state, hands the job to the
//! [`JobDispatcher`] registered for its agent type, and acknowledges the
//! claim. Agent failures become `failure` status updates through the
//! [`Setter`]; lookup failures release the claim for a later retry.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration;
use keel_core::parallel::CancelFlag;

use super::agent::{DispatchContext, JobAgentRegistry};
use super::setter::Setter;
use super::verification::{VerificationManager, VerificationSpec};
use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;
use crate::model::JobStatus;
use crate::workqueue::{
    AckParams, ClaimParams, JOB_DISPATCH_KIND, JOB_PAYLOAD, RetryParams, WorkItem, Workqueue,
};

/// Read access to dispatchable jobs, provided by the workspace registry.
#[async_trait]
pub trait DispatchSource: Send + Sync {
    /// Context of `job_id` in `workspace_id`, or `None` if the job is gone.
    ///
    /// Fails with [`Error::WorkspaceUnavailable`] while the workspace is not
    /// loaded.
    async fn dispatch_context(
        &self,
        workspace_id: &str,
        job_id: &str,
    ) -> Result<Option<DispatchContext>>;
}

/// Dispatch worker settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Identity used for workqueue claims.
    pub worker_id: String,
    /// Scopes claimed per poll.
    pub batch_size: usize,
    /// Claim lease.
    pub lease: Duration,
    /// Delay before a failed scope is retried.
    pub retry_backoff: Duration,
    /// Attempts before a job whose context cannot be loaded is failed.
    pub max_attempts: u32,
    /// Sleep between empty polls.
    pub poll_interval: StdDuration,
}

impl DispatchConfig {
    /// Defaults for `worker_id`.
    #[must_use]
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            batch_size: 10,
            lease: Duration::seconds(30),
            retry_backoff: Duration::seconds(5),
            max_attempts: 5,
            poll_interval: StdDuration::from_millis(500),
        }
    }
}

/// Outcome of one job payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handed to the agent.
    Dispatched,
    /// The agent returned an error; reported as `failure`.
    Failed,
    /// No dispatcher for the agent type; reported as `invalidIntegration`.
    InvalidIntegration,
    /// The job is gone or no longer pending.
    Skipped,
}

impl DispatchOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Dispatched => "dispatched",
            Self::Failed => "failed",
            Self::InvalidIntegration => "invalid_integration",
            Self::Skipped => "skipped",
        }
    }
}

/// Counts from one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Scopes claimed.
    pub claimed: usize,
    /// Jobs handed to agents.
    pub dispatched: usize,
    /// Jobs reported as failed or invalid.
    pub failed: usize,
    /// Jobs skipped.
    pub skipped: usize,
    /// Scopes released for retry.
    pub retried: usize,
}

/// Claims and dispatches jobs.
pub struct DispatchWorker {
    queue: Arc<dyn Workqueue>,
    source: Arc<dyn DispatchSource>,
    agents: Arc<JobAgentRegistry>,
    setter: Arc<dyn Setter>,
    verifications: Option<VerificationManager>,
    config: DispatchConfig,
    metrics: EngineMetrics,
}

impl std::fmt::Debug for DispatchWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchWorker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DispatchWorker {
    /// Creates a worker.
    #[must_use]
    pub fn new(
        queue: Arc<dyn Workqueue>,
        source: Arc<dyn DispatchSource>,
        agents: Arc<JobAgentRegistry>,
        setter: Arc<dyn Setter>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            queue,
            source,
            agents,
            setter,
            verifications: None,
            config,
            metrics: EngineMetrics::new(),
        }
    }

    /// Runs agent verifications after successful dispatch.
    #[must_use]
    pub fn with_verifications(mut self, manager: VerificationManager) -> Self {
        self.verifications = Some(manager);
        self
    }

    /// Polls until `cancel` is raised.
    pub async fn run(&self, cancel: CancelFlag) {
        tracing::info!(worker_id = %self.config.worker_id, "dispatch worker started");
        while !cancel.is_cancelled() {
            match self.run_once().await {
                Ok(report) if report.claimed > 0 => continue,
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "dispatch poll failed"),
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
        tracing::info!(worker_id = %self.config.worker_id, "dispatch worker stopped");
    }

    /// Claims one batch and processes it.
    ///
    /// # Errors
    ///
    /// Returns an error if the claim itself fails.
    #[tracing::instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn run_once(&self) -> Result<DispatchReport> {
        let items = self
            .queue
            .claim(
                ClaimParams::new(&self.config.worker_id, self.config.batch_size, self.config.lease)
                    .with_kinds([JOB_DISPATCH_KIND]),
            )
            .await?;

        let mut report = DispatchReport {
            claimed: items.len(),
            ..DispatchReport::default()
        };
        for item in items {
            self.process(&item, &mut report).await;
        }
        Ok(report)
    }

    async fn process(&self, item: &WorkItem, report: &mut DispatchReport) {
        let workspace_id = &item.scope.workspace_id;
        let mut transient: Option<Error> = None;
        // Payloads settled under this claim; a retry keeps only the others.
        let mut completed = Vec::new();

        for payload in item.payloads_of(JOB_PAYLOAD) {
            let job_id = &payload.payload_key;
            let settled = match self.dispatch_job(workspace_id, job_id).await {
                Ok(outcome) => {
                    match outcome {
                        DispatchOutcome::Dispatched => report.dispatched += 1,
                        DispatchOutcome::Failed | DispatchOutcome::InvalidIntegration => {
                            report.failed += 1;
                        }
                        DispatchOutcome::Skipped => report.skipped += 1,
                    }
                    true
                }
                // Reporting failure needs the workspace, so never give up here.
                Err(e @ Error::WorkspaceUnavailable { .. }) => {
                    tracing::debug!(workspace_id = %workspace_id, job_id = %job_id, error = %e, "workspace unavailable, dispatch deferred");
                    transient = Some(e);
                    false
                }
                Err(e) if payload.attempt_count + 1 >= self.config.max_attempts => {
                    tracing::warn!(workspace_id = %workspace_id, job_id = %job_id, error = %e, "giving up on job dispatch");
                    let message = format!("dispatch abandoned after {} attempts: {e}", payload.attempt_count + 1);
                    match self
                        .setter
                        .set_status(workspace_id, job_id, JobStatus::Failure, message)
                        .await
                    {
                        Ok(()) => {
                            report.failed += 1;
                            true
                        }
                        Err(report_err) => {
                            transient = Some(report_err);
                            false
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(workspace_id = %workspace_id, job_id = %job_id, error = %e, "job dispatch deferred");
                    transient = Some(e);
                    false
                }
            };
            if settled {
                completed.push((payload.payload_type.clone(), payload.payload_key.clone()));
            }
        }

        let result = match transient {
            Some(error) => {
                report.retried += 1;
                self.queue
                    .retry(RetryParams {
                        item_id: item.id.clone(),
                        worker_id: self.config.worker_id.clone(),
                        last_error: error.to_string(),
                        retry_backoff: self.config.retry_backoff,
                        completed,
                    })
                    .await
            }
            None => self
                .queue
                .ack_success(AckParams {
                    item_id: item.id.clone(),
                    worker_id: self.config.worker_id.clone(),
                    claimed_updated_at: item.updated_at,
                })
                .await
                .map(|_| ()),
        };
        if let Err(e) = result {
            tracing::warn!(item_id = %item.id, error = %e, "dropping workqueue claim");
        }
    }

    async fn dispatch_job(&self, workspace_id: &str, job_id: &str) -> Result<DispatchOutcome> {
        let Some(ctx) = self.source.dispatch_context(workspace_id, job_id).await? else {
            return Ok(DispatchOutcome::Skipped);
        };
        if ctx.job.status != JobStatus::Pending {
            return Ok(DispatchOutcome::Skipped);
        }

        let agent_type = ctx.job_agent.agent_type.clone();
        let outcome = match self.agents.get(&agent_type)? {
            None => {
                self.setter
                    .set_status(
                        workspace_id,
                        job_id,
                        JobStatus::InvalidIntegration,
                        format!("no dispatcher registered for agent type '{agent_type}'"),
                    )
                    .await?;
                DispatchOutcome::InvalidIntegration
            }
            Some(dispatcher) => match dispatcher.dispatch(&ctx, Arc::clone(&self.setter)).await {
                Ok(()) => {
                    self.start_verification(&ctx, dispatcher.verifications(&ctx));
                    DispatchOutcome::Dispatched
                }
                Err(e) => {
                    tracing::warn!(workspace_id, job_id, agent_type = %agent_type, error = %e, "job agent rejected job");
                    self.setter
                        .set_status(workspace_id, job_id, JobStatus::Failure, e.to_string())
                        .await?;
                    DispatchOutcome::Failed
                }
            },
        };
        self.metrics.record_dispatch(&agent_type, outcome.as_str());
        Ok(outcome)
    }

    fn start_verification(&self, ctx: &DispatchContext, specs: Vec<VerificationSpec>) {
        if specs.is_empty() {
            return;
        }
        let Some(manager) = self.verifications.clone() else {
            tracing::debug!(job_id = %ctx.job.id, "agent declared verifications but none are configured");
            return;
        };
        let workspace_id = ctx.workspace_id.clone();
        let job_id = ctx.job.id.clone();
        tokio::spawn(async move {
            if let Err(e) = manager
                .verify(&workspace_id, &job_id, specs, CancelFlag::new())
                .await
            {
                tracing::warn!(workspace_id = %workspace_id, job_id = %job_id, error = %e, "job verification failed");
            }
        });
    }
}
