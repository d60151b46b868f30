//! Release manager: desired releases and reconciliation per release target.
//!
//! Every release target moves through
//!
//! ```text
//! Clean --mark dirty--> DesiredDirty --recompute--> DesiredReady --reconcile--> Allowed | Pending | Denied
//! ```
//!
//! Recompute picks the newest ready version that no applicable
//! `deploymentVersionSelector` rejects, resolves variables and stores the
//! candidate [`Release`] as the target's desired release. Reconcile compares
//! the desired release with the target's job history, evaluates policies and,
//! when allowed, creates a job and enqueues it for dispatch.
//!
//! Reconciliation is idempotent: with no state change in between, a second
//! pass creates no jobs and enqueues nothing.

pub mod variables;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use keel_core::observability::release_target_span;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::Instrument;

use crate::error::{Result, poison_err};
use crate::jobs::factory::{create_job_for_release, next_job_id};
use crate::metrics::EngineMetrics;
use crate::model::{Job, JobStatus, Release, ReleaseTarget};
use crate::policy::{
    Decision, EvaluationContext, EvaluationScope, PolicyEngine, PolicyEvaluation, TargetEntities,
    applicable_policies, permits_retry, version_eligible,
};
use crate::store::Stores;
use crate::workqueue::{
    EnqueueParams, JOB_DISPATCH_KIND, JOB_PAYLOAD, RELEASE_TARGET_SCOPE, ScopeKey, Workqueue,
};

pub use variables::{RelationshipResolver, RuleRelationshipResolver, resolve_variables};

/// Where a target is in the desired-release cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TargetPhase {
    /// No pending recomputation.
    #[default]
    Clean,
    /// The desired release must be recomputed.
    DesiredDirty,
    /// The desired release is current.
    DesiredReady,
}

/// Per-target bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetState {
    /// Cycle phase.
    pub phase: TargetPhase,
    /// Release the target should run, if any version is eligible.
    pub desired: Option<Release>,
    /// Outcome of the most recent policy evaluation.
    pub decision: Option<Decision>,
    /// Reason attached to the decision.
    pub message: Option<String>,
    /// When a pending or denied decision may change.
    pub next_evaluation_time: Option<DateTime<Utc>>,
    /// Full rule breakdown of the last evaluation.
    pub last_evaluation: Option<PolicyEvaluation>,
}

/// Inputs of one reconcile pass.
#[derive(Clone, Copy)]
pub struct ReconcileContext<'a> {
    /// Workspace stores.
    pub stores: &'a Stores,
    /// Owning workspace.
    pub workspace_id: &'a str,
    /// Logical clock of the pass.
    pub now: DateTime<Utc>,
    /// Queue receiving dispatch work.
    pub workqueue: &'a dyn Workqueue,
}

impl std::fmt::Debug for ReconcileContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcileContext")
            .field("workspace_id", &self.workspace_id)
            .field("now", &self.now)
            .finish_non_exhaustive()
    }
}

/// Options for [`ReleaseManager::reconcile_targets`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOptions {
    /// Recompute desired releases of the given targets first.
    pub recompute: bool,
}

/// Counts from one reconcile pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Jobs created, in target order.
    pub jobs_created: Vec<Job>,
    /// Targets left pending.
    pub pending: usize,
    /// Targets denied.
    pub denied: usize,
    /// Targets with nothing to do.
    pub unchanged: usize,
}

/// What reconciliation should do for one target.
enum Step {
    Nothing,
    Evaluate(Release),
}

/// Tracks desired releases and reconciles them into jobs.
#[derive(Debug)]
pub struct ReleaseManager {
    states: RwLock<BTreeMap<ReleaseTarget, TargetState>>,
    policies: PolicyEngine,
    resolver: Arc<dyn RelationshipResolver>,
    metrics: EngineMetrics,
}

impl Default for ReleaseManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ReleaseManager {
    /// Creates a manager resolving references with relationship rules.
    #[must_use]
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(RuleRelationshipResolver))
    }

    /// Creates a manager with a custom reference resolver.
    #[must_use]
    pub fn with_resolver(resolver: Arc<dyn RelationshipResolver>) -> Self {
        Self {
            states: RwLock::new(BTreeMap::new()),
            policies: PolicyEngine::new(),
            resolver,
            metrics: EngineMetrics::new(),
        }
    }

    /// Drops memoized policy results.
    pub fn clear_cache(&self) {
        self.policies.clear_cache();
    }

    /// Flags `rt` for desired-release recomputation.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn dirty_desired_release(&self, rt: &ReleaseTarget) -> Result<()> {
        self.states
            .write()
            .map_err(poison_err)?
            .entry(rt.clone())
            .or_default()
            .phase = TargetPhase::DesiredDirty;
        Ok(())
    }

    /// Flags every stored release target.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn taint_all(&self, stores: &Stores) -> Result<()> {
        let targets = stores.release_targets.values()?;
        let mut states = self.states.write().map_err(poison_err)?;
        for rt in targets {
            states.entry(rt).or_default().phase = TargetPhase::DesiredDirty;
        }
        Ok(())
    }

    /// Forgets a removed target, returning its last state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn drop_target(&self, rt: &ReleaseTarget) -> Result<Option<TargetState>> {
        Ok(self.states.write().map_err(poison_err)?.remove(rt))
    }

    /// State of one target.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn state(&self, rt: &ReleaseTarget) -> Result<Option<TargetState>> {
        Ok(self.states.read().map_err(poison_err)?.get(rt).cloned())
    }

    /// States of every tracked target.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn states(&self) -> Result<BTreeMap<ReleaseTarget, TargetState>> {
        Ok(self.states.read().map_err(poison_err)?.clone())
    }

    /// Recomputes the desired release of every dirty target.
    ///
    /// Returns the number of targets recomputed.
    ///
    /// # Errors
    ///
    /// Returns an error if stores cannot be read.
    pub fn recompute_state(&self, stores: &Stores, now: DateTime<Utc>) -> Result<usize> {
        let dirty: Vec<ReleaseTarget> = self
            .states
            .read()
            .map_err(poison_err)?
            .iter()
            .filter(|(_, s)| s.phase == TargetPhase::DesiredDirty)
            .map(|(rt, _)| rt.clone())
            .collect();

        for rt in &dirty {
            let desired = self.desired_release(stores, rt, now)?;
            let mut states = self.states.write().map_err(poison_err)?;
            let state = states.entry(rt.clone()).or_default();
            state.desired = desired;
            state.phase = TargetPhase::DesiredReady;
        }
        Ok(dirty.len())
    }

    fn desired_release(
        &self,
        stores: &Stores,
        rt: &ReleaseTarget,
        now: DateTime<Utc>,
    ) -> Result<Option<Release>> {
        let Some(entities) = TargetEntities::load(stores, rt)? else {
            return Ok(None);
        };
        let policies = applicable_policies(stores, &entities)?;
        let Some(version) = stores
            .versions_for_deployment(&rt.deployment_id)?
            .into_iter()
            .filter(|v| v.is_ready())
            .find(|v| version_eligible(&policies, v))
        else {
            return Ok(None);
        };
        let Some(variables) =
            resolve_variables(stores, self.resolver.as_ref(), &rt.deployment_id, &entities.resource)?
        else {
            return Ok(None);
        };

        let candidate = Release::new(rt.clone(), version, variables, now)?;
        // Keep the first-seen creation time so identical candidates compare equal.
        Ok(Some(match stores.releases.get(&candidate.id)? {
            Some(existing) => existing,
            None => candidate,
        }))
    }

    /// Decides whether `rt` needs a policy evaluation.
    fn step(stores: &Stores, rt: &ReleaseTarget, desired: Option<Release>) -> Result<Step> {
        let Some(desired) = desired else {
            return Ok(Step::Nothing);
        };
        let jobs = stores.jobs_for_release_target(rt)?;
        if jobs.iter().any(|j| j.status.is_active()) {
            return Ok(Step::Nothing);
        }
        let Some(latest) = jobs.first() else {
            return Ok(Step::Evaluate(desired));
        };
        if latest.release_id != desired.id {
            return Ok(Step::Evaluate(desired));
        }
        if latest.status == JobStatus::Successful {
            return Ok(Step::Nothing);
        }
        let retryable = match TargetEntities::load(stores, rt)? {
            Some(entities) => permits_retry(&applicable_policies(stores, &entities)?),
            None => false,
        };
        Ok(if retryable {
            Step::Evaluate(desired)
        } else {
            Step::Nothing
        })
    }

    /// Reconciles `targets` toward their desired releases.
    ///
    /// # Errors
    ///
    /// Returns an error if stores cannot be read, a job cannot be built, or
    /// the workqueue rejects an enqueue.
    #[tracing::instrument(skip_all, fields(workspace_id = %ctx.workspace_id, targets = targets.len()))]
    pub async fn reconcile_targets(
        &self,
        ctx: ReconcileContext<'_>,
        targets: &[ReleaseTarget],
        options: ReconcileOptions,
    ) -> Result<ReconcileReport> {
        if options.recompute {
            for rt in targets {
                self.dirty_desired_release(rt)?;
            }
            self.recompute_state(ctx.stores, ctx.now)?;
        }

        let mut report = ReconcileReport::default();
        for rt in targets {
            let desired = self.state(rt)?.and_then(|s| s.desired);
            let Step::Evaluate(release) = Self::step(ctx.stores, rt, desired)? else {
                report.unchanged += 1;
                continue;
            };

            let evaluation = self.evaluate(ctx, rt, &release)?;
            self.metrics.record_decision(evaluation.decision.as_str());
            self.record_evaluation(rt, &evaluation)?;

            match evaluation.decision {
                Decision::Allowed => {
                    let span = release_target_span("create_job", ctx.workspace_id, &rt.key());
                    let job = self.create_job(ctx, rt, &release).instrument(span).await?;
                    report.jobs_created.push(job);
                }
                Decision::Pending => report.pending += 1,
                Decision::Denied => report.denied += 1,
            }
        }
        Ok(report)
    }

    /// Recomputes dirty targets and reconciles every stored target.
    ///
    /// # Errors
    ///
    /// See [`ReleaseManager::reconcile_targets`].
    pub async fn reconcile_all(&self, ctx: ReconcileContext<'_>) -> Result<ReconcileReport> {
        self.recompute_state(ctx.stores, ctx.now)?;
        let targets = ctx.stores.release_targets.values()?;
        self.reconcile_targets(ctx, &targets, ReconcileOptions::default())
            .await
    }

    fn evaluate(
        &self,
        ctx: ReconcileContext<'_>,
        rt: &ReleaseTarget,
        release: &Release,
    ) -> Result<PolicyEvaluation> {
        let Some(entities) = TargetEntities::load(ctx.stores, rt)? else {
            return Ok(PolicyEvaluation::from_outcomes(Vec::new()));
        };
        let policies = applicable_policies(ctx.stores, &entities)?;
        let eval_ctx = EvaluationContext {
            stores: ctx.stores,
            now: ctx.now,
            workspace_id: ctx.workspace_id,
        };
        let scope = EvaluationScope {
            environment: Some(&entities.environment),
            version: Some(&release.version),
            release_target: Some(rt),
            release: Some(release),
        };
        self.policies.evaluate(&eval_ctx, &policies, &scope)
    }

    fn record_evaluation(&self, rt: &ReleaseTarget, evaluation: &PolicyEvaluation) -> Result<()> {
        let mut states = self.states.write().map_err(poison_err)?;
        let state = states.entry(rt.clone()).or_default();
        state.decision = Some(evaluation.decision);
        state.message = evaluation.message().map(str::to_string);
        state.next_evaluation_time = evaluation.next_evaluation_time();
        state.last_evaluation = Some(evaluation.clone());
        if evaluation.decision != Decision::Allowed {
            tracing::debug!(
                release_target = %rt,
                decision = evaluation.decision.as_str(),
                message = state.message.as_deref().unwrap_or_default(),
                "release held by policy"
            );
        }
        Ok(())
    }

    async fn create_job(
        &self,
        ctx: ReconcileContext<'_>,
        rt: &ReleaseTarget,
        release: &Release,
    ) -> Result<Job> {
        if !ctx.stores.releases.contains(&release.id)? {
            ctx.stores.releases.upsert(release.clone())?;
        }
        let job_id = next_job_id(ctx.stores, release, ctx.now)?;
        let job = create_job_for_release(ctx.stores, release, job_id, ctx.now)?;
        ctx.stores.jobs.upsert(job.clone())?;
        // Concurrency results cached earlier in this pass no longer hold.
        self.policies.clear_cache();
        self.metrics.record_job_created(job.status.as_str());
        tracing::info!(
            release_target = %rt,
            job_id = %job.id,
            status = %job.status,
            version = %release.version.tag,
            "created job"
        );

        if job.status == JobStatus::Pending {
            enqueue_dispatch(ctx.workqueue, ctx.workspace_id, rt, &job, ctx.now.timestamp_millis())
                .await?;
        }
        Ok(job)
    }
}

/// Queues `job` for dispatch on its release target's scope.
///
/// # Errors
///
/// Returns the workqueue's error.
pub async fn enqueue_dispatch(
    workqueue: &dyn Workqueue,
    workspace_id: &str,
    rt: &ReleaseTarget,
    job: &Job,
    event_ts: i64,
) -> Result<()> {
    let params = EnqueueParams::new(
        ScopeKey::new(workspace_id, JOB_DISPATCH_KIND, RELEASE_TARGET_SCOPE, rt.key()),
        event_ts,
    )
    .with_payload(
        JOB_PAYLOAD,
        Some(job.id.clone()),
        json!({"jobId": job.id, "releaseId": job.release_id}),
    );
    workqueue.enqueue(params).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Deployment, Environment, JobAgent, Policy, PolicyRule, Resource,
        Rule, VersionStatus,
    };
    use crate::policy::test_support::{at, version};
    use crate::selector::Selector;
    use crate::workqueue::memory::InMemoryWorkqueue;
    use serde_json::Map;

    fn seed() -> (Stores, ReleaseTarget) {
        let stores = Stores::new();
        stores
            .resources
            .upsert(Resource {
                id: "r1".into(),
                name: "r1".into(),
                kind: "server".into(),
                identifier: "r1".into(),
                version: "v1".into(),
                config: Map::new(),
                metadata: BTreeMap::new(),
                created_at: at(0),
                updated_at: None,
                locked_at: None,
                deleted_at: None,
            })
            .unwrap();
        stores
            .environments
            .upsert(Environment {
                id: "e1".into(),
                name: "prod".into(),
                system_id: "s1".into(),
                resource_selector: Some(Selector::cel("true")),
                metadata: BTreeMap::new(),
            })
            .unwrap();
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
                name: "agent".into(),
                agent_type: "test".into(),
                config: Map::new(),
            })
            .unwrap();
        let rt = ReleaseTarget::new("r1", "e1", "d1");
        stores.release_targets.upsert(rt.clone()).unwrap();
        (stores, rt)
    }

    fn ctx<'a>(stores: &'a Stores, queue: &'a InMemoryWorkqueue, secs: i64) -> ReconcileContext<'a> {
        ReconcileContext {
            stores,
            workspace_id: "ws",
            now: at(secs),
            workqueue: queue,
        }
    }

    fn policy(id: &str, rule: Rule) -> Policy {
        Policy {
            id: id.into(),
            name: id.into(),
            description: None,
            priority: 0,
            enabled: true,
            selectors: Vec::new(),
            rules: vec![PolicyRule {
                id: format!("{id}-rule"),
                rule,
            }],
            created_at: Some(at(0)),
        }
    }

    #[test]
    fn recompute_picks_newest_ready_version() {
        let (stores, rt) = seed();
        stores.deployment_versions.upsert(version("v1", 1)).unwrap();
        let mut v2 = version("v2", 2);
        v2.status = VersionStatus::Building;
        stores.deployment_versions.upsert(v2).unwrap();

        let manager = ReleaseManager::new();
        manager.dirty_desired_release(&rt).unwrap();
        assert_eq!(manager.recompute_state(&stores, at(10)).unwrap(), 1);
        let state = manager.state(&rt).unwrap().unwrap();
        assert_eq!(state.phase, TargetPhase::DesiredReady);
        assert_eq!(state.desired.unwrap().version.id, "v1");
    }

    #[test]
    fn version_selector_policy_filters_versions() {
        let (stores, rt) = seed();
        stores.deployment_versions.upsert(version("v1", 1)).unwrap();
        stores.deployment_versions.upsert(version("v2", 2)).unwrap();
        stores
            .policies
            .upsert(policy(
                "pin",
                Rule::DeploymentVersionSelector {
                    selector: Selector::cel("tag == 'v1'"),
                },
            ))
            .unwrap();

        let manager = ReleaseManager::new();
        manager.dirty_desired_release(&rt).unwrap();
        manager.recompute_state(&stores, at(10)).unwrap();
        let desired = manager.state(&rt).unwrap().unwrap().desired.unwrap();
        assert_eq!(desired.version.id, "v1");
    }

    #[tokio::test]
    async fn allowed_release_creates_and_enqueues_one_job() -> Result<()> {
        let (stores, rt) = seed();
        stores.deployment_versions.upsert(version("v1", 1))?;
        let queue = InMemoryWorkqueue::new();
        let manager = ReleaseManager::new();
        manager.taint_all(&stores)?;

        let first = manager.reconcile_all(ctx(&stores, &queue, 10)).await?;
        assert_eq!(first.jobs_created.len(), 1);
        assert_eq!(first.jobs_created[0].status, JobStatus::Pending);
        assert_eq!(queue.len()?, 1);
        let items = queue.list(Some("ws")).await?;
        assert_eq!(items[0].scope.scope_id, rt.key());
        assert!(items[0].payloads_of(JOB_PAYLOAD).any(|p| p.payload_key == first.jobs_created[0].id));

        let second = manager.reconcile_all(ctx(&stores, &queue, 11)).await?;
        assert!(second.jobs_created.is_empty());
        assert_eq!(stores.jobs.len()?, 1);
        assert_eq!(queue.list(Some("ws")).await?[0].payloads.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn successful_job_for_desired_release_is_final() -> Result<()> {
        let (stores, rt) = seed();
        stores.deployment_versions.upsert(version("v1", 1))?;
        let queue = InMemoryWorkqueue::new();
        let manager = ReleaseManager::new();
        manager.taint_all(&stores)?;
        let report = manager.reconcile_all(ctx(&stores, &queue, 10)).await?;
        let mut job = report.jobs_created[0].clone();
        job.status = JobStatus::Successful;
        stores.jobs.upsert(job)?;

        let again = manager.reconcile_all(ctx(&stores, &queue, 20)).await?;
        assert!(again.jobs_created.is_empty());

        stores.deployment_versions.upsert(version("v2", 15))?;
        manager.dirty_desired_release(&rt)?;
        let upgraded = manager.reconcile_all(ctx(&stores, &queue, 30)).await?;
        assert_eq!(upgraded.jobs_created.len(), 1);
        let release = stores.releases.get(&upgraded.jobs_created[0].release_id)?.unwrap();
        assert_eq!(release.version.id, "v2");
        Ok(())
    }

    #[tokio::test]
    async fn failed_job_reruns_only_with_retry_rule() -> Result<()> {
        let (stores, _) = seed();
        stores.deployment_versions.upsert(version("v1", 1))?;
        let queue = InMemoryWorkqueue::new();
        let manager = ReleaseManager::new();
        manager.taint_all(&stores)?;
        let report = manager.reconcile_all(ctx(&stores, &queue, 10)).await?;
        let mut job = report.jobs_created[0].clone();
        job.status = JobStatus::Failure;
        job.completed_at = Some(at(12));
        stores.jobs.upsert(job)?;

        let without = manager.reconcile_all(ctx(&stores, &queue, 20)).await?;
        assert!(without.jobs_created.is_empty());

        stores.policies.upsert(policy("retry", Rule::MaxRetries { max_retries: 2 }))?;
        manager.clear_cache();
        let with = manager.reconcile_all(ctx(&stores, &queue, 30)).await?;
        assert_eq!(with.jobs_created.len(), 1);
        assert_ne!(with.jobs_created[0].id, report.jobs_created[0].id);
        Ok(())
    }

    #[tokio::test]
    async fn pending_decision_records_reason() -> Result<()> {
        let (stores, rt) = seed();
        stores.deployment_versions.upsert(version("v1", 1))?;
        stores
            .policies
            .upsert(policy("approval", Rule::AnyApproval { min_approvals: 1 }))?;
        let queue = InMemoryWorkqueue::new();
        let manager = ReleaseManager::new();
        manager.taint_all(&stores)?;

        let report = manager.reconcile_all(ctx(&stores, &queue, 10)).await?;
        assert_eq!(report.pending, 1);
        assert!(queue.is_empty()?);
        let state = manager.state(&rt)?.unwrap();
        assert_eq!(state.decision, Some(Decision::Pending));
        assert_eq!(state.message.as_deref(), Some("Not enough approvals (0/1)."));
        Ok(())
    }

    #[tokio::test]
    async fn invalid_job_agent_is_recorded_not_enqueued() -> Result<()> {
        let (stores, _) = seed();
        stores.job_agents.remove("a1")?;
        stores.deployment_versions.upsert(version("v1", 1))?;
        let queue = InMemoryWorkqueue::new();
        let manager = ReleaseManager::new();
        manager.taint_all(&stores)?;

        let report = manager.reconcile_all(ctx(&stores, &queue, 10)).await?;
        assert_eq!(report.jobs_created[0].status, JobStatus::InvalidJobAgent);
        assert!(queue.is_empty()?);
        Ok(())
    }

    #[tokio::test]
    async fn no_ready_version_means_no_desired_release() -> Result<()> {
        let (stores, rt) = seed();
        let queue = InMemoryWorkqueue::new();
        let manager = ReleaseManager::new();
        manager.taint_all(&stores)?;
        let report = manager.reconcile_all(ctx(&stores, &queue, 10)).await?;
        assert_eq!(report.unchanged, 1);
        assert!(manager.state(&rt)?.unwrap().desired.is_none());
        Ok(())
    }

    #[test]
    fn drop_target_forgets_state() {
        let (_, rt) = seed();
        let manager = ReleaseManager::new();
        manager.dirty_desired_release(&rt).unwrap();
        assert!(manager.drop_target(&rt).unwrap().is_some());
        assert!(manager.state(&rt).unwrap().is_none());
    }
}
