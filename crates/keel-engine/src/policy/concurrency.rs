//! Concurrency rules.

use super::{EvaluationContext, EvaluationScope, RuleEvaluator, RuleResult, ScopeFields};
use crate::error::{Error, Result};

/// `concurrency{maxConcurrent}` over a deployment and environment.
#[derive(Debug)]
pub struct ConcurrencyEvaluator {
    /// Active jobs allowed at once.
    pub max_concurrent: u32,
}

impl RuleEvaluator for ConcurrencyEvaluator {
    fn rule_type(&self) -> &'static str {
        "concurrency"
    }

    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::ENVIRONMENT | ScopeFields::RELEASE_TARGET
    }

    fn evaluate(&self, ctx: &EvaluationContext<'_>, scope: &EvaluationScope<'_>) -> Result<RuleResult> {
        let rt = scope
            .release_target
            .ok_or_else(|| Error::internal("concurrency rule evaluated without release target"))?;
        let active = ctx
            .stores
            .active_jobs_for(&rt.deployment_id, &rt.environment_id)?
            .len();
        let max = self.max_concurrent as usize;
        let result = if active < max {
            RuleResult::allowed(format!("Concurrency available ({active}/{max})."))
        } else {
            RuleResult::pending(format!("Concurrency limit reached ({active}/{max})."))
        };
        Ok(result
            .with_detail("activeJobs", active)
            .with_detail("maxConcurrent", self.max_concurrent))
    }
}

/// `releaseTargetConcurrency{}`: nothing active on the target.
#[derive(Debug)]
pub struct ReleaseTargetConcurrencyEvaluator;

impl RuleEvaluator for ReleaseTargetConcurrencyEvaluator {
    fn rule_type(&self) -> &'static str {
        "releaseTargetConcurrency"
    }

    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::RELEASE_TARGET
    }

    fn evaluate(&self, ctx: &EvaluationContext<'_>, scope: &EvaluationScope<'_>) -> Result<RuleResult> {
        let rt = scope.release_target.ok_or_else(|| {
            Error::internal("release target concurrency evaluated without release target")
        })?;
        let active: Vec<String> = ctx
            .stores
            .jobs_for_release_target(rt)?
            .into_iter()
            .filter(|j| j.status.is_active())
            .map(|j| j.id)
            .collect();
        Ok(if active.is_empty() {
            RuleResult::allowed("No active jobs on release target.")
        } else {
            RuleResult::pending("Release target has an active job.").with_detail("activeJobs", active)
        })
    }
}
