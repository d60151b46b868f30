//! Rollback rule: stop rolling forward once the latest job went wrong.

use super::{EvaluationContext, EvaluationScope, RuleEvaluator, RuleResult, ScopeFields};
use crate::error::{Error, Result};
use crate::model::{JobStatus, VerificationMetric};

/// `rollback{onJobStatuses?, onVerificationFailure?}`.
#[derive(Debug)]
pub struct RollbackEvaluator {
    /// Latest-job statuses that deny.
    pub on_job_statuses: Vec<JobStatus>,
    /// Deny when a verification of the latest job failed.
    pub on_verification_failure: bool,
}

impl RuleEvaluator for RollbackEvaluator {
    fn rule_type(&self) -> &'static str {
        "rollback"
    }

    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::RELEASE_TARGET
    }

    fn evaluate(&self, ctx: &EvaluationContext<'_>, scope: &EvaluationScope<'_>) -> Result<RuleResult> {
        let rt = scope
            .release_target
            .ok_or_else(|| Error::internal("rollback rule evaluated without release target"))?;
        let Some(latest) = ctx.stores.jobs_for_release_target(rt)?.into_iter().next() else {
            return Ok(RuleResult::allowed("No previous job."));
        };

        if self.on_job_statuses.contains(&latest.status) {
            return Ok(RuleResult::denied(format!(
                "Rollback: latest job {} ended with status {}.",
                latest.id, latest.status
            ))
            .with_detail("jobId", latest.id)
            .with_detail("status", latest.status.as_str()));
        }

        if self.on_verification_failure {
            let failed: Vec<String> = ctx
                .stores
                .verifications_for_job(&latest.id)?
                .into_iter()
                .flat_map(|v| v.metrics)
                .filter(VerificationMetric::has_failing_measurement)
                .map(|m| m.name)
                .collect();
            if !failed.is_empty() {
                return Ok(RuleResult::denied(format!(
                    "Rollback: verification failed for job {}.",
                    latest.id
                ))
                .with_detail("jobId", latest.id)
                .with_detail("failedMetrics", failed));
            }
        }

        Ok(RuleResult::allowed("Latest job is healthy."))
    }
}
