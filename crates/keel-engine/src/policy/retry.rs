//! Retry rules.
//!
//! Both rules count the consecutive most recent jobs of the candidate release
//! whose status is retryable. A successful or otherwise non-retryable job
//! breaks the streak.

use chrono::Duration;

use super::{EvaluationContext, EvaluationScope, RuleEvaluator, RuleResult, ScopeFields};
use crate::error::{Error, Result};
use crate::model::{BackoffStrategy, Job, JobStatus, Release};

/// Statuses retried when a rule names none.
pub const DEFAULT_RETRYABLE: [JobStatus; 3] = [
    JobStatus::Failure,
    JobStatus::InvalidIntegration,
    JobStatus::InvalidJobAgent,
];

/// Backoff before attempt number `attempt` (1-based), in seconds.
///
/// Linear is constant; exponential doubles from `base`. Both are capped by
/// `cap` when set.
#[must_use]
pub fn backoff_seconds(strategy: BackoffStrategy, base: u64, attempt: u32, cap: Option<u64>) -> u64 {
    let raw = match strategy {
        BackoffStrategy::Linear => base,
        BackoffStrategy::Exponential => {
            let shift = attempt.saturating_sub(1);
            1u64.checked_shl(shift)
                .map_or(u64::MAX, |factor| base.saturating_mul(factor))
        }
    };
    cap.map_or(raw, |cap| raw.min(cap))
}

fn consecutive_retryable(jobs: &[Job], statuses: &[JobStatus]) -> usize {
    jobs.iter().take_while(|j| statuses.contains(&j.status)).count()
}

fn release_of<'a>(scope: &EvaluationScope<'a>) -> Result<&'a Release> {
    scope
        .release
        .ok_or_else(|| Error::internal("retry rule evaluated without release"))
}

/// `retry{maxRetries, retryOnStatuses?, backoffSeconds?, backoffStrategy, maxBackoffSeconds?}`.
#[derive(Debug)]
pub struct RetryEvaluator {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Retryable statuses; defaults to [`DEFAULT_RETRYABLE`].
    pub retry_on_statuses: Option<Vec<JobStatus>>,
    /// Base backoff.
    pub backoff_seconds: Option<u64>,
    /// Growth of the backoff.
    pub backoff_strategy: BackoffStrategy,
    /// Backoff ceiling.
    pub max_backoff_seconds: Option<u64>,
}

impl RetryEvaluator {
    fn statuses(&self) -> Vec<JobStatus> {
        let mut statuses = self
            .retry_on_statuses
            .clone()
            .unwrap_or_else(|| DEFAULT_RETRYABLE.to_vec());
        if self.max_retries == 0 && !statuses.contains(&JobStatus::Successful) {
            statuses.push(JobStatus::Successful);
        }
        statuses
    }
}

impl RuleEvaluator for RetryEvaluator {
    fn rule_type(&self) -> &'static str {
        "retry"
    }

    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::RELEASE
    }

    fn evaluate(&self, ctx: &EvaluationContext<'_>, scope: &EvaluationScope<'_>) -> Result<RuleResult> {
        let release = release_of(scope)?;
        let jobs = ctx.stores.jobs_for_release(&release.id)?;
        let attempts = consecutive_retryable(&jobs, &self.statuses());
        let max = self.max_retries as usize;

        if attempts > max {
            return Ok(RuleResult::denied(format!(
                "Retry limit exceeded ({attempts}/{max})."
            ))
            .with_detail("attempts", attempts)
            .with_detail("maxRetries", self.max_retries));
        }

        if let (Some(base), Some(last)) = (self.backoff_seconds, jobs.first()) {
            if attempts > 0 {
                let attempt = u32::try_from(attempts).unwrap_or(u32::MAX);
                let wait = backoff_seconds(
                    self.backoff_strategy,
                    base,
                    attempt,
                    self.max_backoff_seconds,
                );
                let wait = Duration::seconds(i64::try_from(wait).unwrap_or(i64::MAX / 1_000));
                let next = last.last_attempt_at() + wait;
                if ctx.now < next {
                    let remaining = (next - ctx.now).num_seconds();
                    return Ok(RuleResult::pending(format!(
                        "Waiting {remaining}s before retry {attempts}/{max}."
                    ))
                    .with_detail("attempts", attempts)
                    .with_detail("remainingSeconds", remaining)
                    .with_detail("nextAllowedTime", next.to_rfc3339())
                    .with_next_evaluation(next));
                }
            }
        }

        Ok(RuleResult::allowed(format!("Retry allowed ({attempts}/{max}).")).with_detail("attempts", attempts))
    }
}

/// `maxRetries{maxRetries}`.
#[derive(Debug)]
pub struct MaxRetriesEvaluator {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
}

impl RuleEvaluator for MaxRetriesEvaluator {
    fn rule_type(&self) -> &'static str {
        "maxRetries"
    }

    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::RELEASE
    }

    fn evaluate(&self, ctx: &EvaluationContext<'_>, scope: &EvaluationScope<'_>) -> Result<RuleResult> {
        let release = release_of(scope)?;
        let jobs = ctx.stores.jobs_for_release(&release.id)?;
        let attempts = consecutive_retryable(&jobs, &DEFAULT_RETRYABLE);
        let max = self.max_retries as usize;
        let result = if attempts <= max {
            RuleResult::allowed(format!("Retries remaining ({attempts}/{max})."))
        } else {
            RuleResult::denied(format!("Max retries exceeded ({attempts}/{max})."))
        };
        Ok(result.with_detail("attempts", attempts))
    }
}
