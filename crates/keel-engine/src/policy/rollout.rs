//! Staggered rollout of a version across an environment's targets.
//!
//! Each target of the version's deployment in the environment gets a stable
//! position from the hash of `versionId + rt.key`. A target may deploy once
//! `version.createdAt + offset(position)` has passed.

use chrono::Duration;
use sha2::{Digest, Sha256};

use super::{EvaluationContext, EvaluationScope, RuleEvaluator, RuleResult, ScopeFields};
use crate::error::{Error, Result};
use crate::model::RolloutType;

/// `environmentVersionRollout{rolloutType, timeScaleIntervalMinutes?}`.
#[derive(Debug)]
pub struct EnvironmentVersionRolloutEvaluator {
    /// Offset scaling.
    pub rollout_type: RolloutType,
    /// Minutes between positions; absent means no staggering.
    pub time_scale_interval_minutes: Option<u64>,
}

fn rank(version_id: &str, key: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(version_id.as_bytes());
    hasher.update(key.as_bytes());
    hasher.finalize().into()
}

/// Offset in seconds of `position` among `count` targets.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn rollout_offset_seconds(
    rollout_type: RolloutType,
    position: usize,
    count: usize,
    interval_minutes: u64,
) -> i64 {
    let interval = i64::try_from(interval_minutes.saturating_mul(60)).unwrap_or(i64::MAX);
    let position = i64::try_from(position).unwrap_or(i64::MAX);
    match rollout_type {
        RolloutType::Linear => position.saturating_mul(interval),
        RolloutType::LinearNormalized => {
            if count == 0 {
                0
            } else {
                (position as f64 / count as f64 * interval as f64) as i64
            }
        }
    }
}

impl RuleEvaluator for EnvironmentVersionRolloutEvaluator {
    fn rule_type(&self) -> &'static str {
        "environmentVersionRollout"
    }

    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::ENVIRONMENT | ScopeFields::VERSION | ScopeFields::RELEASE_TARGET
    }

    fn evaluate(&self, ctx: &EvaluationContext<'_>, scope: &EvaluationScope<'_>) -> Result<RuleResult> {
        let Some(interval) = self.time_scale_interval_minutes else {
            return Ok(RuleResult::allowed("Rollout has no time scale."));
        };
        let (Some(environment), Some(version), Some(rt)) =
            (scope.environment, scope.version, scope.release_target)
        else {
            return Err(Error::internal("rollout rule evaluated with incomplete scope"));
        };

        let mut ranked: Vec<([u8; 32], String)> = ctx
            .stores
            .release_targets_for_environment(&environment.id)?
            .into_iter()
            .filter(|t| t.deployment_id == version.deployment_id)
            .map(|t| {
                let key = t.key();
                (rank(&version.id, &key), key)
            })
            .collect();
        ranked.sort();
        let own = rt.key();
        let count = ranked.len();
        let Some(position) = ranked.iter().position(|(_, key)| *key == own) else {
            return Ok(RuleResult::allowed("Release target is not part of the rollout."));
        };

        let offset = rollout_offset_seconds(self.rollout_type, position, count, interval);
        let start = version.created_at + Duration::seconds(offset);
        let result = if ctx.now >= start {
            RuleResult::allowed(format!("Rollout position {position} reached."))
        } else {
            RuleResult::pending(format!("Rollout position {position} starts at {}.", start.to_rfc3339()))
                .with_next_evaluation(start)
        };
        Ok(result
            .with_detail("position", position)
            .with_detail("targets", count)
            .with_detail("rolloutStartTime", start.to_rfc3339()))
    }
}
