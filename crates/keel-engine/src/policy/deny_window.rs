//! Deny windows: recurring periods during which nothing deploys.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

use super::rrule::{RecurrenceRule, WindowState, default_anchor, window_state};
use super::{EvaluationContext, EvaluationScope, RuleEvaluator, RuleResult, ScopeFields};
use crate::error::{Error, Result};

/// Parses a deny window's recurrence rule and timezone.
///
/// # Errors
///
/// Returns a validation error for an unsupported rule, unknown timezone or
/// non-positive duration.
pub fn parse_window(rrule: &str, timezone: &str, duration_minutes: i64) -> Result<(RecurrenceRule, Tz)> {
    let rule: RecurrenceRule = rrule.parse()?;
    let tz: Tz = timezone
        .parse()
        .map_err(|_| Error::validation(format!("unknown timezone '{timezone}'")))?;
    if duration_minutes <= 0 {
        return Err(Error::validation("deny window duration must be positive"));
    }
    Ok((rule, tz))
}

/// `denyWindow{rrule, timezone, durationMinutes, dtstart?}`.
#[derive(Debug)]
pub struct DenyWindowEvaluator {
    parsed: std::result::Result<(RecurrenceRule, Tz), String>,
    duration: Duration,
    dtstart: Option<DateTime<Utc>>,
}

impl DenyWindowEvaluator {
    /// Builds the evaluator. Parse failures surface as a denial.
    #[must_use]
    pub fn new(rrule: &str, timezone: &str, duration_minutes: i64, dtstart: Option<DateTime<Utc>>) -> Self {
        Self {
            parsed: parse_window(rrule, timezone, duration_minutes).map_err(|e| e.to_string()),
            duration: Duration::minutes(duration_minutes.max(0)),
            dtstart,
        }
    }
}

impl RuleEvaluator for DenyWindowEvaluator {
    fn rule_type(&self) -> &'static str {
        "denyWindow"
    }

    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::NONE
    }

    fn evaluate(&self, ctx: &EvaluationContext<'_>, _scope: &EvaluationScope<'_>) -> Result<RuleResult> {
        let (rule, tz) = match &self.parsed {
            Ok(parsed) => parsed,
            Err(message) => return Ok(RuleResult::denied(format!("Invalid deny window: {message}"))),
        };
        let dtstart = self.dtstart.unwrap_or_else(|| default_anchor(*tz));
        Ok(match window_state(rule, *tz, dtstart, self.duration, ctx.now) {
            WindowState::Inside { start, end } => RuleResult::denied(format!(
                "Deployment blocked by deny window until {}.",
                end.to_rfc3339()
            ))
            .with_detail("windowStart", start.to_rfc3339())
            .with_detail("nextAllowedTime", end.to_rfc3339())
            .with_next_evaluation(end),
            WindowState::Outside { next_start } => {
                let result = RuleResult::allowed("Outside deny window.");
                match next_start {
                    Some(at) => result
                        .with_detail("nextWindowStart", at.to_rfc3339())
                        .with_next_evaluation(at),
                    None => result,
                }
            }
        })
    }
}
