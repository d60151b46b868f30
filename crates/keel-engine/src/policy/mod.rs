//! Policy evaluation.
//!
//! Each rule of each applicable policy is evaluated by a [`RuleEvaluator`]
//! chosen by the rule's tag. Results fold with `Denied > Pending > Allowed`.
//! Evaluators declare the scope fields they read; [`memo`] caches results
//! keyed on exactly those fields.

pub mod approval;
pub mod concurrency;
pub mod deny_window;
pub mod memo;
pub mod retry;
pub mod rollback;
pub mod rollout;
pub mod rrule;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::model::{
    Deployment, DeploymentVersion, Environment, Policy, PolicyRule, PolicyTargetSelector, Release,
    ReleaseTarget, Resource, Rule,
};
use crate::selector::matches_or;
use crate::store::Stores;

pub use memo::{MemoCache, MemoStats, MemoizedEvaluator};

/// Outcome of a rule or of a whole evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Decision {
    /// The release may proceed.
    Allowed,
    /// Not yet; re-evaluate later or after an action.
    Pending,
    /// The release must not proceed.
    Denied,
}

impl Decision {
    /// Lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Pending => "pending",
            Self::Denied => "denied",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of evaluating one rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleResult {
    /// Decision of the rule.
    pub decision: Decision,
    /// Convenience flag, true only for `Allowed`.
    pub allowed: bool,
    /// Human-readable explanation.
    pub message: String,
    /// Structured detail for callers and UIs.
    #[serde(default)]
    pub details: Map<String, Value>,
    /// An external action (e.g. an approval) can unblock this rule.
    #[serde(default)]
    pub requires_action: bool,
    /// Kind of action required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
    /// When the result may change without any entity change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_evaluation_time: Option<DateTime<Utc>>,
}

impl RuleResult {
    fn new(decision: Decision, message: impl Into<String>) -> Self {
        Self {
            decision,
            allowed: decision == Decision::Allowed,
            message: message.into(),
            details: Map::new(),
            requires_action: false,
            action_type: None,
            next_evaluation_time: None,
        }
    }

    /// An allowing result.
    #[must_use]
    pub fn allowed(message: impl Into<String>) -> Self {
        Self::new(Decision::Allowed, message)
    }

    /// A pending result.
    #[must_use]
    pub fn pending(message: impl Into<String>) -> Self {
        Self::new(Decision::Pending, message)
    }

    /// A denying result.
    #[must_use]
    pub fn denied(message: impl Into<String>) -> Self {
        Self::new(Decision::Denied, message)
    }

    /// Adds a detail entry.
    #[must_use]
    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    /// Marks the result as waiting on an external action.
    #[must_use]
    pub fn with_action(mut self, action_type: &str) -> Self {
        self.requires_action = true;
        self.action_type = Some(action_type.to_string());
        self
    }

    /// Sets the instant after which the result is stale.
    #[must_use]
    pub fn with_next_evaluation(mut self, at: DateTime<Utc>) -> Self {
        self.next_evaluation_time = Some(at);
        self
    }
}

/// Scope fields an evaluator may read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScopeFields(u8);

impl ScopeFields {
    /// Reads nothing scoped (workspace-wide).
    pub const NONE: Self = Self(0);
    /// Reads the environment.
    pub const ENVIRONMENT: Self = Self(1);
    /// Reads the version.
    pub const VERSION: Self = Self(1 << 1);
    /// Reads the release target.
    pub const RELEASE_TARGET: Self = Self(1 << 2);
    /// Reads the release.
    pub const RELEASE: Self = Self(1 << 3);

    /// Union of two sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns true if every field of `other` is in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ScopeFields {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// The entities a rule is evaluated against.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvaluationScope<'a> {
    /// Target environment.
    pub environment: Option<&'a Environment>,
    /// Candidate version.
    pub version: Option<&'a DeploymentVersion>,
    /// Release target.
    pub release_target: Option<&'a ReleaseTarget>,
    /// Candidate release.
    pub release: Option<&'a Release>,
}

impl EvaluationScope<'_> {
    /// Memo key fragment for `fields`, or the name of the first missing field.
    pub(crate) fn key_for(&self, fields: ScopeFields) -> std::result::Result<String, &'static str> {
        let mut key = String::new();
        if fields.contains(ScopeFields::ENVIRONMENT) {
            let env = self.environment.ok_or("environment")?;
            key.push_str(&format!("env:{}|", env.id));
        }
        if fields.contains(ScopeFields::VERSION) {
            let version = self.version.ok_or("version")?;
            key.push_str(&format!("ver:{}|", version.id));
        }
        if fields.contains(ScopeFields::RELEASE_TARGET) {
            let rt = self.release_target.ok_or("releaseTarget")?;
            key.push_str(&format!("rt:{}|", rt.key()));
        }
        if fields.contains(ScopeFields::RELEASE) {
            let release = self.release.ok_or("release")?;
            key.push_str(&format!("rel:{}|", release.id));
        }
        Ok(key)
    }
}

/// Read-only inputs shared by all evaluators.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext<'a> {
    /// Workspace stores.
    pub stores: &'a Stores,
    /// Logical clock of the evaluation.
    pub now: DateTime<Utc>,
    /// Owning workspace.
    pub workspace_id: &'a str,
}

/// Evaluates one rule variant.
pub trait RuleEvaluator: Send + Sync {
    /// Tag of the rule this evaluator implements.
    fn rule_type(&self) -> &'static str;

    /// Scope fields the result depends on.
    fn scope_fields(&self) -> ScopeFields;

    /// Evaluates the rule. Callers guarantee declared scope fields are present.
    ///
    /// # Errors
    ///
    /// Returns an error if stores cannot be read.
    fn evaluate(&self, ctx: &EvaluationContext<'_>, scope: &EvaluationScope<'_>)
    -> Result<RuleResult>;
}

/// Builds the evaluator for a rule, or `None` for rules that are not
/// runtime gates (`deploymentVersionSelector`).
#[must_use]
pub fn evaluator_for(rule: &Rule) -> Option<Box<dyn RuleEvaluator>> {
    let evaluator: Box<dyn RuleEvaluator> = match rule {
        Rule::AnyApproval { min_approvals } => Box::new(approval::AnyApprovalEvaluator {
            min_approvals: *min_approvals,
        }),
        Rule::UserApproval { user_id } => Box::new(approval::UserApprovalEvaluator {
            user_id: user_id.clone(),
        }),
        Rule::RoleApproval { role_id } => Box::new(approval::RoleApprovalEvaluator {
            role_id: role_id.clone(),
        }),
        Rule::DenyWindow {
            rrule,
            timezone,
            duration_minutes,
            dtstart,
        } => Box::new(deny_window::DenyWindowEvaluator::new(
            rrule,
            timezone,
            *duration_minutes,
            *dtstart,
        )),
        Rule::Concurrency { max_concurrent } => Box::new(concurrency::ConcurrencyEvaluator {
            max_concurrent: *max_concurrent,
        }),
        Rule::ReleaseTargetConcurrency {} => {
            Box::new(concurrency::ReleaseTargetConcurrencyEvaluator)
        }
        Rule::MaxRetries { max_retries } => Box::new(retry::MaxRetriesEvaluator {
            max_retries: *max_retries,
        }),
        Rule::Retry {
            max_retries,
            retry_on_statuses,
            backoff_seconds,
            backoff_strategy,
            max_backoff_seconds,
        } => Box::new(retry::RetryEvaluator {
            max_retries: *max_retries,
            retry_on_statuses: retry_on_statuses.clone(),
            backoff_seconds: *backoff_seconds,
            backoff_strategy: *backoff_strategy,
            max_backoff_seconds: *max_backoff_seconds,
        }),
        Rule::Rollback {
            on_job_statuses,
            on_verification_failure,
        } => Box::new(rollback::RollbackEvaluator {
            on_job_statuses: on_job_statuses.clone().unwrap_or_default(),
            on_verification_failure: on_verification_failure.unwrap_or(false),
        }),
        Rule::EnvironmentVersionRollout {
            rollout_type,
            time_scale_interval_minutes,
        } => Box::new(rollout::EnvironmentVersionRolloutEvaluator {
            rollout_type: *rollout_type,
            time_scale_interval_minutes: *time_scale_interval_minutes,
        }),
        Rule::DeploymentVersionSelector { .. } => return None,
    };
    Some(evaluator)
}

/// Entities a release target refers to.
#[derive(Debug, Clone)]
pub struct TargetEntities {
    /// The target's resource.
    pub resource: Resource,
    /// The target's environment.
    pub environment: Environment,
    /// The target's deployment.
    pub deployment: Deployment,
}

impl TargetEntities {
    /// Loads the entities of `rt`, or `None` if any is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if a repository lock is poisoned.
    pub fn load(stores: &Stores, rt: &ReleaseTarget) -> Result<Option<Self>> {
        let (Some(resource), Some(environment), Some(deployment)) = (
            stores.resources.get(&rt.resource_id)?,
            stores.environments.get(&rt.environment_id)?,
            stores.deployments.get(&rt.deployment_id)?,
        ) else {
            return Ok(None);
        };
        Ok(Some(Self {
            resource,
            environment,
            deployment,
        }))
    }
}

fn target_selector_matches(
    selector: &PolicyTargetSelector,
    entities: &TargetEntities,
) -> Result<bool> {
    let deployment = serde_json::to_value(&entities.deployment)?;
    let environment = serde_json::to_value(&entities.environment)?;
    let resource = serde_json::to_value(&entities.resource)?;
    // Every slot sees the whole target, so selectors may compare entities.
    let context = [
        ("deployment", &deployment),
        ("environment", &environment),
        ("resource", &resource),
    ];
    let slots = [
        (selector.deployment_selector.as_ref(), "deployment"),
        (selector.environment_selector.as_ref(), "environment"),
        (selector.resource_selector.as_ref(), "resource"),
    ];
    Ok(slots.iter().all(|(sel, var)| match sel {
        None => true,
        Some(sel) => sel.matches_in(var, &context).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "policy selector evaluation failed");
            false
        }),
    }))
}

/// Enabled policies whose selectors match the target, highest priority first.
///
/// # Errors
///
/// Returns an error if a repository lock is poisoned or an entity fails to
/// serialize.
pub fn applicable_policies(stores: &Stores, entities: &TargetEntities) -> Result<Vec<Policy>> {
    let mut out = Vec::new();
    for policy in stores.policies.values()? {
        if !policy.enabled {
            continue;
        }
        let mut applies = policy.selectors.is_empty();
        for selector in &policy.selectors {
            if applies {
                break;
            }
            applies = target_selector_matches(selector, entities)?;
        }
        if applies {
            out.push(policy);
        }
    }
    out.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
    Ok(out)
}

/// Rejects policies with malformed selectors or rule configuration.
///
/// # Errors
///
/// Returns a validation error naming the first problem.
pub fn validate_policy(policy: &Policy) -> Result<()> {
    if policy.id.is_empty() {
        return Err(Error::validation("policy id must not be empty"));
    }
    for selector in &policy.selectors {
        for slot in [
            &selector.deployment_selector,
            &selector.environment_selector,
            &selector.resource_selector,
        ]
        .into_iter()
        .flatten()
        {
            slot.validate()?;
        }
    }
    for rule in &policy.rules {
        match &rule.rule {
            Rule::DenyWindow {
                rrule,
                timezone,
                duration_minutes,
                ..
            } => {
                deny_window::parse_window(rrule, timezone, *duration_minutes)?;
            }
            Rule::DeploymentVersionSelector { selector } => selector.validate()?,
            Rule::Retry {
                retry_on_statuses: Some(statuses),
                ..
            } if statuses.iter().any(|s| s.is_active()) => {
                return Err(Error::validation("retry statuses must be terminal"));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Returns true unless some `deploymentVersionSelector` rule rejects `version`.
#[must_use]
pub fn version_eligible(policies: &[Policy], version: &DeploymentVersion) -> bool {
    let Ok(subject) = serde_json::to_value(version) else {
        return false;
    };
    policies
        .iter()
        .flat_map(|p| p.rules.iter())
        .all(|rule| match &rule.rule {
            Rule::DeploymentVersionSelector { selector } => {
                matches_or(Some(selector), "version", &subject, true)
            }
            _ => true,
        })
}

/// Returns true if any policy carries a rule that re-runs failed releases.
#[must_use]
pub fn permits_retry(policies: &[Policy]) -> bool {
    policies
        .iter()
        .flat_map(|p| p.rules.iter())
        .any(|r| r.rule.permits_retry())
}

/// One rule's contribution to an evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleOutcome {
    /// Policy carrying the rule.
    pub policy_id: String,
    /// Rule identifier inside the policy.
    pub rule_id: String,
    /// Rule tag.
    pub rule_type: String,
    /// The rule's result.
    pub result: RuleResult,
}

/// Combined result over every applicable rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyEvaluation {
    /// Folded decision.
    pub decision: Decision,
    /// Individual rule results in evaluation order.
    pub rules: Vec<RuleOutcome>,
}

impl PolicyEvaluation {
    /// Folds rule outcomes.
    #[must_use]
    pub fn from_outcomes(rules: Vec<RuleOutcome>) -> Self {
        let decision = fold_decisions(rules.iter().map(|r| r.result.decision));
        Self { decision, rules }
    }

    /// Message of the first rule sharing the overall decision.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.rules
            .iter()
            .find(|r| r.result.decision == self.decision)
            .map(|r| r.result.message.as_str())
    }

    /// Earliest instant at which a non-allowing rule may change.
    #[must_use]
    pub fn next_evaluation_time(&self) -> Option<DateTime<Utc>> {
        self.rules
            .iter()
            .filter(|r| r.result.decision != Decision::Allowed)
            .filter_map(|r| r.result.next_evaluation_time)
            .min()
    }
}

/// `Denied` dominates `Pending` dominates `Allowed`; no rules means allowed.
#[must_use]
pub fn fold_decisions(decisions: impl IntoIterator<Item = Decision>) -> Decision {
    decisions.into_iter().max().unwrap_or(Decision::Allowed)
}

/// Evaluates policies with a shared memo cache.
#[derive(Debug, Default)]
pub struct PolicyEngine {
    cache: Arc<MemoCache>,
}

impl PolicyEngine {
    /// Creates an engine with an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The memo cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<MemoCache> {
        &self.cache
    }

    /// Drops every memoized result.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Evaluates every rule of `policies` for `scope`.
    ///
    /// # Errors
    ///
    /// Returns an error if an evaluator fails to read the stores.
    pub fn evaluate(
        &self,
        ctx: &EvaluationContext<'_>,
        policies: &[Policy],
        scope: &EvaluationScope<'_>,
    ) -> Result<PolicyEvaluation> {
        let mut outcomes = Vec::new();
        for policy in policies {
            for (index, rule) in policy.rules.iter().enumerate() {
                let Some(evaluator) = evaluator_for(&rule.rule) else {
                    continue;
                };
                let rule_key = rule_key(policy, index, rule);
                let memoized = MemoizedEvaluator::new(evaluator, Arc::clone(&self.cache), rule_key);
                let result = memoized.evaluate(ctx, scope)?;
                outcomes.push(RuleOutcome {
                    policy_id: policy.id.clone(),
                    rule_id: rule.id.clone(),
                    rule_type: rule.rule.type_name().to_string(),
                    result,
                });
            }
        }
        Ok(PolicyEvaluation::from_outcomes(outcomes))
    }
}

fn rule_key(policy: &Policy, index: usize, rule: &PolicyRule) -> String {
    if rule.id.is_empty() {
        format!("{}#{index}", policy.id)
    } else {
        format!("{}/{}", policy.id, rule.id)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeMap;

    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::Map;

    use crate::model::{
        DeploymentVersion, Environment, Job, JobStatus, Release, ReleaseTarget, VersionStatus,
    };

    pub fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    pub fn environment(id: &str) -> Environment {
        Environment {
            id: id.into(),
            name: id.into(),
            system_id: "s1".into(),
            resource_selector: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn version(id: &str, created: i64) -> DeploymentVersion {
        DeploymentVersion {
            id: id.into(),
            deployment_id: "d1".into(),
            tag: id.into(),
            name: id.into(),
            status: VersionStatus::Ready,
            created_at: at(created),
            config: Map::new(),
            job_agent_config: Map::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn release(rt: &ReleaseTarget, version: &DeploymentVersion) -> Release {
        Release::new(rt.clone(), version.clone(), BTreeMap::new(), at(0)).unwrap()
    }

    pub fn job(id: &str, release_id: &str, secs: i64, status: JobStatus) -> Job {
        Job {
            id: id.into(),
            release_id: release_id.into(),
            job_agent_id: "agent".into(),
            job_agent_config: Map::new(),
            status,
            message: String::new(),
            created_at: at(secs),
            updated_at: at(secs),
            started_at: None,
            completed_at: None,
            external_id: None,
            metadata: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::Selector;
    use serde_json::json;

    #[test]
    fn denied_dominates_pending_dominates_allowed() {
        use Decision::{Allowed, Denied, Pending};
        assert_eq!(fold_decisions([]), Allowed);
        assert_eq!(fold_decisions([Allowed, Pending]), Pending);
        assert_eq!(fold_decisions([Pending, Denied, Allowed]), Denied);
        assert_eq!(fold_decisions([Denied, Pending]), fold_decisions([Pending, Denied]));
    }

    #[test]
    fn scope_key_names_missing_field() {
        let env = test_support::environment("e1");
        let scope = EvaluationScope {
            environment: Some(&env),
            ..EvaluationScope::default()
        };
        assert_eq!(scope.key_for(ScopeFields::ENVIRONMENT).unwrap(), "env:e1|");
        assert_eq!(
            scope.key_for(ScopeFields::ENVIRONMENT | ScopeFields::VERSION),
            Err("version")
        );
        assert_eq!(scope.key_for(ScopeFields::NONE).unwrap(), "");
    }

    #[test]
    fn validation_rejects_bad_rules() {
        let bad_window: Policy = serde_json::from_value(json!({
            "id": "p1",
            "rules": [{"denyWindow": {"rrule": "FREQ=DAILY", "timezone": "Nowhere/Land"}}]
        }))
        .unwrap();
        assert!(validate_policy(&bad_window).is_err());

        let bad_selector: Policy = serde_json::from_value(json!({
            "id": "p2",
            "selectors": [{"environmentSelector": {"cel": "environment.name =="}}]
        }))
        .unwrap();
        assert!(validate_policy(&bad_selector).is_err());

        let good: Policy = serde_json::from_value(json!({
            "id": "p3",
            "rules": [{"retry": {"maxRetries": 2, "retryOnStatuses": ["failure"]}}]
        }))
        .unwrap();
        assert!(validate_policy(&good).is_ok());
    }

    #[test]
    fn version_selector_filters_versions() {
        let policy: Policy = serde_json::from_value(json!({
            "id": "p1",
            "rules": [{"deploymentVersionSelector": {"selector": {"cel": "version.tag.startsWith('v2')"}}}]
        }))
        .unwrap();
        assert!(!version_eligible(&[policy.clone()], &test_support::version("v1", 0)));
        assert!(version_eligible(&[policy.clone()], &test_support::version("v2.1", 0)));
        assert!(version_eligible(&[], &test_support::version("v1", 0)));
        assert!(evaluator_for(&policy.rules[0].rule).is_none());
    }

    #[test]
    fn applicable_policies_respect_selectors_and_priority() {
        let stores = Stores::new();
        let entities = TargetEntities {
            resource: serde_json::from_value(json!({
                "id": "r1", "kind": "server", "identifier": "r1", "createdAt": "2024-01-01T00:00:00Z"
            }))
            .unwrap(),
            environment: test_support::environment("e1"),
            deployment: serde_json::from_value(json!({"id": "d1", "systemId": "s1"})).unwrap(),
        };
        let mk = |id: &str, priority: i64, env_sel: Option<&str>, enabled: bool| Policy {
            id: id.into(),
            name: id.into(),
            description: None,
            priority,
            enabled,
            selectors: env_sel
                .map(|s| {
                    vec![PolicyTargetSelector {
                        environment_selector: Some(Selector::cel(s)),
                        ..PolicyTargetSelector::default()
                    }]
                })
                .unwrap_or_default(),
            rules: Vec::new(),
            created_at: None,
        };
        stores.policies.upsert(mk("low", 1, None, true)).unwrap();
        stores.policies.upsert(mk("high", 10, Some("environment.id == 'e1'"), true)).unwrap();
        stores.policies.upsert(mk("other", 5, Some("environment.id == 'e2'"), true)).unwrap();
        stores.policies.upsert(mk("off", 50, None, false)).unwrap();
        // An environment slot may look at the rest of the target.
        stores
            .policies
            .upsert(mk("cross", 7, Some("resource.kind == 'server' && deployment.systemId == 's1'"), true))
            .unwrap();
        stores
            .policies
            .upsert(mk("cross-miss", 6, Some("resource.kind == 'db'"), true))
            .unwrap();

        let ids: Vec<String> = applicable_policies(&stores, &entities)
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["high", "cross", "low"]);
    }
}
