//! Approval rules.

use super::{EvaluationContext, EvaluationScope, RuleEvaluator, RuleResult, ScopeFields};
use crate::error::{Error, Result};

const ACTION_APPROVAL: &str = "approval";

fn version_and_environment<'a>(scope: &EvaluationScope<'a>) -> Result<(&'a str, &'a str)> {
    match (scope.version, scope.environment) {
        (Some(v), Some(e)) => Ok((v.id.as_str(), e.id.as_str())),
        _ => Err(Error::internal("approval rule evaluated without version and environment")),
    }
}

/// `anyApproval{minApprovals}`.
#[derive(Debug)]
pub struct AnyApprovalEvaluator {
    /// Required distinct approvers.
    pub min_approvals: u32,
}

impl RuleEvaluator for AnyApprovalEvaluator {
    fn rule_type(&self) -> &'static str {
        "anyApproval"
    }

    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::ENVIRONMENT | ScopeFields::VERSION
    }

    fn evaluate(&self, ctx: &EvaluationContext<'_>, scope: &EvaluationScope<'_>) -> Result<RuleResult> {
        let (version_id, environment_id) = version_and_environment(scope)?;
        let approvers = ctx.stores.approvers_for(version_id, environment_id)?;
        let count = approvers.len();
        let min = self.min_approvals as usize;
        let result = if count >= min {
            RuleResult::allowed("All approvals met.")
        } else {
            RuleResult::pending(format!("Not enough approvals ({count}/{min})."))
                .with_action(ACTION_APPROVAL)
        };
        Ok(result
            .with_detail("minApprovals", self.min_approvals)
            .with_detail("approvers", approvers.into_iter().collect::<Vec<_>>()))
    }
}

/// `userApproval{userId}`.
#[derive(Debug)]
pub struct UserApprovalEvaluator {
    /// Required approver.
    pub user_id: String,
}

impl RuleEvaluator for UserApprovalEvaluator {
    fn rule_type(&self) -> &'static str {
        "userApproval"
    }

    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::ENVIRONMENT | ScopeFields::VERSION
    }

    fn evaluate(&self, ctx: &EvaluationContext<'_>, scope: &EvaluationScope<'_>) -> Result<RuleResult> {
        let (version_id, environment_id) = version_and_environment(scope)?;
        let approved = ctx
            .stores
            .approvers_for(version_id, environment_id)?
            .contains(&self.user_id);
        let result = if approved {
            RuleResult::allowed(format!("Approved by {}.", self.user_id))
        } else {
            RuleResult::pending(format!("Waiting for approval from {}.", self.user_id))
                .with_action(ACTION_APPROVAL)
        };
        Ok(result.with_detail("userId", self.user_id.clone()))
    }
}

/// `roleApproval{roleId}`.
#[derive(Debug)]
pub struct RoleApprovalEvaluator {
    /// Role whose members may approve.
    pub role_id: String,
}

impl RuleEvaluator for RoleApprovalEvaluator {
    fn rule_type(&self) -> &'static str {
        "roleApproval"
    }

    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::ENVIRONMENT | ScopeFields::VERSION
    }

    fn evaluate(&self, ctx: &EvaluationContext<'_>, scope: &EvaluationScope<'_>) -> Result<RuleResult> {
        let (version_id, environment_id) = version_and_environment(scope)?;
        let approvers = ctx.stores.approvers_for(version_id, environment_id)?;
        let members = ctx.stores.role_members(&self.role_id)?;
        let result = match approvers.intersection(&members).next() {
            Some(user) => RuleResult::allowed(format!("Approved by {user} of role {}.", self.role_id))
                .with_detail("approvedBy", user.clone()),
            None => RuleResult::pending(format!(
                "Waiting for approval from a member of role {}.",
                self.role_id
            ))
            .with_action(ACTION_APPROVAL),
        };
        Ok(result.with_detail("roleId", self.role_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ApprovalStatus, RoleBinding, UserApprovalRecord};
    use crate::policy::Decision;
    use crate::policy::test_support::{at, environment, version};
    use crate::store::Stores;

    fn approve(stores: &Stores, user: &str, status: ApprovalStatus) {
        let mut record = UserApprovalRecord {
            id: String::new(),
            version_id: "v1".into(),
            environment_id: "e1".into(),
            user_id: user.into(),
            status,
            reason: None,
            created_at: at(0),
        };
        record.id = record.derived_id();
        stores.user_approval_records.upsert(record).unwrap();
    }

    fn run(eval: &dyn RuleEvaluator, stores: &Stores) -> RuleResult {
        let (env, ver) = (environment("e1"), version("v1", 0));
        let ctx = EvaluationContext {
            stores,
            now: at(0),
            workspace_id: "ws",
        };
        let scope = EvaluationScope {
            environment: Some(&env),
            version: Some(&ver),
            ..EvaluationScope::default()
        };
        eval.evaluate(&ctx, &scope).unwrap()
    }

    #[test]
    fn any_approval_counts_distinct_approvers() {
        let stores = Stores::new();
        let eval = AnyApprovalEvaluator { min_approvals: 2 };
        approve(&stores, "user-a", ApprovalStatus::Approved);
        approve(&stores, "user-c", ApprovalStatus::Rejected);
        let result = run(&eval, &stores);
        assert_eq!(result.decision, Decision::Pending);
        assert_eq!(result.message, "Not enough approvals (1/2).");
        assert_eq!(result.action_type.as_deref(), Some("approval"));

        approve(&stores, "user-b", ApprovalStatus::Approved);
        assert!(run(&eval, &stores).allowed);
    }

    #[test]
    fn user_and_role_approvals() {
        let stores = Stores::new();
        let user = UserApprovalEvaluator { user_id: "alice".into() };
        let role = RoleApprovalEvaluator { role_id: "sre".into() };
        approve(&stores, "bob", ApprovalStatus::Approved);
        assert_eq!(run(&user, &stores).decision, Decision::Pending);
        assert_eq!(run(&role, &stores).decision, Decision::Pending);

        stores
            .role_bindings
            .upsert(RoleBinding {
                id: "b1".into(),
                role_id: "sre".into(),
                user_id: "bob".into(),
            })
            .unwrap();
        assert!(run(&role, &stores).allowed);

        approve(&stores, "alice", ApprovalStatus::Approved);
        assert!(run(&user, &stores).allowed);
    }
}
