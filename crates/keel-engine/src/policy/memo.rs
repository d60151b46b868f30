//! Scope-keyed memoization of rule results.
//!
//! A cached result is keyed on the workspace, the rule identity and the ids
//! of exactly the scope fields the evaluator declares. Results carrying a
//! `nextEvaluationTime` expire once the evaluation clock reaches it.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{EvaluationContext, EvaluationScope, RuleEvaluator, RuleResult};
use crate::error::{Result, poison_err};

/// Hit and miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that ran the evaluator.
    pub misses: u64,
}

/// Shared result cache.
#[derive(Debug, Default)]
pub struct MemoCache {
    entries: RwLock<HashMap<String, RuleResult>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        match self.entries.write() {
            Ok(mut entries) => entries.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    /// Number of cached results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map_or(0, |e| e.len())
    }

    /// Returns true when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> MemoStats {
        MemoStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

fn is_fresh(result: &RuleResult, ctx: &EvaluationContext<'_>) -> bool {
    result.next_evaluation_time.map_or(true, |at| ctx.now < at)
}

/// Wraps an evaluator with the shared cache.
pub struct MemoizedEvaluator {
    inner: Box<dyn RuleEvaluator>,
    cache: Arc<MemoCache>,
    rule_key: String,
}

impl std::fmt::Debug for MemoizedEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoizedEvaluator")
            .field("rule_type", &self.inner.rule_type())
            .field("rule_key", &self.rule_key)
            .finish_non_exhaustive()
    }
}

impl MemoizedEvaluator {
    /// Wraps `inner`; `rule_key` identifies the configured rule.
    #[must_use]
    pub fn new(inner: Box<dyn RuleEvaluator>, cache: Arc<MemoCache>, rule_key: String) -> Self {
        Self {
            inner,
            cache,
            rule_key,
        }
    }

    /// Returns the cached result for the scope or evaluates and stores it.
    ///
    /// A scope missing a declared field yields `Denied` with `missing field`
    /// and is never cached.
    ///
    /// # Errors
    ///
    /// Returns an error if the evaluator fails or the cache lock is poisoned.
    pub fn evaluate(
        &self,
        ctx: &EvaluationContext<'_>,
        scope: &EvaluationScope<'_>,
    ) -> Result<RuleResult> {
        let fragment = match scope.key_for(self.inner.scope_fields()) {
            Ok(fragment) => fragment,
            Err(field) => {
                return Ok(RuleResult::denied("missing field").with_detail("field", field));
            }
        };
        let key = format!("{}|{}|{fragment}", ctx.workspace_id, self.rule_key);

        {
            let entries = self.cache.entries.read().map_err(poison_err)?;
            if let Some(hit) = entries.get(&key).filter(|r| is_fresh(r, ctx)) {
                self.cache.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(hit.clone());
            }
        }

        let mut entries = self.cache.entries.write().map_err(poison_err)?;
        if let Some(hit) = entries.get(&key).filter(|r| is_fresh(r, ctx)) {
            self.cache.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit.clone());
        }
        self.cache.misses.fetch_add(1, Ordering::Relaxed);
        let result = self.inner.evaluate(ctx, scope)?;
        entries.insert(key, result.clone());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeploymentVersion, Environment, ReleaseTarget};
    use crate::policy::test_support::{at, environment, version};
    use crate::policy::{Decision, ScopeFields};
    use crate::store::Stores;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        fields: ScopeFields,
        calls: Arc<AtomicUsize>,
        expires: Option<i64>,
    }

    impl RuleEvaluator for Counting {
        fn rule_type(&self) -> &'static str {
            "counting"
        }

        fn scope_fields(&self) -> ScopeFields {
            self.fields
        }

        fn evaluate(
            &self,
            _ctx: &EvaluationContext<'_>,
            _scope: &EvaluationScope<'_>,
        ) -> Result<RuleResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = RuleResult::allowed("ok");
            Ok(match self.expires {
                Some(secs) => result.with_next_evaluation(at(secs)),
                None => result,
            })
        }
    }

    fn scope<'a>(
        env: &'a Environment,
        ver: &'a DeploymentVersion,
        rt: &'a ReleaseTarget,
    ) -> EvaluationScope<'a> {
        EvaluationScope {
            environment: Some(env),
            version: Some(ver),
            release_target: Some(rt),
            release: None,
        }
    }

    fn memoized(fields: ScopeFields, cache: &Arc<MemoCache>, expires: Option<i64>) -> (MemoizedEvaluator, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = Counting {
            fields,
            calls: Arc::clone(&calls),
            expires,
        };
        (
            MemoizedEvaluator::new(Box::new(inner), Arc::clone(cache), "p1#0".into()),
            calls,
        )
    }

    #[test]
    fn reuses_results_only_for_identical_declared_fields() -> Result<()> {
        let stores = Stores::new();
        let cache = Arc::new(MemoCache::new());
        let (eval, calls) = memoized(ScopeFields::ENVIRONMENT | ScopeFields::VERSION, &cache, None);
        let ctx = EvaluationContext {
            stores: &stores,
            now: at(0),
            workspace_id: "ws",
        };
        let (e1, e2) = (environment("e1"), environment("e2"));
        let (v1, v2) = (version("v1", 0), version("v2", 0));
        let (rt_a, rt_b) = (ReleaseTarget::new("r1", "e1", "d1"), ReleaseTarget::new("r2", "e1", "d1"));

        eval.evaluate(&ctx, &scope(&e1, &v1, &rt_a))?;
        // Release target is not a declared field, so this is a hit.
        eval.evaluate(&ctx, &scope(&e1, &v1, &rt_b))?;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        eval.evaluate(&ctx, &scope(&e2, &v1, &rt_a))?;
        eval.evaluate(&ctx, &scope(&e1, &v2, &rt_a))?;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.stats(), MemoStats { hits: 1, misses: 3 });
        Ok(())
    }

    #[test]
    fn missing_declared_field_is_denied_and_not_cached() -> Result<()> {
        let stores = Stores::new();
        let cache = Arc::new(MemoCache::new());
        let (eval, calls) = memoized(ScopeFields::RELEASE, &cache, None);
        let ctx = EvaluationContext {
            stores: &stores,
            now: at(0),
            workspace_id: "ws",
        };
        let result = eval.evaluate(&ctx, &EvaluationScope::default())?;
        assert_eq!(result.decision, Decision::Denied);
        assert_eq!(result.message, "missing field");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(cache.is_empty());
        Ok(())
    }

    #[test]
    fn entries_expire_at_next_evaluation_time() -> Result<()> {
        let stores = Stores::new();
        let cache = Arc::new(MemoCache::new());
        let (eval, calls) = memoized(ScopeFields::NONE, &cache, Some(10));
        let mut ctx = EvaluationContext {
            stores: &stores,
            now: at(0),
            workspace_id: "ws",
        };
        eval.evaluate(&ctx, &EvaluationScope::default())?;
        ctx.now = at(9);
        eval.evaluate(&ctx, &EvaluationScope::default())?;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        ctx.now = at(10);
        eval.evaluate(&ctx, &EvaluationScope::default())?;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        cache.clear();
        assert!(cache.is_empty());
        Ok(())
    }
}
