//! Variable resolution for release candidates.
//!
//! For each deployment variable a resource variable with the same key wins.
//! Otherwise the deployment variable's values are tried by descending
//! priority (ties keep declaration order) and the first whose resource
//! selector matches is used, falling back to the default value. A key with no
//! applicable value is omitted.
//!
//! A reference that cannot be resolved makes the whole resolution fail, so no
//! release is produced for the target.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::error::Result;
use crate::model::{LiteralValue, Resource, VariableValue};
use crate::selector::matches_or;
use crate::store::{Stores, index};

/// Resolves `reference` variable values through related entities.
pub trait RelationshipResolver: Send + Sync + fmt::Debug {
    /// Value at `path` on the entity related to `resource` by `reference`,
    /// or `None` if no related entity or property exists.
    ///
    /// # Errors
    ///
    /// Returns an error if stores cannot be read.
    fn resolve(
        &self,
        stores: &Stores,
        resource: &Resource,
        reference: &str,
        path: &[String],
    ) -> Result<Option<LiteralValue>>;
}

/// Resolves references with the workspace's relationship rules.
///
/// A rule applies when its `reference` matches and its `fromKind`, if set,
/// equals the source resource's kind. Candidates are the other live
/// resources in id order; the first one matching the rule's target selector
/// and every property matcher is the related resource.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleRelationshipResolver;

impl RelationshipResolver for RuleRelationshipResolver {
    fn resolve(
        &self,
        stores: &Stores,
        resource: &Resource,
        reference: &str,
        path: &[String],
    ) -> Result<Option<LiteralValue>> {
        let source = serde_json::to_value(resource)?;
        let rules = stores
            .relationship_rules
            .values()?
            .into_iter()
            .filter(|rule| rule.reference == reference)
            .filter(|rule| rule.from_kind.as_ref().map_or(true, |kind| *kind == resource.kind));

        let candidates = stores.resources.values()?;
        for rule in rules {
            for candidate in &candidates {
                if candidate.id == resource.id || candidate.deleted_at.is_some() {
                    continue;
                }
                let target = serde_json::to_value(candidate)?;
                if !matches_or(rule.target.as_ref(), "resource", &target, true) {
                    continue;
                }
                let related = rule.property_matchers.iter().all(|m| {
                    match (walk(&source, &m.from_property), walk(&target, &m.to_property)) {
                        (Some(from), Some(to)) => !from.is_null() && from == to,
                        _ => false,
                    }
                });
                if related {
                    return Ok(walk(&target, path).and_then(LiteralValue::from_json));
                }
            }
        }
        Ok(None)
    }
}

/// Follows `path` through nested objects. An empty path yields `value`.
fn walk<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| current.get(key))
}

fn literal_of(
    stores: &Stores,
    resolver: &dyn RelationshipResolver,
    resource: &Resource,
    value: &VariableValue,
) -> Result<Option<LiteralValue>> {
    Ok(match value {
        VariableValue::Literal { value } => Some(value.clone()),
        VariableValue::Sensitive { value_hash } => Some(LiteralValue::Sensitive {
            value_hash: value_hash.clone(),
        }),
        VariableValue::Reference { reference, path } => {
            resolver.resolve(stores, resource, reference, path)?
        }
    })
}

/// Resolves every variable of `deployment_id` for `resource`.
///
/// Returns `None` when a reference value was selected but could not be
/// resolved.
///
/// # Errors
///
/// Returns an error if stores cannot be read.
pub fn resolve_variables(
    stores: &Stores,
    resolver: &dyn RelationshipResolver,
    deployment_id: &str,
    resource: &Resource,
) -> Result<Option<BTreeMap<String, LiteralValue>>> {
    let overrides: BTreeMap<String, VariableValue> = stores
        .resource_variables
        .lookup(index::RESOURCE, &resource.id)?
        .into_iter()
        .map(|v| (v.key, v.value))
        .collect();
    let subject = serde_json::to_value(resource)?;

    let mut variables = stores
        .deployment_variables
        .lookup(index::DEPLOYMENT, deployment_id)?;
    variables.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.id.cmp(&b.id)));

    let mut out = BTreeMap::new();
    for variable in variables {
        if out.contains_key(&variable.key) {
            continue;
        }
        let selected = if let Some(value) = overrides.get(&variable.key) {
            Some(value.clone())
        } else {
            let mut values = variable.values.clone();
            values.sort_by(|a, b| b.priority.cmp(&a.priority));
            values
                .into_iter()
                .find(|v| matches_or(v.resource_selector.as_ref(), "resource", &subject, true))
                .map(|v| v.value)
        };

        let literal = match selected {
            Some(value) => {
                let Some(literal) = literal_of(stores, resolver, resource, &value)? else {
                    tracing::debug!(
                        resource_id = %resource.id,
                        key = %variable.key,
                        "variable reference did not resolve"
                    );
                    return Ok(None);
                };
                Some(literal)
            }
            None => variable.default_value.clone(),
        };
        if let Some(literal) = literal {
            out.insert(variable.key.clone(), literal);
        }
    }
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        DeploymentVariable, DeploymentVariableValue, PropertyMatcher, RelationshipRule,
        ResourceVariable,
    };
    use crate::selector::Selector;
    use chrono::{TimeZone, Utc};
    use serde_json::Map;

    fn resource(id: &str, kind: &str, metadata: &[(&str, &str)]) -> Resource {
        Resource {
            id: id.into(),
            name: id.into(),
            kind: kind.into(),
            identifier: id.into(),
            version: "v1".into(),
            config: Map::new(),
            metadata: metadata
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            created_at: Utc.timestamp_opt(0, 0).unwrap(),
            updated_at: None,
            locked_at: None,
            deleted_at: None,
        }
    }

    fn literal(s: &str) -> VariableValue {
        VariableValue::Literal {
            value: LiteralValue::String(s.into()),
        }
    }

    fn value(id: &str, priority: i64, selector: Option<&str>, v: VariableValue) -> DeploymentVariableValue {
        DeploymentVariableValue {
            id: id.into(),
            resource_selector: selector.map(Selector::cel),
            priority,
            value: v,
        }
    }

    fn variable(key: &str, values: Vec<DeploymentVariableValue>, default: Option<&str>) -> DeploymentVariable {
        DeploymentVariable {
            id: format!("var-{key}"),
            deployment_id: "d1".into(),
            key: key.into(),
            description: None,
            default_value: default.map(|d| LiteralValue::String(d.into())),
            values,
        }
    }

    #[test]
    fn highest_priority_matching_value_wins() {
        let stores = Stores::new();
        let r = resource("r1", "server", &[("region", "eu")]);
        stores.resources.upsert(r.clone()).unwrap();
        stores
            .deployment_variables
            .upsert(variable(
                "replicas",
                vec![
                    value("low", 1, None, literal("1")),
                    value("us", 10, Some("metadata.region == 'us'"), literal("5")),
                    value("eu", 5, Some("metadata.region == 'eu'"), literal("3")),
                ],
                None,
            ))
            .unwrap();

        let vars = resolve_variables(&stores, &RuleRelationshipResolver, "d1", &r)
            .unwrap()
            .unwrap();
        assert_eq!(vars["replicas"], LiteralValue::String("3".into()));
    }

    #[test]
    fn equal_priority_keeps_declaration_order() {
        let stores = Stores::new();
        let r = resource("r1", "server", &[]);
        stores
            .deployment_variables
            .upsert(variable(
                "tier",
                vec![value("a", 1, None, literal("first")), value("b", 1, None, literal("second"))],
                None,
            ))
            .unwrap();
        let vars = resolve_variables(&stores, &RuleRelationshipResolver, "d1", &r)
            .unwrap()
            .unwrap();
        assert_eq!(vars["tier"], LiteralValue::String("first".into()));
    }

    #[test]
    fn resource_variable_overrides_and_default_applies() {
        let stores = Stores::new();
        let r = resource("r1", "server", &[]);
        stores
            .deployment_variables
            .upsert(variable("image", vec![value("a", 1, None, literal("nginx"))], None))
            .unwrap();
        stores
            .deployment_variables
            .upsert(variable("log", vec![value("x", 1, Some("kind == 'db'"), literal("debug"))], Some("info")))
            .unwrap();
        stores
            .deployment_variables
            .upsert(variable("unset", vec![], None))
            .unwrap();
        stores
            .resource_variables
            .upsert(ResourceVariable {
                id: "rv1".into(),
                resource_id: "r1".into(),
                key: "image".into(),
                value: literal("caddy"),
            })
            .unwrap();

        let vars = resolve_variables(&stores, &RuleRelationshipResolver, "d1", &r)
            .unwrap()
            .unwrap();
        assert_eq!(vars["image"], LiteralValue::String("caddy".into()));
        assert_eq!(vars["log"], LiteralValue::String("info".into()));
        assert!(!vars.contains_key("unset"));
    }

    #[test]
    fn references_resolve_through_relationship_rules() {
        let stores = Stores::new();
        let app = resource("app", "server", &[("cluster", "c1")]);
        let mut cluster = resource("c1-res", "cluster", &[("name", "c1")]);
        cluster.config.insert("endpoint".into(), Value::String("https://c1".into()));
        stores.resources.upsert(app.clone()).unwrap();
        stores.resources.upsert(cluster).unwrap();
        stores
            .relationship_rules
            .upsert(RelationshipRule {
                id: "rr1".into(),
                reference: "cluster".into(),
                from_kind: Some("server".into()),
                target: Some(Selector::cel("kind == 'cluster'")),
                property_matchers: vec![PropertyMatcher {
                    from_property: vec!["metadata".into(), "cluster".into()],
                    to_property: vec!["metadata".into(), "name".into()],
                }],
            })
            .unwrap();
        stores
            .deployment_variables
            .upsert(variable(
                "endpoint",
                vec![value(
                    "ref",
                    1,
                    None,
                    VariableValue::Reference {
                        reference: "cluster".into(),
                        path: vec!["config".into(), "endpoint".into()],
                    },
                )],
                None,
            ))
            .unwrap();

        let vars = resolve_variables(&stores, &RuleRelationshipResolver, "d1", &app)
            .unwrap()
            .unwrap();
        assert_eq!(vars["endpoint"], LiteralValue::String("https://c1".into()));
    }

    #[test]
    fn unresolved_reference_blocks_release() {
        let stores = Stores::new();
        let r = resource("r1", "server", &[]);
        stores
            .deployment_variables
            .upsert(variable(
                "endpoint",
                vec![value(
                    "ref",
                    1,
                    None,
                    VariableValue::Reference {
                        reference: "cluster".into(),
                        path: vec![],
                    },
                )],
                Some("fallback"),
            ))
            .unwrap();
        assert!(resolve_variables(&stores, &RuleRelationshipResolver, "d1", &r)
            .unwrap()
            .is_none());
    }

    #[test]
    fn sensitive_values_keep_only_hash() {
        let stores = Stores::new();
        let r = resource("r1", "server", &[]);
        stores
            .deployment_variables
            .upsert(variable(
                "token",
                vec![value("s", 1, None, VariableValue::Sensitive { value_hash: "abc".into() })],
                None,
            ))
            .unwrap();
        let vars = resolve_variables(&stores, &RuleRelationshipResolver, "d1", &r)
            .unwrap()
            .unwrap();
        assert_eq!(vars["token"], LiteralValue::Sensitive { value_hash: "abc".into() });
    }
}
