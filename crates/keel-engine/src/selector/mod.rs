//! Selectors: CEL expressions or structured JSON predicates over entities.
//!
//! A selector is total. Compile errors are reported at validation time and
//! evaluation problems (missing keys, type mismatches) make the selector
//! evaluate to `false` for that entity.

pub mod cache;
pub mod cel;
pub mod engine;
pub mod json;
pub mod service;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::Entity;

pub use engine::{MatchChange, SelectorEngine};
pub use json::JsonSelector;

/// A predicate over entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Selector {
    /// A CEL expression.
    Cel(String),
    /// A structured predicate.
    Json(JsonSelector),
}

impl Selector {
    /// Creates a CEL selector.
    #[must_use]
    pub fn cel(expression: impl Into<String>) -> Self {
        Self::Cel(expression.into())
    }

    /// Validates the selector with the default JSON depth limit.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed expressions or predicates.
    pub fn validate(&self) -> Result<()> {
        self.validate_with_depth(json::DEFAULT_MAX_DEPTH)
    }

    /// Validates the selector with an explicit JSON depth limit.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed expressions or predicates.
    pub fn validate_with_depth(&self, max_depth: usize) -> Result<()> {
        match self {
            Self::Cel(expr) => cache::program(expr)
                .map(|_| ())
                .map_err(|e| Error::validation(format!("invalid CEL selector '{expr}': {e}"))),
            Self::Json(sel) => sel.validate(max_depth),
        }
    }

    /// Evaluates the selector against an entity rendered as JSON.
    ///
    /// `var` names the entity in CEL (`resource`, `deployment`, ...); its
    /// fields are also addressable as bare identifiers.
    ///
    /// # Errors
    ///
    /// Returns an evaluation error if the selector does not compile.
    pub fn matches_json(&self, var: &str, subject: &Value) -> Result<bool> {
        self.matches_in(var, &[(var, subject)])
    }

    /// Evaluates the selector with several entities bound at once.
    ///
    /// CEL sees every `(name, value)` of `context`. The entry named `var` is
    /// the bare-identifier subject and the only input of JSON selectors.
    ///
    /// # Errors
    ///
    /// Returns an evaluation error if the selector does not compile.
    pub fn matches_in(&self, var: &str, context: &[(&str, &Value)]) -> Result<bool> {
        let null = Value::Null;
        let subject = context
            .iter()
            .find(|(name, _)| *name == var)
            .map_or(&null, |&(_, value)| value);
        match self {
            Self::Cel(expr) => {
                let program = cache::program(expr)
                    .map_err(|e| Error::evaluation(format!("invalid CEL selector '{expr}': {e}")))?;
                let activation = context
                    .iter()
                    .fold(cel::Activation::new(), |activation, &(name, value)| activation.bind(name, value))
                    .with_subject(subject);
                match program.evaluate_bool(&activation) {
                    Ok(b) => Ok(b),
                    Err(e) => {
                        tracing::trace!(selector = %expr, error = %e, "selector evaluated to false");
                        Ok(false)
                    }
                }
            }
            Self::Json(sel) => sel.matches(subject),
        }
    }

    /// Evaluates the selector against a typed entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the entity fails to serialize or the selector is invalid.
    pub fn matches<T: Entity>(&self, entity: &T) -> Result<bool> {
        let subject = serde_json::to_value(entity)?;
        self.matches_json(variable_name(T::KIND), &subject)
    }
}

/// Evaluates an optional selector, treating evaluation failures as a miss.
///
/// `absent` is returned when there is no selector.
#[must_use]
pub fn matches_or(selector: Option<&Selector>, var: &str, subject: &Value, absent: bool) -> bool {
    match selector {
        None => absent,
        Some(sel) => sel.matches_json(var, subject).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "selector evaluation failed");
            false
        }),
    }
}

/// CEL variable name under which an entity kind is bound.
#[must_use]
pub fn variable_name(kind: &str) -> &str {
    match kind {
        "deployment-version" => "version",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shape_is_tagged_by_variant() {
        let cel: Selector = serde_json::from_value(json!({"cel": "kind == 'server'"})).unwrap();
        assert_eq!(cel, Selector::cel("kind == 'server'"));
        let js: Selector = serde_json::from_value(json!({
            "json": {"type": "kind", "operator": "equals", "value": "server"}
        }))
        .unwrap();
        assert!(matches!(js, Selector::Json(JsonSelector::Kind { .. })));
    }

    #[test]
    fn cel_missing_key_is_false() {
        let sel = Selector::cel("metadata.team == 'platform'");
        assert!(!sel.matches_json("resource", &json!({"metadata": {}})).unwrap());
        assert!(sel
            .matches_json("resource", &json!({"metadata": {"team": "platform"}}))
            .unwrap());
    }

    #[test]
    fn invalid_cel_fails_validation() {
        assert!(Selector::cel("kind ==").validate().is_err());
        assert!(Selector::cel("resource.kind == 'x'").validate().is_ok());
    }

    #[test]
    fn optional_selector_defaults() {
        let subject = json!({"kind": "server"});
        assert!(matches_or(None, "resource", &subject, true));
        assert!(!matches_or(None, "resource", &subject, false));
        assert!(!matches_or(Some(&Selector::cel("kind ==")), "resource", &subject, true));
    }

    #[test]
    fn context_binds_every_entity() {
        let resource = json!({"kind": "server", "metadata": {"team": "data"}});
        let environment = json!({"id": "e1", "metadata": {"team": "data"}});
        let context = [("resource", &resource), ("environment", &environment)];

        let cel = Selector::cel("environment.metadata.team == resource.metadata.team && kind == 'server'");
        assert!(cel.matches_in("resource", &context).unwrap());
        assert!(!Selector::cel("id == 'e1'").matches_in("resource", &context).unwrap());

        let json: Selector = serde_json::from_value(json!({
            "json": {"type": "kind", "operator": "equals", "value": "server"}
        }))
        .unwrap();
        assert!(json.matches_in("resource", &context).unwrap());
        assert!(!json.matches_in("environment", &context).unwrap());
    }
}
