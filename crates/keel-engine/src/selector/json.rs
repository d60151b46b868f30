//! Structured JSON predicates over entity fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::cache;
use crate::error::{Error, Result};

/// Default maximum nesting of `comparison` nodes.
pub const DEFAULT_MAX_DEPTH: usize = 10;

/// Boolean composition operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonOperator {
    /// Every condition must hold.
    And,
    /// Any condition must hold.
    Or,
}

/// String comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StringOperator {
    /// Exact equality.
    Equals,
    /// Prefix match.
    StartsWith,
    /// Suffix match.
    EndsWith,
    /// Substring match.
    Contains,
    /// Regular expression match.
    Regex,
}

/// Metadata operator: a string operator or an absence test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetadataOperator {
    /// Exact equality.
    Equals,
    /// Prefix match.
    StartsWith,
    /// Suffix match.
    EndsWith,
    /// Substring match.
    Contains,
    /// Regular expression match.
    Regex,
    /// The key is absent.
    Null,
}

impl MetadataOperator {
    fn as_string_operator(self) -> Option<StringOperator> {
        match self {
            Self::Equals => Some(StringOperator::Equals),
            Self::StartsWith => Some(StringOperator::StartsWith),
            Self::EndsWith => Some(StringOperator::EndsWith),
            Self::Contains => Some(StringOperator::Contains),
            Self::Regex => Some(StringOperator::Regex),
            Self::Null => None,
        }
    }
}

/// Which timestamp a date condition reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DateField {
    /// `createdAt`.
    CreatedAt,
    /// `updatedAt`.
    UpdatedAt,
}

/// Date comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DateOperator {
    /// Strictly before.
    Before,
    /// Strictly after.
    After,
    /// Before or equal.
    BeforeOrOn,
    /// After or equal.
    AfterOrOn,
}

/// Equality-only operator for kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KindOperator {
    /// Exact equality.
    Equals,
}

/// A recursive predicate over entity fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JsonSelector {
    /// Boolean composition of nested conditions.
    Comparison {
        /// `and` / `or`.
        operator: ComparisonOperator,
        /// Nested conditions.
        conditions: Vec<JsonSelector>,
    },
    /// Compares the entity name.
    Name {
        /// String operator.
        operator: StringOperator,
        /// Operand.
        value: String,
    },
    /// Compares one metadata entry.
    Metadata {
        /// Metadata key.
        key: String,
        /// Operator; `null` tests absence.
        operator: MetadataOperator,
        /// Operand, required unless the operator is `null`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
    /// Compares the version (or version tag).
    Version {
        /// String operator.
        operator: StringOperator,
        /// Operand.
        value: String,
    },
    /// Compares a timestamp field.
    Date {
        /// Field read from the entity.
        #[serde(rename = "dateField")]
        date_field: DateField,
        /// Date operator.
        operator: DateOperator,
        /// RFC 3339 operand.
        value: String,
    },
    /// Compares the resource kind.
    Kind {
        /// Equality only.
        operator: KindOperator,
        /// Operand.
        value: String,
    },
    /// Compares the resource identifier.
    Identifier {
        /// String operator.
        operator: StringOperator,
        /// Operand.
        value: String,
    },
}

impl JsonSelector {
    /// Validates operator/operand compatibility and nesting depth.
    ///
    /// # Errors
    ///
    /// Returns a validation error describing the first problem found.
    pub fn validate(&self, max_depth: usize) -> Result<()> {
        self.validate_at(1, max_depth)
    }

    fn validate_at(&self, depth: usize, max_depth: usize) -> Result<()> {
        match self {
            Self::Comparison { conditions, .. } => {
                if depth > max_depth {
                    return Err(Error::validation(format!(
                        "selector nesting exceeds maximum depth {max_depth}"
                    )));
                }
                conditions
                    .iter()
                    .try_for_each(|c| c.validate_at(depth + 1, max_depth))
            }
            Self::Name { operator, value }
            | Self::Version { operator, value }
            | Self::Identifier { operator, value } => validate_string_op(*operator, value),
            Self::Metadata {
                key,
                operator,
                value,
            } => {
                if key.is_empty() {
                    return Err(Error::validation("metadata condition requires a key"));
                }
                match (operator.as_string_operator(), value) {
                    (None, _) => Ok(()),
                    (Some(op), Some(v)) => validate_string_op(op, v),
                    (Some(_), None) => Err(Error::validation(format!(
                        "metadata condition on '{key}' requires a value"
                    ))),
                }
            }
            Self::Date { value, .. } => parse_date(value).map(|_| ()),
            Self::Kind { value, .. } => {
                if value.is_empty() {
                    Err(Error::validation("kind condition requires a value"))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Evaluates the predicate against an entity rendered as JSON.
    ///
    /// Conditions on absent fields evaluate to false.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed operands (bad regex or date).
    pub fn matches(&self, subject: &Value) -> Result<bool> {
        match self {
            Self::Comparison {
                operator,
                conditions,
            } => {
                for c in conditions {
                    let m = c.matches(subject)?;
                    match operator {
                        ComparisonOperator::And if !m => return Ok(false),
                        ComparisonOperator::Or if m => return Ok(true),
                        _ => {}
                    }
                }
                Ok(match operator {
                    ComparisonOperator::And => true,
                    ComparisonOperator::Or => false,
                })
            }
            Self::Name { operator, value } => match str_field(subject, "name") {
                Some(s) => compare_string(*operator, s, value),
                None => Ok(false),
            },
            Self::Identifier { operator, value } => match str_field(subject, "identifier") {
                Some(s) => compare_string(*operator, s, value),
                None => Ok(false),
            },
            Self::Version { operator, value } => {
                match str_field(subject, "version").or_else(|| str_field(subject, "tag")) {
                    Some(s) => compare_string(*operator, s, value),
                    None => Ok(false),
                }
            }
            Self::Kind { value, .. } => Ok(str_field(subject, "kind") == Some(value.as_str())),
            Self::Metadata {
                key,
                operator,
                value,
            } => {
                let actual = subject
                    .get("metadata")
                    .and_then(|m| m.get(key))
                    .and_then(Value::as_str);
                match (operator.as_string_operator(), actual, value) {
                    (None, actual, _) => Ok(actual.is_none()),
                    (Some(op), Some(a), Some(v)) => compare_string(op, a, v),
                    _ => Ok(false),
                }
            }
            Self::Date {
                date_field,
                operator,
                value,
            } => {
                let field = match date_field {
                    DateField::CreatedAt => "createdAt",
                    DateField::UpdatedAt => "updatedAt",
                };
                let Some(actual) = str_field(subject, field)
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|d| d.with_timezone(&Utc))
                else {
                    return Ok(false);
                };
                let operand = parse_date(value)?;
                Ok(match operator {
                    DateOperator::Before => actual < operand,
                    DateOperator::After => actual > operand,
                    DateOperator::BeforeOrOn => actual <= operand,
                    DateOperator::AfterOrOn => actual >= operand,
                })
            }
        }
    }
}

fn str_field<'a>(subject: &'a Value, field: &str) -> Option<&'a str> {
    subject.get(field).and_then(Value::as_str)
}

fn parse_date(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| Error::validation(format!("invalid RFC 3339 date '{value}': {e}")))
}

fn validate_string_op(operator: StringOperator, value: &str) -> Result<()> {
    if operator == StringOperator::Regex {
        cache::regex(value)
            .map_err(|e| Error::validation(format!("invalid regex '{value}': {e}")))?;
    }
    Ok(())
}

fn compare_string(operator: StringOperator, actual: &str, operand: &str) -> Result<bool> {
    Ok(match operator {
        StringOperator::Equals => actual == operand,
        StringOperator::StartsWith => actual.starts_with(operand),
        StringOperator::EndsWith => actual.ends_with(operand),
        StringOperator::Contains => actual.contains(operand),
        StringOperator::Regex => cache::regex(operand)
            .map_err(|e| Error::evaluation(format!("invalid regex '{operand}': {e}")))?
            .is_match(actual),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: Value) -> JsonSelector {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn metadata_equals_and_null() {
        let subject = json!({"metadata": {"team": "platform"}});
        let eq = parse(json!({"type": "metadata", "key": "team", "operator": "equals", "value": "platform"}));
        assert!(eq.matches(&subject).unwrap());
        let absent = parse(json!({"type": "metadata", "key": "owner", "operator": "null"}));
        assert!(absent.matches(&subject).unwrap());
        let present = parse(json!({"type": "metadata", "key": "team", "operator": "null"}));
        assert!(!present.matches(&subject).unwrap());
    }

    #[test]
    fn comparison_composes() {
        let subject = json!({"name": "web-1", "kind": "server"});
        let sel = parse(json!({
            "type": "comparison",
            "operator": "and",
            "conditions": [
                {"type": "kind", "operator": "equals", "value": "server"},
                {"type": "comparison", "operator": "or", "conditions": [
                    {"type": "name", "operator": "starts-with", "value": "db"},
                    {"type": "name", "operator": "regex", "value": "^web-\\d$"}
                ]}
            ]
        }));
        sel.validate(DEFAULT_MAX_DEPTH).unwrap();
        assert!(sel.matches(&subject).unwrap());
    }

    #[test]
    fn dates_compare_monotonically() {
        let subject = json!({"createdAt": "2024-01-02T00:00:00Z"});
        let before = parse(json!({
            "type": "date", "dateField": "created-at", "operator": "before", "value": "2024-01-03T00:00:00Z"
        }));
        assert!(before.matches(&subject).unwrap());
        let on = parse(json!({
            "type": "date", "dateField": "created-at", "operator": "after-or-on", "value": "2024-01-02T00:00:00Z"
        }));
        assert!(on.matches(&subject).unwrap());
    }

    #[test]
    fn validation_rejects_bad_input() {
        let mut sel = parse(json!({"type": "kind", "operator": "equals", "value": "x"}));
        for _ in 0..11 {
            sel = JsonSelector::Comparison {
                operator: ComparisonOperator::And,
                conditions: vec![sel],
            };
        }
        assert!(sel.validate(DEFAULT_MAX_DEPTH).is_err());

        let bad_regex = parse(json!({"type": "name", "operator": "regex", "value": "("}));
        assert!(bad_regex.validate(DEFAULT_MAX_DEPTH).is_err());

        let missing_value = parse(json!({"type": "metadata", "key": "k", "operator": "equals"}));
        assert!(missing_value.validate(DEFAULT_MAX_DEPTH).is_err());

        let bad_date = parse(json!({"type": "date", "dateField": "created-at", "operator": "before", "value": "yesterday"}));
        assert!(bad_date.validate(DEFAULT_MAX_DEPTH).is_err());

        assert!(serde_json::from_value::<JsonSelector>(json!({"type": "name", "operator": "like", "value": "x"})).is_err());
    }
}
