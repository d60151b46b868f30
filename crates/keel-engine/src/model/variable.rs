//! Deployment and resource variables.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::impl_entity;
use crate::selector::Selector;

/// A resolved, concrete variable value carried by a release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum LiteralValue {
    /// UTF-8 string.
    String(String),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Boolean.
    Bool(bool),
    /// Nested object.
    Object(Map<String, Value>),
    /// Explicit null.
    Null,
    /// Secret represented only by its hash.
    Sensitive {
        /// Hash of the secret value.
        #[serde(rename = "valueHash")]
        value_hash: String,
    },
}

impl LiteralValue {
    /// Converts a plain JSON value. Arrays have no literal form.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Self::Null),
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float)),
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Object(m) => Some(Self::Object(m.clone())),
            Value::Array(_) => None,
        }
    }
}

/// How a variable value is obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VariableValue {
    /// A literal.
    Literal {
        /// The value.
        value: LiteralValue,
    },
    /// A property of a related resource, found through relationship rules.
    Reference {
        /// Relationship reference name.
        reference: String,
        /// Property path on the related resource.
        #[serde(default)]
        path: Vec<String>,
    },
    /// A secret stored elsewhere.
    Sensitive {
        /// Hash of the secret value.
        #[serde(rename = "valueHash")]
        value_hash: String,
    },
}

/// One candidate value of a deployment variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentVariableValue {
    /// Stable identifier.
    pub id: String,
    /// Restricts the value to matching resources. Absent matches all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_selector: Option<Selector>,
    /// Higher priority values are tried first.
    #[serde(default)]
    pub priority: i64,
    /// The value.
    pub value: VariableValue,
}

/// A keyed variable defined on a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentVariable {
    /// Stable identifier.
    pub id: String,
    /// Owning deployment.
    pub deployment_id: String,
    /// Variable name.
    pub key: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Used when no value matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<LiteralValue>,
    /// Candidate values.
    #[serde(default)]
    pub values: Vec<DeploymentVariableValue>,
}

impl_entity!(DeploymentVariable, "deployment-variable");

/// A variable set directly on a resource; overrides deployment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceVariable {
    /// Stable identifier.
    pub id: String,
    /// Owning resource.
    pub resource_id: String,
    /// Variable name.
    pub key: String,
    /// The value.
    pub value: VariableValue,
}

impl_entity!(ResourceVariable, "resource-variable");

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn literal_wire_shape() {
        let v = serde_json::to_value(LiteralValue::Int(3)).unwrap();
        assert_eq!(v, json!({"type": "int", "value": 3}));
        let s = serde_json::to_value(LiteralValue::Sensitive {
            value_hash: "abc".into(),
        })
        .unwrap();
        assert_eq!(s, json!({"type": "sensitive", "value": {"valueHash": "abc"}}));
    }

    #[test]
    fn variable_value_parses_reference() {
        let v: VariableValue =
            serde_json::from_value(json!({"type": "reference", "reference": "vpc", "path": ["id"]}))
                .unwrap();
        assert_eq!(
            v,
            VariableValue::Reference {
                reference: "vpc".into(),
                path: vec!["id".into()]
            }
        );
    }

    #[test]
    fn from_json_maps_numbers() {
        assert_eq!(LiteralValue::from_json(&json!(2)), Some(LiteralValue::Int(2)));
        assert_eq!(LiteralValue::from_json(&json!(2.5)), Some(LiteralValue::Float(2.5)));
        assert_eq!(LiteralValue::from_json(&json!([1])), None);
    }
}
