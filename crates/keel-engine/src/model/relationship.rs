//! Relationship rules used to resolve variable references.

use serde::{Deserialize, Serialize};

use super::impl_entity;
use crate::selector::Selector;

/// Pairs a property path on the source resource with one on the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyMatcher {
    /// Path on the release target's resource.
    pub from_property: Vec<String>,
    /// Path on the candidate resource.
    pub to_property: Vec<String>,
}

/// Declares how a named reference finds a related resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipRule {
    /// Stable identifier.
    pub id: String,
    /// Reference name used by variable values.
    pub reference: String,
    /// Restricts the rule to source resources of this kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_kind: Option<String>,
    /// Filter applied to candidate resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Selector>,
    /// All matchers must hold for a candidate to qualify.
    #[serde(default)]
    pub property_matchers: Vec<PropertyMatcher>,
}

impl_entity!(RelationshipRule, "relationship-rule");
