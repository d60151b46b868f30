//! Environments scope which resources a system deploys to.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::impl_entity;
use crate::selector::Selector;

/// A target grouping inside a system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    /// Stable identifier.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Owning system.
    pub system_id: String,
    /// Resource filter. Absent means no resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_selector: Option<Selector>,
    /// Labels.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl_entity!(Environment, "environment");
