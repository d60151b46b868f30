//! Systems group deployments and environments.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::impl_entity;

/// A user-defined grouping of deployments and environments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct System {
    /// Stable identifier.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Deployments linked into this system.
    #[serde(default)]
    pub deployment_ids: BTreeSet<String>,
    /// Environments linked into this system.
    #[serde(default)]
    pub environment_ids: BTreeSet<String>,
}

impl System {
    /// Creates an empty system.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            deployment_ids: BTreeSet::new(),
            environment_ids: BTreeSet::new(),
        }
    }
}

impl_entity!(System, "system");
