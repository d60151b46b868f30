//! Resources are the units deployed to.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::impl_entity;

/// A deployable target (cluster, host, database, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Stable identifier. Preserved across upserts with the same kind and identifier.
    #[serde(default)]
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Resource kind, e.g. `server`.
    pub kind: String,
    /// Unique within the workspace for a given kind.
    pub identifier: String,
    /// Schema version of the resource payload.
    #[serde(default)]
    pub version: String,
    /// Opaque configuration.
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Labels.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last modification instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Set while the resource is locked against deploys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    /// Soft-deletion instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Resource {
    /// Secondary index key `(kind, identifier)`.
    #[must_use]
    pub fn identity_key(&self) -> String {
        identity_key(&self.kind, &self.identifier)
    }
}

/// Builds the `(kind, identifier)` lookup key.
#[must_use]
pub fn identity_key(kind: &str, identifier: &str) -> String {
    format!("{kind}/{identifier}")
}

impl_entity!(Resource, "resource");
