//! Batch selector service over resources.
//!
//! Transport-agnostic form of the streaming selector API: callers load and
//! remove resources and selectors in batches and receive the resulting match
//! changes.

use serde::{Deserialize, Serialize};

use super::{MatchChange, Selector, SelectorEngine};
use crate::error::{Error, Result};
use crate::model::Resource;

/// Maximum items accepted per call.
pub const MAX_BATCH: usize = 1_000;

/// A match notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    /// Resource identifier.
    pub resource_id: String,
    /// Selector identifier.
    pub selector_id: String,
    /// `added` or `removed`.
    pub message: String,
}

impl From<MatchChange> for Match {
    fn from(change: MatchChange) -> Self {
        match change {
            MatchChange::Added {
                selector_id,
                entity_id,
            } => Self {
                resource_id: entity_id,
                selector_id,
                message: "added".to_string(),
            },
            MatchChange::Removed {
                selector_id,
                entity_id,
            } => Self {
                resource_id: entity_id,
                selector_id,
                message: "removed".to_string(),
            },
        }
    }
}

/// A selector registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSelector {
    /// Selector identifier.
    pub id: String,
    /// The predicate.
    pub selector: Selector,
}

/// Reference to a resource or selector by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    /// Identifier.
    pub id: String,
}

/// Outcome of a removal batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// Whether every item was processed.
    pub ok: bool,
    /// Items processed.
    pub count: usize,
    /// Matches dropped as a consequence.
    pub removed_matches: usize,
}

/// Resource selector service.
#[derive(Debug)]
pub struct SelectorService {
    engine: SelectorEngine,
}

impl Default for SelectorService {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectorService {
    /// Creates an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self {
            engine: SelectorEngine::new("resource"),
        }
    }

    /// The underlying engine.
    #[must_use]
    pub fn engine(&self) -> &SelectorEngine {
        &self.engine
    }

    /// Loads or replaces resources.
    ///
    /// # Errors
    ///
    /// Returns a validation error for oversized batches.
    pub fn load_resources(&self, resources: Vec<Resource>) -> Result<Vec<Match>> {
        check_batch(resources.len())?;
        let mut out = Vec::new();
        for resource in resources {
            let id = resource.id.clone();
            let value = serde_json::to_value(&resource)?;
            out.extend(self.engine.upsert_entity(&id, value)?.into_iter().map(Match::from));
        }
        Ok(out)
    }

    /// Removes resources.
    ///
    /// # Errors
    ///
    /// Returns a validation error for oversized batches.
    pub fn remove_resources(&self, refs: Vec<EntityRef>) -> Result<Status> {
        check_batch(refs.len())?;
        let mut removed = 0;
        for r in &refs {
            removed += self.engine.remove_entity(&r.id)?.len();
        }
        Ok(Status {
            ok: true,
            count: refs.len(),
            removed_matches: removed,
        })
    }

    /// Loads or replaces selectors.
    ///
    /// # Errors
    ///
    /// Returns a validation error for oversized batches or invalid selectors.
    pub fn load_selectors(&self, selectors: Vec<ResourceSelector>) -> Result<Vec<Match>> {
        check_batch(selectors.len())?;
        let mut out = Vec::new();
        for s in selectors {
            out.extend(
                self.engine
                    .upsert_selector(&s.id, s.selector)?
                    .into_iter()
                    .map(Match::from),
            );
        }
        Ok(out)
    }

    /// Removes selectors.
    ///
    /// # Errors
    ///
    /// Returns a validation error for oversized batches.
    pub fn remove_selectors(&self, refs: Vec<EntityRef>) -> Result<Status> {
        check_batch(refs.len())?;
        let mut removed = 0;
        for r in &refs {
            removed += self.engine.remove_selector(&r.id)?.len();
        }
        Ok(Status {
            ok: true,
            count: refs.len(),
            removed_matches: removed,
        })
    }
}

fn check_batch(len: usize) -> Result<()> {
    if len > MAX_BATCH {
        return Err(Error::validation(format!(
            "batch of {len} exceeds the limit of {MAX_BATCH} items"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn resource(id: &str, kind: &str) -> Resource {
        Resource {
            id: id.into(),
            name: id.into(),
            kind: kind.into(),
            identifier: id.into(),
            version: "v1".into(),
            config: serde_json::Map::new(),
            metadata: BTreeMap::new(),
            created_at: Utc.timestamp_opt(0, 0).unwrap(),
            updated_at: None,
            locked_at: None,
            deleted_at: None,
        }
    }

    #[test]
    fn load_and_remove_round() {
        let svc = SelectorService::new();
        svc.load_selectors(vec![ResourceSelector {
            id: "servers".into(),
            selector: Selector::cel("kind == 'server'"),
        }])
        .unwrap();
        let matches = svc
            .load_resources(vec![resource("r1", "server"), resource("r2", "db")])
            .unwrap();
        assert_eq!(
            matches,
            vec![Match {
                resource_id: "r1".into(),
                selector_id: "servers".into(),
                message: "added".into()
            }]
        );
        let status = svc
            .remove_resources(vec![EntityRef { id: "r1".into() }])
            .unwrap();
        assert_eq!(status.removed_matches, 1);

        let status = svc
            .remove_selectors(vec![EntityRef { id: "servers".into() }])
            .unwrap();
        assert!(status.ok);
        assert_eq!(status.count, 1);
        assert_eq!(status.removed_matches, 0);
    }

    #[test]
    fn removing_a_selector_drops_its_matches() {
        let svc = SelectorService::new();
        svc.load_selectors(vec![ResourceSelector {
            id: "servers".into(),
            selector: Selector::cel("kind == 'server'"),
        }])
        .unwrap();
        svc.load_resources(vec![resource("r1", "server"), resource("r2", "server")])
            .unwrap();

        let status = svc
            .remove_selectors(vec![EntityRef { id: "servers".into() }])
            .unwrap();
        assert_eq!(status.removed_matches, 2);
    }

    #[test]
    fn oversized_batches_are_rejected() {
        let svc = SelectorService::new();
        let refs = (0..=MAX_BATCH)
            .map(|i| EntityRef { id: i.to_string() })
            .collect();
        assert!(svc.remove_resources(refs).is_err());
    }
}
