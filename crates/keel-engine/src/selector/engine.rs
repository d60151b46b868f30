//! Incremental selector-to-entity match maintenance.
//!
//! The engine keeps `selectorId -> matched entity ids` current as entities and
//! selectors are upserted or removed. Every mutation reports the resulting
//! [`MatchChange`]s and then invokes registered callbacks after the state lock
//! has been released.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use serde_json::Value;

use super::Selector;
use crate::error::{Result, poison_err};

/// A change in the match relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MatchChange {
    /// The entity now matches the selector.
    #[serde(rename_all = "camelCase")]
    Added {
        /// Selector identifier.
        selector_id: String,
        /// Entity identifier.
        entity_id: String,
    },
    /// The entity no longer matches the selector.
    #[serde(rename_all = "camelCase")]
    Removed {
        /// Selector identifier.
        selector_id: String,
        /// Entity identifier.
        entity_id: String,
    },
}

type Callback = Arc<dyn Fn(&MatchChange) + Send + Sync>;

#[derive(Debug, Default)]
struct State {
    entities: BTreeMap<String, Value>,
    selectors: BTreeMap<String, Selector>,
    matches: BTreeMap<String, BTreeSet<String>>,
}

/// Maintains matches between one entity kind and a set of selectors.
pub struct SelectorEngine {
    var: &'static str,
    state: RwLock<State>,
    callbacks: RwLock<Vec<Callback>>,
}

impl std::fmt::Debug for SelectorEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectorEngine")
            .field("var", &self.var)
            .finish_non_exhaustive()
    }
}

impl SelectorEngine {
    /// Creates an engine whose entities are bound as `var` in CEL.
    #[must_use]
    pub fn new(var: &'static str) -> Self {
        Self {
            var,
            state: RwLock::new(State::default()),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Registers a callback invoked for every match change.
    pub fn on_match_change(&self, callback: impl Fn(&MatchChange) + Send + Sync + 'static) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Inserts or replaces an entity and re-evaluates every selector against it.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn upsert_entity(&self, id: &str, entity: Value) -> Result<Vec<MatchChange>> {
        let changes = {
            let mut state = self.state.write().map_err(poison_err)?;
            let mut changes = Vec::new();
            let State {
                selectors, matches, ..
            } = &mut *state;
            for (selector_id, selector) in selectors.iter() {
                let now = super::matches_or(Some(selector), self.var, &entity, false);
                let set = matches.entry(selector_id.clone()).or_default();
                let before = set.contains(id);
                if now && !before {
                    set.insert(id.to_string());
                    changes.push(MatchChange::Added {
                        selector_id: selector_id.clone(),
                        entity_id: id.to_string(),
                    });
                } else if !now && before {
                    set.remove(id);
                    changes.push(MatchChange::Removed {
                        selector_id: selector_id.clone(),
                        entity_id: id.to_string(),
                    });
                }
            }
            state.entities.insert(id.to_string(), entity);
            changes
        };
        self.notify(&changes);
        Ok(changes)
    }

    /// Removes an entity and every match it participated in.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn remove_entity(&self, id: &str) -> Result<Vec<MatchChange>> {
        let changes = {
            let mut state = self.state.write().map_err(poison_err)?;
            state.entities.remove(id);
            let mut changes = Vec::new();
            for (selector_id, set) in &mut state.matches {
                if set.remove(id) {
                    changes.push(MatchChange::Removed {
                        selector_id: selector_id.clone(),
                        entity_id: id.to_string(),
                    });
                }
            }
            changes
        };
        self.notify(&changes);
        Ok(changes)
    }

    /// Inserts or replaces a selector and evaluates it against every entity.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an invalid selector; state is unchanged.
    pub fn upsert_selector(&self, id: &str, selector: Selector) -> Result<Vec<MatchChange>> {
        selector.validate()?;
        let changes = {
            let mut state = self.state.write().map_err(poison_err)?;
            let matched: BTreeSet<String> = state
                .entities
                .iter()
                .filter(|(_, e)| super::matches_or(Some(&selector), self.var, e, false))
                .map(|(k, _)| k.clone())
                .collect();
            let previous = state.matches.remove(id).unwrap_or_default();
            let mut changes: Vec<MatchChange> = previous
                .difference(&matched)
                .map(|e| MatchChange::Removed {
                    selector_id: id.to_string(),
                    entity_id: e.clone(),
                })
                .collect();
            changes.extend(matched.difference(&previous).map(|e| MatchChange::Added {
                selector_id: id.to_string(),
                entity_id: e.clone(),
            }));
            state.selectors.insert(id.to_string(), selector);
            state.matches.insert(id.to_string(), matched);
            changes
        };
        self.notify(&changes);
        Ok(changes)
    }

    /// Removes a selector and its matches.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn remove_selector(&self, id: &str) -> Result<Vec<MatchChange>> {
        let changes: Vec<MatchChange> = {
            let mut state = self.state.write().map_err(poison_err)?;
            state.selectors.remove(id);
            state
                .matches
                .remove(id)
                .unwrap_or_default()
                .into_iter()
                .map(|e| MatchChange::Removed {
                    selector_id: id.to_string(),
                    entity_id: e,
                })
                .collect()
        };
        self.notify(&changes);
        Ok(changes)
    }

    /// Entities currently matched by a selector.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn matched(&self, selector_id: &str) -> Result<BTreeSet<String>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.matches.get(selector_id).cloned().unwrap_or_default())
    }

    /// Selectors that currently match an entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn selectors_matching(&self, entity_id: &str) -> Result<BTreeSet<String>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .matches
            .iter()
            .filter(|(_, set)| set.contains(entity_id))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn notify(&self, changes: &[MatchChange]) {
        if changes.is_empty() {
            return;
        }
        let callbacks = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for change in changes {
            for cb in &callbacks {
                cb(change);
            }
        }
    }
}
