//! Per-workspace record of repository mutations.

use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeType {
    /// The entity did not exist before.
    Created,
    /// The entity replaced a previous version.
    Updated,
    /// The entity was removed.
    Deleted,
}

/// One repository mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// Entity kind.
    pub kind: String,
    /// Mutation type.
    pub change_type: ChangeType,
    /// Entity identifier.
    pub id: String,
    /// Entity after the change, or before it for deletions.
    pub payload: Value,
}

/// Accumulates changes between drains.
#[derive(Debug, Default)]
pub struct ChangeSet {
    changes: Mutex<Vec<Change>>,
}

impl ChangeSet {
    /// Creates an empty change set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a change.
    pub fn record(&self, change: Change) {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(change);
    }

    /// Takes every change recorded so far.
    #[must_use]
    pub fn drain(&self) -> Vec<Change> {
        std::mem::take(&mut *self.changes.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Number of pending changes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if nothing changed since the last drain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
