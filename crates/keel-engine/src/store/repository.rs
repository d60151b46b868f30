//! Generic typed repository with inline secondary indexes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use serde_json::Value;

use super::changeset::{Change, ChangeSet, ChangeType};
use crate::error::{Error, Result, poison_err};
use crate::model::Entity;

/// Extracts secondary index keys from an entity.
pub type Indexer<T> = fn(&T) -> Vec<String>;

#[derive(Debug)]
struct Inner<T> {
    items: BTreeMap<String, T>,
    indexes: BTreeMap<&'static str, BTreeMap<String, BTreeSet<String>>>,
}

/// A single-writer, multi-reader store for one entity kind.
///
/// Items are kept in an ordered map so iteration and serialization are
/// deterministic. Every mutation is recorded on the shared [`ChangeSet`].
#[derive(Debug)]
pub struct Repository<T> {
    inner: RwLock<Inner<T>>,
    indexers: Vec<(&'static str, Indexer<T>)>,
    changes: Arc<ChangeSet>,
}

impl<T: Entity> Repository<T> {
    /// Creates an empty repository reporting to `changes`.
    #[must_use]
    pub fn new(changes: Arc<ChangeSet>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                items: BTreeMap::new(),
                indexes: BTreeMap::new(),
            }),
            indexers: Vec::new(),
            changes,
        }
    }

    /// Adds a secondary index. Must be called before any insert.
    #[must_use]
    pub fn with_index(mut self, name: &'static str, indexer: Indexer<T>) -> Self {
        self.indexers.push((name, indexer));
        self
    }

    /// Returns the entity with `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn get(&self, id: &str) -> Result<Option<T>> {
        Ok(self.inner.read().map_err(poison_err)?.items.get(id).cloned())
    }

    /// Returns true if an entity with `id` exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.inner.read().map_err(poison_err)?.items.contains_key(id))
    }

    /// Inserts or replaces an entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned or the entity fails to serialize.
    pub fn upsert(&self, item: T) -> Result<ChangeType> {
        let payload = serde_json::to_value(&item)?;
        let id = item.entity_id();
        let change_type = {
            let mut inner = self.inner.write().map_err(poison_err)?;
            let previous = inner.items.remove(&id);
            if let Some(prev) = &previous {
                self.unindex(&mut inner, &id, prev);
            }
            self.index(&mut inner, &id, &item);
            inner.items.insert(id.clone(), item);
            if previous.is_some() {
                ChangeType::Updated
            } else {
                ChangeType::Created
            }
        };
        self.changes.record(Change {
            kind: T::KIND.to_string(),
            change_type,
            id,
            payload,
        });
        Ok(change_type)
    }

    /// Removes an entity, returning it if it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn remove(&self, id: &str) -> Result<Option<T>> {
        let removed = {
            let mut inner = self.inner.write().map_err(poison_err)?;
            let removed = inner.items.remove(id);
            if let Some(prev) = &removed {
                self.unindex(&mut inner, id, prev);
            }
            removed
        };
        if let Some(prev) = &removed {
            self.changes.record(Change {
                kind: T::KIND.to_string(),
                change_type: ChangeType::Deleted,
                id: id.to_string(),
                payload: serde_json::to_value(prev)?,
            });
        }
        Ok(removed)
    }

    /// Snapshot of every entity keyed by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn items(&self) -> Result<BTreeMap<String, T>> {
        Ok(self.inner.read().map_err(poison_err)?.items.clone())
    }

    /// Every entity in id order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn values(&self) -> Result<Vec<T>> {
        Ok(self
            .inner
            .read()
            .map_err(poison_err)?
            .items
            .values()
            .cloned()
            .collect())
    }

    /// Every id in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn ids(&self) -> Result<Vec<String>> {
        Ok(self
            .inner
            .read()
            .map_err(poison_err)?
            .items
            .keys()
            .cloned()
            .collect())
    }

    /// Number of entities.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.inner.read().map_err(poison_err)?.items.len())
    }

    /// Returns true when empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Entities whose `index` contains `key`, in id order.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown index or a poisoned lock.
    pub fn lookup(&self, index: &str, key: &str) -> Result<Vec<T>> {
        let inner = self.inner.read().map_err(poison_err)?;
        if !self.indexers.iter().any(|(name, _)| *name == index) {
            return Err(Error::internal(format!(
                "repository '{}' has no index '{index}'",
                T::KIND
            )));
        }
        Ok(inner
            .indexes
            .get(index)
            .and_then(|idx| idx.get(key))
            .map(|ids| ids.iter().filter_map(|id| inner.items.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    /// Replaces the whole content without recording changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn restore(&self, items: BTreeMap<String, T>) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.items.clear();
        inner.indexes.clear();
        for (id, item) in items {
            self.index(&mut inner, &id, &item);
            inner.items.insert(id, item);
        }
        Ok(())
    }

    fn index(&self, inner: &mut Inner<T>, id: &str, item: &T) {
        for (name, indexer) in &self.indexers {
            let idx = inner.indexes.entry(*name).or_default();
            for key in indexer(item) {
                idx.entry(key).or_default().insert(id.to_string());
            }
        }
    }

    fn unindex(&self, inner: &mut Inner<T>, id: &str, item: &T) {
        for (name, indexer) in &self.indexers {
            if let Some(idx) = inner.indexes.get_mut(name) {
                for key in indexer(item) {
                    if let Some(ids) = idx.get_mut(&key) {
                        ids.remove(id);
                        if ids.is_empty() {
                            idx.remove(&key);
                        }
                    }
                }
            }
        }
    }
}

/// Type-erased repository operations used by snapshots and replay.
pub trait AnyRepository: Send + Sync {
    /// Entity kind stored in this repository.
    fn kind(&self) -> &'static str;

    /// Serializes the whole repository as a JSON object keyed by id.
    ///
    /// # Errors
    ///
    /// Returns an error on serialization failure or a poisoned lock.
    fn export_json(&self) -> Result<Vec<u8>>;

    /// Replaces the content from a JSON object keyed by id.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed input or a poisoned lock.
    fn import_json(&self, bytes: &[u8]) -> Result<()>;

    /// Applies a recorded change without emitting a new one.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed payloads or a poisoned lock.
    fn replay(&self, change_type: ChangeType, id: &str, payload: &Value) -> Result<()>;
}

impl<T: Entity> AnyRepository for Repository<T> {
    fn kind(&self) -> &'static str {
        T::KIND
    }

    fn export_json(&self) -> Result<Vec<u8>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(serde_json::to_vec(&inner.items)?)
    }

    fn import_json(&self, bytes: &[u8]) -> Result<()> {
        let items: BTreeMap<String, T> = serde_json::from_slice(bytes)?;
        self.restore(items)
    }

    fn replay(&self, change_type: ChangeType, id: &str, payload: &Value) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if let Some(prev) = inner.items.remove(id) {
            self.unindex(&mut inner, id, &prev);
        }
        if change_type != ChangeType::Deleted {
            let item: T = serde_json::from_value(payload.clone())?;
            self.index(&mut inner, id, &item);
            inner.items.insert(id.to_string(), item);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::System;

    fn repo() -> (Arc<ChangeSet>, Repository<System>) {
        let changes = Arc::new(ChangeSet::new());
        let repo = Repository::new(Arc::clone(&changes))
            .with_index("deployment", |s: &System| s.deployment_ids.iter().cloned().collect());
        (changes, repo)
    }

    #[test]
    fn upsert_reports_created_then_updated() {
        let (changes, repo) = repo();
        assert_eq!(repo.upsert(System::new("s1", "one")).unwrap(), ChangeType::Created);
        assert_eq!(repo.upsert(System::new("s1", "uno")).unwrap(), ChangeType::Updated);
        assert_eq!(repo.get("s1").unwrap().unwrap().name, "uno");
        let drained = changes.drain();
        assert_eq!(drained.len(), 2);
        assert!(changes.is_empty());
    }

    #[test]
    fn index_tracks_mutations() {
        let (_, repo) = repo();
        let mut s = System::new("s1", "one");
        s.deployment_ids.insert("d1".into());
        repo.upsert(s.clone()).unwrap();
        assert_eq!(repo.lookup("deployment", "d1").unwrap().len(), 1);

        s.deployment_ids.clear();
        s.deployment_ids.insert("d2".into());
        repo.upsert(s).unwrap();
        assert!(repo.lookup("deployment", "d1").unwrap().is_empty());
        assert_eq!(repo.lookup("deployment", "d2").unwrap().len(), 1);

        repo.remove("s1").unwrap();
        assert!(repo.lookup("deployment", "d2").unwrap().is_empty());
        assert!(repo.lookup("missing-index", "x").is_err());
    }

    #[test]
    fn export_import_preserves_content() {
        let (_, a) = repo();
        a.upsert(System::new("s2", "two")).unwrap();
        a.upsert(System::new("s1", "one")).unwrap();
        let bytes = a.export_json().unwrap();
        let (changes, b) = repo();
        b.import_json(&bytes).unwrap();
        assert_eq!(a.items().unwrap(), b.items().unwrap());
        assert!(changes.is_empty(), "restore does not record changes");
    }
}
