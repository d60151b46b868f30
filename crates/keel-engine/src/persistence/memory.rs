//! In-memory persistence adapters for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;

use super::{ChangeRecord, Changelog, SnapshotStore};
use crate::error::{Result, poison_err};
use crate::store::Change;

/// Changelog held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryChangelog {
    logs: RwLock<HashMap<String, Vec<ChangeRecord>>>,
}

impl InMemoryChangelog {
    /// Creates an empty changelog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Changelog for InMemoryChangelog {
    async fn append(&self, workspace_id: &str, changes: Vec<Change>) -> Result<u64> {
        let mut logs = self.logs.write().map_err(poison_err)?;
        let log = logs.entry(workspace_id.to_string()).or_default();
        for change in changes {
            let sequence = log.last().map_or(1, |r| r.sequence + 1);
            log.push(ChangeRecord {
                sequence,
                kind: change.kind,
                change_type: change.change_type,
                id: change.id,
                payload: change.payload,
            });
        }
        Ok(log.last().map_or(0, |r| r.sequence))
    }

    async fn list_after(&self, workspace_id: &str, after: u64) -> Result<Vec<ChangeRecord>> {
        let logs = self.logs.read().map_err(poison_err)?;
        Ok(logs
            .get(workspace_id)
            .map(|log| log.iter().filter(|r| r.sequence > after).cloned().collect())
            .unwrap_or_default())
    }

    async fn head(&self, workspace_id: &str) -> Result<u64> {
        let logs = self.logs.read().map_err(poison_err)?;
        Ok(logs
            .get(workspace_id)
            .and_then(|log| log.last())
            .map_or(0, |r| r.sequence))
    }
}

/// Snapshot store held in process memory.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<String, Bytes>>,
}

impl InMemorySnapshotStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn put(&self, workspace_id: &str, bytes: Bytes) -> Result<()> {
        self.snapshots
            .write()
            .map_err(poison_err)?
            .insert(workspace_id.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, workspace_id: &str) -> Result<Option<Bytes>> {
        Ok(self
            .snapshots
            .read()
            .map_err(poison_err)?
            .get(workspace_id)
            .cloned())
    }

    async fn delete(&self, workspace_id: &str) -> Result<()> {
        self.snapshots.write().map_err(poison_err)?.remove(workspace_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChangeType;
    use serde_json::json;

    fn change(id: &str) -> Change {
        Change {
            kind: "system".into(),
            change_type: ChangeType::Created,
            id: id.into(),
            payload: json!({"id": id}),
        }
    }

    #[tokio::test]
    async fn changelog_sequences_are_per_workspace() -> Result<()> {
        let log = InMemoryChangelog::new();
        assert_eq!(log.append("a", vec![change("s1"), change("s2")]).await?, 2);
        assert_eq!(log.append("b", vec![change("s1")]).await?, 1);
        assert_eq!(log.append("a", Vec::new()).await?, 2);
        assert_eq!(log.head("a").await?, 2);
        assert_eq!(log.head("missing").await?, 0);

        let tail = log.list_after("a", 1).await?;
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].id, "s2");
        assert_eq!(tail[0].sequence, 2);
        Ok(())
    }

    #[tokio::test]
    async fn snapshot_store_keeps_latest() -> Result<()> {
        let store = InMemorySnapshotStore::new();
        assert!(store.get("ws").await?.is_none());
        store.put("ws", Bytes::from_static(b"one")).await?;
        store.put("ws", Bytes::from_static(b"two")).await?;
        assert_eq!(store.get("ws").await?.as_deref(), Some(&b"two"[..]));
        store.delete("ws").await?;
        store.delete("ws").await?;
        assert!(store.get("ws").await?.is_none());
        Ok(())
    }
}
