//! Persistence ports for workspace state.
//!
//! A workspace is durable through two ports:
//!
//! - [`Changelog`]: every entity change, in apply order, with a per-workspace
//!   monotonically increasing sequence.
//! - [`SnapshotStore`]: the latest encoded snapshot (see [`snapshot`]) which
//!   records the changelog sequence it covers.
//!
//! Loading restores the snapshot, then replays changelog records after its
//! sequence. In-memory implementations live in [`memory`].
//!
//! ## Core Types
//!
//! - [`ChangeRecord`]: one durable entity change
//! - [`Changelog`], [`SnapshotStore`]: async storage ports

pub mod memory;
pub mod snapshot;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::store::{Change, ChangeType};

pub use memory::{InMemoryChangelog, InMemorySnapshotStore};
pub use snapshot::{Snapshot, SNAPSHOT_FORMAT_VERSION, SNAPSHOT_MAGIC};

/// A change as stored in the changelog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Position in the workspace changelog, starting at 1.
    pub sequence: u64,
    /// Entity kind.
    pub kind: String,
    /// Mutation type.
    pub change_type: ChangeType,
    /// Entity identifier.
    pub id: String,
    /// Entity body, or the removed entity for deletions.
    pub payload: Value,
}

impl ChangeRecord {
    /// The repository change this record replays.
    #[must_use]
    pub fn to_change(&self) -> Change {
        Change {
            kind: self.kind.clone(),
            change_type: self.change_type,
            id: self.id.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// Ordered, append-only log of entity changes per workspace.
#[async_trait]
pub trait Changelog: Send + Sync {
    /// Appends `changes` in order and returns the sequence of the last one,
    /// or the current head when `changes` is empty.
    async fn append(&self, workspace_id: &str, changes: Vec<Change>) -> Result<u64>;

    /// Records with `sequence > after`, in order.
    async fn list_after(&self, workspace_id: &str, after: u64) -> Result<Vec<ChangeRecord>>;

    /// Sequence of the newest record, or 0.
    async fn head(&self, workspace_id: &str) -> Result<u64>;
}

/// Latest snapshot per workspace.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Stores `bytes` as the workspace's latest snapshot.
    async fn put(&self, workspace_id: &str, bytes: Bytes) -> Result<()>;

    /// The latest snapshot, if any.
    async fn get(&self, workspace_id: &str) -> Result<Option<Bytes>>;

    /// Removes the workspace's snapshot. Succeeds if none exists.
    async fn delete(&self, workspace_id: &str) -> Result<()>;
}
