//! Workspace partitioning.
//!
//! A workspace belongs to partition `u64::from_be_bytes(sha256(id)[..8]) % count`.
//! The router and every worker compute it the same way, so a worker can
//! reject requests for workspaces it does not own.

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

const WORKSPACE_PREFIX: &str = "/v1/workspaces/";

/// Partition owning `workspace_id` among `count` partitions.
///
/// A `count` of zero is treated as one.
#[must_use]
pub fn partition_for(workspace_id: &str, count: u32) -> u32 {
    let digest = Sha256::digest(workspace_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let bucket = u64::from_be_bytes(prefix) % u64::from(count.max(1));
    // The modulus fits in u32.
    u32::try_from(bucket).unwrap_or(0)
}

/// The partitions one worker owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ownership {
    count: u32,
    owned: BTreeSet<u32>,
}

impl Ownership {
    /// Owns every one of `count` partitions.
    #[must_use]
    pub fn all(count: u32) -> Self {
        let count = count.max(1);
        Self {
            count,
            owned: (0..count).collect(),
        }
    }

    /// Owns `owned` among `count` partitions.
    #[must_use]
    pub fn new(count: u32, owned: impl IntoIterator<Item = u32>) -> Self {
        Self {
            count: count.max(1),
            owned: owned.into_iter().collect(),
        }
    }

    /// Partition count.
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    /// Owned partitions, ascending.
    #[must_use]
    pub fn partitions(&self) -> Vec<u32> {
        self.owned.iter().copied().collect()
    }

    /// Returns true if `workspace_id` hashes into an owned partition.
    #[must_use]
    pub fn owns(&self, workspace_id: &str) -> bool {
        self.owned.contains(&partition_for(workspace_id, self.count))
    }
}

/// Extracts the workspace id from a `/v1/workspaces/{id}/...` path.
#[must_use]
pub fn workspace_id_from_path(path: &str) -> Option<&str> {
    let rest = path.strip_prefix(WORKSPACE_PREFIX)?;
    let id = rest.split('/').next()?;
    (!id.is_empty()).then_some(id)
}
