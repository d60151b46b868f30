//! Live worker registry.
//!
//! Workers register their address and partitions and then heartbeat. A
//! worker whose last heartbeat is older than the timeout is evicted on the
//! next lookup or sweep, whichever comes first.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keel_core::{Clock, Error, Result, SystemClock};

use crate::membership::Registration;

/// A registered worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    /// Worker identity.
    pub worker_id: String,
    /// Base URL requests are proxied to.
    pub http_address: String,
    /// Owned partitions, ascending.
    pub partitions: Vec<u32>,
    /// First registration of this incarnation.
    pub registered_at: DateTime<Utc>,
    /// Most recent heartbeat or registration.
    pub last_heartbeat: DateTime<Utc>,
}

/// Registry of live workers.
pub struct WorkerRegistry {
    workers: RwLock<BTreeMap<String, WorkerInfo>>,
    partition_count: u32,
    timeout: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("partition_count", &self.partition_count)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn poison_err<T>(_: T) -> Error {
    Error::internal("worker registry lock poisoned")
}

impl WorkerRegistry {
    /// Registry over `partition_count` partitions evicting after `timeout`.
    #[must_use]
    pub fn new(partition_count: u32, timeout: Duration) -> Self {
        Self::with_clock(partition_count, timeout, Arc::new(SystemClock))
    }

    /// Registry reading time from `clock`.
    #[must_use]
    pub fn with_clock(partition_count: u32, timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            workers: RwLock::new(BTreeMap::new()),
            partition_count: partition_count.max(1),
            timeout: chrono::Duration::from_std(timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30)),
            clock,
        }
    }

    /// Partition count workers are validated against.
    #[must_use]
    pub const fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Adds or replaces a worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a blank id or address, or a
    /// partition outside the configured range.
    pub fn register(&self, registration: Registration) -> Result<WorkerInfo> {
        let worker_id = registration.worker_id.trim().to_string();
        let http_address = registration
            .http_address
            .trim()
            .trim_end_matches('/')
            .to_string();
        if worker_id.is_empty() {
            return Err(Error::InvalidInput("workerId must not be empty".into()));
        }
        if http_address.is_empty() {
            return Err(Error::InvalidInput("httpAddress must not be empty".into()));
        }
        if let Some(bad) = registration
            .partitions
            .iter()
            .find(|p| **p >= self.partition_count)
        {
            return Err(Error::InvalidInput(format!(
                "partition {bad} is out of range for {} partitions",
                self.partition_count
            )));
        }

        let now = self.clock.now();
        let partitions: BTreeSet<u32> = registration.partitions.into_iter().collect();
        let info = WorkerInfo {
            worker_id: worker_id.clone(),
            http_address,
            partitions: partitions.into_iter().collect(),
            registered_at: now,
            last_heartbeat: now,
        };
        self.workers
            .write()
            .map_err(poison_err)?
            .insert(worker_id, info.clone());
        tracing::info!(
            worker_id = %info.worker_id,
            http_address = %info.http_address,
            partitions = ?info.partitions,
            "worker registered"
        );
        Ok(info)
    }

    /// Refreshes a worker's heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the worker is unknown or was evicted.
    pub fn heartbeat(&self, worker_id: &str) -> Result<WorkerInfo> {
        self.evict_stale()?;
        let now = self.clock.now();
        let mut workers = self.workers.write().map_err(poison_err)?;
        let info = workers
            .get_mut(worker_id)
            .ok_or_else(|| Error::not_found("worker", worker_id))?;
        info.last_heartbeat = now;
        Ok(info.clone())
    }

    /// Removes a worker. Returns false if it was not registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn unregister(&self, worker_id: &str) -> Result<bool> {
        let removed = self
            .workers
            .write()
            .map_err(poison_err)?
            .remove(worker_id)
            .is_some();
        if removed {
            tracing::info!(worker_id, "worker unregistered");
        }
        Ok(removed)
    }

    /// Evicts workers whose heartbeat is older than the timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn evict_stale(&self) -> Result<Vec<String>> {
        let deadline = self.clock.now() - self.timeout;
        let mut workers = self.workers.write().map_err(poison_err)?;
        let stale: Vec<String> = workers
            .values()
            .filter(|w| w.last_heartbeat < deadline)
            .map(|w| w.worker_id.clone())
            .collect();
        for worker_id in &stale {
            workers.remove(worker_id);
            tracing::warn!(worker_id = %worker_id, "worker evicted after missed heartbeats");
        }
        if !stale.is_empty() {
            crate::metrics::record_evictions(stale.len());
        }
        crate::metrics::set_router_workers(workers.len());
        Ok(stale)
    }

    /// Live workers ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn workers(&self) -> Result<Vec<WorkerInfo>> {
        self.evict_stale()?;
        Ok(self
            .workers
            .read()
            .map_err(poison_err)?
            .values()
            .cloned()
            .collect())
    }

    /// The live worker owning `partition`.
    ///
    /// When several workers claim a partition the one with the smallest id
    /// wins, so every lookup agrees.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn worker_for_partition(&self, partition: u32) -> Result<Option<WorkerInfo>> {
        self.evict_stale()?;
        Ok(self
            .workers
            .read()
            .map_err(poison_err)?
            .values()
            .find(|w| w.partitions.binary_search(&partition).is_ok())
            .cloned())
    }

    /// Partitions no live worker owns.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn uncovered_partitions(&self) -> Result<Vec<u32>> {
        let covered: BTreeSet<u32> = self
            .workers()?
            .into_iter()
            .flat_map(|w| w.partitions)
            .collect();
        Ok((0..self.partition_count)
            .filter(|p| !covered.contains(p))
            .collect())
    }
}
