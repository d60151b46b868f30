//! Process-wide registry of loaded workspaces.
//!
//! Lookups take a short read lock on the map; event application then holds
//! only the target workspace's async mutex, so different workspaces apply in
//! parallel while events for one workspace apply in receipt order.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use keel_core::WorkspaceId;
use keel_core::observability::workspace_span;
use tokio::sync::Mutex;
use tracing::Instrument;

use super::status::{StatusReport, StatusTracker};
use super::{ApplyOutcome, Workspace, WorkspaceDeps};
use crate::error::{Error, Result, poison_err};
use crate::events::{EventSink, RawEvent};
use crate::jobs::{DispatchContext, DispatchSource};
use crate::metrics::EngineMetrics;
use crate::model::ReleaseTarget;

/// A registered workspace.
pub struct WorkspaceHandle {
    status: Arc<StatusTracker>,
    workspace: Arc<Mutex<Workspace>>,
}

impl std::fmt::Debug for WorkspaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceHandle")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl WorkspaceHandle {
    /// Status, answerable while the workspace is busy.
    #[must_use]
    pub fn status(&self) -> &Arc<StatusTracker> {
        &self.status
    }

    /// Exclusive access to the workspace.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, Workspace> {
        self.workspace.lock().await
    }
}

/// Owns every loaded workspace of this process.
pub struct WorkspaceRegistry {
    workspaces: RwLock<HashMap<String, Arc<WorkspaceHandle>>>,
    deps: WorkspaceDeps,
    metrics: EngineMetrics,
}

impl std::fmt::Debug for WorkspaceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceRegistry")
            .field("deps", &self.deps)
            .finish_non_exhaustive()
    }
}

impl WorkspaceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(deps: WorkspaceDeps) -> Self {
        Self {
            workspaces: RwLock::new(HashMap::new()),
            deps,
            metrics: EngineMetrics::new(),
        }
    }

    /// Shared collaborators.
    #[must_use]
    pub fn deps(&self) -> &WorkspaceDeps {
        &self.deps
    }

    /// The workspace handle, loading it on first use.
    ///
    /// A workspace whose load fails stays registered in `error` so its status
    /// remains queryable. The load runs to completion even if the caller is
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed workspace ids or a poisoned lock.
    pub async fn get_or_create(&self, workspace_id: &str) -> Result<Arc<WorkspaceHandle>> {
        if let Some(handle) = self.get(workspace_id)? {
            return Ok(handle);
        }
        let id = WorkspaceId::new(workspace_id)?;

        // The creator holds the workspace lock before publishing the handle,
        // so no event can reach it before the load finishes.
        let (handle, loading) = {
            let mut map = self.workspaces.write().map_err(poison_err)?;
            if let Some(existing) = map.get(workspace_id) {
                (Arc::clone(existing), None)
            } else {
                let workspace = Workspace::new(id, self.deps.clone());
                let handle = Arc::new(WorkspaceHandle {
                    status: Arc::clone(workspace.status()),
                    workspace: Arc::new(Mutex::new(workspace)),
                });
                let guard = Arc::clone(&handle.workspace)
                    .try_lock_owned()
                    .map_err(|e| Error::internal(format!("fresh workspace already locked: {e}")))?;
                map.insert(workspace_id.to_string(), Arc::clone(&handle));
                self.metrics.set_workspaces_loaded(map.len());
                (handle, Some(guard))
            }
        };

        // The load owns the guard on its own task, so a caller dropped
        // mid-load cannot strand the workspace in `loadingFromPersistence`.
        if let Some(mut workspace) = loading {
            let load = tokio::spawn(
                async move {
                    if let Err(e) = workspace.load().await {
                        tracing::error!(workspace_id = %workspace.id(), error = %e, "workspace load failed");
                    }
                }
                .in_current_span(),
            );
            load.await
                .map_err(|e| Error::internal(format!("workspace load task failed: {e}")))?;
        }
        Ok(handle)
    }

    /// The handle of a loaded workspace.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn get(&self, workspace_id: &str) -> Result<Option<Arc<WorkspaceHandle>>> {
        Ok(self
            .workspaces
            .read()
            .map_err(poison_err)?
            .get(workspace_id)
            .cloned())
    }

    /// Applies `event` to its workspace, loading it first if needed.
    ///
    /// # Errors
    ///
    /// Returns the workspace's apply error.
    pub async fn apply(&self, event: &RawEvent) -> Result<ApplyOutcome> {
        let span = workspace_span("apply", &event.workspace_id);
        async {
            let handle = self.get_or_create(&event.workspace_id).await?;
            let mut workspace = handle.lock().await;
            workspace.apply(event).await
        }
        .instrument(span)
        .await
    }

    /// Status of a loaded workspace.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn status(&self, workspace_id: &str) -> Result<Option<StatusReport>> {
        self.get(workspace_id)?
            .map(|handle| handle.status.report())
            .transpose()
    }

    /// Status of every loaded workspace, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn statuses(&self) -> Result<Vec<StatusReport>> {
        let handles: Vec<Arc<WorkspaceHandle>> = self
            .workspaces
            .read()
            .map_err(poison_err)?
            .values()
            .cloned()
            .collect();
        let mut reports = handles
            .iter()
            .map(|h| h.status.report())
            .collect::<Result<Vec<_>>>()?;
        reports.sort_by(|a, b| a.workspace_id.cmp(&b.workspace_id));
        Ok(reports)
    }

    /// Release targets of a loaded workspace.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub async fn release_targets(&self, workspace_id: &str) -> Result<Option<Vec<ReleaseTarget>>> {
        let Some(handle) = self.get(workspace_id)? else {
            return Ok(None);
        };
        let workspace = handle.lock().await;
        workspace.release_targets().map(Some)
    }

    /// Writes a snapshot of a loaded workspace.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or storage fails.
    pub async fn snapshot(&self, workspace_id: &str) -> Result<Option<Bytes>> {
        let Some(handle) = self.get(workspace_id)? else {
            return Ok(None);
        };
        let workspace = handle.lock().await;
        workspace.snapshot().await.map(Some)
    }

    /// Drains, snapshots and removes a workspace. Returns false if it was not
    /// loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if the final snapshot cannot be written; the
    /// workspace is removed regardless.
    pub async fn unload(&self, workspace_id: &str) -> Result<bool> {
        let Some(handle) = self.get(workspace_id)? else {
            return Ok(false);
        };
        let result = {
            let mut workspace = handle.lock().await;
            workspace.unload().await
        };
        {
            let mut map = self.workspaces.write().map_err(poison_err)?;
            map.remove(workspace_id);
            self.metrics.set_workspaces_loaded(map.len());
        }
        tracing::info!(workspace_id, "workspace unloaded");
        result.map(|()| true)
    }

    /// Ids of loaded workspaces, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn workspace_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .workspaces
            .read()
            .map_err(poison_err)?
            .keys()
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl EventSink for WorkspaceRegistry {
    async fn submit(&self, event: RawEvent) -> Result<()> {
        self.apply(&event).await.map(|_| ())
    }
}

#[async_trait]
impl DispatchSource for WorkspaceRegistry {
    async fn dispatch_context(
        &self,
        workspace_id: &str,
        job_id: &str,
    ) -> Result<Option<DispatchContext>> {
        // Unloaded workspaces keep their jobs; the claim is retried.
        let Some(handle) = self.get(workspace_id)? else {
            return Err(Error::WorkspaceUnavailable {
                workspace_id: workspace_id.to_string(),
                status: "unloaded".to_string(),
            });
        };
        let workspace = handle.lock().await;
        DispatchContext::load(workspace.stores(), workspace_id, job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use crate::workspace::WorkspaceStatus;
    use serde_json::json;

    fn event(workspace: &str, event_type: EventType, data: serde_json::Value) -> RawEvent {
        RawEvent {
            event_type: event_type.as_str().into(),
            workspace_id: workspace.into(),
            data,
            timestamp: 1_000,
        }
    }

    #[tokio::test]
    async fn apply_loads_workspaces_lazily() -> Result<()> {
        let registry = WorkspaceRegistry::new(WorkspaceDeps::in_memory());
        assert!(registry.status("acme")?.is_none());
        registry
            .apply(&event("acme", EventType::SystemCreated, json!({"id": "s1"})))
            .await?;
        let report = registry.status("acme")?.expect("loaded");
        assert_eq!(report.status, WorkspaceStatus::Ready);
        assert_eq!(report.events_applied, 1);
        assert_eq!(registry.workspace_ids()?, vec!["acme".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_workspace_ids_are_rejected() {
        let registry = WorkspaceRegistry::new(WorkspaceDeps::in_memory());
        let err = registry
            .apply(&event("a/b", EventType::WorkspaceTick, json!(null)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn unload_snapshots_and_reload_restores() -> Result<()> {
        let registry = WorkspaceRegistry::new(WorkspaceDeps::in_memory());
        registry
            .apply(&event("acme", EventType::SystemCreated, json!({"id": "s1"})))
            .await?;
        assert!(registry.unload("acme").await?);
        assert!(!registry.unload("acme").await?);
        assert!(registry.deps().snapshots.get("acme").await?.is_some());

        let handle = registry.get_or_create("acme").await?;
        let workspace = handle.lock().await;
        assert!(workspace.stores().systems.contains("s1")?);
        Ok(())
    }

    #[tokio::test]
    async fn workspaces_apply_independently() -> Result<()> {
        let registry = Arc::new(WorkspaceRegistry::new(WorkspaceDeps::in_memory()));
        let mut tasks = tokio::task::JoinSet::new();
        for ws in ["a", "b", "c"] {
            let registry = Arc::clone(&registry);
            tasks.spawn(async move {
                for i in 0..5 {
                    registry
                        .apply(&event(ws, EventType::SystemCreated, json!({"id": format!("s{i}")})))
                        .await?;
                }
                Ok::<_, crate::error::Error>(())
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.expect("task panicked")?;
        }
        for report in registry.statuses()? {
            assert_eq!(report.events_applied, 5);
        }
        Ok(())
    }

    struct SlowSnapshots {
        inner: crate::persistence::InMemorySnapshotStore,
        delay: std::time::Duration,
    }

    #[async_trait]
    impl crate::persistence::SnapshotStore for SlowSnapshots {
        async fn put(&self, workspace_id: &str, bytes: Bytes) -> Result<()> {
            self.inner.put(workspace_id, bytes).await
        }

        async fn get(&self, workspace_id: &str) -> Result<Option<Bytes>> {
            tokio::time::sleep(self.delay).await;
            self.inner.get(workspace_id).await
        }

        async fn delete(&self, workspace_id: &str) -> Result<()> {
            self.inner.delete(workspace_id).await
        }
    }

    #[tokio::test]
    async fn abandoned_load_still_completes() -> Result<()> {
        let mut deps = WorkspaceDeps::in_memory();
        deps.snapshots = Arc::new(SlowSnapshots {
            inner: crate::persistence::InMemorySnapshotStore::new(),
            delay: std::time::Duration::from_millis(200),
        });
        let registry = WorkspaceRegistry::new(deps);
        let first = event("acme", EventType::SystemCreated, json!({"id": "s1"}));

        let cancelled =
            tokio::time::timeout(std::time::Duration::from_millis(20), registry.apply(&first)).await;
        assert!(cancelled.is_err());
        assert_eq!(
            registry.status("acme")?.map(|r| r.status),
            Some(WorkspaceStatus::LoadingFromPersistence)
        );

        // The next apply waits for the detached load instead of failing.
        registry
            .apply(&event("acme", EventType::SystemCreated, json!({"id": "s2"})))
            .await?;
        let report = registry.status("acme")?.expect("loaded");
        assert_eq!(report.status, WorkspaceStatus::Ready);
        assert_eq!(report.events_applied, 1);
        Ok(())
    }
}
