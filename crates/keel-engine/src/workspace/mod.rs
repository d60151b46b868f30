//! Workspaces: the event-sourced unit of state.
//!
//! A [`Workspace`] owns the stores and release manager of one tenant. Events
//! are applied one at a time:
//!
//! 1. parse the type (unknown types are logged and skipped)
//! 2. run the handler, mutating stores
//! 3. recompute the affected part of the release-target set
//! 4. mark targets dirty, recompute desired releases and reconcile
//! 5. append every entity change to the changelog
//!
//! [`WorkspaceRegistry`] maps workspace ids to loaded workspaces and
//! serializes application per workspace.
//!
//! ## Core Types
//!
//! - [`Workspace`]: one tenant's state and apply loop
//! - [`WorkspaceDeps`]: workqueue and persistence ports shared by workspaces
//! - [`WorkspaceRegistry`]: process-wide owner of loaded workspaces

pub mod handlers;
pub mod registry;
pub mod status;

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use keel_core::parallel::{CancelFlag, ChunkOptions};
use keel_core::WorkspaceId;

use crate::error::{Error, Result};
use crate::events::{EventType, RawEvent, RecoverPayload};
use crate::metrics::EngineMetrics;
use crate::model::{JobStatus, ReleaseTarget};
use crate::persistence::{
    Changelog, InMemoryChangelog, InMemorySnapshotStore, Snapshot, SnapshotStore,
};
use crate::release::{ReconcileContext, ReconcileReport, ReleaseManager, enqueue_dispatch};
use crate::release_target::{ComputeScope, ReleaseTargetDiff, recompute};
use crate::store::Stores;
use crate::workqueue::Workqueue;
use crate::workqueue::memory::InMemoryWorkqueue;

pub use registry::WorkspaceRegistry;
pub use status::{StatusReport, StatusTracker, StatusTransition, WorkspaceStatus};

/// Collaborators shared by every workspace of a process.
#[derive(Clone)]
pub struct WorkspaceDeps {
    /// Queue receiving dispatch work.
    pub workqueue: Arc<dyn Workqueue>,
    /// Durable change log.
    pub changelog: Arc<dyn Changelog>,
    /// Latest snapshots.
    pub snapshots: Arc<dyn SnapshotStore>,
    /// Fan-out settings for release-target computation.
    pub chunk_options: ChunkOptions,
}

impl std::fmt::Debug for WorkspaceDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceDeps")
            .field("chunk_options", &self.chunk_options)
            .finish_non_exhaustive()
    }
}

impl WorkspaceDeps {
    /// Process-local workqueue and persistence.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            workqueue: Arc::new(InMemoryWorkqueue::new()),
            changelog: Arc::new(InMemoryChangelog::new()),
            snapshots: Arc::new(InMemorySnapshotStore::new()),
            chunk_options: ChunkOptions::default(),
        }
    }
}

/// What one apply did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyOutcome {
    /// Parsed type, `None` when the event was skipped as unknown.
    pub event_type: Option<EventType>,
    /// Release targets added and removed.
    pub diff: ReleaseTargetDiff,
    /// Reconciliation result.
    pub reconcile: ReconcileReport,
    /// Changelog head after the apply.
    pub sequence: u64,
}

/// One tenant's in-memory state.
pub struct Workspace {
    id: WorkspaceId,
    stores: Stores,
    releases: ReleaseManager,
    status: Arc<StatusTracker>,
    deps: WorkspaceDeps,
    sequence: u64,
    metrics: EngineMetrics,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("id", &self.id)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

impl Workspace {
    /// Creates an empty workspace in `initializing`.
    #[must_use]
    pub fn new(id: WorkspaceId, deps: WorkspaceDeps) -> Self {
        Self {
            status: Arc::new(StatusTracker::new(id.as_str())),
            id,
            stores: Stores::new(),
            releases: ReleaseManager::new(),
            deps,
            sequence: 0,
            metrics: EngineMetrics::new(),
        }
    }

    /// Workspace identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        self.id.as_str()
    }

    /// Entity stores.
    #[must_use]
    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Release manager.
    #[must_use]
    pub fn releases(&self) -> &ReleaseManager {
        &self.releases
    }

    /// Shared status tracker.
    #[must_use]
    pub fn status(&self) -> &Arc<StatusTracker> {
        &self.status
    }

    /// Changelog sequence reflected in the stores.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Current release targets in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository lock is poisoned.
    pub fn release_targets(&self) -> Result<Vec<ReleaseTarget>> {
        self.stores.release_targets.values()
    }

    /// Restores the latest snapshot, replays the changelog after it and
    /// recomputes derived state. Ends in `ready`, or `error` on failure.
    ///
    /// # Errors
    ///
    /// Returns the failure that moved the workspace to `error`.
    #[tracing::instrument(skip(self), fields(workspace_id = %self.id))]
    pub async fn load(&mut self) -> Result<()> {
        match self.load_inner().await {
            Ok(()) => {
                self.status.transition(WorkspaceStatus::Ready, "loaded")?;
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "workspace failed to load");
                self.status
                    .transition(WorkspaceStatus::Error, format!("load failed: {e}"))?;
                Err(e)
            }
        }
    }

    async fn load_inner(&mut self) -> Result<()> {
        let id = self.id.as_str().to_string();
        self.status
            .transition(WorkspaceStatus::LoadingFromPersistence, "restoring snapshot")?;
        if let Some(bytes) = self.deps.snapshots.get(&id).await? {
            let snapshot = Snapshot::decode(&bytes)?;
            if snapshot.workspace_id != id {
                return Err(Error::CorruptSnapshot {
                    message: format!("snapshot belongs to workspace {}", snapshot.workspace_id),
                });
            }
            snapshot.restore(&self.stores)?;
            self.sequence = snapshot.sequence;
        }

        self.status
            .transition(WorkspaceStatus::ReplayingEvents, "replaying changelog")?;
        let records = self.deps.changelog.list_after(&id, self.sequence).await?;
        let replayed = records.len();
        for record in records {
            self.stores.replay(&record.to_change())?;
            self.sequence = record.sequence;
        }
        tracing::info!(sequence = self.sequence, replayed, "workspace state restored");

        let diff = recompute(
            &self.stores,
            &ComputeScope::Full,
            self.deps.chunk_options,
            CancelFlag::new(),
        )
        .await?;
        self.metrics
            .record_release_targets(diff.added.len(), diff.removed.len());
        // Desired releases are recomputed on the next event, at its clock.
        self.releases.taint_all(&self.stores)?;
        self.requeue_pending_jobs().await?;
        self.persist_changes().await?;
        Ok(())
    }

    /// Puts every `pending` job back on the workqueue. Dispatch work dropped
    /// while the workspace was unloaded would otherwise pin its target.
    async fn requeue_pending_jobs(&self) -> Result<()> {
        let mut requeued = 0usize;
        for job in self.stores.jobs.values()? {
            if job.status != JobStatus::Pending {
                continue;
            }
            let Some(release) = self.stores.releases.get(&job.release_id)? else {
                tracing::warn!(job_id = %job.id, release_id = %job.release_id, "pending job without release");
                continue;
            };
            enqueue_dispatch(
                self.deps.workqueue.as_ref(),
                self.id.as_str(),
                &release.release_target,
                &job,
                job.created_at.timestamp_millis(),
            )
            .await?;
            requeued += 1;
        }
        if requeued > 0 {
            tracing::info!(requeued, "pending jobs requeued for dispatch");
        }
        Ok(())
    }

    /// Applies one event.
    ///
    /// Unknown event types are skipped. While the workspace is in `error`
    /// only `workspace.recover` is accepted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkspaceUnavailable`] when the workspace is not
    /// accepting events, or the handler's error. Fatal errors move the
    /// workspace to `error`.
    #[tracing::instrument(skip(self, event), fields(workspace_id = %self.id, event_type = %event.event_type))]
    pub async fn apply(&mut self, event: &RawEvent) -> Result<ApplyOutcome> {
        let Ok(event_type) = event.event_type.parse::<EventType>() else {
            tracing::warn!("skipping unknown event type");
            self.metrics.record_event(&event.event_type, "skipped");
            return Ok(ApplyOutcome {
                sequence: self.sequence,
                ..ApplyOutcome::default()
            });
        };

        let status = self.status.status()?;
        if event_type == EventType::WorkspaceRecover {
            return self.recover(event, status);
        }
        if status != WorkspaceStatus::Ready {
            return Err(Error::WorkspaceUnavailable {
                workspace_id: self.id.as_str().to_string(),
                status: status.to_string(),
            });
        }

        let started = Instant::now();
        let result = self.apply_ready(event_type, event).await;
        self.metrics.observe_apply(event_type.as_str(), started.elapsed());
        match result {
            Ok(outcome) => {
                self.metrics.record_event(event_type.as_str(), "applied");
                self.status.record_applied()?;
                Ok(outcome)
            }
            Err(e) => {
                self.metrics.record_event(event_type.as_str(), e.kind().as_str());
                self.fail(event_type, &e).await?;
                Err(e)
            }
        }
    }

    async fn apply_ready(&mut self, event_type: EventType, event: &RawEvent) -> Result<ApplyOutcome> {
        let now = event.occurred_at()?;
        let effect = handlers::apply(&self.stores, event_type, event, now)?;

        let diff = match &effect.scope {
            Some(scope) => {
                let diff =
                    recompute(&self.stores, scope, self.deps.chunk_options, CancelFlag::new()).await?;
                self.metrics
                    .record_release_targets(diff.added.len(), diff.removed.len());
                diff
            }
            None => ReleaseTargetDiff::default(),
        };
        if effect.taint_all {
            self.releases.taint_all(&self.stores)?;
        }
        for rt in effect.dirty.iter().chain(&diff.added) {
            self.releases.dirty_desired_release(rt)?;
        }
        // Removed last: handlers report dirty targets before recomputation.
        for rt in &diff.removed {
            self.releases.drop_target(rt)?;
        }

        // Cached policy results may depend on whatever the handler touched.
        if !self.stores.changes().is_empty() {
            self.releases.clear_cache();
        }

        let ctx = ReconcileContext {
            stores: &self.stores,
            workspace_id: self.id.as_str(),
            now,
            workqueue: self.deps.workqueue.as_ref(),
        };
        let reconcile = self.releases.reconcile_all(ctx).await?;
        self.persist_changes().await?;

        Ok(ApplyOutcome {
            event_type: Some(event_type),
            diff,
            reconcile,
            sequence: self.sequence,
        })
    }

    fn recover(&mut self, event: &RawEvent, status: WorkspaceStatus) -> Result<ApplyOutcome> {
        let payload: RecoverPayload = event.parse().unwrap_or_default();
        if status == WorkspaceStatus::Error {
            let reason = payload.reason.unwrap_or_else(|| "recovered".to_string());
            self.status.transition(WorkspaceStatus::Ready, reason)?;
        }
        Ok(ApplyOutcome {
            event_type: Some(EventType::WorkspaceRecover),
            sequence: self.sequence,
            ..ApplyOutcome::default()
        })
    }

    async fn fail(&mut self, event_type: EventType, error: &Error) -> Result<()> {
        tracing::warn!(error = %error, kind = error.kind().as_str(), "event failed");
        self.status.record_error(status::EventError {
            event_type: event_type.as_str().to_string(),
            message: error.to_string(),
            kind: error.kind().as_str().to_string(),
            at: chrono::Utc::now(),
        })?;
        // Keep the changelog in step with whatever the stores already hold.
        self.persist_changes().await?;
        if error.is_fatal() {
            self.status
                .transition(WorkspaceStatus::Error, format!("{event_type}: {error}"))?;
        }
        Ok(())
    }

    async fn persist_changes(&mut self) -> Result<()> {
        let changes = self.stores.changes().drain();
        if !changes.is_empty() {
            self.sequence = self.deps.changelog.append(self.id.as_str(), changes).await?;
        }
        Ok(())
    }

    /// Encodes the current state and stores it as the latest snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the snapshot store fails.
    pub async fn snapshot(&self) -> Result<Bytes> {
        let bytes = Snapshot::capture(self.id.as_str(), self.sequence, &self.stores)?.encode()?;
        self.deps.snapshots.put(self.id.as_str(), bytes.clone()).await?;
        tracing::info!(workspace_id = %self.id, sequence = self.sequence, bytes = bytes.len(), "snapshot written");
        Ok(bytes)
    }

    /// Moves to `unloading` and writes a final snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub async fn unload(&mut self) -> Result<()> {
        self.status.transition(WorkspaceStatus::Unloading, "unload requested")?;
        self.persist_changes().await?;
        self.snapshot().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn event(event_type: EventType, data: Value, ts: i64) -> RawEvent {
        RawEvent {
            event_type: event_type.as_str().into(),
            workspace_id: "ws".into(),
            data,
            timestamp: ts,
        }
    }

    async fn ready(deps: WorkspaceDeps) -> Workspace {
        let mut ws = Workspace::new(WorkspaceId::new("ws").unwrap(), deps);
        ws.load().await.unwrap();
        ws
    }

    async fn seed(ws: &mut Workspace) {
        let events = [
            event(EventType::SystemCreated, json!({"id": "s1"}), 1_000),
            event(
                EventType::EnvironmentCreated,
                json!({"id": "e1", "systemId": "s1", "resourceSelector": {"cel": "kind == 'server'"}}),
                2_000,
            ),
            event(EventType::DeploymentCreated, json!({"id": "d1", "systemId": "s1", "jobAgentId": "a1"}), 3_000),
            event(EventType::JobAgentCreated, json!({"id": "a1", "type": "noop"}), 3_500),
            event(
                EventType::ResourceCreated,
                json!({"id": "r1", "kind": "server", "identifier": "web-1", "createdAt": "2024-01-01T00:00:00Z"}),
                4_000,
            ),
        ];
        for e in &events {
            ws.apply(e).await.unwrap();
        }
    }

    #[tokio::test]
    async fn load_reaches_ready() {
        let ws = ready(WorkspaceDeps::in_memory()).await;
        let report = ws.status().report().unwrap();
        assert_eq!(report.status, WorkspaceStatus::Ready);
        let path: Vec<_> = report.history.iter().map(|t| t.to).collect();
        assert_eq!(
            path,
            [
                WorkspaceStatus::LoadingFromPersistence,
                WorkspaceStatus::ReplayingEvents,
                WorkspaceStatus::Ready
            ]
        );
    }

    #[tokio::test]
    async fn version_creates_a_job_and_dispatch_work() {
        let deps = WorkspaceDeps::in_memory();
        let mut ws = ready(deps.clone()).await;
        seed(&mut ws).await;
        assert_eq!(ws.release_targets().unwrap(), vec![ReleaseTarget::new("r1", "e1", "d1")]);

        let outcome = ws
            .apply(&event(
                EventType::DeploymentVersionCreated,
                json!({"id": "v1", "deploymentId": "d1", "tag": "1.0.0", "status": "ready", "createdAt": "2024-01-02T00:00:00Z"}),
                5_000,
            ))
            .await
            .unwrap();
        assert_eq!(outcome.reconcile.jobs_created.len(), 1);
        assert_eq!(deps.workqueue.list(Some("ws")).await.unwrap().len(), 1);

        let tick = ws
            .apply(&event(EventType::WorkspaceTick, Value::Null, 6_000))
            .await
            .unwrap();
        assert!(tick.reconcile.jobs_created.is_empty());
    }

    #[tokio::test]
    async fn unknown_events_are_skipped() {
        let mut ws = ready(WorkspaceDeps::in_memory()).await;
        let outcome = ws
            .apply(&event(EventType::WorkspaceTick, Value::Null, 1))
            .await
            .unwrap();
        assert_eq!(outcome.event_type, Some(EventType::WorkspaceTick));

        let mut unknown = event(EventType::WorkspaceTick, Value::Null, 2);
        unknown.event_type = "widget.created".into();
        let skipped = ws.apply(&unknown).await.unwrap();
        assert_eq!(skipped.event_type, None);

        unknown.event_type = "system.created@v2".into();
        assert_eq!(ws.apply(&unknown).await.unwrap().event_type, None);
    }

    #[tokio::test]
    async fn validation_errors_leave_workspace_ready() {
        let mut ws = ready(WorkspaceDeps::in_memory()).await;
        let err = ws
            .apply(&event(EventType::SystemCreated, json!({"name": 5}), 1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        let report = ws.status().report().unwrap();
        assert_eq!(report.status, WorkspaceStatus::Ready);
        assert_eq!(report.last_error.unwrap().event_type, "system.created");
    }

    #[tokio::test]
    async fn error_status_blocks_until_recover() {
        let mut ws = ready(WorkspaceDeps::in_memory()).await;
        ws.status().transition(WorkspaceStatus::Error, "test").unwrap();
        let blocked = ws
            .apply(&event(EventType::SystemCreated, json!({"id": "s1"}), 1))
            .await;
        assert!(matches!(blocked, Err(Error::WorkspaceUnavailable { .. })));

        ws.apply(&event(EventType::WorkspaceRecover, json!({"reason": "operator"}), 2))
            .await
            .unwrap();
        assert_eq!(ws.status().status().unwrap(), WorkspaceStatus::Ready);
        ws.apply(&event(EventType::SystemCreated, json!({"id": "s1"}), 3))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reload_from_snapshot_and_changelog() {
        let deps = WorkspaceDeps::in_memory();
        let mut ws = ready(deps.clone()).await;
        seed(&mut ws).await;
        ws.snapshot().await.unwrap();
        ws.apply(&event(
            EventType::ResourceCreated,
            json!({"id": "r2", "kind": "server", "identifier": "web-2", "createdAt": "2024-01-01T00:00:00Z"}),
            7_000,
        ))
        .await
        .unwrap();
        let expected = Snapshot::capture("ws", ws.sequence(), ws.stores()).unwrap().encode().unwrap();

        let reloaded = ready(deps).await;
        assert_eq!(reloaded.release_targets().unwrap().len(), 2);
        let actual = Snapshot::capture("ws", reloaded.sequence(), reloaded.stores())
            .unwrap()
            .encode()
            .unwrap();
        assert_eq!(actual, expected);
    }

    #[tokio::test]
    async fn load_requeues_pending_jobs() {
        use crate::workqueue::{AckParams, ClaimParams, JOB_PAYLOAD};

        let deps = WorkspaceDeps::in_memory();
        let mut ws = ready(deps.clone()).await;
        seed(&mut ws).await;
        let outcome = ws
            .apply(&event(
                EventType::DeploymentVersionCreated,
                json!({"id": "v1", "deploymentId": "d1", "tag": "1.0.0", "status": "ready", "createdAt": "2024-01-02T00:00:00Z"}),
                5_000,
            ))
            .await
            .unwrap();
        let job_id = outcome.reconcile.jobs_created[0].id.clone();

        // Lose the dispatch work without touching the job.
        let claimed = deps
            .workqueue
            .claim(ClaimParams::new("w1", 10, chrono::Duration::seconds(30)))
            .await
            .unwrap();
        deps.workqueue
            .ack_success(AckParams {
                item_id: claimed[0].id.clone(),
                worker_id: "w1".into(),
                claimed_updated_at: claimed[0].updated_at,
            })
            .await
            .unwrap();
        assert!(deps.workqueue.list(Some("ws")).await.unwrap().is_empty());

        ready(deps.clone()).await;
        let items = deps.workqueue.list(Some("ws")).await.unwrap();
        assert_eq!(items.len(), 1);
        let keys: Vec<_> = items[0].payloads_of(JOB_PAYLOAD).map(|p| p.payload_key.clone()).collect();
        assert_eq!(keys, vec![job_id]);
    }
}
