//! Workspace routes.
//!
//! ## Routes
//!
//! - `POST   /v1/workspaces/{id}/events` - Apply one event or an array, in order
//! - `GET    /v1/workspaces/{id}/status` - Status report of a loaded workspace
//! - `GET    /v1/workspaces/{id}/release-targets` - Current release targets
//! - `POST   /v1/workspaces/{id}/snapshot` - Write a snapshot now
//! - `DELETE /v1/workspaces/{id}` - Snapshot and unload

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use keel_core::WorkspaceId;
use keel_engine::events::RawEvent;
use keel_engine::model::ReleaseTarget;
use keel_engine::workspace::{ApplyOutcome, StatusReport};

use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Body of an ingest request: one event or an ordered array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EventBatch {
    /// Several events, applied in order.
    Many(Vec<RawEvent>),
    /// A single event.
    One(RawEvent),
}

impl EventBatch {
    fn into_events(self) -> Vec<RawEvent> {
        match self {
            Self::Many(events) => events,
            Self::One(event) => vec![event],
        }
    }
}

/// What applying one event did.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventResult {
    /// Declared event type.
    pub event_type: String,
    /// False when the type was unknown and the event skipped.
    pub applied: bool,
    /// Release targets added.
    pub targets_added: usize,
    /// Release targets removed.
    pub targets_removed: usize,
    /// Ids of jobs created by reconciliation.
    pub jobs_created: Vec<String>,
}

impl EventResult {
    fn new(event: &RawEvent, outcome: &ApplyOutcome) -> Self {
        Self {
            event_type: event.event_type.clone(),
            applied: outcome.event_type.is_some(),
            targets_added: outcome.diff.added.len(),
            targets_removed: outcome.diff.removed.len(),
            jobs_created: outcome
                .reconcile
                .jobs_created
                .iter()
                .map(|job| job.id.clone())
                .collect(),
        }
    }
}

/// Ingest response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    /// Target workspace.
    pub workspace_id: String,
    /// Changelog head after the last event.
    pub sequence: u64,
    /// One entry per event, in request order.
    pub results: Vec<EventResult>,
}

/// Release targets of a workspace.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseTargetsResponse {
    /// Workspace identifier.
    pub workspace_id: String,
    /// Targets in key order.
    pub release_targets: Vec<ReleaseTarget>,
}

/// Snapshot write result.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResponse {
    /// Workspace identifier.
    pub workspace_id: String,
    /// Changelog sequence captured by the snapshot.
    pub sequence: u64,
    /// Encoded snapshot length.
    pub size_bytes: usize,
}

/// Creates workspace routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/workspaces/:workspace_id/events", post(ingest_events))
        .route("/v1/workspaces/:workspace_id/status", get(workspace_status))
        .route(
            "/v1/workspaces/:workspace_id/release-targets",
            get(release_targets),
        )
        .route("/v1/workspaces/:workspace_id/snapshot", post(write_snapshot))
        .route("/v1/workspaces/:workspace_id", delete(unload_workspace))
}

/// Validates the id and checks this worker owns it.
fn owned_workspace(state: &AppState, workspace_id: &str) -> ApiResult<WorkspaceId> {
    let id = WorkspaceId::new(workspace_id)?;
    if !state.ownership.owns(id.as_str()) {
        return Err(ApiError::misdirected(format!(
            "workspace {workspace_id} is not owned by this worker"
        )));
    }
    Ok(id)
}

fn not_loaded(workspace_id: &str) -> ApiError {
    ApiError::not_found(format!("workspace {workspace_id} is not loaded"))
}

/// Apply events.
///
/// POST /v1/workspaces/{id}/events
///
/// Events are applied one at a time. On the first failure the error is
/// returned and the events before it stay applied.
async fn ingest_events(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    Json(batch): Json<EventBatch>,
) -> ApiResult<Json<IngestResponse>> {
    let id = owned_workspace(&state, &workspace_id)?;
    let events = batch.into_events();
    if let Some(stray) = events.iter().find(|e| e.workspace_id != id.as_str()) {
        return Err(ApiError::bad_request(format!(
            "event for workspace {} posted to {}",
            stray.workspace_id,
            id.as_str()
        )));
    }

    let handle = state.registry.get_or_create(id.as_str()).await?;
    let mut workspace = handle.lock().await;
    let mut results = Vec::with_capacity(events.len());
    for event in &events {
        let outcome = workspace.apply(event).await?;
        results.push(EventResult::new(event, &outcome));
    }

    tracing::debug!(workspace_id = %id, events = events.len(), "events ingested");
    Ok(Json(IngestResponse {
        workspace_id: id.as_str().to_string(),
        sequence: workspace.sequence(),
        results,
    }))
}

/// Workspace status.
///
/// GET /v1/workspaces/{id}/status
async fn workspace_status(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
) -> ApiResult<Json<StatusReport>> {
    let id = owned_workspace(&state, &workspace_id)?;
    state
        .registry
        .status(id.as_str())?
        .map(Json)
        .ok_or_else(|| not_loaded(&workspace_id))
}

/// Current release targets.
///
/// GET /v1/workspaces/{id}/release-targets
async fn release_targets(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
) -> ApiResult<Json<ReleaseTargetsResponse>> {
    let id = owned_workspace(&state, &workspace_id)?;
    let release_targets = state
        .registry
        .release_targets(id.as_str())
        .await?
        .ok_or_else(|| not_loaded(&workspace_id))?;
    Ok(Json(ReleaseTargetsResponse {
        workspace_id,
        release_targets,
    }))
}

/// Write a snapshot.
///
/// POST /v1/workspaces/{id}/snapshot
async fn write_snapshot(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
) -> ApiResult<Json<SnapshotResponse>> {
    let id = owned_workspace(&state, &workspace_id)?;
    let handle = state
        .registry
        .get(id.as_str())?
        .ok_or_else(|| not_loaded(&workspace_id))?;
    let workspace = handle.lock().await;
    let bytes = workspace.snapshot().await?;
    Ok(Json(SnapshotResponse {
        workspace_id,
        sequence: workspace.sequence(),
        size_bytes: bytes.len(),
    }))
}

/// Unload a workspace.
///
/// DELETE /v1/workspaces/{id}
async fn unload_workspace(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = owned_workspace(&state, &workspace_id)?;
    if state.registry.unload(id.as_str()).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_loaded(&workspace_id))
    }
}
