//! Worker health.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use keel_engine::workspace::{StatusReport, WorkspaceStatus};

use crate::error::ApiResult;
use crate::metrics::serve_metrics;
use crate::server::AppState;

/// Health report of a worker and its loaded workspaces.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `ok`, or `degraded` when any workspace is in `error`.
    pub status: String,
    /// Worker identity.
    pub worker_id: String,
    /// Owned partitions.
    pub partitions: Vec<u32>,
    /// Status of every loaded workspace, ordered by id.
    pub workspaces: Vec<StatusReport>,
}

/// Creates health and metrics routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(serve_metrics))
}

async fn healthz(State(state): State<Arc<AppState>>) -> ApiResult<Json<HealthResponse>> {
    let workspaces = state.registry.statuses()?;
    let degraded = workspaces
        .iter()
        .any(|report| report.status == WorkspaceStatus::Error);
    Ok(Json(HealthResponse {
        status: if degraded { "degraded" } else { "ok" }.to_string(),
        worker_id: state.worker_id.clone(),
        partitions: state.ownership.partitions(),
        workspaces,
    }))
}
