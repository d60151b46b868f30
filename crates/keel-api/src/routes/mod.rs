//! Worker HTTP route handlers.

pub mod health;
pub mod release_targets;
pub mod workspaces;

use std::sync::Arc;

use axum::Router;

use crate::server::AppState;

/// `/v1` routes served by a worker.
pub fn api_v1_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(workspaces::routes())
        .merge(release_targets::routes())
}
