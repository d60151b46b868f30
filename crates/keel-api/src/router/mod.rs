//! Workspace router.
//!
//! Partitions workspaces across workers and proxies workspace requests to
//! the live worker owning each workspace's partition.
//!
//! ## Routes
//!
//! - `POST /register` - Add or replace a worker
//! - `POST /heartbeat` - Refresh a worker; 404 if it was evicted
//! - `POST /unregister` - Remove a worker
//! - `GET  /workers` - Live workers
//! - `GET  /healthz` - Router health and uncovered partitions
//! - `*    /v1/workspaces/{id}/...` - Proxied to the owning worker

pub mod proxy;
pub mod registry;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use keel_core::{Error, Result};

use crate::config::{Config, DEFAULT_ROUTER_PORT};
use crate::error::ApiResult;
use crate::membership::{Registration, WorkerRef};
use crate::metrics::serve_metrics;

pub use registry::{WorkerInfo, WorkerRegistry};

/// Shared state for router handlers.
#[derive(Debug)]
pub struct RouterState {
    /// Live workers.
    pub workers: Arc<WorkerRegistry>,
    /// Client used to forward requests.
    pub client: reqwest::Client,
}

/// Live workers response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkersResponse {
    /// Workers ordered by id.
    pub workers: Vec<WorkerInfo>,
}

/// Router health.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterHealth {
    /// `ok`, or `degraded` when some partition has no live worker.
    pub status: String,
    /// Live worker count.
    pub workers: usize,
    /// Configured partition count.
    pub partition_count: u32,
    /// Partitions without a live worker.
    pub uncovered_partitions: Vec<u32>,
}

/// Router HTTP server.
#[derive(Debug)]
pub struct RouterServer {
    config: Config,
    workers: Arc<WorkerRegistry>,
}

impl RouterServer {
    /// Router using the configured partition count and worker timeout.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let workers = Arc::new(WorkerRegistry::new(
            config.partition_count,
            config.worker_timeout,
        ));
        Self::with_registry(config, workers)
    }

    /// Router over an existing worker registry.
    #[must_use]
    pub fn with_registry(config: Config, workers: Arc<WorkerRegistry>) -> Self {
        Self { config, workers }
    }

    /// Worker registry of this router.
    #[must_use]
    pub fn workers(&self) -> &Arc<WorkerRegistry> {
        &self.workers
    }

    fn create_router(&self) -> Router {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let state = Arc::new(RouterState {
            workers: Arc::clone(&self.workers),
            client,
        });

        Router::new()
            .route("/register", post(register))
            .route("/heartbeat", post(heartbeat))
            .route("/unregister", post(unregister))
            .route("/workers", get(list_workers))
            .route("/healthz", get(healthz))
            .route("/metrics", get(serve_metrics))
            .route("/v1/workspaces/:workspace_id", any(proxy::proxy))
            .route("/v1/workspaces/:workspace_id/*rest", any(proxy::proxy))
            .layer(TraceLayer::new_for_http())
            .layer(axum::middleware::from_fn(crate::metrics::metrics_middleware))
            .with_state(state)
    }

    /// Starts the router and blocks until the listener fails.
    ///
    /// # Errors
    ///
    /// Returns an error if the router cannot bind to the port.
    pub async fn serve(&self) -> Result<()> {
        crate::metrics::init_metrics();

        let port = self.config.port_or(DEFAULT_ROUTER_PORT);
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::internal(format!("failed to bind to {addr}: {e}")))?;

        let sweep = tokio::spawn(sweep(
            Arc::clone(&self.workers),
            (self.config.worker_timeout / 2).max(Duration::from_secs(1)),
        ));

        tracing::info!(
            http_port = port,
            partition_count = self.config.partition_count,
            worker_timeout_secs = self.config.worker_timeout.as_secs(),
            "Starting keel router"
        );
        let served = axum::serve(listener, self.create_router())
            .await
            .map_err(|e| Error::internal(format!("server error: {e}")));
        sweep.abort();
        served
    }

    /// Creates the router without binding a port.
    #[doc(hidden)]
    pub fn test_router(&self) -> Router {
        self.create_router()
    }
}

/// Evicts silent workers every `interval` until aborted.
async fn sweep(workers: Arc<WorkerRegistry>, interval: Duration) {
    let mut timer = tokio::time::interval(interval);
    loop {
        timer.tick().await;
        if let Err(e) = workers.evict_stale() {
            tracing::error!(error = %e, "worker sweep failed");
        }
    }
}

async fn register(
    State(state): State<Arc<RouterState>>,
    Json(registration): Json<Registration>,
) -> ApiResult<Json<WorkerInfo>> {
    Ok(Json(state.workers.register(registration)?))
}

async fn heartbeat(
    State(state): State<Arc<RouterState>>,
    Json(worker): Json<WorkerRef>,
) -> ApiResult<Json<WorkerInfo>> {
    Ok(Json(state.workers.heartbeat(&worker.worker_id)?))
}

async fn unregister(
    State(state): State<Arc<RouterState>>,
    Json(worker): Json<WorkerRef>,
) -> ApiResult<StatusCode> {
    state.workers.unregister(&worker.worker_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_workers(State(state): State<Arc<RouterState>>) -> ApiResult<Json<WorkersResponse>> {
    Ok(Json(WorkersResponse {
        workers: state.workers.workers()?,
    }))
}

async fn healthz(State(state): State<Arc<RouterState>>) -> ApiResult<Json<RouterHealth>> {
    let workers = state.workers.workers()?.len();
    let uncovered_partitions = state.workers.uncovered_partitions()?;
    Ok(Json(RouterHealth {
        status: if uncovered_partitions.is_empty() { "ok" } else { "degraded" }.to_string(),
        workers,
        partition_count: state.workers.partition_count(),
        uncovered_partitions,
    }))
}
