//! Worker server.
//!
//! Serves the workspace API and runs the worker's background loops: the
//! periodic tick, the job dispatch worker and, when a router is configured,
//! membership heartbeats.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::task::JoinSet;
use tower_http::trace::TraceLayer;

use keel_core::parallel::{CancelFlag, ChunkOptions};
use keel_core::{Clock, Error, Result, SystemClock};
use keel_engine::events::EventSink;
use keel_engine::jobs::{
    DispatchWorker, EventSetter, JobAgentRegistry, JobDispatcher, VerificationManager,
};
use keel_engine::workspace::{WorkspaceDeps, WorkspaceRegistry};

use crate::config::{Config, DEFAULT_WORKER_PORT};
use crate::membership::{Registration, RouterClient};
use crate::partition::Ownership;
use crate::routes;

/// Shared state for all worker request handlers.
pub struct AppState {
    /// Loaded workspaces.
    pub registry: Arc<WorkspaceRegistry>,
    /// Partitions this worker serves.
    pub ownership: Ownership,
    /// Worker identity.
    pub worker_id: String,
    /// Fan-out settings for stateless target computation.
    pub chunk_options: ChunkOptions,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("worker_id", &self.worker_id)
            .field("ownership", &self.ownership)
            .finish_non_exhaustive()
    }
}

/// Worker HTTP server and background loops.
pub struct Server {
    config: Config,
    registry: Arc<WorkspaceRegistry>,
    agents: Arc<JobAgentRegistry>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Worker with process-local persistence and workqueue.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_deps(config, WorkspaceDeps::in_memory())
    }

    /// Worker using `deps` for persistence and the workqueue.
    #[must_use]
    pub fn with_deps(config: Config, deps: WorkspaceDeps) -> Self {
        Self {
            config,
            registry: Arc::new(WorkspaceRegistry::new(deps)),
            agents: Arc::new(JobAgentRegistry::new()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Workspace registry served by this worker.
    #[must_use]
    pub fn registry(&self) -> &Arc<WorkspaceRegistry> {
        &self.registry
    }

    /// Registers a job agent implementation.
    ///
    /// Jobs whose agent type has no implementation are reported as
    /// `invalidIntegration`.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent registry lock is poisoned.
    pub fn register_agent(&self, dispatcher: Arc<dyn JobDispatcher>) -> Result<()> {
        self.agents
            .register(dispatcher)
            .map_err(|e| Error::internal(e.to_string()))
    }

    fn ownership(&self) -> Ownership {
        Ownership::new(self.config.partition_count, self.config.owned_partitions())
    }

    fn create_router(&self) -> Router {
        let state = Arc::new(AppState {
            registry: Arc::clone(&self.registry),
            ownership: self.ownership(),
            worker_id: self.config.worker_id.clone(),
            chunk_options: self.registry.deps().chunk_options,
        });

        Router::new()
            .merge(routes::health::routes())
            .merge(routes::api_v1_routes())
            // Metrics outermost for timing, then trace.
            .layer(TraceLayer::new_for_http())
            .layer(axum::middleware::from_fn(crate::metrics::metrics_middleware))
            .with_state(state)
    }

    fn dispatch_worker(&self) -> DispatchWorker {
        let sink: Arc<dyn EventSink> = self.registry.clone();
        let setter = Arc::new(EventSetter::new(Arc::clone(&sink), Arc::clone(&self.clock)));
        DispatchWorker::new(
            Arc::clone(&self.registry.deps().workqueue),
            self.registry.clone(),
            Arc::clone(&self.agents),
            setter,
            self.config.dispatch_config(),
        )
        .with_verifications(VerificationManager::with_default_providers(
            sink,
            Arc::clone(&self.clock),
        ))
    }

    /// Starts the server and blocks until shutdown.
    ///
    /// On SIGINT or SIGTERM the server stops accepting requests, lets the
    /// dispatch worker finish its batch, leaves the router and snapshots
    /// every loaded workspace.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to the port.
    pub async fn serve(&self) -> Result<()> {
        crate::metrics::init_metrics();

        let port = self.config.port_or(DEFAULT_WORKER_PORT);
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::internal(format!("failed to bind to {addr}: {e}")))?;

        let mut background = JoinSet::new();
        background.spawn(crate::ticker::run(
            Arc::clone(&self.registry),
            Arc::clone(&self.clock),
            self.config.tick_interval,
        ));
        let membership = self.config.router_url.as_ref().map(|url| {
            let registration = Registration {
                worker_id: self.config.worker_id.clone(),
                http_address: self.config.advertise_address(port),
                partitions: self.config.owned_partitions(),
            };
            (RouterClient::new(url.clone()), registration)
        });
        if let Some((client, registration)) = membership.clone() {
            background.spawn(crate::membership::run(
                client,
                registration,
                self.config.heartbeat_interval,
            ));
        }

        let cancel = CancelFlag::new();
        let worker = self.dispatch_worker();
        let dispatch_cancel = cancel.clone();
        let dispatch = tokio::spawn(async move { worker.run(dispatch_cancel).await });

        tracing::info!(
            http_port = port,
            worker_id = %self.config.worker_id,
            partitions = ?self.config.owned_partitions(),
            "Starting keel worker"
        );
        let served = axum::serve(listener, self.create_router())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::internal(format!("server error: {e}")));

        cancel.cancel();
        background.shutdown().await;
        if let Err(e) = dispatch.await {
            tracing::warn!(error = %e, "dispatch worker ended abnormally");
        }
        if let Some((client, registration)) = membership {
            if let Err(e) = client.unregister(&registration.worker_id).await {
                tracing::warn!(error = %e, "failed to leave router");
            }
        }
        self.unload_all().await;
        served
    }

    async fn unload_all(&self) {
        let ids = match self.registry.workspace_ids() {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "cannot list workspaces for shutdown");
                return;
            }
        };
        for id in ids {
            if let Err(e) = self.registry.unload(&id).await {
                tracing::error!(workspace_id = %id, error = %e, "final snapshot failed");
            }
        }
    }

    /// Creates the router without binding a port or starting background loops.
    #[doc(hidden)]
    pub fn test_router(&self) -> Router {
        self.create_router()
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
