//! # keel-api
//!
//! HTTP composition layer for the keel deployment control plane.
//!
//! This crate wires the engine into two processes:
//!
//! - **Worker**: owns a set of workspace partitions, ingests events, serves
//!   status and health, streams release-target computations, runs the
//!   periodic tick and the job dispatch loop
//! - **Router**: keeps a registry of live workers and reverse-proxies
//!   workspace requests to the worker owning the workspace's partition
//!
//! ## Design Principles
//!
//! This crate is a **thin composition layer** with no domain policy.
//! All business logic lives in `keel-engine`.
//!
//! ## Endpoints
//!
//! ```text
//! Worker:
//!   POST   /v1/workspaces/{id}/events          - Ingest one event or an array
//!   GET    /v1/workspaces/{id}/status          - Workspace status report
//!   GET    /v1/workspaces/{id}/release-targets - Current release targets
//!   POST   /v1/workspaces/{id}/snapshot        - Write a snapshot
//!   DELETE /v1/workspaces/{id}                 - Unload a workspace
//!   POST   /v1/release-targets/compute         - NDJSON stream of targets
//!   GET    /healthz                            - Per-workspace health
//!   GET    /metrics                            - Prometheus metrics
//!
//! Router:
//!   POST /register, /heartbeat, /unregister    - Worker membership
//!   GET  /workers                              - Live workers
//!   GET  /healthz                              - Router health
//!   *    /v1/workspaces/{id}/...               - Proxied to the owning worker
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use keel_api::config::Config;
//! use keel_api::server::Server;
//!
//! let server = Server::new(Config::from_env()?);
//! server.serve().await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod membership;
pub mod metrics;
pub mod partition;
pub mod router;
pub mod routes;
pub mod seed;
pub mod server;
pub mod ticker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{ApiError, ApiResult};
    pub use crate::partition::partition_for;
    pub use crate::router::{RouterServer, WorkerRegistry};
    pub use crate::server::Server;
}
