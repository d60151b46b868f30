//! # keel-engine
//!
//! Event-sourced workspace engine for the keel deployment control plane.
//!
//! This crate provides:
//!
//! - **Workspaces**: Single-writer apply loop per tenant with status tracking
//! - **Entity stores**: Ordered typed repositories with secondary indexes
//! - **Selectors**: CEL and JSON predicates over resources, environments and deployments
//! - **Release targets**: Derivation of `(resource, environment, deployment)` triples
//! - **Release manager**: Desired-release tracking and reconciliation
//! - **Policies**: Tagged rule evaluators with scope-keyed memoization
//! - **Jobs**: Job materialisation, agent dispatch and verification
//! - **Workqueue**: Scoped, leased and coalescing work distribution
//! - **Persistence**: Changelog and snapshot ports with in-memory backends
//!
//! ## Core Concepts
//!
//! - **Event**: A typed, versioned mutation of one workspace
//! - **Release Target**: A resource that an environment and deployment of the same system both select
//! - **Release**: A decision record binding a target to a version and resolved variables
//! - **Job**: One execution of a release by a job agent
//! - **Scope**: The workqueue's unit of exclusion; payloads attached to it coalesce
//!
//! ## Guarantees
//!
//! - Replaying the same ordered events into an empty workspace yields
//!   byte-identical snapshots
//! - At most one active job per release target
//! - At most one worker holds a workqueue scope at any instant
//! - Policy decisions fold with `Denied > Pending > Allowed`
//!
//! ## Example
//!
//! ```rust,no_run
//! use keel_engine::prelude::*;
//! use serde_json::json;
//!
//! # async fn example() -> Result<()> {
//! let registry = WorkspaceRegistry::new(WorkspaceDeps::in_memory());
//! registry
//!     .apply(&RawEvent {
//!         event_type: "system.created".into(),
//!         workspace_id: "acme".into(),
//!         data: json!({"id": "sys1", "name": "payments"}),
//!         timestamp: 1_700_000_000_000,
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod events;
pub mod jobs;
pub mod metrics;
pub mod model;
pub mod persistence;
pub mod policy;
pub mod release;
pub mod release_target;
pub mod selector;
pub mod store;
pub mod workqueue;
pub mod workspace;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::events::{EventSink, EventType, RawEvent};
    pub use crate::jobs::{DispatchWorker, JobAgentRegistry, JobDispatcher, Setter};
    pub use crate::metrics::EngineMetrics;
    pub use crate::model::{Job, JobStatus, Release, ReleaseTarget};
    pub use crate::persistence::{Changelog, SnapshotStore};
    pub use crate::policy::{Decision, PolicyEngine};
    pub use crate::release::ReleaseManager;
    pub use crate::release_target::{ComputeScope, ReleaseTargetDiff};
    pub use crate::selector::Selector;
    pub use crate::store::Stores;
    pub use crate::workqueue::memory::InMemoryWorkqueue;
    pub use crate::workqueue::Workqueue;
    pub use crate::workspace::{Workspace, WorkspaceDeps, WorkspaceRegistry, WorkspaceStatus};
}
