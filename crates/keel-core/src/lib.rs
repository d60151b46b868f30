//! # keel-core
//!
//! Shared primitives for the keel deployment control plane.
//!
//! - **Errors**: the crate-wide [`Error`] and [`Result`] alias
//! - **Identifiers**: validated workspace IDs and ULID-backed entity IDs
//! - **Canonical JSON**: stable byte encoding for identity hashes
//! - **Clock**: injectable time source for deterministic replay and tests
//! - **Parallelism**: ordered, short-circuiting chunked fan-out
//! - **Observability**: one-shot logging initialisation
//!
//! ## Example
//!
//! ```rust
//! use keel_core::prelude::*;
//!
//! let workspace = WorkspaceId::new("acme-prod").unwrap();
//! assert_eq!(workspace.as_str(), "acme-prod");
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod canonical_json;
pub mod clock;
pub mod error;
pub mod id;
pub mod observability;
pub mod parallel;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::canonical_json::{sha256_hex, to_canonical_bytes};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::error::{Error, Result};
    pub use crate::id::{WorkspaceId, deterministic_ulid, generate_id};
    pub use crate::parallel::{CancelFlag, ChunkOptions, chunked_map};
}

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use id::WorkspaceId;
pub use observability::{LogFormat, init_logging};
