//! Shared test utilities for keel tests.
//!
//! This crate provides:
//! - Entity builders with sensible defaults ([`fixtures`])
//! - [`EventFactory`]: `RawEvent`s for one workspace on a controllable clock
//! - [`RecordingJobAgent`] and [`RecordingSetter`]: job agent doubles
//! - Assertion helpers over workspace state
//!
//! # Example
//!
//! ```rust,ignore
//! use keel_test_utils::{EventFactory, fixtures};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let mut events = EventFactory::new("acme");
//!     let event = events.system("sys1");
//!     // ... apply to a workspace ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod agent;
pub mod assertions;
pub mod events;
pub mod fixtures;

pub use agent::*;
pub use assertions::*;
pub use events::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("keel=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
