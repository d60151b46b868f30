//! Job materialisation, dispatch and verification.
//!
//! ## Core Types
//!
//! - [`factory::create_job_for_release`]: Pure job construction from a release
//! - [`JobDispatcher`]: Contract implemented by job agent integrations
//! - [`JobAgentRegistry`]: Dispatchers keyed by agent type
//! - [`Setter`]: Status callback; [`EventSetter`] routes it through the apply loop
//! - [`DispatchWorker`]: Drains `job-dispatch` workqueue scopes
//! - [`VerificationManager`]: Samples post-dispatch metrics

pub mod agent;
pub mod dispatch;
pub mod factory;
pub mod setter;
pub mod verification;

pub use agent::{DispatchContext, JobAgentRegistry, JobDispatcher};
pub use dispatch::{DispatchConfig, DispatchReport, DispatchSource, DispatchWorker};
pub use factory::{create_job_for_release, deep_merge, next_job_id};
pub use setter::{EventSetter, Setter};
pub use verification::{MetricProvider, VerificationManager, VerificationSpec};
