//! Logging initialisation and span helpers.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (production).
    Json,
    /// Pretty-printed logs (development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Picks `Pretty` when `debug` is set, otherwise `Json`.
    #[must_use]
    pub fn for_debug(debug: bool) -> Self {
        if debug { Self::Pretty } else { Self::Json }
    }
}

/// Initializes the global tracing subscriber.
///
/// Safe to call more than once; only the first call installs a subscriber.
/// `RUST_LOG` controls levels and defaults to `info`.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let registry = tracing_subscriber::registry().with(env_filter);
        let result = match format {
            LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
            LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        };
        if result.is_err() {
            tracing::debug!("global subscriber already installed");
        }
    });
}

/// Span for operations scoped to one workspace.
#[must_use]
pub fn workspace_span(operation: &str, workspace_id: &str) -> Span {
    tracing::info_span!("workspace", op = operation, workspace_id = workspace_id)
}

/// Span for work on a single release target.
#[must_use]
pub fn release_target_span(operation: &str, workspace_id: &str, release_target: &str) -> Span {
    tracing::info_span!(
        "release_target",
        op = operation,
        workspace_id = workspace_id,
        release_target = release_target,
    )
}
