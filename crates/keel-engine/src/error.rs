//! Error types for the workspace engine.

use std::sync::PoisonError;

/// The result type used throughout keel-engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used by the apply loop and HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input; the mutation is rejected and state is unchanged.
    Validation,
    /// A referenced entity does not exist.
    NotFound,
    /// A selector or condition could not be evaluated.
    Evaluation,
    /// A job agent failed to accept work.
    Dispatch,
    /// A workqueue lease is held by another worker or has moved on.
    ClaimNotOwned,
    /// The operation was cancelled.
    Cancelled,
    /// An invariant was violated; the workspace must be reloaded.
    Fatal,
}

impl ErrorKind {
    /// Stable lowercase label, used in metrics and API error codes.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Evaluation => "evaluation",
            Self::Dispatch => "dispatch",
            Self::ClaimNotOwned => "claim_not_owned",
            Self::Cancelled => "cancelled",
            Self::Fatal => "fatal",
        }
    }
}

/// Errors raised by the workspace engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input failed validation (selector, rule config, event payload).
    #[error("validation error: {message}")]
    Validation {
        /// What was wrong with the input.
        message: String,
    },

    /// A referenced entity was not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind, e.g. `deployment`.
        entity: &'static str,
        /// The missing identifier.
        id: String,
    },

    /// A selector or condition failed to compile or evaluate.
    #[error("evaluation error: {message}")]
    Evaluation {
        /// Description of the failure.
        message: String,
    },

    /// A job agent failed to dispatch a job.
    #[error("dispatch error: {message}")]
    Dispatch {
        /// Description of the failure.
        message: String,
    },

    /// The caller does not hold the workqueue claim it referenced.
    #[error("claim not owned: item {item_id} is not claimed by {worker_id}")]
    ClaimNotOwned {
        /// Scope identifier.
        item_id: String,
        /// Worker that attempted the operation.
        worker_id: String,
    },

    /// The scope changed since it was claimed.
    #[error("stale claim on item {item_id}: claimed at revision {claimed}, now {current}")]
    StaleClaim {
        /// Scope identifier.
        item_id: String,
        /// Revision observed at claim time.
        claimed: u64,
        /// Current revision of the scope.
        current: u64,
    },

    /// The workspace is not accepting work in its current status.
    #[error("workspace {workspace_id} unavailable: {status}")]
    WorkspaceUnavailable {
        /// Workspace identifier.
        workspace_id: String,
        /// Current status label.
        status: String,
    },

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// A storage or lock failure.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Snapshot bytes could not be decoded.
    #[error("corrupt snapshot: {message}")]
    CorruptSnapshot {
        /// Description of the decoding failure.
        message: String,
    },

    /// An invariant violation that should not occur.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the violation.
        message: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An error from keel-core.
    #[error("core error: {0}")]
    Core(#[from] keel_core::Error),
}

impl Error {
    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Creates an evaluation error.
    #[must_use]
    pub fn evaluation(message: impl Into<String>) -> Self {
        Self::Evaluation {
            message: message.into(),
        }
    }

    /// Creates a dispatch error.
    #[must_use]
    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::Dispatch {
            message: message.into(),
        }
    }

    /// Creates a storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns the classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } | Self::Serialization(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Evaluation { .. } => ErrorKind::Evaluation,
            Self::Dispatch { .. } | Self::WorkspaceUnavailable { .. } => ErrorKind::Dispatch,
            Self::ClaimNotOwned { .. } | Self::StaleClaim { .. } => ErrorKind::ClaimNotOwned,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Storage { .. } | Self::CorruptSnapshot { .. } | Self::Internal { .. } => {
                ErrorKind::Fatal
            }
            Self::Core(inner) => match inner {
                keel_core::Error::InvalidId { .. }
                | keel_core::Error::InvalidInput(_)
                | keel_core::Error::Serialization { .. } => ErrorKind::Validation,
                keel_core::Error::NotFound { .. } => ErrorKind::NotFound,
                keel_core::Error::Cancelled => ErrorKind::Cancelled,
                keel_core::Error::Internal { .. } => ErrorKind::Fatal,
            },
        }
    }

    /// Returns true if the workspace must move to `error` after this failure.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

/// Converts a lock poison error to a storage error.
pub(crate) fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn kinds_classify_errors() {
        assert_eq!(Error::validation("bad").kind(), ErrorKind::Validation);
        assert_eq!(Error::not_found("deployment", "d1").kind(), ErrorKind::NotFound);
        assert_eq!(Error::storage("poisoned").kind(), ErrorKind::Fatal);
        assert_eq!(
            Error::ClaimNotOwned {
                item_id: "i".into(),
                worker_id: "w".into()
            }
            .kind(),
            ErrorKind::ClaimNotOwned
        );
        assert!(Error::internal("boom").is_fatal());
        assert!(!Error::Cancelled.is_fatal());
    }

    #[test]
    fn not_found_display() {
        let err = Error::not_found("deployment", "dep-1");
        assert_eq!(err.to_string(), "deployment not found: dep-1");
    }

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::storage_with_source("failed to read snapshot", source);
        assert!(StdError::source(&err).is_some());
        assert_eq!(err.kind().as_str(), "fatal");
    }
}
