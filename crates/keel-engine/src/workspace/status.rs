//! Observable workspace lifecycle status.

use std::collections::VecDeque;
use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, poison_err};

/// Transitions retained per workspace.
pub const HISTORY_LIMIT: usize = 20;

/// Lifecycle status of a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkspaceStatus {
    /// Constructed, nothing loaded yet.
    Initializing,
    /// Restoring the latest snapshot.
    LoadingFromPersistence,
    /// Replaying changelog records after the snapshot.
    ReplayingEvents,
    /// Accepting events.
    Ready,
    /// Draining before removal from the registry.
    Unloading,
    /// Event application suspended until `workspace.recover`.
    Error,
}

impl WorkspaceStatus {
    /// camelCase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::LoadingFromPersistence => "loadingFromPersistence",
            Self::ReplayingEvents => "replayingEvents",
            Self::Ready => "ready",
            Self::Unloading => "unloading",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusTransition {
    /// Previous status.
    pub from: WorkspaceStatus,
    /// New status.
    pub to: WorkspaceStatus,
    /// Wall-clock instant of the change.
    pub at: DateTime<Utc>,
    /// Why the status changed.
    pub reason: String,
}

/// Last per-event failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventError {
    /// Type of the failing event.
    pub event_type: String,
    /// Error message.
    pub message: String,
    /// Error classification label.
    pub kind: String,
    /// Instant of the failure.
    pub at: DateTime<Utc>,
}

/// Point-in-time view served by status and health endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Workspace identifier.
    pub workspace_id: String,
    /// Current status.
    pub status: WorkspaceStatus,
    /// Recent transitions, oldest first.
    pub history: Vec<StatusTransition>,
    /// Most recent per-event failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<EventError>,
    /// Events applied since load.
    pub events_applied: u64,
}

#[derive(Debug)]
struct Inner {
    status: WorkspaceStatus,
    history: VecDeque<StatusTransition>,
    last_error: Option<EventError>,
    events_applied: u64,
}

/// Thread-safe status holder, readable while the workspace is busy.
#[derive(Debug)]
pub struct StatusTracker {
    workspace_id: String,
    inner: RwLock<Inner>,
}

impl StatusTracker {
    /// Creates a tracker in `initializing`.
    #[must_use]
    pub fn new(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            inner: RwLock::new(Inner {
                status: WorkspaceStatus::Initializing,
                history: VecDeque::with_capacity(HISTORY_LIMIT),
                last_error: None,
                events_applied: 0,
            }),
        }
    }

    /// Current status.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn status(&self) -> Result<WorkspaceStatus> {
        Ok(self.inner.read().map_err(poison_err)?.status)
    }

    /// Moves to `to`, recording the transition. A no-op when already there.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn transition(&self, to: WorkspaceStatus, reason: impl Into<String>) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if inner.status == to {
            return Ok(());
        }
        let transition = StatusTransition {
            from: inner.status,
            to,
            at: Utc::now(),
            reason: reason.into(),
        };
        tracing::info!(
            workspace_id = %self.workspace_id,
            from = %transition.from,
            to = %transition.to,
            reason = %transition.reason,
            "workspace status changed"
        );
        if inner.history.len() == HISTORY_LIMIT {
            inner.history.pop_front();
        }
        inner.history.push_back(transition);
        inner.status = to;
        Ok(())
    }

    /// Records a failed event.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn record_error(&self, error: EventError) -> Result<()> {
        self.inner.write().map_err(poison_err)?.last_error = Some(error);
        Ok(())
    }

    /// Counts an applied event.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn record_applied(&self) -> Result<()> {
        self.inner.write().map_err(poison_err)?.events_applied += 1;
        Ok(())
    }

    /// Current report.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn report(&self) -> Result<StatusReport> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(StatusReport {
            workspace_id: self.workspace_id.clone(),
            status: inner.status,
            history: inner.history.iter().cloned().collect(),
            last_error: inner.last_error.clone(),
            events_applied: inner.events_applied,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_bounded() {
        let tracker = StatusTracker::new("ws");
        for i in 0..30 {
            let to = if i % 2 == 0 {
                WorkspaceStatus::Ready
            } else {
                WorkspaceStatus::Error
            };
            tracker.transition(to, format!("step {i}")).unwrap();
        }
        let report = tracker.report().unwrap();
        assert_eq!(report.history.len(), HISTORY_LIMIT);
        assert_eq!(report.history.last().unwrap().reason, "step 29");
        assert_eq!(report.status, WorkspaceStatus::Error);
    }

    #[test]
    fn repeated_status_is_not_recorded() {
        let tracker = StatusTracker::new("ws");
        tracker.transition(WorkspaceStatus::Ready, "loaded").unwrap();
        tracker.transition(WorkspaceStatus::Ready, "again").unwrap();
        assert_eq!(tracker.report().unwrap().history.len(), 1);
    }

    #[test]
    fn labels_are_camel_case() {
        assert_eq!(WorkspaceStatus::LoadingFromPersistence.to_string(), "loadingFromPersistence");
        assert_eq!(
            serde_json::to_value(WorkspaceStatus::ReplayingEvents).unwrap(),
            "replayingEvents"
        );
    }
}
