//! Status reporting from job agents.

use std::sync::Arc;

use async_trait::async_trait;
use keel_core::Clock;

use crate::error::Result;
use crate::events::{EventSink, EventType, RawEvent};
use crate::model::{JobStatus, JobUpdate};

/// Callback through which agents report job progress.
#[async_trait]
pub trait Setter: Send + Sync {
    /// Records an update for a job of `workspace_id`.
    async fn set(&self, workspace_id: &str, update: JobUpdate) -> Result<()>;

    /// Convenience for a status-only update.
    async fn set_status(
        &self,
        workspace_id: &str,
        job_id: &str,
        status: JobStatus,
        message: String,
    ) -> Result<()> {
        self.set(workspace_id, JobUpdate::status(job_id, status, message))
            .await
    }
}

/// Turns updates into `job.updated` events so job state only changes inside
/// the workspace apply loop.
#[derive(Clone)]
pub struct EventSetter {
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for EventSetter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSetter").finish_non_exhaustive()
    }
}

impl EventSetter {
    /// Creates a setter submitting to `sink`, stamping events with `clock`.
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>, clock: Arc<dyn Clock>) -> Self {
        Self { sink, clock }
    }
}

#[async_trait]
impl Setter for EventSetter {
    async fn set(&self, workspace_id: &str, update: JobUpdate) -> Result<()> {
        let event = RawEvent::new(
            EventType::JobUpdated,
            workspace_id,
            &update,
            self.clock.now_millis(),
        )?;
        tracing::debug!(workspace_id, job_id = %update.id, status = ?update.status, "reporting job update");
        self.sink.submit(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ManualClock;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Captured(Mutex<Vec<RawEvent>>);

    #[async_trait]
    impl EventSink for Captured {
        async fn submit(&self, event: RawEvent) -> Result<()> {
            self.0.lock().unwrap().push(event);
            Ok(())
        }
    }

    #[tokio::test]
    async fn event_setter_emits_job_updated() {
        let sink = Arc::new(Captured::default());
        let setter = EventSetter::new(sink.clone(), Arc::new(ManualClock::at_millis(42)));
        setter
            .set_status("ws", "j1", JobStatus::Failure, "boom".into())
            .await
            .unwrap();

        let events = sink.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "job.updated");
        assert_eq!(events[0].timestamp, 42);
        let update: JobUpdate = events[0].parse().unwrap();
        assert_eq!(update.id, "j1");
        assert_eq!(update.status, Some(JobStatus::Failure));
        assert_eq!(update.message.as_deref(), Some("boom"));
    }
}
