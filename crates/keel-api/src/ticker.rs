//! Periodic `workspace.tick` delivery.
//!
//! Ticks let time-based policies (deny windows, rollouts, retry backoff)
//! re-evaluate without any other event arriving.

use std::sync::Arc;
use std::time::Duration;

use keel_core::Clock;
use keel_engine::error::{Error, Result};
use keel_engine::events::{EventType, RawEvent};
use keel_engine::workspace::WorkspaceRegistry;

use crate::metrics::record_tick;

/// Applies one tick to every loaded workspace. Returns how many accepted it.
///
/// Workspaces that are not `ready` are skipped.
///
/// # Errors
///
/// Returns an error only if the registry cannot be read.
pub async fn tick_all(registry: &WorkspaceRegistry, clock: &dyn Clock) -> Result<usize> {
    let now = clock.now().timestamp_millis();
    let mut ticked = 0;
    for workspace_id in registry.workspace_ids()? {
        let event = RawEvent::new(
            EventType::WorkspaceTick,
            workspace_id.as_str(),
            &serde_json::json!({}),
            now,
        )?;
        match registry.apply(&event).await {
            Ok(outcome) => {
                ticked += 1;
                record_tick("applied");
                if !outcome.reconcile.jobs_created.is_empty() {
                    tracing::info!(
                        workspace_id = %workspace_id,
                        jobs = outcome.reconcile.jobs_created.len(),
                        "tick created jobs"
                    );
                }
            }
            Err(Error::WorkspaceUnavailable { status, .. }) => {
                record_tick("skipped");
                tracing::debug!(workspace_id = %workspace_id, %status, "tick skipped");
            }
            Err(e) => {
                record_tick("failed");
                tracing::warn!(workspace_id = %workspace_id, error = %e, "tick failed");
            }
        }
    }
    Ok(ticked)
}

/// Ticks every `interval` until the task is aborted.
pub async fn run(registry: Arc<WorkspaceRegistry>, clock: Arc<dyn Clock>, interval: Duration) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    timer.tick().await;
    loop {
        timer.tick().await;
        if let Err(e) = tick_all(&registry, clock.as_ref()).await {
            tracing::warn!(error = %e, "tick pass failed");
        }
    }
}
