//! In-memory workqueue.
//!
//! [`InMemoryWorkqueue`] keeps the scope table, the scope index and every
//! scope record behind a single mutex. Critical sections are short and never
//! await; items are cloned on the way out so callers never alias queue state.
//!
//! It is the queue used by a worker process for its own workspaces. It is not
//! shared across processes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::canonical_json;
use keel_core::{Clock, SystemClock};

use super::{
    AckOutcome, AckParams, ClaimParams, EnqueueOutcome, EnqueueParams, ExtendLeaseParams, Payload,
    RetryParams, ScopeKey, WorkItem, Workqueue,
};
use crate::error::{Error, Result, poison_err};
use crate::metrics::EngineMetrics;

#[derive(Debug, Default)]
struct QueueState {
    items: BTreeMap<String, WorkItem>,
    index: HashMap<ScopeKey, String>,
    revision: u64,
    next_id: u64,
}

impl QueueState {
    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        // Zero-padded so lexical order matches allocation order.
        format!("wq-{:016}", self.next_id)
    }

    fn held_mut(&mut self, item_id: &str, worker_id: &str) -> Result<&mut WorkItem> {
        let not_owned = || Error::ClaimNotOwned {
            item_id: item_id.to_string(),
            worker_id: worker_id.to_string(),
        };
        let item = self.items.get_mut(item_id).ok_or_else(not_owned)?;
        if item.is_held_by(worker_id) {
            Ok(item)
        } else {
            Err(not_owned())
        }
    }

    /// Drops payloads covered by the claim and clears it; returns what remains.
    fn release_acked(&mut self, params: &AckParams) -> Result<usize> {
        let item = self.held_mut(&params.item_id, &params.worker_id)?;
        if item.updated_at > params.claimed_updated_at {
            return Err(Error::StaleClaim {
                item_id: params.item_id.clone(),
                claimed: params.claimed_updated_at,
                current: item.updated_at,
            });
        }
        item.payloads
            .retain(|_, payload| payload.created_at > params.claimed_updated_at);
        item.claimed_by = None;
        item.claimed_until = None;
        Ok(item.payloads.len())
    }

    fn remove(&mut self, item_id: &str) {
        if let Some(item) = self.items.remove(item_id) {
            self.index.remove(&item.scope);
        }
    }
}

/// Single-mutex workqueue.
#[derive(Debug)]
pub struct InMemoryWorkqueue {
    state: Mutex<QueueState>,
    clock: Arc<dyn Clock>,
    metrics: EngineMetrics,
}

impl Default for InMemoryWorkqueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWorkqueue {
    /// Creates a queue on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates a queue reading time from `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            clock,
            metrics: EngineMetrics::new(),
        }
    }

    /// Returns the number of scope records.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.state.lock().map_err(poison_err)?.items.len())
    }

    /// Returns true if the queue holds no scopes.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

fn build_payload(params: &EnqueueParams, revision: u64) -> Result<Option<Payload>> {
    let Some(payload_type) = params.payload_type.clone() else {
        if params.payload.is_some() || params.payload_key.is_some() {
            return Err(Error::validation("payloadType is required with a payload"));
        }
        return Ok(None);
    };
    let data = match &params.payload {
        Some(value) => canonical_json::normalize(value)?,
        None => serde_json::Value::Null,
    };
    let payload_key = match &params.payload_key {
        Some(key) if !key.is_empty() => key.clone(),
        _ => canonical_json::sha256_hex(&data)?,
    };
    Ok(Some(Payload {
        payload_type,
        payload_key,
        data,
        attempt_count: 0,
        last_error: None,
        created_at: revision,
    }))
}

#[async_trait]
impl Workqueue for InMemoryWorkqueue {
    async fn enqueue(&self, params: EnqueueParams) -> Result<EnqueueOutcome> {
        params.scope.validate()?;
        let mut state = self.state.lock().map_err(poison_err)?;
        let revision = state.bump();
        let payload = build_payload(&params, revision)?;

        let existing = state.index.get(&params.scope).cloned();
        let outcome = match existing {
            Some(item_id) => {
                let item = state
                    .items
                    .get_mut(&item_id)
                    .ok_or_else(|| Error::internal(format!("workqueue index points at missing item {item_id}")))?;
                item.event_ts = item.event_ts.max(params.event_ts);
                item.priority = item.priority.min(params.priority);
                item.not_before = match (item.not_before, params.not_before) {
                    (Some(current), Some(incoming)) => Some(current.min(incoming)),
                    _ => None,
                };
                if let Some(payload) = payload {
                    let key = (payload.payload_type.clone(), payload.payload_key.clone());
                    let attempts = item.payloads.get(&key).map_or(0, |p| p.attempt_count);
                    item.payloads.insert(key, Payload { attempt_count: attempts, ..payload });
                }
                EnqueueOutcome {
                    item_id,
                    created: false,
                }
            }
            None => {
                let item_id = state.allocate_id();
                let mut payloads = BTreeMap::new();
                if let Some(payload) = payload {
                    payloads.insert(
                        (payload.payload_type.clone(), payload.payload_key.clone()),
                        payload,
                    );
                }
                let item = WorkItem {
                    id: item_id.clone(),
                    scope: params.scope.clone(),
                    priority: params.priority,
                    event_ts: params.event_ts,
                    not_before: params.not_before,
                    claimed_by: None,
                    claimed_until: None,
                    updated_at: revision,
                    payloads,
                };
                state.index.insert(params.scope, item_id.clone());
                state.items.insert(item_id.clone(), item);
                EnqueueOutcome {
                    item_id,
                    created: true,
                }
            }
        };
        drop(state);

        self.metrics.record_workqueue(
            "enqueue",
            if outcome.created { "created" } else { "coalesced" },
        );
        Ok(outcome)
    }

    async fn claim(&self, params: ClaimParams) -> Result<Vec<WorkItem>> {
        if params.batch_size == 0 {
            return Ok(Vec::new());
        }
        let now = self.now();
        let mut state = self.state.lock().map_err(poison_err)?;

        let mut candidates: Vec<(i32, i64, String)> = state
            .items
            .values()
            .filter(|item| item.is_available(now))
            .filter(|item| params.kinds.is_empty() || params.kinds.contains(&item.scope.kind))
            .map(|item| (item.priority, item.event_ts, item.id.clone()))
            .collect();
        candidates.sort();
        candidates.truncate(params.batch_size);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, _, item_id) in candidates {
            let revision = state.bump();
            if let Some(item) = state.items.get_mut(&item_id) {
                item.claimed_by = Some(params.worker_id.clone());
                item.claimed_until = Some(now + params.lease_duration);
                item.updated_at = revision;
                claimed.push(item.clone());
            }
        }
        drop(state);

        self.metrics.record_workqueue(
            "claim",
            if claimed.is_empty() { "empty" } else { "claimed" },
        );
        tracing::debug!(worker_id = %params.worker_id, count = claimed.len(), "claimed workqueue scopes");
        Ok(claimed)
    }

    async fn extend_lease(&self, params: ExtendLeaseParams) -> Result<DateTime<Utc>> {
        let until = self.now() + params.lease_duration;
        let mut state = self.state.lock().map_err(poison_err)?;
        let item = state.held_mut(&params.item_id, &params.worker_id)?;
        item.claimed_until = Some(until);
        drop(state);
        self.metrics.record_workqueue("extend_lease", "ok");
        Ok(until)
    }

    async fn ack_success(&self, params: AckParams) -> Result<AckOutcome> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let remaining = match state.release_acked(&params) {
            Ok(remaining) => remaining,
            Err(err) => {
                drop(state);
                self.metrics.record_workqueue("ack", "rejected");
                return Err(err);
            }
        };

        let deleted = remaining == 0;
        if deleted {
            state.remove(&params.item_id);
        } else {
            let revision = state.bump();
            if let Some(item) = state.items.get_mut(&params.item_id) {
                item.updated_at = revision;
            }
        }
        drop(state);

        self.metrics.record_workqueue("ack", if deleted { "deleted" } else { "requeued" });
        Ok(AckOutcome {
            deleted,
            remaining_payloads: remaining,
        })
    }

    async fn retry(&self, params: RetryParams) -> Result<()> {
        let now = self.now();
        let mut state = self.state.lock().map_err(poison_err)?;
        let revision = state.bump();
        let item = state.held_mut(&params.item_id, &params.worker_id)?;
        let claimed_at = item.updated_at;
        item.payloads.retain(|key, payload| {
            payload.created_at > claimed_at || !params.completed.contains(key)
        });
        for payload in item.payloads.values_mut() {
            payload.attempt_count = payload.attempt_count.saturating_add(1);
            payload.last_error = Some(params.last_error.clone());
        }
        item.not_before = Some(now + params.retry_backoff);
        item.claimed_by = None;
        item.claimed_until = None;
        item.updated_at = revision;
        drop(state);

        self.metrics.record_workqueue("retry", "ok");
        tracing::debug!(item_id = %params.item_id, error = %params.last_error, "workqueue scope released for retry");
        Ok(())
    }

    async fn list(&self, workspace_id: Option<&str>) -> Result<Vec<WorkItem>> {
        let state = self.state.lock().map_err(poison_err)?;
        Ok(state
            .items
            .values()
            .filter(|item| workspace_id.map_or(true, |ws| item.scope.workspace_id == ws))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use keel_core::ManualClock;
    use serde_json::json;

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    fn queue() -> (Arc<ManualClock>, InMemoryWorkqueue) {
        let clock = Arc::new(ManualClock::at_millis(1_000_000));
        let queue = InMemoryWorkqueue::with_clock(clock.clone());
        (clock, queue)
    }

    fn scope(id: &str) -> ScopeKey {
        ScopeKey::new("ws", "reconcile", "rt", id)
    }

    fn lease() -> Duration {
        Duration::seconds(30)
    }

    #[tokio::test]
    async fn enqueue_coalesces_scope_and_payload() -> TestResult {
        let (_, queue) = queue();
        let first = queue
            .enqueue(
                EnqueueParams::new(scope("X"), 5)
                    .with_priority(100)
                    .with_payload("rt", Some("X".into()), json!({"id": "X"})),
            )
            .await?;
        let second = queue
            .enqueue(
                EnqueueParams::new(scope("X"), 10)
                    .with_priority(50)
                    .with_payload("rt", Some("X".into()), json!({"id": "X"})),
            )
            .await?;
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.item_id, second.item_id);

        let claimed = queue.claim(ClaimParams::new("w1", 1, lease())).await?;
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].priority, 50);
        assert_eq!(claimed[0].event_ts, 10);
        assert_eq!(claimed[0].payloads.len(), 1);

        let ack = queue
            .ack_success(AckParams {
                item_id: claimed[0].id.clone(),
                worker_id: "w1".into(),
                claimed_updated_at: claimed[0].updated_at,
            })
            .await?;
        assert!(ack.deleted);
        assert!(queue.is_empty()?);
        Ok(())
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_lease_expires() -> TestResult {
        let (clock, queue) = queue();
        queue.enqueue(EnqueueParams::new(scope("X"), 1)).await?;

        let first = queue.claim(ClaimParams::new("w1", 10, lease())).await?;
        assert_eq!(first.len(), 1);
        let second = queue.claim(ClaimParams::new("w2", 10, lease())).await?;
        assert!(second.is_empty());

        clock.advance(Duration::seconds(31));
        let stolen = queue.claim(ClaimParams::new("w2", 10, lease())).await?;
        assert_eq!(stolen.len(), 1);
        assert_eq!(stolen[0].claimed_by.as_deref(), Some("w2"));

        let err = queue
            .ack_success(AckParams {
                item_id: first[0].id.clone(),
                worker_id: "w1".into(),
                claimed_updated_at: first[0].updated_at,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClaimNotOwned { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn payload_enqueued_during_claim_survives_ack() -> TestResult {
        let (_, queue) = queue();
        queue
            .enqueue(EnqueueParams::new(scope("X"), 1).with_payload("job", Some("j1".into()), json!({})))
            .await?;
        let claimed = queue.claim(ClaimParams::new("w1", 1, lease())).await?;
        queue
            .enqueue(EnqueueParams::new(scope("X"), 2).with_payload("job", Some("j2".into()), json!({})))
            .await?;

        let ack = queue
            .ack_success(AckParams {
                item_id: claimed[0].id.clone(),
                worker_id: "w1".into(),
                claimed_updated_at: claimed[0].updated_at,
            })
            .await?;
        assert!(!ack.deleted);
        assert_eq!(ack.remaining_payloads, 1);

        let next = queue.claim(ClaimParams::new("w1", 1, lease())).await?;
        let keys: Vec<_> = next[0].payloads_of("job").map(|p| p.payload_key.as_str()).collect();
        assert_eq!(keys, vec!["j2"]);
        Ok(())
    }

    #[tokio::test]
    async fn ack_with_old_revision_is_stale() -> TestResult {
        let (clock, queue) = queue();
        queue.enqueue(EnqueueParams::new(scope("X"), 1)).await?;
        let first = queue.claim(ClaimParams::new("w1", 1, lease())).await?;
        clock.advance(Duration::seconds(31));
        let again = queue.claim(ClaimParams::new("w1", 1, lease())).await?;
        assert!(again[0].updated_at > first[0].updated_at);

        let err = queue
            .ack_success(AckParams {
                item_id: first[0].id.clone(),
                worker_id: "w1".into(),
                claimed_updated_at: first[0].updated_at,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StaleClaim { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn retry_delays_scope_and_counts_attempts() -> TestResult {
        let (clock, queue) = queue();
        queue
            .enqueue(EnqueueParams::new(scope("X"), 1).with_payload("job", Some("j1".into()), json!({})))
            .await?;
        let claimed = queue.claim(ClaimParams::new("w1", 1, lease())).await?;
        queue
            .retry(RetryParams {
                item_id: claimed[0].id.clone(),
                worker_id: "w1".into(),
                last_error: "agent unavailable".into(),
                retry_backoff: Duration::seconds(10),
                completed: Vec::new(),
            })
            .await?;

        assert!(queue.claim(ClaimParams::new("w2", 1, lease())).await?.is_empty());
        clock.advance(Duration::seconds(10));
        let next = queue.claim(ClaimParams::new("w2", 1, lease())).await?;
        let payload = next[0].payloads_of("job").next().unwrap();
        assert_eq!(payload.attempt_count, 1);
        assert_eq!(payload.last_error.as_deref(), Some("agent unavailable"));
        Ok(())
    }

    #[tokio::test]
    async fn retry_drops_completed_payloads_unless_rewritten() -> TestResult {
        let (_, queue) = queue();
        for key in ["j1", "j2", "j3"] {
            queue
                .enqueue(EnqueueParams::new(scope("X"), 1).with_payload("job", Some(key.into()), json!({})))
                .await?;
        }
        let claimed = queue.claim(ClaimParams::new("w1", 1, lease())).await?;
        // j3 is re-enqueued while claimed, so it survives despite completing.
        queue
            .enqueue(EnqueueParams::new(scope("X"), 2).with_payload("job", Some("j3".into()), json!({})))
            .await?;
        queue
            .retry(RetryParams {
                item_id: claimed[0].id.clone(),
                worker_id: "w1".into(),
                last_error: "j2 failed".into(),
                retry_backoff: Duration::zero(),
                completed: vec![
                    ("job".to_string(), "j1".to_string()),
                    ("job".to_string(), "j3".to_string()),
                ],
            })
            .await?;

        let next = queue.claim(ClaimParams::new("w1", 1, lease())).await?;
        let keys: Vec<_> = next[0].payloads_of("job").map(|p| p.payload_key.as_str()).collect();
        assert_eq!(keys, vec!["j2", "j3"]);
        Ok(())
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_event_time() -> TestResult {
        let (_, queue) = queue();
        queue.enqueue(EnqueueParams::new(scope("a"), 3).with_priority(5)).await?;
        queue.enqueue(EnqueueParams::new(scope("b"), 2).with_priority(1)).await?;
        queue.enqueue(EnqueueParams::new(scope("c"), 1).with_priority(5)).await?;

        let claimed = queue.claim(ClaimParams::new("w1", 3, lease())).await?;
        let ids: Vec<_> = claimed.iter().map(|i| i.scope.scope_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        Ok(())
    }

    #[tokio::test]
    async fn claim_filters_by_kind() -> TestResult {
        let (_, queue) = queue();
        queue.enqueue(EnqueueParams::new(scope("a"), 1)).await?;
        queue
            .enqueue(EnqueueParams::new(ScopeKey::new("ws", "job-dispatch", "rt", "a"), 1))
            .await?;
        let claimed = queue
            .claim(ClaimParams::new("w1", 10, lease()).with_kinds(["job-dispatch"]))
            .await?;
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].scope.kind, "job-dispatch");
        Ok(())
    }

    #[tokio::test]
    async fn default_payload_key_is_content_hash() -> TestResult {
        let (_, queue) = queue();
        queue
            .enqueue(EnqueueParams::new(scope("X"), 1).with_payload("rt", None, json!({"b": 1, "a": 2})))
            .await?;
        queue
            .enqueue(EnqueueParams::new(scope("X"), 1).with_payload("rt", None, json!({"a": 2, "b": 1})))
            .await?;
        let items = queue.list(Some("ws")).await?;
        assert_eq!(items[0].payloads.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn extend_lease_requires_ownership() -> TestResult {
        let (_, queue) = queue();
        queue.enqueue(EnqueueParams::new(scope("X"), 1)).await?;
        let claimed = queue.claim(ClaimParams::new("w1", 1, lease())).await?;
        let err = queue
            .extend_lease(ExtendLeaseParams {
                item_id: claimed[0].id.clone(),
                worker_id: "w2".into(),
                lease_duration: lease(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClaimNotOwned { .. }));
        queue
            .extend_lease(ExtendLeaseParams {
                item_id: claimed[0].id.clone(),
                worker_id: "w1".into(),
                lease_duration: lease(),
            })
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn payload_without_type_is_rejected() {
        let (_, queue) = queue();
        let mut params = EnqueueParams::new(scope("X"), 1);
        params.payload = Some(json!({}));
        assert!(queue.enqueue(params).await.is_err());
    }
}
