//! Scoped workqueue with leased claims.
//!
//! A scope `(workspaceId, kind, scopeType, scopeId)` is the unit of
//! exclusion: at most one worker holds it at a time. Each scope carries a set
//! of payloads keyed by `(payloadType, payloadKey)`, so repeated enqueues for
//! the same scope coalesce instead of queueing duplicate work.
//!
//! ## Core Types
//!
//! - [`Workqueue`]: Port implemented by queue backends
//! - [`EnqueueParams`], [`ClaimParams`], [`ExtendLeaseParams`], [`AckParams`], [`RetryParams`]
//! - [`WorkItem`]: A scope as handed out by [`Workqueue::claim`]
//! - [`memory::InMemoryWorkqueue`]: Single-mutex implementation
//!
//! ## Payload lifetime
//!
//! Payloads are stamped with the queue revision at which they were written.
//! Acknowledging a claim removes only payloads written at or before the
//! claim's revision; anything enqueued while the scope was held survives
//! and is visible to the next claim.

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Workqueue kind used by the release manager for job dispatch.
pub const JOB_DISPATCH_KIND: &str = "job-dispatch";

/// Scope type for work keyed by release target.
pub const RELEASE_TARGET_SCOPE: &str = "release-target";

/// Payload type carrying a job identifier.
pub const JOB_PAYLOAD: &str = "job";

/// Identity of a workqueue scope.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeKey {
    /// Owning workspace.
    pub workspace_id: String,
    /// Work kind, e.g. `job-dispatch`.
    pub kind: String,
    /// What the scope id refers to, e.g. `release-target`.
    pub scope_type: String,
    /// Scope identifier.
    pub scope_id: String,
}

impl ScopeKey {
    /// Creates a scope key.
    #[must_use]
    pub fn new(
        workspace_id: impl Into<String>,
        kind: impl Into<String>,
        scope_type: impl Into<String>,
        scope_id: impl Into<String>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            kind: kind.into(),
            scope_type: scope_type.into(),
            scope_id: scope_id.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("workspaceId", &self.workspace_id),
            ("kind", &self.kind),
            ("scopeType", &self.scope_type),
            ("scopeId", &self.scope_id),
        ] {
            if value.trim().is_empty() {
                return Err(Error::validation(format!("workqueue {field} must not be empty")));
            }
        }
        Ok(())
    }
}

/// Request to add or coalesce work into a scope.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueParams {
    /// Target scope.
    pub scope: ScopeKey,
    /// Logical time of the triggering event (Unix milliseconds).
    pub event_ts: i64,
    /// Lower is more urgent.
    pub priority: i32,
    /// Earliest time the scope may be claimed.
    pub not_before: Option<DateTime<Utc>>,
    /// Payload type; required when a payload is supplied.
    pub payload_type: Option<String>,
    /// Payload key; defaults to the SHA-256 of the normalised payload.
    pub payload_key: Option<String>,
    /// Payload body.
    pub payload: Option<Value>,
}

impl EnqueueParams {
    /// Creates an enqueue request with no payload, priority 0 and no delay.
    #[must_use]
    pub fn new(scope: ScopeKey, event_ts: i64) -> Self {
        Self {
            scope,
            event_ts,
            priority: 0,
            not_before: None,
            payload_type: None,
            payload_key: None,
            payload: None,
        }
    }

    /// Sets the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Delays the scope until `not_before`.
    #[must_use]
    pub const fn with_not_before(mut self, not_before: DateTime<Utc>) -> Self {
        self.not_before = Some(not_before);
        self
    }

    /// Attaches a payload. A `None` key is derived from the payload hash.
    #[must_use]
    pub fn with_payload(
        mut self,
        payload_type: impl Into<String>,
        payload_key: Option<String>,
        payload: Value,
    ) -> Self {
        self.payload_type = Some(payload_type.into());
        self.payload_key = payload_key;
        self.payload = Some(payload);
        self
    }
}

/// Result of an enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOutcome {
    /// Identifier of the scope record.
    pub item_id: String,
    /// True if the scope did not exist before.
    pub created: bool,
}

/// Request to claim scopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimParams {
    /// Claiming worker.
    pub worker_id: String,
    /// Maximum number of scopes to return.
    pub batch_size: usize,
    /// How long the claim is held before it may be taken by another worker.
    pub lease_duration: Duration,
    /// Restrict to these kinds; empty means all kinds.
    pub kinds: Vec<String>,
}

impl ClaimParams {
    /// Creates claim parameters for all kinds.
    #[must_use]
    pub fn new(worker_id: impl Into<String>, batch_size: usize, lease_duration: Duration) -> Self {
        Self {
            worker_id: worker_id.into(),
            batch_size,
            lease_duration,
            kinds: Vec::new(),
        }
    }

    /// Restricts the claim to the given kinds.
    #[must_use]
    pub fn with_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kinds = kinds.into_iter().map(Into::into).collect();
        self
    }
}

/// Request to extend a held lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendLeaseParams {
    /// Scope record identifier.
    pub item_id: String,
    /// Worker holding the claim.
    pub worker_id: String,
    /// New lease duration from now.
    pub lease_duration: Duration,
}

/// Request to acknowledge successful processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckParams {
    /// Scope record identifier.
    pub item_id: String,
    /// Worker holding the claim.
    pub worker_id: String,
    /// `updated_at` revision returned by the claim.
    pub claimed_updated_at: u64,
}

/// Result of an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckOutcome {
    /// True if the scope had no remaining payloads and was removed.
    pub deleted: bool,
    /// Payloads that arrived during the claim and remain queued.
    pub remaining_payloads: usize,
}

/// Request to release a claim for a later retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryParams {
    /// Scope record identifier.
    pub item_id: String,
    /// Worker holding the claim.
    pub worker_id: String,
    /// Error recorded on each surviving payload.
    pub last_error: String,
    /// Delay before the scope becomes claimable again.
    pub retry_backoff: Duration,
    /// `(payloadType, payloadKey)` of payloads finished under this claim.
    /// They are dropped unless re-enqueued after the claim.
    pub completed: Vec<(String, String)>,
}

/// A payload attached to a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    /// Payload type.
    pub payload_type: String,
    /// Payload key, unique within its type.
    pub payload_key: String,
    /// Normalised payload body.
    pub data: Value,
    /// Number of times this payload was handed back via retry.
    pub attempt_count: u32,
    /// Error from the most recent retry, if any.
    pub last_error: Option<String>,
    /// Queue revision at which the payload was last written.
    pub created_at: u64,
}

/// A scope record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    /// Record identifier.
    pub id: String,
    /// Scope identity.
    pub scope: ScopeKey,
    /// Lower is more urgent.
    pub priority: i32,
    /// Latest event time folded into the scope.
    pub event_ts: i64,
    /// Earliest claim time.
    pub not_before: Option<DateTime<Utc>>,
    /// Holder of the current claim.
    pub claimed_by: Option<String>,
    /// Expiry of the current claim.
    pub claimed_until: Option<DateTime<Utc>>,
    /// Queue revision of the last claim or release.
    pub updated_at: u64,
    /// Payloads keyed by `(payloadType, payloadKey)`.
    #[serde(with = "payload_map")]
    pub payloads: BTreeMap<(String, String), Payload>,
}

impl WorkItem {
    /// Returns true if the scope can be claimed at `now`.
    #[must_use]
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        let lease_free = self.claimed_until.map_or(true, |until| until <= now);
        let due = self.not_before.map_or(true, |at| at <= now);
        lease_free && due
    }

    /// Returns true if `worker_id` holds a claim on this scope.
    #[must_use]
    pub fn is_held_by(&self, worker_id: &str) -> bool {
        self.claimed_by.as_deref() == Some(worker_id)
    }

    /// Iterates payloads of one type.
    pub fn payloads_of<'a>(&'a self, payload_type: &'a str) -> impl Iterator<Item = &'a Payload> {
        self.payloads
            .values()
            .filter(move |payload| payload.payload_type == payload_type)
    }
}

mod payload_map {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::Payload;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<(String, String), Payload>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        map.values().collect::<Vec<_>>().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<(String, String), Payload>, D::Error> {
        let payloads = Vec::<Payload>::deserialize(deserializer)?;
        Ok(payloads
            .into_iter()
            .map(|payload| ((payload.payload_type.clone(), payload.payload_key.clone()), payload))
            .collect())
    }
}

/// Scoped workqueue backend.
///
/// Implementations must keep a single claim per scope: a scope whose
/// `claimed_until` lies in the future is never returned by [`Workqueue::claim`].
/// Returned items are copies; mutating them has no effect on the queue.
#[async_trait]
pub trait Workqueue: Send + Sync {
    /// Creates or coalesces into a scope.
    async fn enqueue(&self, params: EnqueueParams) -> Result<EnqueueOutcome>;

    /// Claims up to `batch_size` available scopes ordered by
    /// `(priority, event_ts, id)`.
    async fn claim(&self, params: ClaimParams) -> Result<Vec<WorkItem>>;

    /// Extends a held lease, returning the new expiry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClaimNotOwned`] if the caller does not hold the scope.
    async fn extend_lease(&self, params: ExtendLeaseParams) -> Result<DateTime<Utc>>;

    /// Acknowledges a claim, removing the payloads it covered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClaimNotOwned`] if the caller does not hold the scope
    /// and [`Error::StaleClaim`] if the scope was re-claimed since.
    async fn ack_success(&self, params: AckParams) -> Result<AckOutcome>;

    /// Releases a claim and delays the scope by the backoff.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClaimNotOwned`] if the caller does not hold the scope.
    async fn retry(&self, params: RetryParams) -> Result<()>;

    /// Lists scope records, optionally for one workspace.
    async fn list(&self, workspace_id: Option<&str>) -> Result<Vec<WorkItem>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn scope_validation_rejects_blank_fields() {
        let scope = ScopeKey::new("ws", "", "release-target", "x");
        assert!(scope.validate().is_err());
        assert!(ScopeKey::new("ws", "k", "t", "x").validate().is_ok());
    }

    #[test]
    fn availability_respects_lease_and_delay() {
        let now = Utc.timestamp_opt(1_000, 0).single().unwrap();
        let mut item = WorkItem {
            id: "i".into(),
            scope: ScopeKey::new("ws", "k", "t", "x"),
            priority: 0,
            event_ts: 0,
            not_before: None,
            claimed_by: Some("w1".into()),
            claimed_until: Some(now + Duration::seconds(5)),
            updated_at: 1,
            payloads: BTreeMap::new(),
        };
        assert!(!item.is_available(now));
        assert!(item.is_available(now + Duration::seconds(5)));

        item.claimed_until = None;
        item.not_before = Some(now + Duration::seconds(1));
        assert!(!item.is_available(now));
    }

    #[test]
    fn work_item_serializes_payloads_as_list() {
        let mut payloads = BTreeMap::new();
        payloads.insert(
            ("job".to_string(), "j1".to_string()),
            Payload {
                payload_type: "job".into(),
                payload_key: "j1".into(),
                data: serde_json::json!({"jobId": "j1"}),
                attempt_count: 0,
                last_error: None,
                created_at: 3,
            },
        );
        let item = WorkItem {
            id: "i".into(),
            scope: ScopeKey::new("ws", "k", "t", "x"),
            priority: 1,
            event_ts: 2,
            not_before: None,
            claimed_by: None,
            claimed_until: None,
            updated_at: 3,
            payloads,
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["payloads"][0]["payloadKey"], "j1");
        let back: WorkItem = serde_json::from_value(json).unwrap();
        assert_eq!(back, item);
    }
}
