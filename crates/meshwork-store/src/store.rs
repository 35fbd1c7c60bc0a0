//! The `MeshStore` trait
//!
//! Provider-agnostic operations over the relational+stream+pubsub backend.
//! Guarantees every provider must honor:
//!
//! 1. `hincrby_float` returning exactly `1.0` serializes first-claim wins
//!    across the mesh for a given `(key, field)`.
//! 2. Stream consumption is at-least-once with explicit ack; unacked entries
//!    become claimable after their idle threshold.
//! 3. [`commit_leg`](MeshStore::commit_leg) applies every write of one
//!    activity leg atomically — the status semaphore can never be observed
//!    out of step with the leg's outputs or its outgoing transitions.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use meshwork_core::manifest::AppManifest;
use meshwork_core::message::StreamMessage;

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Key or record not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Append-only violation (manifest redeploy with different content, or
    /// duplicate job creation).
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// Backend failure.
    #[error("database error: {0}")]
    Database(String),

    /// Payload (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A consumed stream entry awaiting ack.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub message: StreamMessage,
}

/// Time-hook entry kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Sleep,
    Expire,
    Interrupt,
    Child,
    Delist,
}

/// One pending time-hook entry on a slot list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeHook {
    /// Slot list key (`{ns}:{app}:tq:{slot}`).
    pub list_key: String,

    /// Target job id.
    pub target: String,

    /// Generation the hook belongs to; stale generations are dropped.
    pub gid: String,

    /// Activity to re-enter.
    pub aid: String,

    /// Dimensional path of the re-entry scope.
    pub dad: String,

    /// Replay slot to resolve on wake (durable sleeps); absent for graph
    /// hooks and cleanup entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,

    pub kind: TaskKind,

    /// Coarse wake time-slot in epoch milliseconds
    /// (`floor(wake_ms / fidelity_ms) * fidelity_ms`).
    pub slot_ms: i64,
}

/// Composite target of a hook-signal binding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HookTarget {
    pub job_id: String,
    pub gid: String,
    pub aid: String,
    pub dad: String,

    /// Replay slot to resolve on delivery (durable `waitFor`); absent for
    /// re-entry hooks, which allocate a fresh dimension instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
}

/// A registered hook-signal binding. Single-delivery: lookup consumes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HookSignal {
    pub topic: String,

    /// Resolved match value an inbound signal must carry.
    pub resolved: String,

    pub target: HookTarget,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<DateTime<Utc>>,
}

/// Throttle rate update; `None` scopes broaden (guid > topic > app).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ThrottleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    /// Milliseconds per message; `-1` pauses, `0` resumes.
    pub throttle: i64,
}

/// Every write of one activity leg, applied atomically.
#[derive(Debug, Clone, Default)]
pub struct LegCommit {
    /// Job HASH key.
    pub job_key: String,

    /// Fields written by this leg.
    pub fields: Vec<(String, String)>,

    /// Status-semaphore adjustment (enter +1, leave −1, fan-out +N).
    pub status_delta: f64,

    /// Force-set the semaphore (interrupt path) instead of adjusting it.
    pub set_status: Option<f64>,

    /// Outgoing transitions, published in the same commit.
    pub publishes: Vec<(String, StreamMessage)>,

    /// Retry re-emissions, visible after the delay.
    pub delayed_publishes: Vec<(String, StreamMessage, Duration)>,

    /// Hook-signal bindings registered by this leg.
    pub hook_signals: Vec<HookSignal>,

    /// Time hooks registered by this leg.
    pub time_hooks: Vec<TimeHook>,
}

impl LegCommit {
    pub fn for_job(job_key: impl Into<String>) -> Self {
        Self {
            job_key: job_key.into(),
            ..Default::default()
        }
    }
}

/// Store for job state, streams, time hooks, signals, and mesh coordination.
///
/// Implementations must be thread-safe and support concurrent access from
/// every mesh member.
#[async_trait]
pub trait MeshStore: Send + Sync + 'static {
    // =========================================================================
    // App manifests
    // =========================================================================

    /// Deploy a manifest version (inactive). Append-only: redeploying an
    /// existing `(app, version)` with different content is an error.
    async fn set_app(&self, manifest: &AppManifest) -> Result<(), StoreError>;

    /// Fetch a manifest; `None` version means the active one.
    async fn get_app(
        &self,
        app_id: &str,
        version: Option<&str>,
    ) -> Result<AppManifest, StoreError>;

    /// Point the active-version pointer at `version`.
    async fn activate_app(&self, app_id: &str, version: &str) -> Result<(), StoreError>;

    /// The currently active version, if any.
    async fn active_version(&self, app_id: &str) -> Result<Option<String>, StoreError>;

    // =========================================================================
    // Job HASH
    // =========================================================================

    /// Create the job HASH. Returns `false` (writing nothing) if it exists.
    async fn create_job(
        &self,
        job_key: &str,
        fields: Vec<(String, String)>,
        initial_status: f64,
    ) -> Result<bool, StoreError>;

    async fn hset(&self, key: &str, fields: Vec<(String, String)>) -> Result<u64, StoreError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Atomic float increment; the returned value is the post-increment
    /// total (guarantee 1: exactly `1.0` means first claim).
    async fn hincrby_float(&self, key: &str, field: &str, delta: f64) -> Result<f64, StoreError>;

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64, StoreError>;

    /// Fields matching a glob pattern (selective replay fetch). `total_cap`
    /// bounds the result; providers may scan in `chunk_size` batches.
    async fn find_job_fields(
        &self,
        key: &str,
        pattern: &str,
        chunk_size: usize,
        total_cap: usize,
    ) -> Result<HashMap<String, String>, StoreError>;

    /// Drop the whole job HASH.
    async fn delete_job(&self, job_key: &str) -> Result<(), StoreError>;

    // =========================================================================
    // Streams
    // =========================================================================

    async fn publish_to_stream(
        &self,
        stream: &str,
        message: &StreamMessage,
    ) -> Result<String, StoreError>;

    /// Publish with a visibility delay (retry backoff).
    async fn publish_to_stream_delayed(
        &self,
        stream: &str,
        message: &StreamMessage,
        delay: Duration,
    ) -> Result<String, StoreError>;

    /// Claim up to `count` visible entries for `consumer`, blocking up to
    /// `block_ms` when the stream is empty. At-least-once with explicit ack.
    async fn consume_batch(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StoreError>;

    /// Re-claim entries whose consumer went quiet for `min_idle`.
    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    // =========================================================================
    // Task lists (time hooks)
    // =========================================================================

    /// Register slot lists so the scout can discover them.
    async fn add_task_queues(&self, keys: &[String]) -> Result<(), StoreError>;

    /// The earliest registered slot list that is ready at `now_ms`.
    async fn get_active_task_queue(&self, now_ms: i64) -> Result<Option<String>, StoreError>;

    /// Move one entry from `src` to `dst` (in-progress marker), returning its
    /// job id.
    async fn process_task_queue(
        &self,
        src: &str,
        dst: &str,
    ) -> Result<Option<String>, StoreError>;

    /// Drop a fully-drained processed list.
    async fn delete_processed_task_queue(&self, key: &str) -> Result<(), StoreError>;

    async fn register_time_hook(&self, hook: TimeHook) -> Result<(), StoreError>;

    /// Pop the next due entry (slot ≤ `now_ms`), optionally restricted to one
    /// list.
    async fn get_next_task(
        &self,
        now_ms: i64,
        list_key: Option<&str>,
    ) -> Result<Option<TimeHook>, StoreError>;

    /// Cancel every pending time hook for a job (interrupt path).
    async fn cancel_time_hooks(&self, job_id: &str) -> Result<u64, StoreError>;

    // =========================================================================
    // Hook signals
    // =========================================================================

    async fn set_hook_signal(&self, signal: HookSignal) -> Result<(), StoreError>;

    /// Consume a binding: read AND remove. At most one consumer ever
    /// receives a given signal.
    async fn get_hook_signal(
        &self,
        topic: &str,
        resolved: &str,
    ) -> Result<Option<HookTarget>, StoreError>;

    async fn delete_hook_signal(&self, topic: &str, resolved: &str) -> Result<u64, StoreError>;

    // =========================================================================
    // Pub/Sub
    // =========================================================================

    async fn notify(&self, channel: &str, payload: &str) -> Result<(), StoreError>;

    /// Subscribe to a channel. Payloads are raw strings; at-most-once,
    /// best-effort.
    async fn listen(&self, channel: &str) -> Result<broadcast::Receiver<String>, StoreError>;

    async fn unlisten(&self, channel: &str) -> Result<(), StoreError>;

    // =========================================================================
    // Throttle
    // =========================================================================

    async fn set_throttle_rate(&self, spec: &ThrottleSpec) -> Result<(), StoreError>;

    /// Effective rate for `(topic, guid)`; precedence guid > topic > app;
    /// `0` when unset.
    async fn get_throttle_rate(
        &self,
        topic: Option<&str>,
        guid: Option<&str>,
    ) -> Result<i64, StoreError>;

    // =========================================================================
    // Coordination
    // =========================================================================

    /// Lease-based scout election: true iff `guid` holds the role for the
    /// next `lease` window.
    async fn reserve_scout_role(
        &self,
        role: &str,
        guid: &str,
        lease: Duration,
    ) -> Result<bool, StoreError>;

    // =========================================================================
    // Atomic leg commit
    // =========================================================================

    /// Apply one activity leg atomically; returns the post-commit status
    /// semaphore value.
    async fn commit_leg(&self, commit: LegCommit) -> Result<f64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_kind_wire_names() {
        assert_eq!(serde_json::to_string(&TaskKind::Sleep).unwrap(), "\"sleep\"");
        assert_eq!(
            serde_json::to_string(&TaskKind::Interrupt).unwrap(),
            "\"interrupt\""
        );
    }

    #[test]
    fn test_hook_signal_round_trip() {
        let signal = HookSignal {
            topic: "order.approved".into(),
            resolved: "order-9".into(),
            target: HookTarget {
                job_id: "j9".into(),
                gid: "g1".into(),
                aid: "h1".into(),
                dad: "0,1".into(),
                sid: Some("-y0,1-2-".into()),
            },
            expire_at: None,
        };
        let json = serde_json::to_string(&signal).unwrap();
        let back: HookSignal = serde_json::from_str(&json).unwrap();
        assert_eq!(signal, back);
    }

    #[test]
    fn test_leg_commit_default_is_empty() {
        let commit = LegCommit::for_job("mesh:a:j:1");
        assert_eq!(commit.status_delta, 0.0);
        assert!(commit.publishes.is_empty());
        assert!(commit.set_status.is_none());
    }
}
