//! The workflow replay context
//!
//! One context per invocation. Every durable primitive consults
//! [`did_run`](WorkflowContext::did_run): a deterministic counter mints the
//! session id, a replay hit returns the stored result, and a miss registers
//! an interruption and suspends via `Err(DurableError::Interrupted)`.
//!
//! Determinism contract: the user function must reach its durable primitives
//! in the same textual order on every execution. The counter is a pure
//! function of call order; `random()` derives from it rather than a clock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;

use meshwork_core::message::{now_iso, MessageMetadata, StreamMessage};
use meshwork_core::{codes, job, JobError, RetryPolicy};
use meshwork_store::{Keys, MeshStore};

use crate::error::DurableError;
use crate::factory::{activity_topic, workflow_topic, ACTIVITY_EXECUTE_TOPIC, EXECUTE_TOPIC};
use crate::interruption::Interruption;

/// Options for `proxy_activities`.
#[derive(Debug, Clone, Default)]
pub struct ProxyOptions {
    /// Task queue whose activity worker should run the calls; defaults to
    /// the workflow's own queue.
    pub task_queue: Option<String>,

    pub retry: RetryPolicy,
}

impl ProxyOptions {
    pub fn with_task_queue(mut self, queue: impl Into<String>) -> Self {
        self.task_queue = Some(queue.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Options for `exec_child` / `start_child`.
#[derive(Debug, Clone)]
pub struct ChildOptions {
    pub workflow_name: String,
    pub args: Vec<Value>,

    /// Target task queue; defaults to the parent's.
    pub task_queue: Option<String>,

    pub retry: RetryPolicy,
}

impl ChildOptions {
    pub fn new(workflow_name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            args,
            task_queue: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_task_queue(mut self, queue: impl Into<String>) -> Self {
        self.task_queue = Some(queue.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Inputs for constructing a context (one per invocation).
#[derive(Debug, Clone, Default)]
pub struct ContextParams {
    pub workflow_id: String,
    pub workflow_topic: String,
    pub dimension: String,
    pub task_queue: String,
    pub origin_job_id: Option<String>,
    pub attempt: u32,
    pub replay: HashMap<String, Value>,
}

struct ContextState {
    counter: u32,
    replay: HashMap<String, Value>,
    registry: Vec<Interruption>,
}

/// Per-invocation workflow context. Cheap to clone; clones share the counter
/// and registry so concurrent branches stay serialized through one cursor.
#[derive(Clone)]
pub struct WorkflowContext {
    store: Arc<dyn MeshStore>,
    keys: Keys,
    state: Arc<Mutex<ContextState>>,
    workflow_id: String,
    workflow_topic: String,
    dimension: String,
    task_queue: String,
    origin_job_id: Option<String>,
    attempt: u32,
}

impl WorkflowContext {
    pub fn new(store: Arc<dyn MeshStore>, keys: Keys, params: ContextParams) -> Self {
        Self {
            store,
            keys,
            state: Arc::new(Mutex::new(ContextState {
                counter: 0,
                replay: params.replay,
                registry: Vec::new(),
            })),
            workflow_id: params.workflow_id,
            workflow_topic: params.workflow_topic,
            dimension: params.dimension,
            task_queue: params.task_queue,
            origin_job_id: params.origin_job_id,
            attempt: params.attempt,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn workflow_topic(&self) -> &str {
        &self.workflow_topic
    }

    pub fn dimension(&self) -> &str {
        &self.dimension
    }

    pub fn origin_job_id(&self) -> Option<&str> {
        self.origin_job_id.as_deref()
    }

    /// Current attempt number for this invocation (1-based).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Drain the interruption registry (worker wrapper only).
    pub(crate) fn take_registry(&self) -> Vec<Interruption> {
        std::mem::take(&mut self.state.lock().registry)
    }

    /// Mint the next session id and look it up in the replay cache.
    ///
    /// Returns `(replayed, execution_index, stored_value)`.
    pub fn did_run(&self, prefix: char) -> (bool, u32, Option<Value>) {
        let mut state = self.state.lock();
        let index = state.counter;
        state.counter += 1;
        let sid = job::session_field(prefix, &self.dimension, index);
        match state.replay.get(&sid) {
            Some(value) => (true, index, Some(value.clone())),
            None => (false, index, None),
        }
    }

    fn register(&self, interruption: Interruption) -> DurableError {
        self.state.lock().registry.push(interruption);
        DurableError::Interrupted
    }

    // =========================================================================
    // Suspending primitives
    // =========================================================================

    /// Durable sleep. Replay returns immediately; otherwise the engine
    /// schedules a wake at the next fidelity slot ≥ now + duration.
    pub async fn sleep_for(&self, duration: Duration) -> Result<(), DurableError> {
        let (ran, index, _) = self.did_run('l');
        if ran {
            return Ok(());
        }
        Err(self.register(Interruption::Sleep {
            duration_secs: duration.as_secs(),
            index,
        }))
    }

    /// Wait for an external signal; resolves to the signal's payload.
    pub async fn wait_for<T: DeserializeOwned>(&self, signal: &str) -> Result<T, DurableError> {
        let (ran, index, value) = self.did_run('y');
        if ran {
            return unwrap_stored(value.unwrap_or(Value::Null), true);
        }
        Err(self.register(Interruption::Wait {
            signal: signal.to_string(),
            index,
        }))
    }

    /// Handle for invoking proxied activities under `options`.
    pub fn proxy_activities(&self, options: ProxyOptions) -> ActivityProxy {
        ActivityProxy {
            ctx: self.clone(),
            options,
        }
    }

    /// Run a child workflow and await its result.
    pub async fn exec_child<T: DeserializeOwned>(
        &self,
        options: ChildOptions,
    ) -> Result<T, DurableError> {
        let (ran, index, value) = self.did_run('d');
        if ran {
            return unwrap_stored(value.unwrap_or(Value::Null), options.retry.throw_on_error);
        }
        let queue = options.task_queue.as_deref().unwrap_or(&self.task_queue);
        Err(self.register(Interruption::Child {
            topic: EXECUTE_TOPIC.to_string(),
            data: json!({
                "topic": workflow_topic(queue, &options.workflow_name),
                "args": options.args,
            }),
            index,
            await_result: true,
            retry: Some(options.retry.clone()),
        }))
    }

    /// Start a child workflow without awaiting it; resolves to the child's
    /// job id.
    pub async fn start_child(&self, options: ChildOptions) -> Result<String, DurableError> {
        let (ran, index, value) = self.did_run('d');
        if ran {
            return unwrap_stored(value.unwrap_or(Value::Null), true);
        }
        let queue = options.task_queue.as_deref().unwrap_or(&self.task_queue);
        Err(self.register(Interruption::Child {
            topic: EXECUTE_TOPIC.to_string(),
            data: json!({
                "topic": workflow_topic(queue, &options.workflow_name),
                "args": options.args,
            }),
            index,
            await_result: false,
            retry: Some(options.retry.clone()),
        }))
    }

    /// Await several durable branches at once.
    ///
    /// Branches run sequentially (preserving the counter order); a branch
    /// that suspends registers its interruption and the next branch still
    /// runs, so the whole group lands in one collated emission. Once every
    /// branch replays, the values return in branch order.
    pub async fn all(
        &self,
        branches: Vec<BoxFuture<'_, Result<Value, DurableError>>>,
    ) -> Result<Vec<Value>, DurableError> {
        let mut values = Vec::with_capacity(branches.len());
        let mut pending = false;
        for branch in branches {
            match branch.await {
                Ok(value) => values.push(value),
                Err(e) if e.is_interruption() => pending = true,
                Err(e) => return Err(e),
            }
        }
        if pending {
            Err(DurableError::Interrupted)
        } else {
            Ok(values)
        }
    }

    /// Deterministic pseudo-random value in `[0, 1)`, derived from the
    /// execution counter so replays observe the same sequence.
    pub fn random(&self) -> f64 {
        let mut state = self.state.lock();
        let index = state.counter;
        state.counter += 1;
        let mut x = (index as u64).wrapping_add(0x9e37_79b9_7f4a_7c15);
        x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        x ^= x >> 31;
        (x >> 11) as f64 / (1u64 << 53) as f64
    }

    // =========================================================================
    // Idempotent side effects
    // =========================================================================

    /// First-claim gate for a side effect: false on replay or when another
    /// consumer already claimed this execution index.
    pub async fn is_side_effect_allowed(&self, prefix: char) -> Result<bool, DurableError> {
        let sid = {
            let mut state = self.state.lock();
            let index = state.counter;
            state.counter += 1;
            let sid = job::session_field(prefix, &self.dimension, index);
            if state.replay.contains_key(&sid) {
                return Ok(false);
            }
            sid
        };
        let total = self
            .store
            .hincrby_float(&self.keys.job(&self.workflow_id), &sid, 1.0)
            .await
            .map_err(|e| DurableError::Store(e.to_string()))?;
        Ok(total == 1.0)
    }

    /// Deliver a hook signal (exactly once across replays).
    pub async fn signal(&self, topic: &str, data: Value) -> Result<(), DurableError> {
        if !self.is_side_effect_allowed('k').await? {
            return Ok(());
        }
        self.publish_signal(topic, data).await
    }

    /// Signal a job's re-entry hook (exactly once across replays).
    pub async fn hook(&self, topic: &str, data: Value) -> Result<(), DurableError> {
        if !self.is_side_effect_allowed('h').await? {
            return Ok(());
        }
        self.publish_signal(topic, data).await
    }

    /// Broadcast an opaque user message on the quorum channel.
    pub async fn emit(&self, topic: &str, data: Value) -> Result<(), DurableError> {
        if !self.is_side_effect_allowed('e').await? {
            return Ok(());
        }
        let message = json!({
            "type": "user",
            "topic": topic,
            "payload": data,
        });
        self.store
            .notify(&self.keys.quorum(), &message.to_string())
            .await
            .map_err(|e| DurableError::Store(e.to_string()))?;
        Ok(())
    }

    /// Record a trace marker (exactly once across replays).
    pub async fn trace(&self, attributes: Value) -> Result<(), DurableError> {
        if !self.is_side_effect_allowed('t').await? {
            return Ok(());
        }
        debug!(workflow = %self.workflow_id, %attributes, "workflow trace");
        Ok(())
    }

    /// Attach user-searchable fields to the job record. Keys are prefixed
    /// with `_` so they can never collide with reserved namespaces.
    pub async fn enrich(&self, fields: HashMap<String, String>) -> Result<(), DurableError> {
        if !self.is_side_effect_allowed('r').await? {
            return Ok(());
        }
        let prefixed = fields
            .into_iter()
            .map(|(k, v)| (format!("_{k}"), json!(v).to_string()))
            .collect();
        self.store
            .hset(&self.keys.job(&self.workflow_id), prefixed)
            .await
            .map_err(|e| DurableError::Store(e.to_string()))?;
        Ok(())
    }

    async fn publish_signal(&self, topic: &str, data: Value) -> Result<(), DurableError> {
        let message = StreamMessage::new(
            MessageMetadata {
                jid: self.workflow_id.clone(),
                aid: String::new(),
                dad: "0".to_string(),
                tpc: Some(topic.to_string()),
                ts: now_iso(),
                code: Some(codes::WAIT),
                oj: self.origin_job_id.clone(),
                ..Default::default()
            },
            data,
        );
        self.store
            .publish_to_stream(&self.keys.engine_stream(), &message)
            .await
            .map_err(|e| DurableError::Store(e.to_string()))?;
        Ok(())
    }
}

/// Handle returned by [`WorkflowContext::proxy_activities`].
pub struct ActivityProxy {
    ctx: WorkflowContext,
    options: ProxyOptions,
}

impl ActivityProxy {
    /// Invoke a registered activity durably.
    pub async fn call<T: DeserializeOwned>(
        &self,
        name: &str,
        args: Vec<Value>,
    ) -> Result<T, DurableError> {
        let (ran, index, value) = self.ctx.did_run('p');
        if ran {
            return unwrap_stored(
                value.unwrap_or(Value::Null),
                self.options.retry.throw_on_error,
            );
        }
        let queue = self
            .options
            .task_queue
            .as_deref()
            .unwrap_or(&self.ctx.task_queue);
        Err(self.ctx.register(Interruption::Proxy {
            topic: ACTIVITY_EXECUTE_TOPIC.to_string(),
            data: json!({
                "topic": activity_topic(queue),
                "activity": name,
                "args": args,
            }),
            index,
            retry: Some(self.options.retry.clone()),
        }))
    }
}

/// Decode a replayed slot value, honoring `throw_on_error`.
fn unwrap_stored<T: DeserializeOwned>(value: Value, throw_on_error: bool) -> Result<T, DurableError> {
    if let Some(error) = value.get("$error") {
        let error: JobError = serde_json::from_value(error.clone())?;
        if throw_on_error {
            return Err(DurableError::Activity(error));
        }
        return Ok(serde_json::from_value(json!({ "$error": error }))?);
    }
    Ok(serde_json::from_value(value)?)
}
