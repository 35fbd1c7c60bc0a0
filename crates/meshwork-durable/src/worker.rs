//! The durable worker
//!
//! Consumes a task queue's workflow and activity streams, runs registered
//! functions under the replay context, and maps each outcome back onto the
//! wire: `200` for a return value, the interruption codes for suspensions,
//! `599` for transient failures, and `596..598` for terminal ones.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use meshwork_core::message::{now_iso, MessageMetadata, StreamMessage};
use meshwork_core::{codes, job, MeshError};
use meshwork_engine::quorum::ThrottleCache;
use meshwork_engine::router::{Router, RouterConfig};
use meshwork_store::{Keys, MeshStore};

use crate::context::{ContextParams, WorkflowContext};
use crate::error::DurableError;
use crate::factory::{activity_topic, workflow_topic};
use crate::interceptor::{
    compose_activity, compose_workflow, ActivityInterceptor, WorkflowInterceptor,
};
use crate::interruption;

/// A registered workflow function.
pub type WorkflowFn = Arc<
    dyn Fn(WorkflowContext, Value) -> BoxFuture<'static, Result<Value, DurableError>>
        + Send
        + Sync,
>;

/// A registered activity function.
pub type ActivityFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, DurableError>> + Send + Sync>;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub namespace: String,
    pub app_id: String,

    /// Task queue this worker serves; workflow streams are
    /// `{task_queue}.{name}` and the activity stream `{task_queue}.activity`.
    pub task_queue: String,

    pub guid: String,

    /// Cap for the selective replay fetch.
    pub replay_fetch_cap: usize,
}

impl WorkerConfig {
    pub fn new(
        namespace: impl Into<String>,
        app_id: impl Into<String>,
        task_queue: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            app_id: app_id.into(),
            task_queue: task_queue.into(),
            guid: format!("worker-{}", Uuid::now_v7()),
            replay_fetch_cap: 10_000,
        }
    }

    pub fn with_guid(mut self, guid: impl Into<String>) -> Self {
        self.guid = guid.into();
        self
    }
}

/// Worker for one task queue: registered workflow and activity functions
/// plus their interceptor chains.
pub struct DurableWorker {
    store: Arc<dyn MeshStore>,
    keys: Keys,
    config: WorkerConfig,
    workflows: RwLock<HashMap<String, WorkflowFn>>,
    activities: RwLock<HashMap<String, ActivityFn>>,
    workflow_interceptors: RwLock<Vec<Arc<dyn WorkflowInterceptor>>>,
    activity_interceptors: RwLock<Vec<Arc<dyn ActivityInterceptor>>>,
    throttle: Arc<ThrottleCache>,
}

impl DurableWorker {
    pub fn new(store: Arc<dyn MeshStore>, config: WorkerConfig) -> Arc<Self> {
        let keys = Keys::new(&config.namespace, &config.app_id);
        let throttle = Arc::new(ThrottleCache::new(&config.guid));
        Arc::new(Self {
            store,
            keys,
            config,
            workflows: RwLock::new(HashMap::new()),
            activities: RwLock::new(HashMap::new()),
            workflow_interceptors: RwLock::new(Vec::new()),
            activity_interceptors: RwLock::new(Vec::new()),
            throttle,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn throttle_cache(&self) -> Arc<ThrottleCache> {
        Arc::clone(&self.throttle)
    }

    /// Register a workflow function under `name`.
    pub fn register_workflow<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(WorkflowContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, DurableError>> + Send + 'static,
    {
        let f: WorkflowFn = Arc::new(move |ctx, args| Box::pin(f(ctx, args)));
        self.workflows.write().insert(name.to_string(), f);
        info!(workflow = name, "registered workflow");
    }

    /// Register an activity function under `name`.
    pub fn register_activity<F, Fut>(&self, name: &str, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, DurableError>> + Send + 'static,
    {
        let f: ActivityFn = Arc::new(move |args| Box::pin(f(args)));
        self.activities.write().insert(name.to_string(), f);
        info!(activity = name, "registered activity");
    }

    /// Interceptors run as an onion, first registered outermost. Register
    /// everything before `run`.
    pub fn add_workflow_interceptor(&self, interceptor: Arc<dyn WorkflowInterceptor>) {
        self.workflow_interceptors.write().push(interceptor);
    }

    pub fn add_activity_interceptor(&self, interceptor: Arc<dyn ActivityInterceptor>) {
        self.activity_interceptors.write().push(interceptor);
    }

    /// Every stream topic this worker serves (reported in roll calls).
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .workflows
            .read()
            .keys()
            .map(|name| workflow_topic(&self.config.task_queue, name))
            .collect();
        topics.sort();
        topics.push(activity_topic(&self.config.task_queue));
        topics
    }

    /// Spawn one consumer per served topic; they drain until shutdown.
    #[instrument(skip(self, shutdown), fields(task_queue = %self.config.task_queue))]
    pub async fn run(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let workflow_names: Vec<String> = self.workflows.read().keys().cloned().collect();

        for name in workflow_names {
            let topic = workflow_topic(&self.config.task_queue, &name);
            let worker = Arc::clone(self);
            let stream = self.keys.stream(&topic);
            let shutdown = shutdown.clone();
            let router = Router::new(
                Arc::clone(&self.store),
                stream,
                Some(topic.clone()),
                self.throttle_cache(),
                RouterConfig::new("worker", &self.config.guid),
            );
            tokio::spawn(async move {
                router
                    .run(
                        move |message| {
                            let worker = Arc::clone(&worker);
                            let name = name.clone();
                            async move { worker.process_workflow_message(&name, message).await }
                        },
                        shutdown,
                    )
                    .await;
            });
        }

        let worker = Arc::clone(self);
        let topic = activity_topic(&self.config.task_queue);
        let router = Router::new(
            Arc::clone(&self.store),
            self.keys.stream(&topic),
            Some(topic),
            self.throttle_cache(),
            RouterConfig::new("worker", &self.config.guid),
        );
        tokio::spawn(async move {
            router
                .run(
                    move |message| {
                        let worker = Arc::clone(&worker);
                        async move { worker.process_activity_message(message).await }
                    },
                    shutdown,
                )
                .await;
        });
    }

    /// Run one workflow invocation end-to-end: build the replay context,
    /// execute through the interceptor chain, reply on the engine stream.
    #[instrument(skip(self, message), fields(jid = %message.metadata.jid))]
    pub async fn process_workflow_message(
        &self,
        name: &str,
        message: StreamMessage,
    ) -> Result<(), MeshError> {
        let f = self
            .workflows
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| MeshError::fatal(format!("no workflow registered as {name}")))?;

        let meta = &message.metadata;
        let args = message
            .data
            .get("args")
            .cloned()
            .unwrap_or_else(|| json!([]));

        let ctx = self.build_context(meta, name).await?;
        debug!(workflow = name, attempt = meta.attempt, "invoking workflow");

        let outcome = {
            let interceptors = self.workflow_interceptors.read().clone();
            let terminal = f(ctx.clone(), args.clone());
            compose_workflow(&interceptors, &ctx, &args, terminal).await
        };

        let (code, data) = self.wire_outcome(&ctx, outcome);
        self.reply(meta, code, data).await
    }

    /// Run one proxied-activity invocation.
    #[instrument(skip(self, message), fields(jid = %message.metadata.jid))]
    pub async fn process_activity_message(
        &self,
        message: StreamMessage,
    ) -> Result<(), MeshError> {
        let meta = &message.metadata;
        let name = message
            .data
            .get("activity")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let args = message
            .data
            .get("args")
            .cloned()
            .unwrap_or_else(|| json!([]));

        let f = self.activities.read().get(&name).cloned();
        let outcome = match f {
            Some(f) => {
                let interceptors = self.activity_interceptors.read().clone();
                let terminal = f(args.clone());
                compose_activity(&interceptors, &name, &args, terminal).await
            }
            None => Err(DurableError::Fatal(format!(
                "no activity registered as {name}"
            ))),
        };

        let (code, data) = match outcome {
            Ok(value) => (codes::SUCCESS, json!({ "response": value, "done": true })),
            Err(e) => failure_wire(e),
        };
        self.reply(meta, code, data).await
    }

    async fn build_context(
        &self,
        meta: &MessageMetadata,
        name: &str,
    ) -> Result<WorkflowContext, MeshError> {
        // Selective fetch: only this dimension's replay markers.
        let pattern = format!("-?{}-*", meta.dad);
        let raw = self
            .store
            .find_job_fields(
                &self.keys.job(&meta.jid),
                &pattern,
                100,
                self.config.replay_fetch_cap,
            )
            .await
            .map_err(|e| MeshError::Store(e.to_string()))?;
        let replay: HashMap<String, Value> = raw
            .into_iter()
            .map(|(field, value)| (field, job::field_to_value(&value)))
            .collect();

        Ok(WorkflowContext::new(
            Arc::clone(&self.store),
            self.keys.clone(),
            ContextParams {
                workflow_id: meta.jid.clone(),
                workflow_topic: workflow_topic(&self.config.task_queue, name),
                dimension: meta.dad.clone(),
                task_queue: self.config.task_queue.clone(),
                origin_job_id: meta.oj.clone(),
                attempt: meta.attempt.max(1),
                replay,
            },
        ))
    }

    /// Map a workflow outcome onto `(code, data)`.
    fn wire_outcome(
        &self,
        ctx: &WorkflowContext,
        outcome: Result<Value, DurableError>,
    ) -> (u32, Value) {
        match outcome {
            Ok(value) => (codes::SUCCESS, json!({ "response": value, "done": true })),
            Err(DurableError::Interrupted) => {
                let registry = ctx.take_registry();
                match interruption::to_wire(&registry) {
                    Some((code, payload)) => (code, payload),
                    None => {
                        // An interruption with no registered entries means a
                        // swallowed-and-rethrown control error; terminal.
                        warn!("interrupted with an empty registry");
                        (
                            codes::FATAL,
                            json!({ "message": "interrupted with empty registry" }),
                        )
                    }
                }
            }
            Err(e) => failure_wire(e),
        }
    }

    async fn reply(
        &self,
        meta: &MessageMetadata,
        code: u32,
        data: Value,
    ) -> Result<(), MeshError> {
        let reply = StreamMessage::new(
            MessageMetadata {
                jid: meta.jid.clone(),
                gid: meta.gid.clone(),
                aid: meta.aid.clone(),
                dad: meta.dad.clone(),
                ts: now_iso(),
                code: Some(code),
                attempt: meta.attempt,
                trc: meta.trc.clone(),
                spn: meta.spn.clone(),
                oj: meta.oj.clone(),
                ..Default::default()
            },
            data,
        );
        self.store
            .publish_to_stream(&self.keys.engine_stream(), &reply)
            .await
            .map_err(|e| MeshError::Store(e.to_string()))?;
        debug!(jid = %meta.jid, code, "replied");
        Ok(())
    }
}

fn failure_wire(error: DurableError) -> (u32, Value) {
    let code = error.code();
    match error {
        DurableError::Activity(err) => (
            code,
            json!({ "message": err.message, "stack": err.stack }),
        ),
        other => (code, json!({ "message": other.to_string() })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshwork_store::MemoryMeshStore;
    use std::time::Duration;

    fn setup() -> (Arc<MemoryMeshStore>, Arc<DurableWorker>) {
        let store: Arc<MemoryMeshStore> = Arc::new(MemoryMeshStore::new());
        let worker = DurableWorker::new(
            store.clone() as Arc<dyn MeshStore>,
            WorkerConfig::new("mesh", "durable", "orders").with_guid("w1"),
        );
        (store, worker)
    }

    fn workflow_message(jid: &str, args: Value) -> StreamMessage {
        StreamMessage::new(
            MessageMetadata {
                jid: jid.into(),
                aid: "w1".into(),
                dad: "0".into(),
                ts: now_iso(),
                attempt: 1,
                ..Default::default()
            },
            json!({ "args": args, "topic": "orders.greet" }),
        )
    }

    async fn engine_reply(store: &MemoryMeshStore) -> StreamMessage {
        let keys = Keys::new("mesh", "durable");
        let entries = store
            .consume_batch(&keys.engine_stream(), "g", "t", 10, 0)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        entries.into_iter().next().unwrap().message
    }

    #[tokio::test]
    async fn test_return_value_maps_to_success() {
        let (store, worker) = setup();
        worker.register_workflow("greet", |_ctx, args| async move {
            Ok(json!(format!("hi {}", args[0].as_str().unwrap_or("?"))))
        });

        worker
            .process_workflow_message("greet", workflow_message("j1", json!(["ada"])))
            .await
            .unwrap();

        let reply = engine_reply(&store).await;
        assert_eq!(reply.metadata.code, Some(200));
        assert_eq!(reply.data["response"], json!("hi ada"));
        assert_eq!(reply.data["done"], json!(true));
    }

    #[tokio::test]
    async fn test_sleep_suspension_emits_588() {
        let (store, worker) = setup();
        worker.register_workflow("nap", |ctx, _args| async move {
            ctx.sleep_for(Duration::from_secs(2)).await?;
            Ok(json!("done"))
        });

        worker
            .process_workflow_message("nap", workflow_message("j1", json!([])))
            .await
            .unwrap();

        let reply = engine_reply(&store).await;
        assert_eq!(reply.metadata.code, Some(588));
        assert_eq!(reply.data["duration"], json!(2));
        assert_eq!(reply.data["index"], json!(0));
    }

    #[tokio::test]
    async fn test_wait_suspension_collates() {
        let (store, worker) = setup();
        worker.register_workflow("fanin", |ctx, _args| async move {
            let branches = vec![
                Box::pin({
                    let ctx = ctx.clone();
                    async move { ctx.wait_for::<Value>("A").await }
                }) as BoxFuture<'static, Result<Value, DurableError>>,
                Box::pin({
                    let ctx = ctx.clone();
                    async move { ctx.wait_for::<Value>("B").await }
                }),
            ];
            let values = ctx.all(branches).await?;
            Ok(json!(values))
        });

        worker
            .process_workflow_message("fanin", workflow_message("j1", json!([])))
            .await
            .unwrap();

        let reply = engine_reply(&store).await;
        assert_eq!(reply.metadata.code, Some(589));
        assert_eq!(reply.data["base_index"], json!(0));
        assert_eq!(reply.data["items"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_retryable_failure_emits_599() {
        let (store, worker) = setup();
        worker.register_workflow("flaky", |_ctx, _args| async move {
            Err(DurableError::Retryable("downstream 503".into()))
        });

        worker
            .process_workflow_message("flaky", workflow_message("j1", json!([])))
            .await
            .unwrap();

        let reply = engine_reply(&store).await;
        assert_eq!(reply.metadata.code, Some(599));
        assert!(reply.data["message"].as_str().unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_replay_resumes_past_sleep() {
        let (store, worker) = setup();
        let keys = Keys::new("mesh", "durable");

        // the engine stored the sleep marker after the first suspension
        store
            .hset(&keys.job("j1"), vec![("-l0-0-".into(), "null".into())])
            .await
            .unwrap();

        worker.register_workflow("nap", |ctx, _args| async move {
            ctx.sleep_for(Duration::from_secs(2)).await?;
            Ok(json!("done"))
        });

        worker
            .process_workflow_message("nap", workflow_message("j1", json!([])))
            .await
            .unwrap();

        let reply = engine_reply(&store).await;
        assert_eq!(reply.metadata.code, Some(200));
        assert_eq!(reply.data["response"], json!("done"));
    }

    #[tokio::test]
    async fn test_activity_dispatch_and_unknown_activity() {
        let (store, worker) = setup();
        worker.register_activity("double", |args| async move {
            let n = args[0].as_i64().unwrap_or(0);
            Ok(json!(n * 2))
        });

        let message = StreamMessage::new(
            MessageMetadata {
                jid: "j2".into(),
                aid: "w2".into(),
                dad: "0".into(),
                ts: now_iso(),
                attempt: 1,
                ..Default::default()
            },
            json!({ "activity": "double", "args": [21] }),
        );
        worker.process_activity_message(message.clone()).await.unwrap();
        let reply = engine_reply(&store).await;
        assert_eq!(reply.metadata.code, Some(200));
        assert_eq!(reply.data["response"], json!(42));

        let mut unknown = message;
        unknown.data["activity"] = json!("missing");
        worker.process_activity_message(unknown).await.unwrap();
        let reply = engine_reply(&store).await;
        assert_eq!(reply.metadata.code, Some(596));
    }

    #[test]
    fn test_topics_include_activity_stream() {
        let (_store, worker) = setup();
        worker.register_workflow("greet", |_ctx, _args| async move { Ok(json!(null)) });
        let topics = worker.topics();
        assert!(topics.contains(&"orders.greet".to_string()));
        assert!(topics.contains(&"orders.activity".to_string()));
    }
}
