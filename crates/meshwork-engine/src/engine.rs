//! The workflow interpreter
//!
//! The engine consumes transition messages from its app stream and drives
//! jobs through the activity graph. Each activity leg commits atomically via
//! the store's `commit_leg`; the job's status semaphore reaching `0.0`
//! triggers the completion path (exactly one publication per job).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use meshwork_core::manifest::{ActivityKind, AppManifest, Graph};
use meshwork_core::message::{now_iso, MessageMetadata, StreamMessage};
use meshwork_core::{codes, job, JobError, JobMetadata, JobOutput, MeshError};
use meshwork_store::{Keys, LegCommit, MeshStore, TaskKind, TimeHook};

use crate::activities;
use crate::config::EngineConfig;
use crate::quorum::{Quorum, ThrottleCache};
use crate::router::{Router, RouterConfig};

/// Options for `interrupt`.
#[derive(Debug, Clone, Default)]
pub struct InterruptOptions {
    /// Human-readable reason recorded in the job error.
    pub reason: Option<String>,

    /// Recursively interrupt child jobs.
    pub descend: bool,
}

/// Context attached when starting a job (parent linkage, tracing).
#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub jid: Option<String>,
    pub trc: Option<String>,
    pub spn: Option<String>,
    pub pj: Option<String>,
    pub pa: Option<String>,
    pub pd: Option<String>,
    pub oj: Option<String>,
    pub key: Option<String>,
}

/// The graph interpreter for one app.
pub struct Engine {
    store: Arc<dyn MeshStore>,
    keys: Keys,
    config: EngineConfig,
    manifest: parking_lot::RwLock<Option<Arc<AppManifest>>>,
    throttle: Arc<ThrottleCache>,
    quorum: parking_lot::RwLock<Option<Arc<Quorum>>>,
}

impl Engine {
    pub fn new(store: Arc<dyn MeshStore>, config: EngineConfig) -> Arc<Self> {
        let keys = Keys::new(&config.namespace, &config.app_id);
        let throttle = Arc::new(ThrottleCache::new(&config.guid));
        Arc::new(Self {
            store,
            keys,
            config,
            manifest: parking_lot::RwLock::new(None),
            throttle,
            quorum: parking_lot::RwLock::new(None),
        })
    }

    pub fn store(&self) -> &Arc<dyn MeshStore> {
        &self.store
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn throttle_cache(&self) -> Arc<ThrottleCache> {
        Arc::clone(&self.throttle)
    }

    /// Wire the quorum handle used for completion notifications.
    pub fn set_quorum(&self, quorum: Arc<Quorum>) {
        *self.quorum.write() = Some(quorum);
    }

    fn quorum(&self) -> Option<Arc<Quorum>> {
        self.quorum.read().clone()
    }

    /// Drop the manifest cache (version activation `nocache` phase).
    pub fn drop_manifest_cache(&self) {
        *self.manifest.write() = None;
    }

    /// The active manifest, cached after first load.
    pub async fn manifest(&self) -> Result<Arc<AppManifest>, MeshError> {
        if let Some(manifest) = self.manifest.read().clone() {
            return Ok(manifest);
        }
        let manifest = self
            .store
            .get_app(&self.config.app_id, None)
            .await
            .map_err(|e| MeshError::UnknownApp(format!("{}: {e}", self.config.app_id)))?;
        let manifest = Arc::new(manifest);
        *self.manifest.write() = Some(Arc::clone(&manifest));
        Ok(manifest)
    }

    // =========================================================================
    // Client entry points
    // =========================================================================

    /// Publish a job-start transition. Returns the job id.
    #[instrument(skip(self, data, context))]
    pub async fn start_job(
        &self,
        topic: &str,
        data: Value,
        context: Option<JobContext>,
    ) -> Result<String, MeshError> {
        // Validate the topic against the active manifest up front.
        let manifest = self.manifest().await?;
        manifest.graph_by_subscribes(topic)?;

        let context = context.unwrap_or_default();
        let jid = context
            .jid
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        let metadata = MessageMetadata {
            jid: jid.clone(),
            aid: String::new(),
            dad: "0".to_string(),
            tpc: Some(topic.to_string()),
            ts: now_iso(),
            trc: context.trc,
            spn: context.spn,
            pj: context.pj,
            pa: context.pa,
            pd: context.pd,
            oj: context.oj,
            key: context.key,
            ..Default::default()
        };

        self.store
            .publish_to_stream(
                &self.keys.engine_stream(),
                &StreamMessage::new(metadata, data),
            )
            .await
            .map_err(|e| MeshError::Store(e.to_string()))?;

        debug!(%jid, topic, "queued job start");
        Ok(jid)
    }

    /// Run the engine consumer loop until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let config = RouterConfig::new("engine", &self.config.guid)
            .with_batch_size(self.config.batch_size)
            .with_stale_threshold(self.config.stale_threshold);
        let router = Router::new(
            Arc::clone(&self.store),
            self.keys.engine_stream(),
            None,
            self.throttle_cache(),
            config,
        );

        let engine = Arc::clone(&self);
        router
            .run(
                move |message| {
                    let engine = Arc::clone(&engine);
                    async move {
                        if let Err(e) = engine.route_message(message).await {
                            warn!("message dropped: {}", e);
                        }
                        Ok(())
                    }
                },
                shutdown,
            )
            .await;
    }

    // =========================================================================
    // Message routing
    // =========================================================================

    /// Process one transition message (the unit the consumer loop dispatches;
    /// integration tests drive this directly).
    #[instrument(skip(self, message), fields(jid = %message.metadata.jid, aid = %message.metadata.aid))]
    pub async fn route_message(&self, message: StreamMessage) -> Result<(), MeshError> {
        let manifest = self.manifest().await?;

        // Control transitions carry no activity id: a bare one starts a job,
        // a coded one delivers a signal (595) or an interrupt (596).
        if message.metadata.aid.is_empty() {
            match message.metadata.code {
                None => {
                    let topic = message
                        .metadata
                        .tpc
                        .clone()
                        .ok_or_else(|| MeshError::UnknownTopic("<missing>".into()))?;
                    let graph = manifest.graph_by_subscribes(&topic)?;
                    return activities::trigger::run(self, &manifest, graph, &message).await;
                }
                Some(code) if codes::normalize(code) == codes::WAIT => {
                    let topic = message
                        .metadata
                        .tpc
                        .clone()
                        .ok_or_else(|| MeshError::UnknownTopic("<missing>".into()))?;
                    return self.deliver_signal(&topic, message.data, None).await;
                }
                Some(code) if code == codes::FATAL => {
                    let options = InterruptOptions {
                        reason: message
                            .data
                            .get("reason")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        descend: message
                            .data
                            .get("descend")
                            .and_then(Value::as_bool)
                            .unwrap_or(false),
                    };
                    return self.interrupt(&message.metadata.jid, options).await;
                }
                Some(code) => {
                    return Err(MeshError::fatal(format!(
                        "control message with unsupported code {code}"
                    )))
                }
            }
        }

        let (graph, def) = find_activity(&manifest, &message.metadata.aid)?;

        // Terminal jobs accept no further legs.
        let fields = self
            .store
            .hget_all(&self.keys.job(&message.metadata.jid))
            .await
            .map_err(|e| MeshError::Store(e.to_string()))?;
        if fields.is_empty() {
            return Err(MeshError::JobNotFound(message.metadata.jid.clone()));
        }
        if !job_open(&fields) {
            debug!("job is terminal; dropping message");
            return Ok(());
        }
        if let Some(gid) = &message.metadata.gid {
            let current = fields.get("md/gid").map(|g| job::field_to_value(g));
            if let Some(Value::String(current)) = current {
                if &current != gid {
                    debug!(stale = %gid, current = %current, "stale generation; dropping");
                    return Ok(());
                }
            }
        }

        match (message.metadata.code, def.kind) {
            (None, ActivityKind::Worker) => {
                activities::worker::enter(self, graph, &message, fields).await
            }
            (None, ActivityKind::Hook) => {
                activities::hook::enter(self, graph, &message, fields).await
            }
            (None, ActivityKind::Await) => {
                activities::awaiter::enter(self, graph, &message, fields).await
            }
            (None, ActivityKind::Cycle) => {
                activities::cycle::enter(self, graph, &message, fields).await
            }
            (None, ActivityKind::Signal) => {
                activities::signal::enter(self, graph, &message, fields).await
            }
            (Some(_), ActivityKind::Worker) => {
                activities::worker::leave(self, graph, &message, fields).await
            }
            (Some(_), ActivityKind::Hook) => {
                activities::hook::leave(self, graph, &message, fields).await
            }
            (Some(_), ActivityKind::Await) => {
                activities::awaiter::leave(self, graph, &message, fields).await
            }
            (code, kind) => Err(MeshError::fatal(format!(
                "no leg for {kind:?} with code {code:?}"
            ))),
        }
    }

    // =========================================================================
    // Shared leg plumbing (used by the activity kind handlers)
    // =========================================================================

    /// Build an enter-leg transition message.
    pub(crate) fn enter_message(
        &self,
        jid: &str,
        gid: Option<&str>,
        aid: &str,
        dad: &str,
        attempt: u32,
        data: Value,
    ) -> StreamMessage {
        StreamMessage::new(
            MessageMetadata {
                jid: jid.to_string(),
                gid: gid.map(str::to_string),
                aid: aid.to_string(),
                dad: dad.to_string(),
                ts: now_iso(),
                attempt,
                ..Default::default()
            },
            data,
        )
    }

    /// Finish a leave leg: write outputs and `job.maps`, evaluate
    /// transitions, enqueue the fan-out, and run the completion path when the
    /// semaphore lands on zero.
    pub(crate) async fn finish_leave(
        &self,
        graph: &Graph,
        message: &StreamMessage,
        mut fields: HashMap<String, String>,
        output: &Value,
        code: u32,
        extra_fields: Vec<(String, String)>,
    ) -> Result<(), MeshError> {
        let meta = &message.metadata;
        let aid = &meta.aid;
        let def = graph.activity(aid)?;

        let mut new_fields = extra_fields;
        job::flatten_fields(&format!("{aid}/output/data"), output, &mut new_fields);

        // Materialize the doc with this leg's outputs visible to the maps.
        fields.extend(new_fields.iter().cloned());
        let doc = job::materialize_doc(&fields);

        if let Some(section) = &def.job {
            let mapped = meshwork_core::map_rules(&section.maps, &doc)?;
            job::flatten_fields("d", &mapped, &mut new_fields);
        }

        let transitions =
            meshwork_core::eval_transitions(graph.transitions_from(aid), code, &doc)?;
        let gid = fields.get("md/gid").map(|g| trim_json_string(g));

        let mut publishes = Vec::with_capacity(transitions.len());
        for transition in &transitions {
            publishes.push((
                self.keys.engine_stream(),
                self.enter_message(&meta.jid, gid.as_deref(), &transition.to, &meta.dad, 0, json!({})),
            ));
        }

        let commit = LegCommit {
            job_key: self.keys.job(&meta.jid),
            fields: new_fields,
            status_delta: transitions.len() as f64 - 1.0,
            publishes,
            ..Default::default()
        };

        let status = self
            .store
            .commit_leg(commit)
            .await
            .map_err(|e| MeshError::Store(e.to_string()))?;

        if status == 0.0 {
            self.complete_job(graph, &meta.jid).await?;
        }
        Ok(())
    }

    /// Completion path: write `jc`, notify the mesh, resolve the parent, and
    /// schedule cleanup. Runs exactly once per job (the semaphore hits zero
    /// in exactly one leg commit).
    #[instrument(skip(self, graph))]
    pub(crate) async fn complete_job(&self, graph: &Graph, jid: &str) -> Result<(), MeshError> {
        let job_key = self.keys.job(jid);
        let jc = now_iso();
        self.store
            .hset(&job_key, vec![(job::md_field("jc"), json!(jc).to_string())])
            .await
            .map_err(|e| MeshError::Store(e.to_string()))?;

        let fields = self
            .store
            .hget_all(&job_key)
            .await
            .map_err(|e| MeshError::Store(e.to_string()))?;
        let metadata = JobMetadata::from_fields(&fields);
        let doc = job::materialize_doc(&fields);
        let data = doc.get("data").cloned().unwrap_or(Value::Null);
        let status = job_status(&fields);

        info!(%jid, status, "job completed");

        // Parent resolution (durable subflows and graph-level awaits).
        if let Some(pj) = metadata.pj.clone() {
            self.notify_parent(&metadata, &data, status).await?;
            debug!(parent = %pj, "resolved parent linkage");
        }

        if let Some(quorum) = self.quorum() {
            quorum
                .publish_job(graph.publishes.clone(), jid, status, data)
                .await
                .map_err(|e| MeshError::Store(e.to_string()))?;
        }

        if let Some(expire) = metadata.expire.or(graph.expire) {
            let wake_ms = Utc::now().timestamp_millis() + (expire as i64) * 1000;
            let slot = self.config.slot_for(wake_ms);
            self.store
                .register_time_hook(TimeHook {
                    list_key: self.keys.time_slot(slot),
                    target: jid.to_string(),
                    gid: metadata.gid.clone(),
                    aid: String::new(),
                    dad: "0".to_string(),
                    sid: None,
                    kind: TaskKind::Expire,
                    slot_ms: slot,
                })
                .await
                .map_err(|e| MeshError::Store(e.to_string()))?;
        }

        Ok(())
    }

    /// Deliver a completed child's result to its parent.
    async fn notify_parent(
        &self,
        child: &JobMetadata,
        data: &Value,
        status: f64,
    ) -> Result<(), MeshError> {
        let (Some(pj), Some(pa)) = (child.pj.clone(), child.pa.clone()) else {
            return Ok(());
        };
        let pd = child.pd.clone().unwrap_or_else(|| "0".to_string());

        let manifest = self.manifest().await?;
        let Ok((_, parent_def)) = find_activity(&manifest, &pa) else {
            warn!(parent_activity = %pa, "parent activity not found; skipping notification");
            return Ok(());
        };

        let failed = status <= codes::INTERRUPTED_FLOOR || data.get("$error").is_some();
        let code = if failed {
            data.get("$error")
                .and_then(|e| e.get("code"))
                .and_then(Value::as_u64)
                .map(|c| c as u32)
                .unwrap_or(codes::FATAL)
        } else {
            codes::SUCCESS
        };

        match parent_def.kind {
            ActivityKind::Worker => {
                // Durable subflow: store the result at the parent's replay
                // slot, then re-enter the parent when nothing remains pending.
                // A child without a slot was started fire-and-forget; its
                // completion must not touch the parent.
                let Some(sid) = child.key.clone() else {
                    return Ok(());
                };
                let value = if failed {
                    data.get("$error").cloned().unwrap_or(json!({
                        "message": "interrupted", "code": code
                    }))
                } else {
                    data.get("response").cloned().unwrap_or_else(|| data.clone())
                };
                self.resolve_parent_session(&pj, &pa, &pd, &sid, value, failed)
                    .await
            }
            _ => {
                // Graph-level await: a leave leg for the awaiting activity.
                let mut message =
                    self.enter_message(&pj, None, &pa, &pd, 0, data.clone());
                message.metadata.code = Some(code);
                self.store
                    .publish_to_stream(&self.keys.engine_stream(), &message)
                    .await
                    .map_err(|e| MeshError::Store(e.to_string()))?;
                Ok(())
            }
        }
    }

    /// Write a subflow result into the parent's replay slot and re-enter the
    /// parent worker once the dimension has no outstanding subflows.
    pub(crate) async fn resolve_parent_session(
        &self,
        jid: &str,
        aid: &str,
        dad: &str,
        sid: &str,
        value: Value,
        is_error: bool,
    ) -> Result<(), MeshError> {
        let job_key = self.keys.job(jid);

        if !sid.is_empty() {
            let stored = if is_error {
                json!({ "$error": value })
            } else {
                value
            };
            self.store
                .hset(&job_key, vec![(sid.to_string(), stored.to_string())])
                .await
                .map_err(|e| MeshError::Store(e.to_string()))?;
        }

        let pending_field = job::pending_field(dad);
        let pending = self
            .store
            .hget(&job_key, &pending_field)
            .await
            .map_err(|e| MeshError::Store(e.to_string()))?;

        if pending.is_some() {
            let remaining = self
                .store
                .hincrby_float(&job_key, &pending_field, -1.0)
                .await
                .map_err(|e| MeshError::Store(e.to_string()))?;
            if remaining > 0.0 {
                debug!(%jid, remaining, "collation still pending");
                return Ok(());
            }
            self.store
                .hdel(&job_key, &[pending_field])
                .await
                .map_err(|e| MeshError::Store(e.to_string()))?;
        }

        self.reenter_worker(jid, aid, dad).await
    }

    /// Queue a worker re-entry (replay) for a suspended dimension.
    pub async fn reenter_worker(&self, jid: &str, aid: &str, dad: &str) -> Result<(), MeshError> {
        let message = self.enter_message(jid, None, aid, dad, 0, json!({}));
        self.store
            .publish_to_stream(&self.keys.engine_stream(), &message)
            .await
            .map_err(|e| MeshError::Store(e.to_string()))?;
        debug!(%jid, %aid, %dad, "queued worker re-entry");
        Ok(())
    }

    // =========================================================================
    // Signals
    // =========================================================================

    /// Deliver a hook signal. Consumes the matching binding (single
    /// delivery); an early signal with no binding yet persists until a
    /// binding claims it.
    #[instrument(skip(self, data))]
    pub async fn deliver_signal(
        &self,
        topic: &str,
        data: Value,
        code: Option<u32>,
    ) -> Result<(), MeshError> {
        let manifest = self.manifest().await?;
        let resolved = self.resolve_signal_key(&manifest, topic, &data)?;

        let target = self
            .store
            .get_hook_signal(topic, &resolved)
            .await
            .map_err(|e| MeshError::Store(e.to_string()))?;

        let Some(target) = target else {
            // Delivery-before-registration: persist until TTL; registration
            // will find it and win.
            self.store
                .hset(
                    &self.keys.hook_signals(),
                    vec![(format!("{topic}|{resolved}"), data.to_string())],
                )
                .await
                .map_err(|e| MeshError::Store(e.to_string()))?;
            debug!(topic, resolved, "no binding yet; persisted early signal");
            return Ok(());
        };

        self.dispatch_hook_delivery(&manifest, target, topic, data, code)
            .await
    }

    /// Route a consumed binding to its target kind.
    pub(crate) async fn dispatch_hook_delivery(
        &self,
        manifest: &AppManifest,
        target: meshwork_store::HookTarget,
        topic: &str,
        data: Value,
        code: Option<u32>,
    ) -> Result<(), MeshError> {
        let (_, def) = find_activity(manifest, &target.aid)?;
        match def.kind {
            ActivityKind::Worker => {
                if let Some(sid) = &target.sid {
                    // waitFor resolution.
                    self.resolve_parent_session(
                        &target.job_id,
                        &target.aid,
                        &target.dad,
                        sid,
                        data,
                        false,
                    )
                    .await
                } else {
                    // Job re-entry hook: a fresh dimension gives the hook
                    // function its private counter space.
                    let job_key = self.keys.job(&target.job_id);
                    let n = self
                        .store
                        .hincrby_float(&job_key, &job::search_field(&target.dad, 0), 1.0)
                        .await
                        .map_err(|e| MeshError::Store(e.to_string()))?;
                    let dad = format!("{},{}", target.dad, n as i64);
                    let message =
                        self.enter_message(&target.job_id, None, &target.aid, &dad, 0, data);
                    self.store
                        .publish_to_stream(&self.keys.engine_stream(), &message)
                        .await
                        .map_err(|e| MeshError::Store(e.to_string()))?;
                    Ok(())
                }
            }
            _ => {
                // Graph hook activity: complete its leave leg.
                let mut message =
                    self.enter_message(&target.job_id, None, &target.aid, &target.dad, 0, data);
                message.metadata.code = Some(code.unwrap_or(codes::SUCCESS));
                message.metadata.tpc = Some(topic.to_string());
                self.store
                    .publish_to_stream(&self.keys.engine_stream(), &message)
                    .await
                    .map_err(|e| MeshError::Store(e.to_string()))?;
                Ok(())
            }
        }
    }

    /// Compute the binding key an inbound signal resolves to.
    fn resolve_signal_key(
        &self,
        manifest: &AppManifest,
        topic: &str,
        data: &Value,
    ) -> Result<String, MeshError> {
        for graph in &manifest.graphs {
            for def in graph.activities.values() {
                if let Some(hook) = &def.hook {
                    if hook.topic == topic {
                        if let Some(resolver) = &hook.resolver {
                            let doc = json!({ "data": data });
                            let resolved = meshwork_core::resolve_expr(resolver, &doc)?;
                            return Ok(value_to_plain(&resolved));
                        }
                    }
                }
            }
        }
        // Durable waitFor bindings key on the signal topic itself.
        Ok(topic.to_string())
    }

    /// Claim an early (pre-registration) signal for `(topic, resolved)`.
    pub(crate) async fn take_early_signal(
        &self,
        topic: &str,
        resolved: &str,
    ) -> Result<Option<Value>, MeshError> {
        let key = self.keys.hook_signals();
        let field = format!("{topic}|{resolved}");
        let payload = self
            .store
            .hget(&key, &field)
            .await
            .map_err(|e| MeshError::Store(e.to_string()))?;
        if payload.is_some() {
            self.store
                .hdel(&key, &[field])
                .await
                .map_err(|e| MeshError::Store(e.to_string()))?;
        }
        Ok(payload.map(|p| job::field_to_value(&p)))
    }

    // =========================================================================
    // Interrupt / cleanup
    // =========================================================================

    /// Interrupt a running job: reserved-negative status, cancelled time
    /// hooks, optional descent into children. No-op on terminal jobs.
    #[instrument(skip(self, options))]
    pub async fn interrupt(
        &self,
        jid: &str,
        options: InterruptOptions,
    ) -> Result<(), MeshError> {
        let job_key = self.keys.job(jid);
        let fields = self
            .store
            .hget_all(&job_key)
            .await
            .map_err(|e| MeshError::Store(e.to_string()))?;
        if fields.is_empty() {
            return Err(MeshError::JobNotFound(jid.to_string()));
        }
        if !job_open(&fields) {
            debug!(%jid, "already terminal; interrupt is a no-op");
            return Ok(());
        }

        let reason = options
            .reason
            .clone()
            .unwrap_or_else(|| "interrupted".to_string());
        let error = JobError::new(&reason, codes::FATAL);

        let mut commit = LegCommit::for_job(job_key.clone());
        commit.set_status = Some(codes::INTERRUPTED_FLOOR - 1.0);
        commit.fields = vec![
            (job::md_field("jc"), json!(now_iso()).to_string()),
            (
                job::data_field("$error"),
                serde_json::to_value(&error)?.to_string(),
            ),
        ];
        let status = self
            .store
            .commit_leg(commit)
            .await
            .map_err(|e| MeshError::Store(e.to_string()))?;

        self.store
            .cancel_time_hooks(jid)
            .await
            .map_err(|e| MeshError::Store(e.to_string()))?;

        if let Some(quorum) = self.quorum() {
            let manifest = self.manifest().await?;
            let metadata = JobMetadata::from_fields(&fields);
            let publishes = manifest
                .graph_by_subscribes(&metadata.tpc)
                .ok()
                .and_then(|g| g.publishes.clone());
            quorum
                .publish_job(publishes, jid, status, json!({ "$error": error }))
                .await
                .map_err(|e| MeshError::Store(e.to_string()))?;
        }

        if options.descend {
            let children: Vec<String> = fields
                .keys()
                .filter_map(|f| f.strip_prefix("ch/"))
                .map(str::to_string)
                .collect();
            for child in children {
                if let Err(e) = Box::pin(self.interrupt(&child, options.clone())).await {
                    warn!(child = %child, "descend interrupt failed: {}", e);
                }
            }
        }

        info!(%jid, "interrupted");
        Ok(())
    }

    /// TTL cleanup: drop the job HASH.
    pub async fn expire_job(&self, jid: &str) -> Result<(), MeshError> {
        self.store
            .delete_job(&self.keys.job(jid))
            .await
            .map_err(|e| MeshError::Store(e.to_string()))?;
        debug!(%jid, "expired job record");
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_status(&self, jid: &str) -> Result<f64, MeshError> {
        let status = self
            .store
            .hget(&self.keys.job(jid), job::STATUS_FIELD)
            .await
            .map_err(|e| MeshError::Store(e.to_string()))?
            .ok_or_else(|| MeshError::JobNotFound(jid.to_string()))?;
        status
            .parse()
            .map_err(|_| MeshError::Store(format!("bad status value: {status}")))
    }

    pub async fn get_state(&self, jid: &str) -> Result<JobOutput, MeshError> {
        let fields = self
            .store
            .hget_all(&self.keys.job(jid))
            .await
            .map_err(|e| MeshError::Store(e.to_string()))?;
        if fields.is_empty() {
            return Err(MeshError::JobNotFound(jid.to_string()));
        }
        let doc = job::materialize_doc(&fields);
        Ok(JobOutput {
            metadata: JobMetadata::from_fields(&fields),
            data: doc.get("data").cloned().unwrap_or(Value::Null),
        })
    }
}

// Free helpers shared with the activity handlers.

/// Locate an activity id across the manifest's graphs.
pub(crate) fn find_activity<'a>(
    manifest: &'a AppManifest,
    aid: &str,
) -> Result<(&'a Graph, &'a meshwork_core::ActivityDef), MeshError> {
    for graph in &manifest.graphs {
        if let Some(def) = graph.activities.get(aid) {
            return Ok((graph, def));
        }
    }
    Err(MeshError::UnknownActivity(aid.to_string()))
}

/// A job is open while it has no completion timestamp and a status above the
/// interrupted floor.
pub(crate) fn job_open(fields: &HashMap<String, String>) -> bool {
    if fields.contains_key("md/jc") {
        return false;
    }
    job_status(fields) > codes::INTERRUPTED_FLOOR
}

pub(crate) fn job_status(fields: &HashMap<String, String>) -> f64 {
    fields
        .get(job::STATUS_FIELD)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0)
}

/// Strip the JSON quoting from a stored string scalar.
pub(crate) fn trim_json_string(raw: &str) -> String {
    match job::field_to_value(raw) {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Render a resolved value as a plain (unquoted) match key.
pub(crate) fn value_to_plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_open_checks() {
        let mut fields = HashMap::new();
        fields.insert(":".to_string(), "2".to_string());
        assert!(job_open(&fields));

        fields.insert(":".to_string(), "-100000001".to_string());
        assert!(!job_open(&fields));

        let mut fields = HashMap::new();
        fields.insert(":".to_string(), "0".to_string());
        fields.insert("md/jc".to_string(), "\"2026-08-01T00:00:00Z\"".to_string());
        assert!(!job_open(&fields));
    }

    #[test]
    fn test_trim_json_string() {
        assert_eq!(trim_json_string("\"g1\""), "g1");
        assert_eq!(trim_json_string("42"), "42");
    }
}
