//! The mesh client facade

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use meshwork_core::manifest::AppManifest;
use meshwork_core::message::{now_iso, MessageMetadata, StreamMessage};
use meshwork_core::{codes, job, JobError, JobExport, JobMetadata, JobOutput, MeshError};
use meshwork_durable::{durable_manifest, DurableWorker};
use meshwork_engine::quorum::{CacheMode, Quorum, QuorumMessage, QuorumProfile};
use meshwork_engine::{Engine, EngineConfig, InterruptOptions, Scout, ScoutConfig};
use meshwork_store::{Keys, MeshStore, ThrottleSpec};

/// Configuration for one mesh member.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub namespace: String,
    pub app_id: String,
    pub guid: String,

    /// Run the engine consumer loop (pure workers set this false).
    pub engine: bool,

    /// Participate in time-scout election.
    pub scout: bool,

    pub fidelity_secs: u64,
}

impl ClientConfig {
    pub fn new(namespace: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            app_id: app_id.into(),
            guid: format!("member-{}", Uuid::now_v7()),
            engine: true,
            scout: true,
            fidelity_secs: 60,
        }
    }

    pub fn with_guid(mut self, guid: impl Into<String>) -> Self {
        self.guid = guid.into();
        self
    }

    pub fn engine_only(mut self) -> Self {
        self.scout = false;
        self
    }

    pub fn worker_only(mut self) -> Self {
        self.engine = false;
        self.scout = false;
        self
    }

    pub fn with_fidelity_secs(mut self, secs: u64) -> Self {
        self.fidelity_secs = secs;
        self
    }
}

/// One mesh member: engine + quorum + scout + attached workers.
pub struct MeshClient {
    store: Arc<dyn MeshStore>,
    keys: Keys,
    config: ClientConfig,
    engine: Arc<Engine>,
    quorum: Arc<Quorum>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    subscriptions: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl MeshClient {
    /// Start a mesh member and join the quorum.
    #[instrument(skip(store, config), fields(app = %config.app_id, guid = %config.guid))]
    pub async fn init(
        store: Arc<dyn MeshStore>,
        config: ClientConfig,
    ) -> Result<Arc<Self>, MeshError> {
        let keys = Keys::new(&config.namespace, &config.app_id);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let engine_config = EngineConfig::new(&config.namespace, &config.app_id)
            .with_guid(&config.guid)
            .with_fidelity_secs(config.fidelity_secs);
        let engine = Engine::new(Arc::clone(&store), engine_config);

        let quorum = Arc::new(Quorum::new(
            Arc::clone(&store),
            keys.clone(),
            &config.guid,
            engine.throttle_cache(),
        ));
        quorum.join(shutdown_rx.clone()).await
            .map_err(|e| MeshError::Store(e.to_string()))?;
        engine.set_quorum(Arc::clone(&quorum));

        if config.engine {
            let engine_loop = Arc::clone(&engine);
            tokio::spawn(engine_loop.run(shutdown_rx.clone()));
        }

        if config.scout {
            let scout = Scout::new(Arc::clone(&engine), ScoutConfig::default());
            let scout_shutdown = shutdown_rx.clone();
            tokio::spawn(async move { scout.run(scout_shutdown).await });
        }

        let client = Arc::new(Self {
            store,
            keys,
            config,
            engine,
            quorum,
            shutdown_tx,
            shutdown_rx,
            subscriptions: Mutex::new(HashMap::new()),
        });

        // Version activation: drop the manifest cache on both phases; the
        // next message load re-primes it against the active pointer.
        let activation = Arc::clone(&client);
        let mut events = client.quorum.subscribe();
        let mut shutdown = client.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(QuorumMessage::Activate { version, cache_mode }) => {
                            debug!(%version, ?cache_mode, "activation phase");
                            activation.engine.drop_manifest_cache();
                            if cache_mode == CacheMode::Cache {
                                let _ = activation.engine.manifest().await;
                            }
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });

        info!("mesh member initialized");
        Ok(client)
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn store(&self) -> &Arc<dyn MeshStore> {
        &self.store
    }

    pub fn guid(&self) -> &str {
        &self.config.guid
    }

    /// Attach a durable worker: its consumers run under this member's
    /// shutdown channel and its topics join the roll-call profile.
    pub async fn attach_worker(&self, worker: &Arc<DurableWorker>) {
        worker.run(self.shutdown_rx.clone()).await;
        self.quorum.set_profile(QuorumProfile {
            guid: self.config.guid.clone(),
            engine: self.config.engine,
            worker_topics: worker.topics(),
            throttle_ms: 0,
            stream_depth: 0,
        });
    }

    /// Signal every loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        info!("mesh member shutting down");
    }

    // =========================================================================
    // Deployment
    // =========================================================================

    /// Write an inactive manifest version.
    pub async fn deploy(&self, manifest: AppManifest) -> Result<AppManifest, MeshError> {
        self.store
            .set_app(&manifest)
            .await
            .map_err(|e| MeshError::Store(e.to_string()))?;
        info!(version = %manifest.version, "deployed manifest");
        Ok(manifest)
    }

    pub async fn deploy_yaml(&self, source: &str) -> Result<AppManifest, MeshError> {
        self.deploy(AppManifest::from_yaml(source)?).await
    }

    pub async fn deploy_path(&self, path: impl AsRef<Path>) -> Result<AppManifest, MeshError> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| MeshError::Store(format!("manifest read failed: {e}")))?;
        self.deploy_yaml(&source).await
    }

    /// Deploy and activate the built-in durable app (idempotent).
    pub async fn deploy_durable(&self) -> Result<(), MeshError> {
        let manifest = durable_manifest(&self.config.app_id);
        let version = manifest.version.clone();
        self.deploy(manifest).await?;
        self.activate(&version, Duration::ZERO).await?;
        Ok(())
    }

    /// Coordinated version switch-over.
    pub async fn activate(&self, version: &str, delay: Duration) -> Result<bool, MeshError> {
        self.quorum
            .activate(&self.config.app_id, version, delay)
            .await
            .map_err(|e| MeshError::Store(e.to_string()))
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Fire-and-forget: start a job, return its id. Workflow errors never
    /// surface here.
    pub async fn pub_job(
        &self,
        topic: &str,
        data: Value,
        context: Option<meshwork_engine::engine::JobContext>,
    ) -> Result<String, MeshError> {
        self.engine.start_job(topic, data, context).await
    }

    /// Start a job and await its completion notification. The timeout is
    /// client-side only — it stops the wait, never the job.
    #[instrument(skip(self, data, context))]
    pub async fn pubsub(
        &self,
        topic: &str,
        data: Value,
        context: Option<meshwork_engine::engine::JobContext>,
        timeout: Duration,
    ) -> Result<JobOutput, MeshError> {
        let mut events = self.quorum.subscribe();
        let jid = self.pub_job(topic, data, context).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(MeshError::PubSubTimeout(jid));
            }
            match tokio::time::timeout(remaining, events.recv()).await {
                Ok(Ok(QuorumMessage::Job {
                    jid: done,
                    status,
                    data,
                    ..
                })) if done == jid => {
                    if let Some(error) = data.get("$error") {
                        let error: JobError = serde_json::from_value(error.clone())?;
                        return Err(job_error_to_mesh(error));
                    }
                    if status <= codes::INTERRUPTED_FLOOR {
                        return Err(MeshError::fatal(format!("job {jid} interrupted")));
                    }
                    return self.get_state(&jid).await;
                }
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => return Err(MeshError::Store("quorum channel closed".into())),
                Err(_) => return Err(MeshError::PubSubTimeout(jid)),
            }
        }
    }

    /// Subscribe to completion notifications for one publish topic.
    pub fn sub<F>(&self, topic: &str, callback: F)
    where
        F: Fn(String, Value) + Send + Sync + 'static,
    {
        self.subscribe_internal(topic.to_string(), false, callback);
    }

    /// Pattern variant: `orders.*` matches any suffix.
    pub fn psub<F>(&self, pattern: &str, callback: F)
    where
        F: Fn(String, Value) + Send + Sync + 'static,
    {
        self.subscribe_internal(pattern.to_string(), true, callback);
    }

    pub fn unsub(&self, topic: &str) {
        if let Some(handle) = self.subscriptions.lock().remove(topic) {
            handle.abort();
        }
    }

    pub fn punsub(&self, pattern: &str) {
        self.unsub(pattern);
    }

    fn subscribe_internal<F>(&self, pattern: String, wildcard: bool, callback: F)
    where
        F: Fn(String, Value) + Send + Sync + 'static,
    {
        let mut events = self.quorum.subscribe();
        let mut shutdown = self.shutdown_rx.clone();
        let key = pattern.clone();
        let handle = tokio::spawn(async move {
            let prefix = pattern.strip_suffix('*').map(str::to_string);
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(QuorumMessage::Job { topic: Some(topic), jid, data, .. }) => {
                            let hit = if wildcard {
                                prefix.as_deref().map(|p| topic.starts_with(p)).unwrap_or(false)
                            } else {
                                topic == pattern
                            };
                            if hit {
                                callback(jid, data);
                            }
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });
        if let Some(stale) = self.subscriptions.lock().insert(key, handle) {
            stale.abort();
        }
    }

    // =========================================================================
    // Signals / interrupt / cleanup
    // =========================================================================

    /// Deliver a hook signal; returns the control stream entry id.
    pub async fn signal(
        &self,
        topic: &str,
        data: Value,
        code: Option<u32>,
    ) -> Result<String, MeshError> {
        let message = StreamMessage::new(
            MessageMetadata {
                jid: Uuid::now_v7().to_string(),
                aid: String::new(),
                dad: "0".to_string(),
                tpc: Some(topic.to_string()),
                ts: now_iso(),
                code: Some(code.map(codes::normalize).unwrap_or(codes::WAIT)),
                ..Default::default()
            },
            data,
        );
        self.store
            .publish_to_stream(&self.keys.engine_stream(), &message)
            .await
            .map_err(|e| MeshError::Store(e.to_string()))
    }

    /// Interrupt a running job; returns the control stream entry id.
    pub async fn interrupt(
        &self,
        _topic: &str,
        jid: &str,
        options: InterruptOptions,
    ) -> Result<String, MeshError> {
        let message = StreamMessage::new(
            MessageMetadata {
                jid: jid.to_string(),
                aid: String::new(),
                dad: "0".to_string(),
                ts: now_iso(),
                code: Some(codes::FATAL),
                ..Default::default()
            },
            json!({
                "reason": options.reason,
                "descend": options.descend,
            }),
        );
        self.store
            .publish_to_stream(&self.keys.engine_stream(), &message)
            .await
            .map_err(|e| MeshError::Store(e.to_string()))
    }

    /// Remove a job record entirely.
    pub async fn scrub(&self, jid: &str) -> Result<(), MeshError> {
        self.engine.expire_job(jid).await
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_status(&self, jid: &str) -> Result<f64, MeshError> {
        self.engine.get_status(jid).await
    }

    pub async fn get_state(&self, jid: &str) -> Result<JobOutput, MeshError> {
        self.engine.get_state(jid).await
    }

    /// The raw HASH record.
    pub async fn get_raw(&self, jid: &str) -> Result<HashMap<String, String>, MeshError> {
        let fields = self
            .store
            .hget_all(&self.keys.job(jid))
            .await
            .map_err(|e| MeshError::Store(e.to_string()))?;
        if fields.is_empty() {
            return Err(MeshError::JobNotFound(jid.to_string()));
        }
        Ok(fields)
    }

    /// Selected user-data fields by dotted path.
    pub async fn get_query_state(
        &self,
        jid: &str,
        fields: &[&str],
    ) -> Result<HashMap<String, Value>, MeshError> {
        let job_key = self.keys.job(jid);
        let mut out = HashMap::with_capacity(fields.len());
        for field in fields {
            let raw = self
                .store
                .hget(&job_key, &job::data_field(field))
                .await
                .map_err(|e| MeshError::Store(e.to_string()))?;
            let value = raw
                .map(|r| job::field_to_value(&r))
                .unwrap_or(Value::Null);
            out.insert(field.to_string(), value);
        }
        Ok(out)
    }

    /// Full diagnostic dump of a job record.
    pub async fn export(&self, jid: &str) -> Result<JobExport, MeshError> {
        let fields = self.get_raw(jid).await?;
        let doc = job::materialize_doc(&fields);
        let metadata = JobMetadata::from_fields(&fields);
        let status = fields
            .get(job::STATUS_FIELD)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);

        let mut replay = HashMap::new();
        let mut activities = HashMap::new();
        for (field, raw) in &fields {
            if job::is_session_field(field) {
                replay.insert(field.clone(), job::field_to_value(raw));
            }
        }
        if let Some(map) = doc.as_object() {
            for (key, value) in map {
                if key != "metadata" && key != "data" {
                    activities.insert(key.clone(), value.clone());
                }
            }
        }

        Ok(JobExport {
            status,
            metadata,
            data: doc.get("data").cloned().unwrap_or(Value::Null),
            replay,
            activities,
        })
    }

    // =========================================================================
    // Quorum surface
    // =========================================================================

    pub async fn roll_call(&self, delay: Duration) -> Result<Vec<QuorumProfile>, MeshError> {
        self.quorum
            .roll_call(delay)
            .await
            .map_err(|e| MeshError::Store(e.to_string()))
    }

    pub async fn throttle(&self, spec: ThrottleSpec) -> Result<(), MeshError> {
        self.quorum
            .throttle(spec)
            .await
            .map_err(|e| MeshError::Store(e.to_string()))
    }

    pub async fn pub_quorum(&self, payload: Value) -> Result<(), MeshError> {
        self.quorum
            .pub_user(None, payload)
            .await
            .map_err(|e| MeshError::Store(e.to_string()))
    }

    pub fn sub_quorum(&self) -> tokio::sync::broadcast::Receiver<QuorumMessage> {
        self.quorum.subscribe()
    }
}

fn job_error_to_mesh(error: JobError) -> MeshError {
    match error.code {
        codes::RETRYABLE => MeshError::Retryable {
            message: error.message,
        },
        codes::MAX_ATTEMPTS => MeshError::MaxAttempts {
            message: error.message,
        },
        codes::TIMEOUT => MeshError::Timeout {
            message: error.message,
        },
        _ => MeshError::Fatal {
            message: error.message,
        },
    }
}
