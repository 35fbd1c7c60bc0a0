//! Quorum: the LISTEN/NOTIFY coordination plane
//!
//! Every mesh member joins `{ns}:q:{app}` (plus a guid-targeted subchannel)
//! on init. Messages are best-effort, at-most-once, and never persisted —
//! durable state always flows through the store, the quorum only coordinates:
//! roll call, throttling, coordinated version activation, workflow-completion
//! fan-out, and opaque user broadcasts.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};

use meshwork_store::{Keys, MeshStore, StoreError, ThrottleSpec};

/// Throttle value meaning "paused" (`throttle: -1` maps here).
pub const MAX_DELAY_MS: i64 = i32::MAX as i64;

/// Per-member profile reported during roll call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct QuorumProfile {
    pub guid: String,

    /// Whether this member runs an engine (vs a pure worker).
    pub engine: bool,

    /// Worker topics served by this member.
    #[serde(default)]
    pub worker_topics: Vec<String>,

    /// The member's current effective throttle.
    pub throttle_ms: i64,

    /// Approximate depth of the member's consume backlog.
    pub stream_depth: u64,
}

/// Version-activation phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Drop manifest caches; route from the store until `Cache` arrives.
    NoCache,
    /// Re-prime manifest caches against the newly active version.
    Cache,
}

/// Messages on the quorum channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuorumMessage {
    Ping {
        guid: String,
    },
    Pong {
        profile: QuorumProfile,
    },
    Throttle {
        throttle: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        guid: Option<String>,
    },
    Activate {
        version: String,
        cache_mode: CacheMode,
    },
    /// Workflow completion notification (fanned out to local subscribers).
    Job {
        topic: Option<String>,
        jid: String,
        status: f64,
        data: serde_json::Value,
    },
    /// Opaque application broadcast.
    User {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
        payload: serde_json::Value,
    },
    Work {
        guid: String,
    },
    Cron {},
}

/// In-memory throttle cache, fed by quorum traffic and seeded from the store
/// so late joiners inherit the current rates.
pub struct ThrottleCache {
    guid: String,
    rates: DashMap<String, i64>,
}

impl ThrottleCache {
    pub fn new(guid: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            rates: DashMap::new(),
        }
    }

    /// Record a rate. `-1` pauses (maps to [`MAX_DELAY_MS`]), `0` resumes.
    pub fn set(&self, topic: Option<&str>, guid: Option<&str>, throttle: i64) {
        if let Some(target) = guid {
            if target != self.guid {
                return;
            }
        }
        let scope = match (guid, topic) {
            (Some(_), _) => "guid".to_string(),
            (None, Some(topic)) => format!("t:{topic}"),
            (None, None) => "app".to_string(),
        };
        let rate = if throttle < 0 { MAX_DELAY_MS } else { throttle };
        self.rates.insert(scope, rate);
    }

    /// Effective delay for a topic; precedence guid > topic > app.
    pub fn effective(&self, topic: Option<&str>) -> i64 {
        if let Some(rate) = self.rates.get("guid") {
            return *rate;
        }
        if let Some(topic) = topic {
            if let Some(rate) = self.rates.get(&format!("t:{topic}")) {
                return *rate;
            }
        }
        self.rates.get("app").map(|r| *r).unwrap_or(0)
    }

    /// Seed the cache from persisted rates (join-time inheritance).
    pub async fn seed(&self, store: &dyn MeshStore, topic: Option<&str>) -> Result<(), StoreError> {
        let rate = store.get_throttle_rate(topic, Some(&self.guid)).await?;
        if rate != 0 {
            self.set(topic, None, rate);
        }
        Ok(())
    }
}

/// Handle to the quorum plane for one mesh member.
pub struct Quorum {
    store: Arc<dyn MeshStore>,
    keys: Keys,
    guid: String,
    throttle_cache: Arc<ThrottleCache>,
    profiles: Arc<DashMap<String, QuorumProfile>>,
    events_tx: broadcast::Sender<QuorumMessage>,
    self_profile: parking_lot::RwLock<QuorumProfile>,
}

/// A parsed quorum message delivered to local subscribers.
pub type QuorumEvent = QuorumMessage;

impl Quorum {
    pub fn new(
        store: Arc<dyn MeshStore>,
        keys: Keys,
        guid: impl Into<String>,
        throttle: Arc<ThrottleCache>,
    ) -> Self {
        let guid = guid.into();
        let (events_tx, _) = broadcast::channel(256);
        Self {
            store,
            keys,
            throttle_cache: throttle,
            profiles: Arc::new(DashMap::new()),
            events_tx,
            self_profile: parking_lot::RwLock::new(QuorumProfile {
                guid: guid.clone(),
                engine: true,
                ..Default::default()
            }),
            guid,
        }
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    /// Subscribe to every parsed quorum message (client `sub`/`psub` and the
    /// engine's activation handling are built on this).
    pub fn subscribe(&self) -> broadcast::Receiver<QuorumMessage> {
        self.events_tx.subscribe()
    }

    /// Update the profile reported in `pong` replies.
    pub fn set_profile(&self, profile: QuorumProfile) {
        *self.self_profile.write() = profile;
    }

    /// LISTEN on the app channel and the guid subchannel, pumping messages
    /// through [`handle`](Self::handle) until shutdown.
    #[instrument(skip(self, shutdown), fields(guid = %self.guid))]
    pub async fn join(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), StoreError> {
        let mut app_rx = self.store.listen(&self.keys.quorum()).await?;
        let mut guid_rx = self.store.listen(&self.keys.quorum_guid(&self.guid)).await?;
        self.throttle_cache.seed(self.store.as_ref(), None).await?;

        let quorum = Arc::clone(self);
        tokio::spawn(async move {
            info!(guid = %quorum.guid, "joined quorum");
            loop {
                tokio::select! {
                    payload = app_rx.recv() => match payload {
                        Ok(payload) => quorum.dispatch(&payload).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "quorum receiver lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    payload = guid_rx.recv() => match payload {
                        Ok(payload) => quorum.dispatch(&payload).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "quorum receiver lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => {
                        debug!("quorum loop: shutdown requested");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    async fn dispatch(&self, payload: &str) {
        let message: QuorumMessage = match serde_json::from_str(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("unparseable quorum payload: {}", e);
                return;
            }
        };

        match &message {
            QuorumMessage::Ping { guid } => {
                debug!(from = %guid, "quorum ping");
                let profile = {
                    let mut profile = self.self_profile.read().clone();
                    profile.throttle_ms = self.throttle_cache.effective(None);
                    profile
                };
                let _ = self.broadcast(&QuorumMessage::Pong { profile }).await;
            }
            QuorumMessage::Pong { profile } => {
                self.profiles.insert(profile.guid.clone(), profile.clone());
            }
            QuorumMessage::Throttle {
                throttle,
                topic,
                guid,
            } => {
                self.throttle_cache.set(topic.as_deref(), guid.as_deref(), *throttle);
            }
            _ => {}
        }

        // Fan out to local subscribers regardless of internal handling.
        let _ = self.events_tx.send(message);
    }

    async fn broadcast(&self, message: &QuorumMessage) -> Result<(), StoreError> {
        let payload = serde_json::to_string(message)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.store.notify(&self.keys.quorum(), &payload).await
    }

    /// Broadcast a `ping`, collect `pong`s for `delay`, and return the set of
    /// member profiles observed.
    #[instrument(skip(self))]
    pub async fn roll_call(&self, delay: Duration) -> Result<Vec<QuorumProfile>, StoreError> {
        self.profiles.clear();
        self.broadcast(&QuorumMessage::Ping {
            guid: self.guid.clone(),
        })
        .await?;
        tokio::time::sleep(delay).await;
        Ok(self.profiles.iter().map(|e| e.value().clone()).collect())
    }

    /// Persist and broadcast a throttle update.
    #[instrument(skip(self))]
    pub async fn throttle(&self, spec: ThrottleSpec) -> Result<(), StoreError> {
        // Persist first so newly joining members inherit the rate.
        self.store.set_throttle_rate(&spec).await?;
        self.broadcast(&QuorumMessage::Throttle {
            throttle: spec.throttle,
            topic: spec.topic.clone(),
            guid: spec.guid.clone(),
        })
        .await
    }

    /// Coordinated version switch: `nocache` → flip pointer → `cache`.
    #[instrument(skip(self))]
    pub async fn activate(
        &self,
        app_id: &str,
        version: &str,
        delay: Duration,
    ) -> Result<bool, StoreError> {
        self.broadcast(&QuorumMessage::Activate {
            version: version.to_string(),
            cache_mode: CacheMode::NoCache,
        })
        .await?;

        self.store.activate_app(app_id, version).await?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.broadcast(&QuorumMessage::Activate {
            version: version.to_string(),
            cache_mode: CacheMode::Cache,
        })
        .await?;

        info!(app_id, version, "activated version");
        Ok(true)
    }

    /// Publish a workflow-completion notification.
    pub async fn publish_job(
        &self,
        topic: Option<String>,
        jid: &str,
        status: f64,
        data: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.broadcast(&QuorumMessage::Job {
            topic,
            jid: jid.to_string(),
            status,
            data,
        })
        .await
    }

    /// Publish an opaque user broadcast.
    pub async fn pub_user(
        &self,
        topic: Option<String>,
        payload: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.broadcast(&QuorumMessage::User { topic, payload }).await
    }
}
