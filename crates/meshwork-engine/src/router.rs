//! Stream consumer with throttle, adaptive backoff, and idle-claim recovery
//!
//! One `Router` drives one `(stream, group, consumer)` tuple. It is shared by
//! the engine (engine stream) and by durable workers (topic streams): consume
//! a batch, apply the effective throttle, dispatch each message to the
//! callback, ack, and periodically reclaim entries orphaned by crashed
//! consumers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, instrument, trace, warn};

use meshwork_core::message::StreamMessage;
use meshwork_store::{MeshStore, StreamEntry};

use crate::quorum::{ThrottleCache, MAX_DELAY_MS};

/// Router configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterConfig {
    /// Consumer group name.
    pub group: String,

    /// Consumer name (unique per member).
    pub consumer: String,

    /// Maximum entries claimed per poll.
    pub batch_size: usize,

    /// Blocking window for an empty consume call.
    #[serde(with = "duration_millis")]
    pub block: Duration,

    /// Minimum poll interval (when traffic is flowing).
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Maximum poll interval (when idle).
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier applied while idle.
    pub backoff_multiplier: f64,

    /// How often to sweep for orphaned entries.
    #[serde(with = "duration_millis")]
    pub reclaim_interval: Duration,

    /// Idle threshold before an unacked entry is reclaimable.
    #[serde(with = "duration_millis")]
    pub stale_threshold: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            group: "engine".to_string(),
            consumer: "consumer".to_string(),
            batch_size: 10,
            block: Duration::from_millis(250),
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 10.0,
            reclaim_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
        }
    }
}

impl RouterConfig {
    pub fn new(group: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            consumer: consumer.into(),
            ..Default::default()
        }
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }
}

/// Stream consumer loop.
pub struct Router {
    store: Arc<dyn MeshStore>,
    stream: String,
    /// Topic used for throttle lookups (the logical topic behind the stream).
    topic: Option<String>,
    throttle: Arc<ThrottleCache>,
    config: RouterConfig,
}

impl Router {
    pub fn new(
        store: Arc<dyn MeshStore>,
        stream: impl Into<String>,
        topic: Option<String>,
        throttle: Arc<ThrottleCache>,
        config: RouterConfig,
    ) -> Self {
        Self {
            store,
            stream: stream.into(),
            topic,
            throttle,
            config,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Consume until shutdown, dispatching every entry to `callback`.
    ///
    /// The callback's error is logged and the entry is still acked — poison
    /// messages must not wedge the stream; retry semantics live above this
    /// layer (the engine re-emits with backoff).
    #[instrument(skip(self, callback, shutdown), fields(stream = %self.stream))]
    pub async fn run<F, Fut>(&self, callback: F, mut shutdown: watch::Receiver<bool>)
    where
        F: Fn(StreamMessage) -> Fut,
        Fut: Future<Output = Result<(), meshwork_core::MeshError>>,
    {
        let mut idle_interval = self.config.min_interval;
        let mut consume_failures: u32 = 0;
        let mut last_reclaim = tokio::time::Instant::now();

        loop {
            if *shutdown.borrow() {
                debug!("router: shutdown requested");
                break;
            }

            // Pause takes precedence over polling.
            if self.paused(&mut shutdown).await {
                break;
            }

            let mut entries = match self
                .store
                .consume_batch(
                    &self.stream,
                    &self.config.group,
                    &self.config.consumer,
                    self.config.batch_size,
                    self.config.block.as_millis() as u64,
                )
                .await
            {
                Ok(entries) => {
                    consume_failures = 0;
                    entries
                }
                Err(e) => {
                    // Exponential retry: 10ms, 100ms, 1s, capped at 10s.
                    consume_failures += 1;
                    let backoff = Duration::from_millis(
                        10u64.saturating_pow(consume_failures.min(4)),
                    )
                    .min(Duration::from_secs(10));
                    error!(failures = consume_failures, "consume error: {}; backing off {:?}", e, backoff);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => continue,
                        _ = shutdown.changed() => break,
                    }
                }
            };

            if last_reclaim.elapsed() >= self.config.reclaim_interval {
                last_reclaim = tokio::time::Instant::now();
                match self
                    .store
                    .claim_idle(
                        &self.stream,
                        &self.config.group,
                        &self.config.consumer,
                        self.config.stale_threshold,
                        self.config.batch_size,
                    )
                    .await
                {
                    Ok(reclaimed) if !reclaimed.is_empty() => {
                        warn!(count = reclaimed.len(), "processing reclaimed entries");
                        entries.extend(reclaimed);
                    }
                    Ok(_) => {}
                    Err(e) => error!("idle-claim sweep failed: {}", e),
                }
            }

            if entries.is_empty() {
                idle_interval = Duration::from_secs_f64(
                    (idle_interval.as_secs_f64() * self.config.backoff_multiplier)
                        .min(self.config.max_interval.as_secs_f64()),
                );
                // ±10% jitter so idle consumers across the mesh don't wake
                // in lockstep against the store.
                let wait = idle_interval.mul_f64(rand::thread_rng().gen_range(0.9..1.1));
                trace!(interval_ms = wait.as_millis(), "idle, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.changed() => break,
                }
                continue;
            }

            idle_interval = self.config.min_interval;
            self.dispatch_batch(entries, &callback, &mut shutdown).await;
        }
    }

    /// Process one batch: throttle, dispatch, ack.
    pub async fn dispatch_batch<F, Fut>(
        &self,
        entries: Vec<StreamEntry>,
        callback: &F,
        shutdown: &mut watch::Receiver<bool>,
    ) where
        F: Fn(StreamMessage) -> Fut,
        Fut: Future<Output = Result<(), meshwork_core::MeshError>>,
    {
        let mut acked = Vec::with_capacity(entries.len());
        for entry in entries {
            let rate = self.throttle.effective(self.topic.as_deref());
            if rate > 0 && rate < MAX_DELAY_MS {
                tokio::time::sleep(Duration::from_millis(rate as u64)).await;
            } else if rate >= MAX_DELAY_MS && self.paused(shutdown).await {
                return;
            }

            if let Err(e) = callback(entry.message).await {
                error!(entry = %entry.id, "dispatch error: {}", e);
            }
            acked.push(entry.id);
        }

        if let Err(e) = self
            .store
            .ack(&self.stream, &self.config.group, &acked)
            .await
        {
            error!("ack failed: {}", e);
        }
    }

    /// Wait while the effective throttle means "paused". Returns true when
    /// shutdown was requested during the wait.
    async fn paused(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        while self.throttle.effective(self.topic.as_deref()) >= MAX_DELAY_MS {
            debug!(stream = %self.stream, "paused by throttle");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                _ = shutdown.changed() => return true,
            }
            if *shutdown.borrow() {
                return true;
            }
        }
        false
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshwork_core::message::MessageMetadata;
    use meshwork_store::MemoryMeshStore;
    use parking_lot::Mutex;
    use serde_json::json;

    fn message(jid: &str) -> StreamMessage {
        StreamMessage::new(MessageMetadata::enter(jid, "a1"), json!({}))
    }

    #[tokio::test]
    async fn test_dispatch_batch_acks_after_callback() {
        let store: Arc<MemoryMeshStore> = Arc::new(MemoryMeshStore::new());
        store.publish_to_stream("s", &message("j1")).await.unwrap();
        store.publish_to_stream("s", &message("j2")).await.unwrap();

        let throttle = Arc::new(ThrottleCache::new("g"));
        let router = Router::new(
            store.clone() as Arc<dyn MeshStore>,
            "s",
            None,
            throttle,
            RouterConfig::new("g", "c"),
        );

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(vec![]));
        let entries = store.consume_batch("s", "g", "c", 10, 0).await.unwrap();
        let (_tx, mut shutdown) = watch::channel(false);

        let seen_cb = seen.clone();
        router
            .dispatch_batch(
                entries,
                &move |msg: StreamMessage| {
                    let seen = seen_cb.clone();
                    async move {
                        seen.lock().push(msg.metadata.jid.clone());
                        Ok(())
                    }
                },
                &mut shutdown,
            )
            .await;

        assert_eq!(seen.lock().as_slice(), &["j1".to_string(), "j2".to_string()]);
        // all entries acked: nothing left to claim or reclaim
        assert!(store.consume_batch("s", "g", "c2", 10, 0).await.unwrap().is_empty());
        store.advance(Duration::from_secs(3600));
        assert!(store
            .claim_idle("s", "g", "c2", Duration::from_secs(60), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_poison_message_is_acked() {
        let store: Arc<MemoryMeshStore> = Arc::new(MemoryMeshStore::new());
        store.publish_to_stream("s", &message("bad")).await.unwrap();

        let throttle = Arc::new(ThrottleCache::new("g"));
        let router = Router::new(
            store.clone() as Arc<dyn MeshStore>,
            "s",
            None,
            throttle,
            RouterConfig::new("g", "c"),
        );

        let entries = store.consume_batch("s", "g", "c", 10, 0).await.unwrap();
        let (_tx, mut shutdown) = watch::channel(false);
        router
            .dispatch_batch(
                entries,
                &|_msg: StreamMessage| async {
                    Err(meshwork_core::MeshError::fatal("boom"))
                },
                &mut shutdown,
            )
            .await;

        store.advance(Duration::from_secs(3600));
        assert!(store
            .claim_idle("s", "g", "c2", Duration::from_secs(60), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_delays_dispatch() {
        let store: Arc<MemoryMeshStore> = Arc::new(MemoryMeshStore::new());
        store.publish_to_stream("s", &message("j1")).await.unwrap();

        let throttle = Arc::new(ThrottleCache::new("g"));
        throttle.set(None, None, 500);

        let router = Router::new(
            store.clone() as Arc<dyn MeshStore>,
            "s",
            None,
            throttle,
            RouterConfig::new("g", "c"),
        );

        let entries = store.consume_batch("s", "g", "c", 10, 0).await.unwrap();
        let (_tx, mut shutdown) = watch::channel(false);

        let started = tokio::time::Instant::now();
        router
            .dispatch_batch(entries, &|_m: StreamMessage| async { Ok(()) }, &mut shutdown)
            .await;
        assert!(started.elapsed() >= Duration::from_millis(500));
    }
}
