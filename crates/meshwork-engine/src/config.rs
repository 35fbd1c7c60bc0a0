//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Configuration for one engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Key namespace shared by every mesh member of this deployment.
    pub namespace: String,

    /// App this engine serves.
    pub app_id: String,

    /// Unique member id (generated if not provided).
    pub guid: String,

    /// Time-hook quantization window, in seconds.
    pub fidelity_secs: u64,

    /// Batch size for engine-stream consumption.
    pub batch_size: usize,

    /// Blocking window for an empty consume call.
    #[serde(with = "duration_millis")]
    pub block: Duration,

    /// Idle threshold before an unacked entry may be reclaimed.
    #[serde(with = "duration_millis")]
    pub stale_threshold: Duration,

    /// How often to sweep for reclaimable entries.
    #[serde(with = "duration_millis")]
    pub reclaim_interval: Duration,

    /// Cap for selective replay fetches.
    pub replay_fetch_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: "mesh".to_string(),
            app_id: "app".to_string(),
            guid: format!("engine-{}", Uuid::now_v7()),
            fidelity_secs: 60,
            batch_size: 10,
            block: Duration::from_millis(250),
            stale_threshold: Duration::from_secs(60),
            reclaim_interval: Duration::from_secs(30),
            replay_fetch_cap: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn new(namespace: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            app_id: app_id.into(),
            ..Default::default()
        }
    }

    pub fn with_guid(mut self, guid: impl Into<String>) -> Self {
        self.guid = guid.into();
        self
    }

    pub fn with_fidelity_secs(mut self, secs: u64) -> Self {
        self.fidelity_secs = secs.max(1);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Fidelity window in milliseconds.
    pub fn fidelity_ms(&self) -> i64 {
        (self.fidelity_secs * 1000) as i64
    }

    /// Floor a wake time to its fidelity slot.
    pub fn slot_for(&self, wake_ms: i64) -> i64 {
        (wake_ms / self.fidelity_ms()) * self.fidelity_ms()
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
