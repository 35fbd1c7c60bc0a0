//! Time scout: the elected timer service
//!
//! One mesh member per app holds the `time` scout role for each fidelity
//! window and is the only member that advances time-hook task lists: waking
//! durable sleeps, expiring completed jobs, firing scheduled interrupts, and
//! delisting stale signal bindings.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use meshwork_core::manifest::ActivityKind;
use meshwork_core::{job, MeshError};
use meshwork_store::{MeshStore, TaskKind, TimeHook};

use crate::engine::{find_activity, trim_json_string, Engine, InterruptOptions};

/// Scout configuration.
#[derive(Debug, Clone)]
pub struct ScoutConfig {
    /// Role name in the election table.
    pub role: String,

    /// Consecutive failures tolerated before standing down (so another
    /// member can be elected).
    pub max_failures: u32,

    /// Entries processed per drain pass.
    pub drain_cap: u32,
}

impl Default for ScoutConfig {
    fn default() -> Self {
        Self {
            role: "time".to_string(),
            max_failures: 5,
            drain_cap: 1000,
        }
    }
}

/// The elected time-hook processor.
pub struct Scout {
    engine: Arc<Engine>,
    store: Arc<dyn MeshStore>,
    config: ScoutConfig,
}

impl Scout {
    pub fn new(engine: Arc<Engine>, config: ScoutConfig) -> Self {
        let store = Arc::clone(engine.store());
        Self {
            engine,
            store,
            config,
        }
    }

    /// Run the election + drain loop until shutdown.
    #[instrument(skip(self, shutdown), fields(guid = %self.engine.config().guid))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let fidelity = Duration::from_secs(self.engine.config().fidelity_secs);
        let mut failures: u32 = 0;

        // Optional LISTEN-driven wake-up: new hook registrations may notify
        // this channel to cut the latency below one fidelity window.
        let wake_channel = format!("{}:wake", self.engine.keys().quorum());
        let mut wake_rx = self.store.listen(&wake_channel).await.ok();

        loop {
            if *shutdown.borrow() {
                debug!("scout: shutdown requested");
                break;
            }

            let elected = match self
                .store
                .reserve_scout_role(&self.config.role, &self.engine.config().guid, fidelity)
                .await
            {
                Ok(elected) => elected,
                Err(e) => {
                    error!("scout election failed: {}", e);
                    false
                }
            };

            if elected {
                match self.tick(Utc::now().timestamp_millis()).await {
                    Ok(processed) => {
                        failures = 0;
                        if processed > 0 {
                            info!(processed, "advanced time hooks");
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        error!(failures, "scout drain failed: {}", e);
                        if failures >= self.config.max_failures {
                            // Stand down; the lease lapses and another member
                            // takes over.
                            warn!("too many consecutive failures; standing down");
                            failures = 0;
                            tokio::select! {
                                _ = tokio::time::sleep(fidelity) => continue,
                                _ = shutdown.changed() => break,
                            }
                        }
                        let backoff = Duration::from_secs(failures as u64);
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => continue,
                            _ = shutdown.changed() => break,
                        }
                    }
                }
            }

            // Sleep to the next fidelity boundary, or wake early on NOTIFY.
            let now_ms = Utc::now().timestamp_millis();
            let next_boundary = self.engine.config().slot_for(now_ms) + self.engine.config().fidelity_ms();
            let until = Duration::from_millis((next_boundary - now_ms).max(50) as u64);

            match &mut wake_rx {
                Some(rx) => {
                    tokio::select! {
                        _ = tokio::time::sleep(until) => {}
                        _ = rx.recv() => debug!("woken by notify"),
                        _ = shutdown.changed() => break,
                    }
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(until) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
    }

    /// Drain every entry due at `now_ms`. Exposed for deterministic tests.
    pub async fn tick(&self, now_ms: i64) -> Result<u32, MeshError> {
        let mut processed = 0;
        while processed < self.config.drain_cap {
            let entry = self
                .store
                .get_next_task(now_ms, None)
                .await
                .map_err(|e| MeshError::Store(e.to_string()))?;
            let Some(entry) = entry else { break };
            self.dispatch(entry).await?;
            processed += 1;
        }
        Ok(processed)
    }

    async fn dispatch(&self, entry: TimeHook) -> Result<(), MeshError> {
        debug!(target = %entry.target, kind = ?entry.kind, "processing time hook");
        match entry.kind {
            TaskKind::Sleep => self.wake(entry).await,
            TaskKind::Expire => self.engine.expire_job(&entry.target).await,
            TaskKind::Interrupt => {
                self.engine
                    .interrupt(&entry.target, InterruptOptions::default())
                    .await
            }
            TaskKind::Delist => {
                // Delist entries carry the binding coordinates in the
                // activity/dimension slots: topic in `aid`, resolved in `dad`.
                self.store
                    .delete_hook_signal(&entry.aid, &entry.dad)
                    .await
                    .map_err(|e| MeshError::Store(e.to_string()))?;
                Ok(())
            }
            // Child cleanup is handled by the ancestor's own expiry.
            TaskKind::Child => Ok(()),
        }
    }

    /// Wake a sleeping job: durable sleeps resolve their replay slot; graph
    /// hooks run their leave leg.
    async fn wake(&self, entry: TimeHook) -> Result<(), MeshError> {
        let job_key = self.engine.keys().job(&entry.target);
        let gid = self
            .store
            .hget(&job_key, &job::md_field("gid"))
            .await
            .map_err(|e| MeshError::Store(e.to_string()))?;
        match gid {
            Some(current) if trim_json_string(&current) == entry.gid => {}
            Some(_) => {
                debug!(target = %entry.target, "stale generation; dropping wake");
                return Ok(());
            }
            None => {
                debug!(target = %entry.target, "job gone; dropping wake");
                return Ok(());
            }
        }

        match &entry.sid {
            Some(sid) => {
                self.engine
                    .resolve_parent_session(
                        &entry.target,
                        &entry.aid,
                        &entry.dad,
                        sid,
                        serde_json::Value::Null,
                        false,
                    )
                    .await
            }
            None => {
                let manifest = self.engine.manifest().await?;
                let (_, def) = find_activity(&manifest, &entry.aid)?;
                match def.kind {
                    ActivityKind::Worker => {
                        self.engine
                            .reenter_worker(&entry.target, &entry.aid, &entry.dad)
                            .await
                    }
                    _ => {
                        let mut message = self.engine.enter_message(
                            &entry.target,
                            Some(&entry.gid),
                            &entry.aid,
                            &entry.dad,
                            0,
                            serde_json::json!({}),
                        );
                        message.metadata.code = Some(meshwork_core::codes::SUCCESS);
                        self.store
                            .publish_to_stream(&self.engine.keys().engine_stream(), &message)
                            .await
                            .map_err(|e| MeshError::Store(e.to_string()))?;
                        Ok(())
                    }
                }
            }
        }
    }
}
