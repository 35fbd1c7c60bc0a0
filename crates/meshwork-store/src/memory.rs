//! In-memory implementation of `MeshStore`
//!
//! Primarily for tests. Mirrors the PostgreSQL provider's semantics:
//! single-delivery signals, first-claim-wins counters, at-least-once stream
//! consumption with idle reclaim, and atomic leg commits. A virtual clock
//! skew lets tests advance visibility/lease time deterministically.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use meshwork_core::manifest::AppManifest;
use meshwork_core::message::StreamMessage;

use crate::glob::glob_match;
use crate::store::*;

struct EntryState {
    id: u64,
    message: StreamMessage,
    visible_at_ms: i64,
    claimed: Option<(String, i64)>,
}

/// In-memory store provider.
pub struct MemoryMeshStore {
    apps: RwLock<HashMap<(String, String), AppManifest>>,
    active: RwLock<HashMap<String, String>>,
    hashes: RwLock<HashMap<String, HashMap<String, String>>>,
    streams: RwLock<HashMap<String, Vec<EntryState>>>,
    task_queues: RwLock<BTreeSet<String>>,
    processing: RwLock<HashMap<String, Vec<TimeHook>>>,
    time_hooks: RwLock<Vec<TimeHook>>,
    signals: RwLock<HashMap<(String, String), HookSignal>>,
    throttles: RwLock<HashMap<String, i64>>,
    scouts: RwLock<HashMap<String, (String, i64)>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    commit_lock: Mutex<()>,
    next_id: AtomicU64,
    clock_skew_ms: AtomicI64,
}

impl Default for MemoryMeshStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMeshStore {
    pub fn new() -> Self {
        Self {
            apps: RwLock::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
            hashes: RwLock::new(HashMap::new()),
            streams: RwLock::new(HashMap::new()),
            task_queues: RwLock::new(BTreeSet::new()),
            processing: RwLock::new(HashMap::new()),
            time_hooks: RwLock::new(Vec::new()),
            signals: RwLock::new(HashMap::new()),
            throttles: RwLock::new(HashMap::new()),
            scouts: RwLock::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            commit_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            clock_skew_ms: AtomicI64::new(0),
        }
    }

    /// Advance the provider's virtual clock (visibility delays, leases,
    /// time-hook slots). Tests drive time with this instead of sleeping.
    pub fn advance(&self, by: Duration) {
        self.clock_skew_ms
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.clock_skew_ms.load(Ordering::SeqCst)
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }

    fn append_entry(&self, stream: &str, message: &StreamMessage, visible_at_ms: i64) -> String {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.streams
            .write()
            .entry(stream.to_string())
            .or_default()
            .push(EntryState {
                id,
                message: message.clone(),
                visible_at_ms,
                claimed: None,
            });
        id.to_string()
    }

    fn slot_of_key(key: &str) -> Option<i64> {
        key.rsplit(':').next()?.parse().ok()
    }

    fn hincr_locked(
        hashes: &mut HashMap<String, HashMap<String, String>>,
        key: &str,
        field: &str,
        delta: f64,
    ) -> f64 {
        let hash = hashes.entry(key.to_string()).or_default();
        let current: f64 = hash
            .get(field)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);
        let next = current + delta;
        hash.insert(field.to_string(), format_float(next));
        next
    }
}

fn format_float(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

#[async_trait]
impl MeshStore for MemoryMeshStore {
    async fn set_app(&self, manifest: &AppManifest) -> Result<(), StoreError> {
        let key = (manifest.id.clone(), manifest.version.clone());
        let mut apps = self.apps.write();
        if let Some(existing) = apps.get(&key) {
            if existing != manifest {
                return Err(StoreError::Duplicate(format!(
                    "{}/{}",
                    manifest.id, manifest.version
                )));
            }
            return Ok(());
        }
        apps.insert(key, manifest.clone());
        Ok(())
    }

    async fn get_app(
        &self,
        app_id: &str,
        version: Option<&str>,
    ) -> Result<AppManifest, StoreError> {
        let version = match version {
            Some(v) => v.to_string(),
            None => self
                .active
                .read()
                .get(app_id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(format!("{app_id} (no active version)")))?,
        };
        self.apps
            .read()
            .get(&(app_id.to_string(), version.clone()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{app_id}/{version}")))
    }

    async fn activate_app(&self, app_id: &str, version: &str) -> Result<(), StoreError> {
        if !self
            .apps
            .read()
            .contains_key(&(app_id.to_string(), version.to_string()))
        {
            return Err(StoreError::NotFound(format!("{app_id}/{version}")));
        }
        self.active
            .write()
            .insert(app_id.to_string(), version.to_string());
        Ok(())
    }

    async fn active_version(&self, app_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.active.read().get(app_id).cloned())
    }

    async fn create_job(
        &self,
        job_key: &str,
        fields: Vec<(String, String)>,
        initial_status: f64,
    ) -> Result<bool, StoreError> {
        let _guard = self.commit_lock.lock();
        let mut hashes = self.hashes.write();
        if hashes.contains_key(job_key) {
            return Ok(false);
        }
        let mut hash: HashMap<String, String> = fields.into_iter().collect();
        hash.insert(":".to_string(), format_float(initial_status));
        hashes.insert(job_key.to_string(), hash);
        Ok(true)
    }

    async fn hset(&self, key: &str, fields: Vec<(String, String)>) -> Result<u64, StoreError> {
        let mut hashes = self.hashes.write();
        let hash = hashes.entry(key.to_string()).or_default();
        let count = fields.len() as u64;
        hash.extend(fields);
        Ok(count)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .hashes
            .read()
            .get(key)
            .and_then(|h| h.get(field).cloned()))
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self.hashes.read().get(key).cloned().unwrap_or_default())
    }

    async fn hincrby_float(&self, key: &str, field: &str, delta: f64) -> Result<f64, StoreError> {
        let _guard = self.commit_lock.lock();
        let mut hashes = self.hashes.write();
        Ok(Self::hincr_locked(&mut hashes, key, field, delta))
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64, StoreError> {
        let mut hashes = self.hashes.write();
        let Some(hash) = hashes.get_mut(key) else {
            return Ok(0);
        };
        let mut removed = 0;
        for field in fields {
            if hash.remove(field).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn find_job_fields(
        &self,
        key: &str,
        pattern: &str,
        _chunk_size: usize,
        total_cap: usize,
    ) -> Result<HashMap<String, String>, StoreError> {
        let hashes = self.hashes.read();
        let Some(hash) = hashes.get(key) else {
            return Ok(HashMap::new());
        };
        Ok(hash
            .iter()
            .filter(|(field, _)| glob_match(pattern, field))
            .take(total_cap)
            .map(|(f, v)| (f.clone(), v.clone()))
            .collect())
    }

    async fn delete_job(&self, job_key: &str) -> Result<(), StoreError> {
        self.hashes.write().remove(job_key);
        Ok(())
    }

    async fn publish_to_stream(
        &self,
        stream: &str,
        message: &StreamMessage,
    ) -> Result<String, StoreError> {
        Ok(self.append_entry(stream, message, self.now_ms()))
    }

    async fn publish_to_stream_delayed(
        &self,
        stream: &str,
        message: &StreamMessage,
        delay: Duration,
    ) -> Result<String, StoreError> {
        Ok(self.append_entry(stream, message, self.now_ms() + delay.as_millis() as i64))
    }

    async fn consume_batch(
        &self,
        stream: &str,
        _group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let deadline = self.now_ms() + block_ms as i64;
        loop {
            let now = self.now_ms();
            let mut claimed = Vec::new();
            {
                let mut streams = self.streams.write();
                if let Some(entries) = streams.get_mut(stream) {
                    for entry in entries.iter_mut() {
                        if claimed.len() >= count {
                            break;
                        }
                        if entry.claimed.is_none() && entry.visible_at_ms <= now {
                            entry.claimed = Some((consumer.to_string(), now));
                            claimed.push(StreamEntry {
                                id: entry.id.to_string(),
                                message: entry.message.clone(),
                            });
                        }
                    }
                }
            }
            if !claimed.is_empty() || self.now_ms() >= deadline {
                return Ok(claimed);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn ack(&self, stream: &str, _group: &str, ids: &[String]) -> Result<u64, StoreError> {
        let mut streams = self.streams.write();
        let Some(entries) = streams.get_mut(stream) else {
            return Ok(0);
        };
        let before = entries.len();
        entries.retain(|e| !ids.contains(&e.id.to_string()));
        Ok((before - entries.len()) as u64)
    }

    async fn claim_idle(
        &self,
        stream: &str,
        _group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let now = self.now_ms();
        let cutoff = now - min_idle.as_millis() as i64;
        let mut reclaimed = Vec::new();
        let mut streams = self.streams.write();
        if let Some(entries) = streams.get_mut(stream) {
            for entry in entries.iter_mut() {
                if reclaimed.len() >= count {
                    break;
                }
                if let Some((_, claimed_at)) = &entry.claimed {
                    if *claimed_at <= cutoff {
                        entry.claimed = Some((consumer.to_string(), now));
                        reclaimed.push(StreamEntry {
                            id: entry.id.to_string(),
                            message: entry.message.clone(),
                        });
                    }
                }
            }
        }
        Ok(reclaimed)
    }

    async fn add_task_queues(&self, keys: &[String]) -> Result<(), StoreError> {
        self.task_queues.write().extend(keys.iter().cloned());
        Ok(())
    }

    async fn get_active_task_queue(&self, now_ms: i64) -> Result<Option<String>, StoreError> {
        let queues = self.task_queues.read();
        let mut ready: Vec<(i64, &String)> = queues
            .iter()
            .filter_map(|k| Self::slot_of_key(k).map(|slot| (slot, k)))
            .filter(|(slot, _)| *slot <= now_ms)
            .collect();
        ready.sort();
        Ok(ready.first().map(|(_, k)| (*k).clone()))
    }

    async fn process_task_queue(
        &self,
        src: &str,
        dst: &str,
    ) -> Result<Option<String>, StoreError> {
        let mut hooks = self.time_hooks.write();
        let Some(pos) = hooks.iter().position(|h| h.list_key == src) else {
            self.task_queues.write().remove(src);
            return Ok(None);
        };
        let hook = hooks.remove(pos);
        let job_id = hook.target.clone();
        self.processing
            .write()
            .entry(dst.to_string())
            .or_default()
            .push(hook);
        Ok(Some(job_id))
    }

    async fn delete_processed_task_queue(&self, key: &str) -> Result<(), StoreError> {
        self.processing.write().remove(key);
        Ok(())
    }

    async fn register_time_hook(&self, hook: TimeHook) -> Result<(), StoreError> {
        self.task_queues.write().insert(hook.list_key.clone());
        self.time_hooks.write().push(hook);
        Ok(())
    }

    async fn get_next_task(
        &self,
        now_ms: i64,
        list_key: Option<&str>,
    ) -> Result<Option<TimeHook>, StoreError> {
        let mut hooks = self.time_hooks.write();
        let mut best: Option<usize> = None;
        for (i, hook) in hooks.iter().enumerate() {
            if hook.slot_ms > now_ms {
                continue;
            }
            if let Some(key) = list_key {
                if hook.list_key != key {
                    continue;
                }
            }
            match best {
                Some(j) if hooks[j].slot_ms <= hook.slot_ms => {}
                _ => best = Some(i),
            }
        }
        Ok(best.map(|i| hooks.remove(i)))
    }

    async fn cancel_time_hooks(&self, job_id: &str) -> Result<u64, StoreError> {
        let mut hooks = self.time_hooks.write();
        let before = hooks.len();
        hooks.retain(|h| h.target != job_id);
        Ok((before - hooks.len()) as u64)
    }

    async fn set_hook_signal(&self, signal: HookSignal) -> Result<(), StoreError> {
        self.signals
            .write()
            .insert((signal.topic.clone(), signal.resolved.clone()), signal);
        Ok(())
    }

    async fn get_hook_signal(
        &self,
        topic: &str,
        resolved: &str,
    ) -> Result<Option<HookTarget>, StoreError> {
        let mut signals = self.signals.write();
        let entry = signals.remove(&(topic.to_string(), resolved.to_string()));
        match entry {
            Some(signal) => {
                if let Some(expire_at) = signal.expire_at {
                    if expire_at.timestamp_millis() < self.now_ms() {
                        return Ok(None);
                    }
                }
                Ok(Some(signal.target))
            }
            None => Ok(None),
        }
    }

    async fn delete_hook_signal(&self, topic: &str, resolved: &str) -> Result<u64, StoreError> {
        let removed = self
            .signals
            .write()
            .remove(&(topic.to_string(), resolved.to_string()));
        Ok(removed.map(|_| 1).unwrap_or(0))
    }

    async fn notify(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        // No receivers is fine; quorum traffic is best-effort.
        let _ = self.sender_for(channel).send(payload.to_string());
        Ok(())
    }

    async fn listen(&self, channel: &str) -> Result<broadcast::Receiver<String>, StoreError> {
        Ok(self.sender_for(channel).subscribe())
    }

    async fn unlisten(&self, channel: &str) -> Result<(), StoreError> {
        self.channels.lock().remove(channel);
        Ok(())
    }

    async fn set_throttle_rate(&self, spec: &ThrottleSpec) -> Result<(), StoreError> {
        let scope = match (&spec.guid, &spec.topic) {
            (Some(guid), _) => format!("g:{guid}"),
            (None, Some(topic)) => format!("t:{topic}"),
            (None, None) => "app".to_string(),
        };
        self.throttles.write().insert(scope, spec.throttle);
        Ok(())
    }

    async fn get_throttle_rate(
        &self,
        topic: Option<&str>,
        guid: Option<&str>,
    ) -> Result<i64, StoreError> {
        let throttles = self.throttles.read();
        if let Some(guid) = guid {
            if let Some(rate) = throttles.get(&format!("g:{guid}")) {
                return Ok(*rate);
            }
        }
        if let Some(topic) = topic {
            if let Some(rate) = throttles.get(&format!("t:{topic}")) {
                return Ok(*rate);
            }
        }
        Ok(throttles.get("app").copied().unwrap_or(0))
    }

    async fn reserve_scout_role(
        &self,
        role: &str,
        guid: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.now_ms();
        let mut scouts = self.scouts.write();
        match scouts.get(role) {
            Some((holder, lease_until)) if *lease_until > now && holder != guid => Ok(false),
            _ => {
                scouts.insert(
                    role.to_string(),
                    (guid.to_string(), now + lease.as_millis() as i64),
                );
                Ok(true)
            }
        }
    }

    async fn commit_leg(&self, commit: LegCommit) -> Result<f64, StoreError> {
        let _guard = self.commit_lock.lock();
        let now = self.now_ms();

        let status = {
            let mut hashes = self.hashes.write();
            hashes
                .entry(commit.job_key.clone())
                .or_default()
                .extend(commit.fields);
            match commit.set_status {
                Some(forced) => {
                    hashes
                        .entry(commit.job_key.clone())
                        .or_default()
                        .insert(":".to_string(), format_float(forced));
                    forced
                }
                None => Self::hincr_locked(&mut hashes, &commit.job_key, ":", commit.status_delta),
            }
        };

        for (stream, message) in &commit.publishes {
            self.append_entry(stream, message, now);
        }
        for (stream, message, delay) in &commit.delayed_publishes {
            self.append_entry(stream, message, now + delay.as_millis() as i64);
        }
        for signal in commit.hook_signals {
            self.signals
                .write()
                .insert((signal.topic.clone(), signal.resolved.clone()), signal);
        }
        for hook in commit.time_hooks {
            self.task_queues.write().insert(hook.list_key.clone());
            self.time_hooks.write().push(hook);
        }

        Ok(status)
    }
}
