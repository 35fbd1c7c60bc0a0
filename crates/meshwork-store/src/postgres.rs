//! PostgreSQL implementation of `MeshStore`
//!
//! Production persistence using PostgreSQL with:
//! - SKIP LOCKED stream claiming for contention-free consumers
//! - Visibility timestamps for delayed (retry) delivery
//! - LISTEN/NOTIFY for the quorum plane
//! - A lease table for scout election
//!
//! Apply `schema.sql` (shipped next to this crate) before first use.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sqlx::postgres::PgListener;
use sqlx::{PgPool, Row};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use meshwork_core::manifest::AppManifest;
use meshwork_core::message::StreamMessage;

use crate::glob::glob_to_regex;
use crate::store::*;

/// PostgreSQL store provider.
///
/// # Example
///
/// ```ignore
/// use meshwork_store::PostgresMeshStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mesh").await?;
/// let store = PostgresMeshStore::new(pool);
/// ```
pub struct PostgresMeshStore {
    pool: PgPool,
    listeners: DashMap<String, (broadcast::Sender<String>, JoinHandle<()>)>,
}

impl PostgresMeshStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            listeners: DashMap::new(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the schema if it does not exist.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in include_str!("../schema.sql").split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    async fn insert_stream_entry<'e, E>(
        executor: E,
        stream: &str,
        message: &StreamMessage,
        delay: Duration,
    ) -> Result<String, StoreError>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        let payload = serde_json::to_value(message)?;
        let row = sqlx::query(
            r#"
            INSERT INTO mesh_streams (stream, message, visible_at)
            VALUES ($1, $2, now() + $3 * interval '1 millisecond')
            RETURNING id
            "#,
        )
        .bind(stream)
        .bind(&payload)
        .bind(delay.as_millis() as i64)
        .fetch_one(executor)
        .await
        .map_err(db_err)?;

        Ok(row.get::<i64, _>("id").to_string())
    }

    async fn upsert_fields(
        conn: &mut sqlx::PgConnection,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<(), StoreError> {
        for (field, value) in fields {
            sqlx::query(
                r#"
                INSERT INTO mesh_hash (key, field, value)
                VALUES ($1, $2, $3)
                ON CONFLICT (key, field) DO UPDATE SET value = EXCLUDED.value
                "#,
            )
            .bind(key)
            .bind(field)
            .bind(value)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn incr_status<'e, E>(
        executor: E,
        key: &str,
        delta: f64,
    ) -> Result<f64, StoreError>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        let row = sqlx::query(
            r#"
            INSERT INTO mesh_hash (key, field, value)
            VALUES ($1, ':', ($2::double precision)::text)
            ON CONFLICT (key, field)
            DO UPDATE SET value = ((mesh_hash.value)::double precision + $2)::text
            RETURNING (value)::double precision AS status
            "#,
        )
        .bind(key)
        .bind(delta)
        .fetch_one(executor)
        .await
        .map_err(db_err)?;
        Ok(row.get("status"))
    }

    fn rows_to_entries(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<StreamEntry>, StoreError> {
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get("id");
            let payload: serde_json::Value = row.get("message");
            let message: StreamMessage =
                serde_json::from_value(payload).map_err(|e| StoreError::Serialization(e.to_string()))?;
            entries.push(StreamEntry {
                id: id.to_string(),
                message,
            });
        }
        Ok(entries)
    }
}

#[async_trait]
impl MeshStore for PostgresMeshStore {
    #[instrument(skip(self, manifest), fields(app = %manifest.id, version = %manifest.version))]
    async fn set_app(&self, manifest: &AppManifest) -> Result<(), StoreError> {
        let payload = serde_json::to_value(manifest)?;
        let row = sqlx::query(
            r#"
            INSERT INTO mesh_apps (app_id, version, manifest)
            VALUES ($1, $2, $3)
            ON CONFLICT (app_id, version) DO NOTHING
            RETURNING app_id
            "#,
        )
        .bind(&manifest.id)
        .bind(&manifest.version)
        .bind(&payload)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        if row.is_none() {
            // Already deployed; append-only means identical content is fine.
            let existing = sqlx::query(
                "SELECT manifest FROM mesh_apps WHERE app_id = $1 AND version = $2",
            )
            .bind(&manifest.id)
            .bind(&manifest.version)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
            let existing: serde_json::Value = existing.get("manifest");
            if existing != payload {
                return Err(StoreError::Duplicate(format!(
                    "{}/{}",
                    manifest.id, manifest.version
                )));
            }
        }

        debug!("deployed manifest");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_app(
        &self,
        app_id: &str,
        version: Option<&str>,
    ) -> Result<AppManifest, StoreError> {
        let row = match version {
            Some(version) => sqlx::query(
                "SELECT manifest FROM mesh_apps WHERE app_id = $1 AND version = $2",
            )
            .bind(app_id)
            .bind(version)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?,
            None => sqlx::query(
                r#"
                SELECT a.manifest
                FROM mesh_apps a
                JOIN mesh_app_active v ON v.app_id = a.app_id AND v.version = a.version
                WHERE a.app_id = $1
                "#,
            )
            .bind(app_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?,
        };

        let row = row.ok_or_else(|| StoreError::NotFound(app_id.to_string()))?;
        let payload: serde_json::Value = row.get("manifest");
        serde_json::from_value(payload).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    #[instrument(skip(self))]
    async fn activate_app(&self, app_id: &str, version: &str) -> Result<(), StoreError> {
        let exists = sqlx::query("SELECT 1 FROM mesh_apps WHERE app_id = $1 AND version = $2")
            .bind(app_id)
            .bind(version)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!("{app_id}/{version}")));
        }

        sqlx::query(
            r#"
            INSERT INTO mesh_app_active (app_id, version)
            VALUES ($1, $2)
            ON CONFLICT (app_id) DO UPDATE SET version = EXCLUDED.version
            "#,
        )
        .bind(app_id)
        .bind(version)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!(app_id, version, "activated version");
        Ok(())
    }

    async fn active_version(&self, app_id: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT version FROM mesh_app_active WHERE app_id = $1")
            .bind(app_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| r.get("version")))
    }

    #[instrument(skip(self, fields))]
    async fn create_job(
        &self,
        job_key: &str,
        fields: Vec<(String, String)>,
        initial_status: f64,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let created = sqlx::query(
            r#"
            INSERT INTO mesh_hash (key, field, value)
            VALUES ($1, ':', ($2::double precision)::text)
            ON CONFLICT (key, field) DO NOTHING
            RETURNING key
            "#,
        )
        .bind(job_key)
        .bind(initial_status)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        if created.is_none() {
            tx.rollback().await.map_err(db_err)?;
            return Ok(false);
        }

        Self::upsert_fields(&mut *tx, job_key, &fields).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn hset(&self, key: &str, fields: Vec<(String, String)>) -> Result<u64, StoreError> {
        let count = fields.len() as u64;
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::upsert_fields(&mut *tx, key, &fields).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(count)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM mesh_hash WHERE key = $1 AND field = $2")
            .bind(key)
            .bind(field)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| r.get("value")))
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let rows = sqlx::query("SELECT field, value FROM mesh_hash WHERE key = $1")
            .bind(key)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("field"), r.get("value")))
            .collect())
    }

    async fn hincrby_float(&self, key: &str, field: &str, delta: f64) -> Result<f64, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO mesh_hash (key, field, value)
            VALUES ($1, $2, ($3::double precision)::text)
            ON CONFLICT (key, field)
            DO UPDATE SET value = ((mesh_hash.value)::double precision + $3)::text
            RETURNING (value)::double precision AS value
            "#,
        )
        .bind(key)
        .bind(field)
        .bind(delta)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.get("value"))
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM mesh_hash WHERE key = $1 AND field = ANY($2)")
            .bind(key)
            .bind(fields)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn find_job_fields(
        &self,
        key: &str,
        pattern: &str,
        _chunk_size: usize,
        total_cap: usize,
    ) -> Result<HashMap<String, String>, StoreError> {
        let regex = glob_to_regex(pattern);
        let rows = sqlx::query(
            "SELECT field, value FROM mesh_hash WHERE key = $1 AND field ~ $2 LIMIT $3",
        )
        .bind(key)
        .bind(&regex)
        .bind(total_cap as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("field"), r.get("value")))
            .collect())
    }

    async fn delete_job(&self, job_key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM mesh_hash WHERE key = $1")
            .bind(job_key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn publish_to_stream(
        &self,
        stream: &str,
        message: &StreamMessage,
    ) -> Result<String, StoreError> {
        Self::insert_stream_entry(&self.pool, stream, message, Duration::ZERO).await
    }

    async fn publish_to_stream_delayed(
        &self,
        stream: &str,
        message: &StreamMessage,
        delay: Duration,
    ) -> Result<String, StoreError> {
        Self::insert_stream_entry(&self.pool, stream, message, delay).await
    }

    #[instrument(skip(self), fields(stream, consumer))]
    async fn consume_batch(
        &self,
        stream: &str,
        _group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(block_ms);
        loop {
            // SKIP LOCKED keeps concurrent consumers from contending on the
            // same rows; claiming is one atomic UPDATE.
            let rows = sqlx::query(
                r#"
                WITH claimable AS (
                    SELECT id
                    FROM mesh_streams
                    WHERE stream = $1
                      AND claimed_by IS NULL
                      AND visible_at <= now()
                    ORDER BY id
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE mesh_streams s
                SET claimed_by = $3,
                    claimed_at = now()
                FROM claimable c
                WHERE s.id = c.id
                RETURNING s.id, s.message
                "#,
            )
            .bind(stream)
            .bind(count as i64)
            .bind(consumer)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

            if !rows.is_empty() || tokio::time::Instant::now() >= deadline {
                return Self::rows_to_entries(rows);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn ack(&self, stream: &str, _group: &str, ids: &[String]) -> Result<u64, StoreError> {
        let ids: Vec<i64> = ids.iter().filter_map(|id| id.parse().ok()).collect();
        let result = sqlx::query("DELETE FROM mesh_streams WHERE stream = $1 AND id = ANY($2)")
            .bind(stream)
            .bind(&ids)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn claim_idle(
        &self,
        stream: &str,
        _group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            WITH stale AS (
                SELECT id
                FROM mesh_streams
                WHERE stream = $1
                  AND claimed_by IS NOT NULL
                  AND claimed_at < now() - $2 * interval '1 millisecond'
                ORDER BY id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE mesh_streams s
            SET claimed_by = $4,
                claimed_at = now()
            FROM stale c
            WHERE s.id = c.id
            RETURNING s.id, s.message
            "#,
        )
        .bind(stream)
        .bind(min_idle.as_millis() as i64)
        .bind(count as i64)
        .bind(consumer)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let entries = Self::rows_to_entries(rows)?;
        if !entries.is_empty() {
            warn!(count = entries.len(), "reclaimed orphaned stream entries");
        }
        Ok(entries)
    }

    async fn add_task_queues(&self, _keys: &[String]) -> Result<(), StoreError> {
        // Slot lists are discovered from mesh_task_lists rows directly.
        Ok(())
    }

    async fn get_active_task_queue(&self, now_ms: i64) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT list_key FROM mesh_task_lists
            WHERE slot_ms <= $1 AND processing_key IS NULL
            ORDER BY slot_ms
            LIMIT 1
            "#,
        )
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(|r| r.get("list_key")))
    }

    async fn process_task_queue(
        &self,
        src: &str,
        dst: &str,
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE mesh_task_lists
            SET processing_key = $2
            WHERE id = (
                SELECT id FROM mesh_task_lists
                WHERE list_key = $1 AND processing_key IS NULL
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING target
            "#,
        )
        .bind(src)
        .bind(dst)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(|r| r.get("target")))
    }

    async fn delete_processed_task_queue(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM mesh_task_lists WHERE processing_key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn register_time_hook(&self, hook: TimeHook) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO mesh_task_lists (list_key, slot_ms, target, gid, aid, dad, sid, kind)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&hook.list_key)
        .bind(hook.slot_ms)
        .bind(&hook.target)
        .bind(&hook.gid)
        .bind(&hook.aid)
        .bind(&hook.dad)
        .bind(&hook.sid)
        .bind(kind_name(hook.kind))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_next_task(
        &self,
        now_ms: i64,
        list_key: Option<&str>,
    ) -> Result<Option<TimeHook>, StoreError> {
        let row = sqlx::query(
            r#"
            DELETE FROM mesh_task_lists
            WHERE id = (
                SELECT id FROM mesh_task_lists
                WHERE slot_ms <= $1
                  AND processing_key IS NULL
                  AND ($2::text IS NULL OR list_key = $2)
                ORDER BY slot_ms, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING list_key, slot_ms, target, gid, aid, dad, sid, kind
            "#,
        )
        .bind(now_ms)
        .bind(list_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|r| {
            Ok(TimeHook {
                list_key: r.get("list_key"),
                slot_ms: r.get("slot_ms"),
                target: r.get("target"),
                gid: r.get("gid"),
                aid: r.get("aid"),
                dad: r.get("dad"),
                sid: r.get("sid"),
                kind: parse_kind(r.get("kind"))?,
            })
        })
        .transpose()
    }

    async fn cancel_time_hooks(&self, job_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM mesh_task_lists WHERE target = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn set_hook_signal(&self, signal: HookSignal) -> Result<(), StoreError> {
        let target = serde_json::to_value(&signal.target)?;
        sqlx::query(
            r#"
            INSERT INTO mesh_hook_signals (topic, resolved, target, expire_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (topic, resolved) DO UPDATE
            SET target = EXCLUDED.target, expire_at = EXCLUDED.expire_at
            "#,
        )
        .bind(&signal.topic)
        .bind(&signal.resolved)
        .bind(&target)
        .bind(signal.expire_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_hook_signal(
        &self,
        topic: &str,
        resolved: &str,
    ) -> Result<Option<HookTarget>, StoreError> {
        // Read-and-remove: single delivery across all consumers.
        let row = sqlx::query(
            r#"
            DELETE FROM mesh_hook_signals
            WHERE topic = $1 AND resolved = $2
            RETURNING target, expire_at
            "#,
        )
        .bind(topic)
        .bind(resolved)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else { return Ok(None) };
        let expire_at: Option<chrono::DateTime<Utc>> = row.get("expire_at");
        if let Some(expire_at) = expire_at {
            if expire_at < Utc::now() {
                return Ok(None);
            }
        }
        let target: serde_json::Value = row.get("target");
        Ok(Some(
            serde_json::from_value(target).map_err(|e| StoreError::Serialization(e.to_string()))?,
        ))
    }

    async fn delete_hook_signal(&self, topic: &str, resolved: &str) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM mesh_hook_signals WHERE topic = $1 AND resolved = $2")
                .bind(topic)
                .bind(resolved)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn notify(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn listen(&self, channel: &str) -> Result<broadcast::Receiver<String>, StoreError> {
        if let Some(existing) = self.listeners.get(channel) {
            return Ok(existing.0.subscribe());
        }

        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(db_err)?;
        listener.listen(channel).await.map_err(db_err)?;

        let (tx, rx) = broadcast::channel(256);
        let tx_pump = tx.clone();
        let channel_name = channel.to_string();
        let handle = tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        let _ = tx_pump.send(notification.payload().to_string());
                    }
                    Err(e) => {
                        error!(channel = %channel_name, "listener error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
                if tx_pump.receiver_count() == 0 {
                    debug!(channel = %channel_name, "no receivers left, stopping pump");
                    break;
                }
            }
        });

        self.listeners
            .insert(channel.to_string(), (tx, handle));
        Ok(rx)
    }

    async fn unlisten(&self, channel: &str) -> Result<(), StoreError> {
        if let Some((_, (_, handle))) = self.listeners.remove(channel) {
            handle.abort();
        }
        Ok(())
    }

    async fn set_throttle_rate(&self, spec: &ThrottleSpec) -> Result<(), StoreError> {
        let scope = match (&spec.guid, &spec.topic) {
            (Some(guid), _) => format!("g:{guid}"),
            (None, Some(topic)) => format!("t:{topic}"),
            (None, None) => "app".to_string(),
        };
        sqlx::query(
            r#"
            INSERT INTO mesh_throttle (scope, rate_ms)
            VALUES ($1, $2)
            ON CONFLICT (scope) DO UPDATE SET rate_ms = EXCLUDED.rate_ms
            "#,
        )
        .bind(&scope)
        .bind(spec.throttle)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_throttle_rate(
        &self,
        topic: Option<&str>,
        guid: Option<&str>,
    ) -> Result<i64, StoreError> {
        let mut scopes = Vec::with_capacity(3);
        if let Some(guid) = guid {
            scopes.push(format!("g:{guid}"));
        }
        if let Some(topic) = topic {
            scopes.push(format!("t:{topic}"));
        }
        scopes.push("app".to_string());

        for scope in scopes {
            let row = sqlx::query("SELECT rate_ms FROM mesh_throttle WHERE scope = $1")
                .bind(&scope)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
            if let Some(row) = row {
                return Ok(row.get("rate_ms"));
            }
        }
        Ok(0)
    }

    #[instrument(skip(self))]
    async fn reserve_scout_role(
        &self,
        role: &str,
        guid: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO mesh_scout_roles (role, guid, lease_until)
            VALUES ($1, $2, now() + $3 * interval '1 millisecond')
            ON CONFLICT (role) DO UPDATE
            SET guid = EXCLUDED.guid, lease_until = EXCLUDED.lease_until
            WHERE mesh_scout_roles.lease_until < now()
               OR mesh_scout_roles.guid = EXCLUDED.guid
            RETURNING guid
            "#,
        )
        .bind(role)
        .bind(guid)
        .bind(lease.as_millis() as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|r| r.get::<String, _>("guid") == guid).unwrap_or(false))
    }

    #[instrument(skip(self, commit), fields(job = %commit.job_key))]
    async fn commit_leg(&self, commit: LegCommit) -> Result<f64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        Self::upsert_fields(&mut *tx, &commit.job_key, &commit.fields).await?;

        let status = match commit.set_status {
            Some(forced) => {
                sqlx::query(
                    r#"
                    INSERT INTO mesh_hash (key, field, value)
                    VALUES ($1, ':', ($2::double precision)::text)
                    ON CONFLICT (key, field)
                    DO UPDATE SET value = (($2::double precision))::text
                    "#,
                )
                .bind(&commit.job_key)
                .bind(forced)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                forced
            }
            None => Self::incr_status(&mut *tx, &commit.job_key, commit.status_delta).await?,
        };

        for (stream, message) in &commit.publishes {
            Self::insert_stream_entry(&mut *tx, stream, message, Duration::ZERO).await?;
        }
        for (stream, message, delay) in &commit.delayed_publishes {
            Self::insert_stream_entry(&mut *tx, stream, message, *delay).await?;
        }
        for signal in &commit.hook_signals {
            let target = serde_json::to_value(&signal.target)?;
            sqlx::query(
                r#"
                INSERT INTO mesh_hook_signals (topic, resolved, target, expire_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (topic, resolved) DO UPDATE
                SET target = EXCLUDED.target, expire_at = EXCLUDED.expire_at
                "#,
            )
            .bind(&signal.topic)
            .bind(&signal.resolved)
            .bind(&target)
            .bind(signal.expire_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        for hook in &commit.time_hooks {
            sqlx::query(
                r#"
                INSERT INTO mesh_task_lists (list_key, slot_ms, target, gid, aid, dad, sid, kind)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(&hook.list_key)
            .bind(hook.slot_ms)
            .bind(&hook.target)
            .bind(&hook.gid)
            .bind(&hook.aid)
            .bind(&hook.dad)
            .bind(&hook.sid)
            .bind(kind_name(hook.kind))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        debug!(status, "committed activity leg");
        Ok(status)
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    error!("database error: {}", e);
    StoreError::Database(e.to_string())
}

fn kind_name(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::Sleep => "sleep",
        TaskKind::Expire => "expire",
        TaskKind::Interrupt => "interrupt",
        TaskKind::Child => "child",
        TaskKind::Delist => "delist",
    }
}

fn parse_kind(kind: String) -> Result<TaskKind, StoreError> {
    match kind.as_str() {
        "sleep" => Ok(TaskKind::Sleep),
        "expire" => Ok(TaskKind::Expire),
        "interrupt" => Ok(TaskKind::Interrupt),
        "child" => Ok(TaskKind::Child),
        "delist" => Ok(TaskKind::Delist),
        other => Err(StoreError::Database(format!("unknown task kind: {other}"))),
    }
}
