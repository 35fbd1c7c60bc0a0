//! `worker` — emits work to a worker stream and interprets the reply
//!
//! The leave leg is the durable-function switchboard: besides plain success
//! and failure, the worker reply may carry a durable-control code that turns
//! into a time hook (588), a signal binding (595), a subflow spawn (590/591),
//! or a collated batch of those (589).

use std::collections::HashMap;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn};

use meshwork_core::control::{prefix_for, BatchPayload, SleepPayload, SpawnPayload, WaitPayload};
use meshwork_core::manifest::Graph;
use meshwork_core::message::{now_iso, MessageMetadata, StreamMessage};
use meshwork_core::{codes, job, JobError, MeshError, RetryPolicy};
use meshwork_store::{HookSignal, HookTarget, LegCommit, TaskKind, TimeHook};

use crate::activities::resolve_input;
use crate::engine::{trim_json_string, Engine};

/// Enter: map the input and put a message on the worker's stream topic.
pub async fn enter(
    engine: &Engine,
    graph: &Graph,
    message: &StreamMessage,
    fields: HashMap<String, String>,
) -> Result<(), MeshError> {
    let meta = &message.metadata;
    let def = graph.activity(&meta.aid)?;
    let declared = def
        .topic
        .clone()
        .ok_or_else(|| MeshError::fatal(format!("{}: worker without topic", meta.aid)))?;

    let doc = job::materialize_doc(&fields);
    let input = resolve_input(def, &doc, &message.data)?;

    // Worker topics may be substitution expressions, resolved per job (the
    // durable meta-graph routes each job to its workflow's own stream).
    let topic = if declared.contains('{') {
        let resolved = meshwork_core::resolve_expr(&serde_json::Value::String(declared), &doc)?;
        match resolved {
            serde_json::Value::String(topic) if !topic.is_empty() => topic,
            other => {
                return Err(MeshError::fatal(format!(
                    "{}: worker topic resolved to {other}",
                    meta.aid
                )))
            }
        }
    } else {
        declared
    };

    let mut new_fields = Vec::new();
    job::flatten_fields(&format!("{}/input/data", meta.aid), &input, &mut new_fields);

    let gid = fields.get("md/gid").map(|g| trim_json_string(g));
    let oj = fields.get("md/oj").map(|g| trim_json_string(g));
    let work = StreamMessage::new(
        MessageMetadata {
            jid: meta.jid.clone(),
            gid,
            aid: meta.aid.clone(),
            dad: meta.dad.clone(),
            tpc: Some(topic.clone()),
            ts: now_iso(),
            attempt: meta.attempt.max(1),
            trc: meta.trc.clone(),
            spn: meta.spn.clone(),
            oj,
            ..Default::default()
        },
        input,
    );

    let commit = LegCommit {
        job_key: engine.keys().job(&meta.jid),
        fields: new_fields,
        publishes: vec![(engine.keys().stream(&topic), work)],
        ..Default::default()
    };
    engine
        .store()
        .commit_leg(commit)
        .await
        .map_err(|e| MeshError::Store(e.to_string()))?;

    debug!(jid = %meta.jid, aid = %meta.aid, topic, "emitted worker message");
    Ok(())
}

/// Leave: interpret the worker's reply code.
pub async fn leave(
    engine: &Engine,
    graph: &Graph,
    message: &StreamMessage,
    fields: HashMap<String, String>,
) -> Result<(), MeshError> {
    let code = message.metadata.status_code();

    // Stream delivery is at-least-once; a redelivered reply must not fan out
    // or spawn twice. First `hincrby == 1.0` claims the leg.
    if !claim_leave(engine, message, code).await? {
        debug!(jid = %message.metadata.jid, code, "reply already processed; dropping");
        return Ok(());
    }

    match code {
        codes::SUCCESS | codes::PENDING => {
            engine
                .finish_leave(graph, message, fields, &message.data, code, vec![])
                .await
        }
        codes::RETRYABLE => retry(engine, graph, message, &fields).await,
        codes::FATAL | codes::MAX_ATTEMPTS | codes::TIMEOUT => {
            terminate(engine, graph, message, code).await
        }
        codes::SLEEP => sleep(engine, message, &fields).await,
        codes::WAIT => wait(engine, message, &fields).await,
        codes::CHILD | codes::PROXY => spawn(engine, message, &fields, code).await,
        codes::BATCH => batch(engine, message, &fields).await,
        other => Err(MeshError::fatal(format!("unknown reply code {other}"))),
    }
}

/// Claim one reply leg. The salt distinguishes replies sharing a dimension:
/// the suspension's execution index for durable-control codes, the attempt
/// counter otherwise.
async fn claim_leave(
    engine: &Engine,
    message: &StreamMessage,
    code: u32,
) -> Result<bool, MeshError> {
    let meta = &message.metadata;
    let salt = if codes::is_durable_control(code) {
        message
            .data
            .get("index")
            .or_else(|| message.data.get("base_index"))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    } else {
        meta.attempt.max(1) as u64
    };
    let guard = format!("-ack{}-{code}-{salt}-", meta.dad);
    let total = engine
        .store()
        .hincrby_float(&engine.keys().job(&meta.jid), &guard, 1.0)
        .await
        .map_err(|e| MeshError::Store(e.to_string()))?;
    Ok(total == 1.0)
}

/// Effective retry policy: per-call override (stored by the trigger maps),
/// then the activity's declaration, then defaults.
fn retry_policy(def_retry: Option<&RetryPolicy>, fields: &HashMap<String, String>) -> RetryPolicy {
    if let Some(raw) = fields.get("d/$retry") {
        if let Ok(policy) = serde_json::from_value(job::field_to_value(raw)) {
            return policy;
        }
    }
    def_retry.cloned().unwrap_or_default()
}

async fn retry(
    engine: &Engine,
    graph: &Graph,
    message: &StreamMessage,
    fields: &HashMap<String, String>,
) -> Result<(), MeshError> {
    let meta = &message.metadata;
    let def = graph.activity(&meta.aid)?;
    let policy = retry_policy(def.retry.as_ref(), fields);
    let attempt = meta.attempt.max(1);

    if !policy.has_attempts_remaining(attempt) {
        debug!(jid = %meta.jid, attempt, "retry budget exhausted");
        return terminate(engine, graph, message, codes::MAX_ATTEMPTS).await;
    }

    let delay = policy.delay_for_retry(attempt);
    let reentry = engine.enter_message(
        &meta.jid,
        meta.gid.as_deref(),
        &meta.aid,
        &meta.dad,
        attempt + 1,
        json!({}),
    );

    let commit = LegCommit {
        job_key: engine.keys().job(&meta.jid),
        delayed_publishes: vec![(engine.keys().engine_stream(), reentry, delay)],
        ..Default::default()
    };
    engine
        .store()
        .commit_leg(commit)
        .await
        .map_err(|e| MeshError::Store(e.to_string()))?;

    debug!(jid = %meta.jid, attempt, ?delay, "scheduled retry");
    Ok(())
}

/// Terminal failure: record `$error`, force the semaphore to zero, and run
/// the completion path (the error propagates to any parent from there).
async fn terminate(
    engine: &Engine,
    graph: &Graph,
    message: &StreamMessage,
    code: u32,
) -> Result<(), MeshError> {
    let meta = &message.metadata;
    let error_message = message
        .data
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("workflow failed")
        .to_string();
    let mut error = JobError::new(error_message, code);
    if let Some(stack) = message.data.get("stack").and_then(Value::as_str) {
        error = error.with_stack(stack);
    }

    let commit = LegCommit {
        job_key: engine.keys().job(&meta.jid),
        fields: vec![(
            job::data_field("$error"),
            serde_json::to_value(&error)?.to_string(),
        )],
        set_status: Some(0.0),
        ..Default::default()
    };
    engine
        .store()
        .commit_leg(commit)
        .await
        .map_err(|e| MeshError::Store(e.to_string()))?;

    warn!(jid = %meta.jid, code, "workflow terminated");
    engine.complete_job(graph, &meta.jid).await
}

async fn sleep(
    engine: &Engine,
    message: &StreamMessage,
    fields: &HashMap<String, String>,
) -> Result<(), MeshError> {
    let meta = &message.metadata;
    let payload: SleepPayload = serde_json::from_value(message.data.clone())?;
    let commit = LegCommit {
        job_key: engine.keys().job(&meta.jid),
        time_hooks: vec![sleep_hook(engine, meta, fields, payload.duration, payload.index)],
        ..Default::default()
    };
    engine
        .store()
        .commit_leg(commit)
        .await
        .map_err(|e| MeshError::Store(e.to_string()))?;
    debug!(jid = %meta.jid, duration = payload.duration, "registered durable sleep");
    Ok(())
}

fn sleep_hook(
    engine: &Engine,
    meta: &MessageMetadata,
    fields: &HashMap<String, String>,
    duration_secs: u64,
    index: u32,
) -> TimeHook {
    let wake_ms = Utc::now().timestamp_millis() + (duration_secs as i64) * 1000;
    let slot = engine.config().slot_for(wake_ms);
    TimeHook {
        list_key: engine.keys().time_slot(slot),
        target: meta.jid.clone(),
        gid: fields
            .get("md/gid")
            .map(|g| trim_json_string(g))
            .unwrap_or_default(),
        aid: meta.aid.clone(),
        dad: meta.dad.clone(),
        sid: Some(job::session_field('l', &meta.dad, index)),
        kind: TaskKind::Sleep,
        slot_ms: slot,
    }
}

async fn wait(
    engine: &Engine,
    message: &StreamMessage,
    fields: &HashMap<String, String>,
) -> Result<(), MeshError> {
    let meta = &message.metadata;
    let payload: WaitPayload = serde_json::from_value(message.data.clone())?;
    let sid = job::session_field('y', &meta.dad, payload.index);

    // Delivery-before-registration wins: the persisted signal resolves the
    // slot immediately and no binding is registered.
    if let Some(early) = engine.take_early_signal(&payload.signal, &payload.signal).await? {
        debug!(jid = %meta.jid, signal = %payload.signal, "early signal claims the wait");
        return engine
            .resolve_parent_session(&meta.jid, &meta.aid, &meta.dad, &sid, early, false)
            .await;
    }

    let commit = LegCommit {
        job_key: engine.keys().job(&meta.jid),
        hook_signals: vec![wait_binding(meta, fields, &payload.signal, sid)],
        ..Default::default()
    };
    engine
        .store()
        .commit_leg(commit)
        .await
        .map_err(|e| MeshError::Store(e.to_string()))?;
    debug!(jid = %meta.jid, signal = %payload.signal, "registered waitFor binding");
    Ok(())
}

fn wait_binding(
    meta: &MessageMetadata,
    fields: &HashMap<String, String>,
    signal: &str,
    sid: String,
) -> HookSignal {
    HookSignal {
        topic: signal.to_string(),
        resolved: signal.to_string(),
        target: HookTarget {
            job_id: meta.jid.clone(),
            gid: fields
                .get("md/gid")
                .map(|g| trim_json_string(g))
                .unwrap_or_default(),
            aid: meta.aid.clone(),
            dad: meta.dad.clone(),
            sid: Some(sid),
        },
        expire_at: None,
    }
}

async fn spawn(
    engine: &Engine,
    message: &StreamMessage,
    fields: &HashMap<String, String>,
    code: u32,
) -> Result<(), MeshError> {
    let meta = &message.metadata;
    let payload: SpawnPayload = serde_json::from_value(message.data.clone())?;
    let prefix = prefix_for(code);

    let (child_jid, start, mut commit_fields) =
        subflow_start(engine, meta, fields, prefix, &payload)?;

    let immediate = if payload.await_result {
        None
    } else {
        // start-child: resolve right away with the spawned job id.
        commit_fields.push((
            job::session_field(prefix, &meta.dad, payload.index),
            json!(child_jid).to_string(),
        ));
        Some(())
    };

    let commit = LegCommit {
        job_key: engine.keys().job(&meta.jid),
        fields: commit_fields,
        publishes: vec![(engine.keys().engine_stream(), start)],
        ..Default::default()
    };
    engine
        .store()
        .commit_leg(commit)
        .await
        .map_err(|e| MeshError::Store(e.to_string()))?;

    debug!(jid = %meta.jid, child = %child_jid, code, "spawned subflow");

    if immediate.is_some() {
        engine.reenter_worker(&meta.jid, &meta.aid, &meta.dad).await?;
    }
    Ok(())
}

/// Build the deterministic job-start message for one subflow. Deterministic
/// child ids make redelivered spawns idempotent (duplicate creation is
/// rejected at the trigger).
fn subflow_start(
    engine: &Engine,
    meta: &MessageMetadata,
    fields: &HashMap<String, String>,
    prefix: char,
    payload: &SpawnPayload,
) -> Result<(String, StreamMessage, Vec<(String, String)>), MeshError> {
    let child_jid = format!("{}-{}{}-{}", meta.jid, prefix, meta.dad, payload.index);
    let sid = job::session_field(prefix, &meta.dad, payload.index);

    let mut data = payload.data.clone();
    if let Some(retry) = &payload.retry {
        if let Some(map) = data.as_object_mut() {
            map.insert("$retry".to_string(), serde_json::to_value(retry)?);
        }
    }

    let oj = fields
        .get("md/oj")
        .map(|g| trim_json_string(g))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| meta.jid.clone());

    let start = StreamMessage::new(
        MessageMetadata {
            jid: child_jid.clone(),
            aid: String::new(),
            dad: "0".to_string(),
            tpc: Some(payload.topic.clone()),
            ts: now_iso(),
            trc: meta.trc.clone(),
            spn: meta.spn.clone(),
            pj: Some(meta.jid.clone()),
            pa: Some(meta.aid.clone()),
            pd: Some(meta.dad.clone()),
            oj: Some(oj),
            key: payload.await_result.then(|| sid.clone()),
            ..Default::default()
        },
        data,
    );

    let commit_fields = vec![(format!("ch/{child_jid}"), "1".to_string())];
    Ok((child_jid, start, commit_fields))
}

/// `589` — a collated batch: register every item in one commit with an
/// outstanding-count, then resolve any immediately-resolvable items.
async fn batch(
    engine: &Engine,
    message: &StreamMessage,
    fields: &HashMap<String, String>,
) -> Result<(), MeshError> {
    let meta = &message.metadata;
    let payload: BatchPayload = serde_json::from_value(message.data.clone())?;
    let total = payload.items.len();

    let mut commit = LegCommit::for_job(engine.keys().job(&meta.jid));
    commit.fields.push((
        job::pending_field(&meta.dad),
        format!("{total}"),
    ));

    // (sid, value) slots resolvable without waiting for anything external.
    let mut immediate: Vec<(String, Value)> = Vec::new();

    for item in &payload.items {
        match codes::normalize(item.code) {
            codes::SLEEP => {
                let p: SleepPayload = serde_json::from_value(item.payload.clone())?;
                commit
                    .time_hooks
                    .push(sleep_hook(engine, meta, fields, p.duration, p.index));
            }
            codes::WAIT => {
                let p: WaitPayload = serde_json::from_value(item.payload.clone())?;
                let sid = job::session_field('y', &meta.dad, p.index);
                if let Some(early) = engine.take_early_signal(&p.signal, &p.signal).await? {
                    immediate.push((sid, early));
                } else {
                    commit
                        .hook_signals
                        .push(wait_binding(meta, fields, &p.signal, sid));
                }
            }
            code @ (codes::CHILD | codes::PROXY) => {
                let p: SpawnPayload = serde_json::from_value(item.payload.clone())?;
                let prefix = prefix_for(code);
                let (child_jid, start, extra) = subflow_start(engine, meta, fields, prefix, &p)?;
                commit.fields.extend(extra);
                commit.publishes.push((engine.keys().engine_stream(), start));
                if !p.await_result {
                    immediate.push((
                        job::session_field(prefix, &meta.dad, p.index),
                        json!(child_jid),
                    ));
                }
            }
            other => {
                return Err(MeshError::fatal(format!(
                    "unsupported batch item code {other}"
                )))
            }
        }
    }

    engine
        .store()
        .commit_leg(commit)
        .await
        .map_err(|e| MeshError::Store(e.to_string()))?;
    debug!(jid = %meta.jid, total, "registered collated batch");

    for (sid, value) in immediate {
        engine
            .resolve_parent_session(&meta.jid, &meta.aid, &meta.dad, &sid, value, false)
            .await?;
    }
    Ok(())
}
