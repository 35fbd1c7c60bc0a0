//! `hook` — awaits a time event (`sleep`) or an external signal (`hook`)

use std::collections::HashMap;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use meshwork_core::manifest::Graph;
use meshwork_core::message::StreamMessage;
use meshwork_core::{job, MeshError};
use meshwork_store::{HookSignal, HookTarget, LegCommit, TaskKind, TimeHook};

use crate::engine::{trim_json_string, value_to_plain, Engine};

/// Enter: register the timer or the signal binding; the leave leg arrives
/// when the scout fires or the signal is delivered.
pub async fn enter(
    engine: &Engine,
    graph: &Graph,
    message: &StreamMessage,
    fields: HashMap<String, String>,
) -> Result<(), MeshError> {
    let meta = &message.metadata;
    let def = graph.activity(&meta.aid)?;
    let doc = job::materialize_doc(&fields);
    let gid = fields
        .get("md/gid")
        .map(|g| trim_json_string(g))
        .unwrap_or_default();

    if let Some(sleep_expr) = &def.sleep {
        let resolved = meshwork_core::resolve_expr(sleep_expr, &doc)?;
        let seconds = resolved
            .as_u64()
            .or_else(|| resolved.as_str().and_then(|s| s.parse().ok()))
            .ok_or_else(|| {
                MeshError::fatal(format!("{}: sleep did not resolve to seconds", meta.aid))
            })?;
        let wake_ms = Utc::now().timestamp_millis() + (seconds as i64) * 1000;
        let slot = engine.config().slot_for(wake_ms);

        let commit = LegCommit {
            job_key: engine.keys().job(&meta.jid),
            time_hooks: vec![TimeHook {
                list_key: engine.keys().time_slot(slot),
                target: meta.jid.clone(),
                gid,
                aid: meta.aid.clone(),
                dad: meta.dad.clone(),
                sid: None,
                kind: TaskKind::Sleep,
                slot_ms: slot,
            }],
            ..Default::default()
        };
        engine
            .store()
            .commit_leg(commit)
            .await
            .map_err(|e| MeshError::Store(e.to_string()))?;
        debug!(jid = %meta.jid, aid = %meta.aid, seconds, "registered timer hook");
        return Ok(());
    }

    if let Some(hook) = &def.hook {
        let resolved = match &hook.resolver {
            Some(resolver) => value_to_plain(&meshwork_core::resolve_expr(resolver, &doc)?),
            None => meta.jid.clone(),
        };

        // A signal that arrived first wins over registration.
        if let Some(early) = engine.take_early_signal(&hook.topic, &resolved).await? {
            debug!(jid = %meta.jid, topic = %hook.topic, "early signal satisfies the hook");
            return leave_with(engine, graph, message, fields, early).await;
        }

        let commit = LegCommit {
            job_key: engine.keys().job(&meta.jid),
            hook_signals: vec![HookSignal {
                topic: hook.topic.clone(),
                resolved: resolved.clone(),
                target: HookTarget {
                    job_id: meta.jid.clone(),
                    gid,
                    aid: meta.aid.clone(),
                    dad: meta.dad.clone(),
                    sid: None,
                },
                expire_at: None,
            }],
            ..Default::default()
        };
        engine
            .store()
            .commit_leg(commit)
            .await
            .map_err(|e| MeshError::Store(e.to_string()))?;
        debug!(jid = %meta.jid, topic = %hook.topic, resolved, "registered signal hook");
        return Ok(());
    }

    Err(MeshError::fatal(format!(
        "{}: hook declares neither sleep nor hook",
        meta.aid
    )))
}

/// Leave: the timer fired or the signal arrived; map output and fan out.
pub async fn leave(
    engine: &Engine,
    graph: &Graph,
    message: &StreamMessage,
    fields: HashMap<String, String>,
) -> Result<(), MeshError> {
    let data = message.data.clone();
    leave_with(engine, graph, message, fields, data).await
}

async fn leave_with(
    engine: &Engine,
    graph: &Graph,
    message: &StreamMessage,
    fields: HashMap<String, String>,
    output: Value,
) -> Result<(), MeshError> {
    engine
        .finish_leave(
            graph,
            message,
            fields,
            &output,
            message.metadata.status_code(),
            vec![],
        )
        .await
}
