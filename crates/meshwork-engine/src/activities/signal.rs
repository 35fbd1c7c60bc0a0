//! `signal` — emits a hook signal to one job or a keyed set of jobs

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

use meshwork_core::manifest::{Graph, SignalSubtype};
use meshwork_core::message::StreamMessage;
use meshwork_core::{codes, job, MeshError};

use crate::activities::resolve_input;
use crate::engine::{value_to_plain, Engine};

/// Single-leg: deliver the signal(s), then run the leave transition fan-out.
pub async fn enter(
    engine: &Engine,
    graph: &Graph,
    message: &StreamMessage,
    fields: HashMap<String, String>,
) -> Result<(), MeshError> {
    let meta = &message.metadata;
    let def = graph.activity(&meta.aid)?;
    let topic = def
        .topic
        .clone()
        .ok_or_else(|| MeshError::fatal(format!("{}: signal without topic", meta.aid)))?;

    let doc = job::materialize_doc(&fields);
    let data = resolve_input(def, &doc, &message.data)?;

    match def.subtype.unwrap_or_default() {
        SignalSubtype::One => {
            engine.deliver_signal(&topic, data.clone(), None).await?;
        }
        SignalSubtype::All => {
            deliver_all(engine, &topic, def, &doc, &data).await?;
        }
    }

    engine
        .finish_leave(graph, message, fields, &data, codes::SUCCESS, vec![])
        .await
}

/// `subtype: all` — fan out to every job indexed under `key_name = key_value`.
async fn deliver_all(
    engine: &Engine,
    topic: &str,
    def: &meshwork_core::ActivityDef,
    doc: &Value,
    data: &Value,
) -> Result<(), MeshError> {
    let key_name = def
        .key_name
        .clone()
        .ok_or_else(|| MeshError::fatal("signal all without key_name"))?;
    let key_value_expr = def
        .key_value
        .clone()
        .ok_or_else(|| MeshError::fatal("signal all without key_value"))?;
    let key_value = value_to_plain(&meshwork_core::resolve_expr(&key_value_expr, doc)?);

    let stats_key = engine.keys().job_stats(&format!("{key_name}:{key_value}"));
    let members = engine
        .store()
        .hget_all(&stats_key)
        .await
        .map_err(|e| MeshError::Store(e.to_string()))?;

    debug!(topic, key_name, key_value, count = members.len(), "signal fan-out");

    let manifest = engine.manifest().await?;
    for jid in members.keys() {
        // Per-job bindings register with the job id as their resolved key.
        let target = engine
            .store()
            .get_hook_signal(topic, jid)
            .await
            .map_err(|e| MeshError::Store(e.to_string()))?;
        match target {
            Some(target) => {
                engine
                    .dispatch_hook_delivery(&manifest, target, topic, data.clone(), None)
                    .await?;
            }
            None => {
                warn!(%jid, topic, "no binding for fan-out target");
            }
        }
    }

    Ok(())
}
