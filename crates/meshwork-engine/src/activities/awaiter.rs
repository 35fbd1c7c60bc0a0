//! `await` — spawns a child job on another graph's entry topic

use std::collections::HashMap;

use serde_json::json;
use tracing::debug;

use meshwork_core::manifest::Graph;
use meshwork_core::message::{now_iso, MessageMetadata, StreamMessage};
use meshwork_core::{job, MeshError};
use meshwork_store::LegCommit;

use crate::activities::resolve_input;
use crate::engine::{trim_json_string, Engine};

/// Enter: publish the child's job-start transition. With `await: true` the
/// leave leg arrives when the child completes; otherwise it runs here.
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
        .ok_or_else(|| MeshError::fatal(format!("{}: await without topic", meta.aid)))?;

    let doc = job::materialize_doc(&fields);
    let input = resolve_input(def, &doc, &message.data)?;

    let child_jid = format!("{}-{}-{}", meta.jid, meta.aid, meta.dad);
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
            tpc: Some(topic),
            ts: now_iso(),
            trc: meta.trc.clone(),
            spn: meta.spn.clone(),
            pj: def.await_result.then(|| meta.jid.clone()),
            pa: def.await_result.then(|| meta.aid.clone()),
            pd: def.await_result.then(|| meta.dad.clone()),
            oj: Some(oj),
            ..Default::default()
        },
        input,
    );

    let commit = LegCommit {
        job_key: engine.keys().job(&meta.jid),
        fields: vec![(format!("ch/{child_jid}"), "1".to_string())],
        publishes: vec![(engine.keys().engine_stream(), start)],
        ..Default::default()
    };
    engine
        .store()
        .commit_leg(commit)
        .await
        .map_err(|e| MeshError::Store(e.to_string()))?;
    debug!(jid = %meta.jid, child = %child_jid, "spawned awaited job");

    if !def.await_result {
        // Fire-and-forget: the leave leg runs immediately with the child id.
        return engine
            .finish_leave(
                graph,
                message,
                fields,
                &json!({ "id": child_jid }),
                meshwork_core::codes::SUCCESS,
                vec![],
            )
            .await;
    }
    Ok(())
}

/// Leave: the child completed (successfully or not); its output is the data.
pub async fn leave(
    engine: &Engine,
    graph: &Graph,
    message: &StreamMessage,
    fields: HashMap<String, String>,
) -> Result<(), MeshError> {
    engine
        .finish_leave(
            graph,
            message,
            fields,
            &message.data,
            message.metadata.status_code(),
            vec![],
        )
        .await
}
