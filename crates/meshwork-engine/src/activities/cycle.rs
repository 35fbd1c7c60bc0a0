//! `cycle` — unconditional back-edge to a declared ancestor
//!
//! Re-enqueues the ancestor with input overrides under a bumped dimensional
//! path, giving each iteration its own re-entrant scope. Bounded loops are
//! expressed as a conditional transition into a cycle activity.

use std::collections::HashMap;

use tracing::debug;

use meshwork_core::manifest::Graph;
use meshwork_core::message::StreamMessage;
use meshwork_core::{job, MeshError};
use meshwork_store::LegCommit;

use crate::activities::{bump_dimension, resolve_input};
use crate::engine::{trim_json_string, Engine};

/// Single-leg: emit the ancestor's enter transition and retire.
pub async fn enter(
    engine: &Engine,
    graph: &Graph,
    message: &StreamMessage,
    fields: HashMap<String, String>,
) -> Result<(), MeshError> {
    let meta = &message.metadata;
    let def = graph.activity(&meta.aid)?;
    let ancestor = def
        .ancestor
        .clone()
        .ok_or_else(|| MeshError::fatal(format!("{}: cycle without ancestor", meta.aid)))?;

    // Verify the back-edge target exists before enqueueing.
    graph.activity(&ancestor)?;

    let doc = job::materialize_doc(&fields);
    let overrides = resolve_input(def, &doc, &message.data)?;
    let next_dad = bump_dimension(&meta.dad);
    let gid = fields.get("md/gid").map(|g| trim_json_string(g));

    let reentry = engine.enter_message(&meta.jid, gid.as_deref(), &ancestor, &next_dad, 0, overrides);

    // The cycle leg retires (−1) as the ancestor's new leg opens (+1).
    let commit = LegCommit {
        job_key: engine.keys().job(&meta.jid),
        publishes: vec![(engine.keys().engine_stream(), reentry)],
        ..Default::default()
    };
    engine
        .store()
        .commit_leg(commit)
        .await
        .map_err(|e| MeshError::Store(e.to_string()))?;

    debug!(jid = %meta.jid, ancestor, dad = %next_dad, "cycled to ancestor");
    Ok(())
}
