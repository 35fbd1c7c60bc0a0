//! `trigger` — creates the job HASH and immediately proceeds to its leave leg

use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use meshwork_core::manifest::{AppManifest, Graph};
use meshwork_core::message::StreamMessage;
use meshwork_core::{codes, job, JobMetadata, MeshError};

use crate::engine::{value_to_plain, Engine};

/// Both legs of the trigger run in one pass: persist the job record, seed
/// metadata and data, then fan out the first transitions.
pub async fn run(
    engine: &Engine,
    manifest: &AppManifest,
    graph: &Graph,
    message: &StreamMessage,
) -> Result<(), MeshError> {
    let (tid, tdef) = graph.trigger()?;
    let meta = &message.metadata;
    let jid = &meta.jid;
    let gid = Uuid::now_v7().simple().to_string();

    let mut metadata = JobMetadata {
        jid: jid.clone(),
        gid: gid.clone(),
        app: manifest.id.clone(),
        vrs: manifest.version.clone(),
        tpc: graph.subscribes.clone(),
        ts: meta.ts.clone(),
        trc: meta.trc.clone(),
        spn: meta.spn.clone(),
        pj: meta.pj.clone(),
        pa: meta.pa.clone(),
        pd: meta.pd.clone(),
        oj: meta.oj.clone(),
        expire: graph.expire,
        key: meta.key.clone(),
        ..Default::default()
    };

    // Secondary-key indexing for `signal all` fan-out.
    let mut stats_entry: Option<String> = None;
    if let Some(stats) = &tdef.stats {
        if let (Some(id), Some(key_expr)) = (&stats.id, &stats.key) {
            let doc = json!({ tid: { "output": { "data": message.data } } });
            let name = value_to_plain(&meshwork_core::resolve_expr(id, &doc)?);
            let value = value_to_plain(&meshwork_core::resolve_expr(key_expr, &doc)?);
            if metadata.key.is_none() {
                metadata.key = Some(value.clone());
            }
            stats_entry = Some(engine.keys().job_stats(&format!("{name}:{value}")));
        }
    }

    let mut fields = metadata.to_fields();
    job::flatten_fields(&format!("{tid}/output/data"), &message.data, &mut fields);

    let job_key = engine.keys().job(jid);
    let created = engine
        .store()
        .create_job(&job_key, fields.clone(), 1.0)
        .await
        .map_err(|e| MeshError::Store(e.to_string()))?;
    if !created {
        return Err(MeshError::DuplicateJob(jid.clone()));
    }
    debug!(%jid, %gid, topic = %graph.subscribes, "created job");

    if let Some(stats_key) = stats_entry {
        engine
            .store()
            .hset(&stats_key, vec![(jid.clone(), "1".to_string())])
            .await
            .map_err(|e| MeshError::Store(e.to_string()))?;
    }

    // Back-link on the parent for interrupt descent.
    if let Some(pj) = &metadata.pj {
        engine
            .store()
            .hset(
                &engine.keys().job(pj),
                vec![(format!("ch/{jid}"), "1".to_string())],
            )
            .await
            .map_err(|e| MeshError::Store(e.to_string()))?;
    }

    // Leave leg: job maps + first transitions.
    let mut leave = message.clone();
    leave.metadata.aid = tid.to_string();
    leave.metadata.gid = Some(gid);
    engine
        .finish_leave(
            graph,
            &leave,
            fields.into_iter().collect(),
            &message.data,
            codes::SUCCESS,
            vec![],
        )
        .await
}
