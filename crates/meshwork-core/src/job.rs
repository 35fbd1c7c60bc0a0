//! Job HASH field discipline
//!
//! The authoritative per-job record is a flat field map ("HASH"). Reserved
//! namespaces:
//!
//! | Field shape | Meaning |
//! |---|---|
//! | `:` | status semaphore (in-flight leg count; negative ≤ floor = interrupted) |
//! | `md/<name>` | job metadata |
//! | `d/<path>` | user data mapped per `job.maps` |
//! | `<aid>/output/data/<path>` | activity output leg |
//! | `<aid>/input/data/<path>` | activity input leg |
//! | `-<prefix><dim>-<idx>-` | durable replay markers |
//! | `-search<dim>-<idx>` | re-entry dimension counters |
//!
//! User-facing search keys are prefixed with `_` by the durable runtime so
//! they can never collide with these.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The status-semaphore field.
pub const STATUS_FIELD: &str = ":";

/// Metadata field for `name`.
pub fn md_field(name: &str) -> String {
    format!("md/{name}")
}

/// User-data field for a dotted `path`.
pub fn data_field(path: &str) -> String {
    format!("d/{path}")
}

/// Activity output field for a dotted `path`.
pub fn output_field(aid: &str, path: &str) -> String {
    format!("{aid}/output/data/{path}")
}

/// Activity input field for a dotted `path`.
pub fn input_field(aid: &str, path: &str) -> String {
    format!("{aid}/input/data/{path}")
}

/// Replay marker key: `-{prefix}{dim}-{idx}-`.
pub fn session_field(prefix: char, dimension: &str, index: u32) -> String {
    format!("-{prefix}{dimension}-{index}-")
}

/// Re-entry dimension counter for hook invocations.
pub fn search_field(dimension: &str, index: u32) -> String {
    format!("-search{dimension}-{index}")
}

/// Outstanding-subflow countdown for one suspended dimension. Present only
/// while a collated batch is in flight.
pub fn pending_field(dimension: &str) -> String {
    format!("-pending{dimension}-")
}

/// True when the field is a durable replay marker.
pub fn is_session_field(field: &str) -> bool {
    field.len() >= 3 && field.starts_with('-') && field.ends_with('-')
}

/// Job metadata (`md/*` fields), typed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct JobMetadata {
    pub jid: String,
    pub gid: String,
    pub app: String,
    pub vrs: String,
    pub tpc: String,
    pub ts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pj: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pa: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oj: Option<String>,
    /// Cleanup TTL in seconds, scheduled when the job completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire: Option<u64>,
    /// Secondary key for `signal all` fan-out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl JobMetadata {
    /// Flatten into `md/*` HASH fields. `None` fields are omitted.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let value = serde_json::to_value(self).unwrap_or(Value::Null);
        let mut fields = Vec::new();
        if let Value::Object(map) = value {
            for (k, v) in map {
                fields.push((md_field(&k), value_to_field(&v)));
            }
        }
        fields
    }

    /// Rebuild from raw HASH fields.
    pub fn from_fields(fields: &HashMap<String, String>) -> Self {
        let mut map = Map::new();
        for (field, raw) in fields {
            if let Some(name) = field.strip_prefix("md/") {
                map.insert(name.to_string(), field_to_value(raw));
            }
        }
        serde_json::from_value(Value::Object(map)).unwrap_or_default()
    }
}

/// Query result: the user-visible view of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobOutput {
    pub metadata: JobMetadata,
    pub data: Value,
}

/// Full dump of a job record for diagnostics / migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExport {
    pub status: f64,
    pub metadata: JobMetadata,
    pub data: Value,
    /// Durable replay markers, keyed by session id.
    pub replay: HashMap<String, Value>,
    /// Per-activity output documents, keyed by activity id.
    pub activities: HashMap<String, Value>,
}

/// Scalars are stored JSON-serialized; anything unparseable is a bare string.
pub fn field_to_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Serialize a scalar for storage in the HASH.
pub fn value_to_field(value: &Value) -> String {
    match value {
        Value::String(s) => serde_json::to_string(s).unwrap_or_else(|_| s.clone()),
        other => other.to_string(),
    }
}

/// Materialize the mapping document from raw HASH fields.
///
/// Shape: `{ "metadata": {..}, "data": {..}, "<aid>": { "output": { "data":
/// {..} }, "input": { "data": {..} } } }` — the document every `{a.b.c}`
/// expression resolves against.
pub fn materialize_doc(fields: &HashMap<String, String>) -> Value {
    let mut doc = Map::new();

    for (field, raw) in fields {
        if field == STATUS_FIELD || is_session_field(field) {
            continue;
        }
        if let Some(name) = field.strip_prefix("md/") {
            insert_at(&mut doc, &format!("metadata.{name}"), field_to_value(raw));
        } else if let Some(path) = field.strip_prefix("d/") {
            insert_at(&mut doc, &format!("data.{path}"), field_to_value(raw));
        } else if field.contains('/') {
            // <aid>/output/data/<path> and <aid>/input/data/<path>
            let dotted = field.replace('/', ".");
            insert_at(&mut doc, &dotted, field_to_value(raw));
        }
    }

    Value::Object(doc)
}

/// Flatten a JSON value into dotted-path HASH fields under `prefix`.
pub fn flatten_fields(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (k, v) in map {
                let next = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}/{k}")
                };
                flatten_fields(&next, v, out);
            }
        }
        other => out.push((prefix.to_string(), value_to_field(other))),
    }
}

fn insert_at(root: &mut Map<String, Value>, dotted: &str, value: Value) {
    let mut segments = dotted.split('.').peekable();
    let mut current = root;
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return;
        }
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry.as_object_mut().unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_metadata() -> JobMetadata {
        JobMetadata {
            jid: "j1".into(),
            gid: "g1".into(),
            app: "demo".into(),
            vrs: "1".into(),
            tpc: "order.created".into(),
            ts: "2026-08-01T00:00:00.000Z".into(),
            pj: Some("parent".into()),
            expire: Some(120),
            ..Default::default()
        }
    }

    #[test]
    fn test_metadata_field_round_trip() {
        let md = sample_metadata();
        let fields: HashMap<String, String> = md.to_fields().into_iter().collect();

        assert_eq!(fields.get("md/jid").unwrap(), "\"j1\"");
        assert_eq!(fields.get("md/expire").unwrap(), "120");
        assert!(!fields.contains_key("md/jc"));

        let back = JobMetadata::from_fields(&fields);
        assert_eq!(back, md);
    }

    #[test]
    fn test_session_field_shapes() {
        assert_eq!(session_field('l', "0", 3), "-l0-3-");
        assert_eq!(session_field('p', "0,1", 0), "-p0,1-0-");
        assert!(is_session_field("-l0-3-"));
        assert!(!is_session_field("md/jid"));
        assert!(!is_session_field(":"));
    }

    #[test]
    fn test_materialize_doc() {
        let mut fields = HashMap::new();
        fields.insert(":".to_string(), "1".to_string());
        fields.insert("md/jid".to_string(), "\"j1\"".to_string());
        fields.insert("d/user/name".to_string(), "\"ada\"".to_string());
        fields.insert("a1/output/data/total".to_string(), "42".to_string());
        fields.insert("-l0-1-".to_string(), "null".to_string());

        let doc = materialize_doc(&fields);
        assert_eq!(doc["metadata"]["jid"], json!("j1"));
        assert_eq!(doc["data"]["user"]["name"], json!("ada"));
        assert_eq!(doc["a1"]["output"]["data"]["total"], json!(42));
        // status + replay markers never leak into the mapping doc
        assert!(doc.get(":").is_none());
        assert!(doc.get("-l0-1-").is_none());
    }

    #[test]
    fn test_flatten_fields() {
        let mut out = Vec::new();
        flatten_fields(
            "d",
            &json!({"user": {"name": "ada", "age": 36}, "tags": ["a", "b"]}),
            &mut out,
        );
        out.sort();
        assert_eq!(
            out,
            vec![
                ("d/tags".to_string(), "[\"a\",\"b\"]".to_string()),
                ("d/user/age".to_string(), "36".to_string()),
                ("d/user/name".to_string(), "\"ada\"".to_string()),
            ]
        );
    }

    #[test]
    fn test_scalar_storage_round_trip() {
        for v in [json!("text"), json!(1.5), json!(true), json!(null), json!([1, 2])] {
            let raw = value_to_field(&v);
            assert_eq!(field_to_value(&raw), v);
        }
    }
}
