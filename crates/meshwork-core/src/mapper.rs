//! Mapping rules and `{a.b.c}` substitution
//!
//! A mapping expression is an arbitrary JSON value in which:
//!
//! - a string of the form `{a.b.c}` reads `a.b.c` from the job document
//! - an object `{"@pipe": [...]}` or `{"@reduce": [...]}` evaluates a pipe
//! - any other value resolves element-by-element (objects/arrays) or as a
//!   literal
//!
//! Sink keys in a rule set may end with `[-]` (append to array) or `[N]`
//! (assign array slot N).

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::pipe;

/// Mapping rules: sink key → expression. Ordered so evaluation and tests are
/// deterministic.
pub type MapRules = BTreeMap<String, Value>;

/// Errors from mapping / pipe evaluation.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum MapError {
    #[error("unknown operator: {0}")]
    UnknownOperator(String),

    #[error("operator {op} expects {expected} argument(s), got {got}")]
    BadArity {
        op: String,
        expected: usize,
        got: usize,
    },

    #[error("operator {op} requires numeric arguments")]
    NotANumber { op: String },

    #[error("bad expression: {0}")]
    BadExpression(String),

    #[error("bad sink key: {0}")]
    BadSink(String),
}

/// If `s` is a `{path}` substitution (and not an `{@operator}`), return the
/// inner path.
pub fn substitution(s: &str) -> Option<&str> {
    let inner = s.strip_prefix('{')?.strip_suffix('}')?;
    if inner.is_empty() || inner.starts_with('@') {
        None
    } else {
        Some(inner)
    }
}

/// Read a dotted path from a document. Missing paths resolve to `Null`;
/// numeric segments index into arrays.
pub fn resolve_path(doc: &Value, path: &str) -> Value {
    let mut current = doc;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => match map.get(segment) {
                Some(v) => v,
                None => return Value::Null,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(v) => v,
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    current.clone()
}

/// Resolve a mapping expression against the job document.
pub fn resolve_expr(expr: &Value, doc: &Value) -> Result<Value, MapError> {
    match expr {
        Value::String(s) => Ok(match substitution(s) {
            Some(path) => resolve_path(doc, path),
            None => expr.clone(),
        }),
        Value::Object(map) => {
            if let Some(rows) = map.get("@pipe") {
                let rows = rows
                    .as_array()
                    .ok_or_else(|| MapError::BadExpression("@pipe expects a list".into()))?;
                return pipe::eval_pipe(rows, doc);
            }
            if let Some(rows) = map.get("@reduce") {
                let rows = rows
                    .as_array()
                    .ok_or_else(|| MapError::BadExpression("@reduce expects a list".into()))?;
                return pipe::eval_reduce(rows, doc);
            }
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_expr(v, doc)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_expr(item, doc)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

/// Evaluate a rule set, producing the mapped output document.
pub fn map_rules(rules: &MapRules, doc: &Value) -> Result<Value, MapError> {
    let mut out = Value::Object(Map::new());
    for (sink, expr) in rules {
        let value = resolve_expr(expr, doc)?;
        write_sink(&mut out, sink, value)?;
    }
    Ok(out)
}

/// One parsed sink segment.
enum Sink<'a> {
    Key(&'a str),
    Append(&'a str),
    Index(&'a str, usize),
}

fn parse_segment(segment: &str) -> Result<Sink<'_>, MapError> {
    if let Some(key) = segment.strip_suffix("[-]") {
        return Ok(Sink::Append(key));
    }
    if let Some(open) = segment.find('[') {
        let close = segment
            .rfind(']')
            .ok_or_else(|| MapError::BadSink(segment.to_string()))?;
        let idx: usize = segment[open + 1..close]
            .parse()
            .map_err(|_| MapError::BadSink(segment.to_string()))?;
        return Ok(Sink::Index(&segment[..open], idx));
    }
    Ok(Sink::Key(segment))
}

/// Write `value` at the dotted `sink` key, honoring `[-]` / `[N]` suffixes on
/// the final segment.
pub fn write_sink(out: &mut Value, sink: &str, value: Value) -> Result<(), MapError> {
    let segments: Vec<&str> = sink.split('.').collect();
    let mut current = out;

    for (i, raw) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;
        let segment = parse_segment(raw)?;

        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let map = current.as_object_mut().unwrap();

        match segment {
            Sink::Key(key) => {
                if last {
                    map.insert(key.to_string(), value);
                    return Ok(());
                }
                current = map
                    .entry(key.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
            }
            Sink::Append(key) => {
                if !last {
                    return Err(MapError::BadSink(sink.to_string()));
                }
                let slot = map
                    .entry(key.to_string())
                    .or_insert_with(|| Value::Array(vec![]));
                if !slot.is_array() {
                    *slot = Value::Array(vec![]);
                }
                slot.as_array_mut().unwrap().push(value);
                return Ok(());
            }
            Sink::Index(key, idx) => {
                if !last {
                    return Err(MapError::BadSink(sink.to_string()));
                }
                let slot = map
                    .entry(key.to_string())
                    .or_insert_with(|| Value::Array(vec![]));
                if !slot.is_array() {
                    *slot = Value::Array(vec![]);
                }
                let arr = slot.as_array_mut().unwrap();
                while arr.len() <= idx {
                    arr.push(Value::Null);
                }
                arr[idx] = value;
                return Ok(());
            }
        }
    }
    Ok(())
}
