//! Activity kinds
//!
//! Every activity runs a two-leg contract: **enter** (map input, perform the
//! kind-specific side effect) and **leave** (receive the completion, map
//! output and `job.maps`, fan out transitions). The engine dispatches on the
//! closed [`ActivityKind`](meshwork_core::ActivityKind) enum; each kind lives
//! in its own module.

pub mod awaiter;
pub mod cycle;
pub mod hook;
pub mod signal;
pub mod trigger;
pub mod worker;

use serde_json::Value;

use meshwork_core::manifest::ActivityDef;
use meshwork_core::{MapError, MapRules};

/// Resolve an activity's enter-leg input.
///
/// Declared `input` rules win; otherwise the transition message's payload
/// (cycle overrides, hook deliveries) and finally the job's own data section.
pub(crate) fn resolve_input(
    def: &ActivityDef,
    doc: &Value,
    message_data: &Value,
) -> Result<Value, MapError> {
    if let Some(rules) = &def.input {
        return map_input(rules, doc);
    }
    if message_data.as_object().map(|m| !m.is_empty()).unwrap_or(false) {
        return Ok(message_data.clone());
    }
    Ok(doc.get("data").cloned().unwrap_or(Value::Null))
}

fn map_input(rules: &MapRules, doc: &Value) -> Result<Value, MapError> {
    meshwork_core::map_rules(rules, doc)
}

/// Increment a dimensional path for a cycle re-entry: `0` → `0,1` → `0,2`.
pub(crate) fn bump_dimension(dad: &str) -> String {
    match dad.rsplit_once(',') {
        Some((head, last)) => {
            let next: i64 = last.parse::<i64>().map(|n| n + 1).unwrap_or(1);
            format!("{head},{next}")
        }
        None => format!("{dad},1"),
    }
}
