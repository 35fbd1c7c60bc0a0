//! Durable-control wire payloads
//!
//! When a workflow function suspends, the worker replies with one of the
//! durable-control status codes and one of these payloads in `data`. The
//! engine interprets them into time hooks, signal bindings, or subflow
//! spawns, storing each eventual result under the session's replay slot.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codes;
use crate::retry::RetryPolicy;

/// Replay-marker prefix for a control code.
///
/// The full prefix alphabet (including the side-effect markers the worker
/// writes directly) is `[ehklptydr]`, which the selective replay fetch
/// pattern depends on.
pub fn prefix_for(code: u32) -> char {
    match codes::normalize(code) {
        codes::SLEEP => 'l',
        codes::WAIT => 'y',
        codes::CHILD => 'd',
        codes::PROXY => 'p',
        _ => 'r',
    }
}

/// `588` — timed sleep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SleepPayload {
    /// Sleep duration in seconds.
    pub duration: u64,

    /// Execution index of the suspended primitive.
    pub index: u32,
}

/// `595` — wait for an external signal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WaitPayload {
    /// Signal id the workflow is waiting on.
    pub signal: String,

    pub index: u32,
}

/// `590` / `591` — spawn a child job (child workflow or proxied activity).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpawnPayload {
    /// Entry topic of the target graph.
    pub topic: String,

    /// Trigger payload for the child job.
    pub data: Value,

    pub index: u32,

    /// When false, spawn fire-and-forget and resolve the slot immediately.
    #[serde(default = "default_true")]
    pub await_result: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

fn default_true() -> bool {
    true
}

/// One collated interruption inside a `589` batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchItem {
    /// The item's own control code (588/590/591/595).
    pub code: u32,

    /// The item's payload in its own wire shape.
    pub payload: Value,
}

/// `589` — collated batch of interruptions registered by one suspension.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchPayload {
    pub items: Vec<BatchItem>,

    /// Execution index of the first item; item `i` resolves into index
    /// `base_index + i`.
    pub base_index: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prefixes_stay_in_fetch_alphabet() {
        for code in [588, 589, 590, 591, 594, 595] {
            assert!("ehklptydr".contains(prefix_for(code)));
        }
        assert_eq!(prefix_for(588), 'l');
        assert_eq!(prefix_for(595), 'y');
        assert_eq!(prefix_for(594), 'y');
        assert_eq!(prefix_for(590), 'd');
        assert_eq!(prefix_for(591), 'p');
    }

    #[test]
    fn test_batch_round_trip() {
        let batch = BatchPayload {
            base_index: 4,
            items: vec![
                BatchItem {
                    code: 595,
                    payload: json!({"signal": "A", "index": 4}),
                },
                BatchItem {
                    code: 595,
                    payload: json!({"signal": "B", "index": 5}),
                },
            ],
        };
        let wire = serde_json::to_value(&batch).unwrap();
        let back: BatchPayload = serde_json::from_value(wire).unwrap();
        assert_eq!(batch, back);
    }

    #[test]
    fn test_spawn_await_defaults_true() {
        let spawn: SpawnPayload = serde_json::from_value(json!({
            "topic": "durable.execute",
            "data": {},
            "index": 1
        }))
        .unwrap();
        assert!(spawn.await_result);
    }
}
