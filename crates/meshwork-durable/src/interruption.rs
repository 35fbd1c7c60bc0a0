//! Interruption descriptors
//!
//! One entry per suspended durable primitive, registered before the
//! control-flow error propagates. The worker wrapper serializes them onto
//! the wire: a single entry as its own status code, several (or any wait)
//! as a `589` collation.

use serde_json::{json, Value};

use meshwork_core::control::{BatchItem, BatchPayload, SleepPayload, SpawnPayload, WaitPayload};
use meshwork_core::{codes, RetryPolicy};

/// A registered suspension, pending engine interpretation.
#[derive(Debug, Clone, PartialEq)]
pub enum Interruption {
    Sleep {
        duration_secs: u64,
        index: u32,
    },
    Wait {
        signal: String,
        index: u32,
    },
    Proxy {
        topic: String,
        data: Value,
        index: u32,
        retry: Option<RetryPolicy>,
    },
    Child {
        topic: String,
        data: Value,
        index: u32,
        await_result: bool,
        retry: Option<RetryPolicy>,
    },
}

impl Interruption {
    /// The wire status code for this interruption alone.
    pub fn code(&self) -> u32 {
        match self {
            Self::Sleep { .. } => codes::SLEEP,
            Self::Wait { .. } => codes::WAIT,
            Self::Proxy { .. } => codes::PROXY,
            Self::Child { .. } => codes::CHILD,
        }
    }

    pub fn index(&self) -> u32 {
        match self {
            Self::Sleep { index, .. }
            | Self::Wait { index, .. }
            | Self::Proxy { index, .. }
            | Self::Child { index, .. } => *index,
        }
    }

    /// The wire payload for this interruption alone.
    pub fn payload(&self) -> Value {
        match self {
            Self::Sleep {
                duration_secs,
                index,
            } => json!(SleepPayload {
                duration: *duration_secs,
                index: *index,
            }),
            Self::Wait { signal, index } => json!(WaitPayload {
                signal: signal.clone(),
                index: *index,
            }),
            Self::Proxy {
                topic,
                data,
                index,
                retry,
            } => json!(SpawnPayload {
                topic: topic.clone(),
                data: data.clone(),
                index: *index,
                await_result: true,
                retry: retry.clone(),
            }),
            Self::Child {
                topic,
                data,
                index,
                await_result,
                retry,
            } => json!(SpawnPayload {
                topic: topic.clone(),
                data: data.clone(),
                index: *index,
                await_result: *await_result,
                retry: retry.clone(),
            }),
        }
    }

    pub fn is_wait(&self) -> bool {
        matches!(self, Self::Wait { .. })
    }
}

/// Collapse a registry into its wire form: `(code, payload)`.
///
/// Waits always collate so signal fan-in resolves through one outstanding
/// counter regardless of arrival order.
pub fn to_wire(registry: &[Interruption]) -> Option<(u32, Value)> {
    match registry {
        [] => None,
        [single] if !single.is_wait() => Some((single.code(), single.payload())),
        items => {
            let base_index = items.iter().map(Interruption::index).min().unwrap_or(0);
            let batch = BatchPayload {
                base_index,
                items: items
                    .iter()
                    .map(|i| BatchItem {
                        code: i.code(),
                        payload: i.payload(),
                    })
                    .collect(),
            };
            Some((codes::BATCH, json!(batch)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_sleep_is_its_own_code() {
        let registry = vec![Interruption::Sleep {
            duration_secs: 2,
            index: 1,
        }];
        let (code, payload) = to_wire(&registry).unwrap();
        assert_eq!(code, 588);
        assert_eq!(payload["duration"], json!(2));
        assert_eq!(payload["index"], json!(1));
    }

    #[test]
    fn test_single_wait_still_collates() {
        let registry = vec![Interruption::Wait {
            signal: "approved".into(),
            index: 3,
        }];
        let (code, payload) = to_wire(&registry).unwrap();
        assert_eq!(code, 589);
        assert_eq!(payload["base_index"], json!(3));
        assert_eq!(payload["items"][0]["code"], json!(595));
    }

    #[test]
    fn test_multiple_collate_with_min_base() {
        let registry = vec![
            Interruption::Wait {
                signal: "A".into(),
                index: 4,
            },
            Interruption::Wait {
                signal: "B".into(),
                index: 5,
            },
        ];
        let (code, payload) = to_wire(&registry).unwrap();
        assert_eq!(code, 589);
        assert_eq!(payload["base_index"], json!(4));
        assert_eq!(payload["items"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_empty_registry_is_none() {
        assert!(to_wire(&[]).is_none());
    }
}
