//! Stream transition messages
//!
//! The unit of work on a provider stream. Wire field names are the compact
//! forms (`jid`, `aid`, `dad`, ...) — see the reserved-name table in the
//! graph descriptor documentation.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::codes;

/// Metadata envelope carried by every stream message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MessageMetadata {
    /// Job id.
    pub jid: String,

    /// Generation id — distinguishes re-executions of the same `jid`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<String>,

    /// Target activity id.
    pub aid: String,

    /// Dimensional path — comma-separated indices scoping a re-entrant
    /// context within the job (e.g. `"0"` or `"0,1"`).
    #[serde(default = "MessageMetadata::root_dimension")]
    pub dad: String,

    /// Entry topic that routed the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpc: Option<String>,

    /// Trace / span ids (propagated, not interpreted).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spn: Option<String>,

    /// Publish timestamp, ISO-8601.
    pub ts: String,

    /// Status code; absent means an enter-leg transition (treated as 200).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u32>,

    /// Delivery attempt counter for retryable legs.
    #[serde(default, rename = "try")]
    pub attempt: u32,

    /// Parent linkage: job / activity / dimension of the spawning scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pj: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pa: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pd: Option<String>,

    /// Origin job id — root of the durable cascade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oj: Option<String>,

    /// Secondary key; spawned subflows carry the parent's replay slot here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl MessageMetadata {
    fn root_dimension() -> String {
        "0".to_string()
    }

    /// Metadata for a fresh enter-leg transition.
    pub fn enter(jid: impl Into<String>, aid: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            aid: aid.into(),
            dad: Self::root_dimension(),
            ts: now_iso(),
            ..Default::default()
        }
    }

    /// Status code with the legacy wait alias collapsed; enter legs read 200.
    pub fn status_code(&self) -> u32 {
        codes::normalize(self.code.unwrap_or(codes::SUCCESS))
    }
}

/// A transition message on a provider stream.
///
/// Serialized once per leg as compact JSON; nested objects in `data` are
/// permitted but never re-serialized in flight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamMessage {
    pub metadata: MessageMetadata,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl StreamMessage {
    pub fn new(metadata: MessageMetadata, data: serde_json::Value) -> Self {
        Self { metadata, data }
    }
}

/// Current time in the wire timestamp format.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a wire timestamp.
pub fn parse_iso(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_round_trip() {
        let msg = StreamMessage::new(
            MessageMetadata {
                jid: "job-1".into(),
                aid: "a1".into(),
                dad: "0,1".into(),
                code: Some(595),
                ts: now_iso(),
                ..Default::default()
            },
            json!({"k": "v"}),
        );

        let wire = serde_json::to_string(&msg).unwrap();
        let parsed: StreamMessage = serde_json::from_str(&wire).unwrap();
        assert_eq!(msg, parsed);
    }

    #[test]
    fn test_attempt_serializes_as_try() {
        let mut meta = MessageMetadata::enter("j", "a");
        meta.attempt = 3;
        let wire = serde_json::to_value(&meta).unwrap();
        assert_eq!(wire["try"], json!(3));
    }

    #[test]
    fn test_status_code_defaults_and_normalizes() {
        let mut meta = MessageMetadata::enter("j", "a");
        assert_eq!(meta.status_code(), 200);

        meta.code = Some(594);
        assert_eq!(meta.status_code(), 595);
    }

    #[test]
    fn test_missing_dad_defaults_to_root() {
        let parsed: MessageMetadata = serde_json::from_value(json!({
            "jid": "j", "aid": "a", "ts": now_iso()
        }))
        .unwrap();
        assert_eq!(parsed.dad, "0");
    }

    #[test]
    fn test_timestamp_round_trip() {
        let ts = now_iso();
        assert!(parse_iso(&ts).is_some());
    }
}
