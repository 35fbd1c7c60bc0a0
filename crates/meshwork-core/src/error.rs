//! Error taxonomy
//!
//! Every terminal error kind maps onto a wire status code (defined in
//! [`crate::codes`]). Durable-control interruptions are deliberately NOT part
//! of this enum — they are control flow, live in the durable runtime crate,
//! and must never surface to user code as a `MeshError`.

use serde::{Deserialize, Serialize};

use crate::codes;
use crate::mapper::MapError;

/// Errors surfaced by the mesh core, engine, and client.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// Transient worker failure; the engine reschedules with backoff.
    #[error("retryable: {message}")]
    Retryable { message: String },

    /// Retry budget exhausted; terminal.
    #[error("maximum attempts exhausted: {message}")]
    MaxAttempts { message: String },

    /// Bounded wait exceeded; terminal.
    #[error("timed out: {message}")]
    Timeout { message: String },

    /// User-thrown unrecoverable failure; terminal.
    #[error("fatal: {message}")]
    Fatal { message: String },

    /// Partial fan-in; the engine keeps waiting for the remaining signals.
    #[error("incomplete signal fan-in")]
    IncompleteSignal,

    /// Provider failure (connection, transaction, stream).
    #[error("store error: {0}")]
    Store(String),

    /// Payload (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Manifest file parse failure.
    #[error("manifest error: {0}")]
    Manifest(#[from] serde_yaml::Error),

    /// Mapping / pipe evaluation failure.
    #[error("mapping error: {0}")]
    Map(#[from] MapError),

    /// No deployed (or no active) manifest for the app.
    #[error("unknown app or version: {0}")]
    UnknownApp(String),

    /// No graph subscribes to the topic.
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    /// Activity id missing from the graph.
    #[error("unknown activity: {0}")]
    UnknownActivity(String),

    /// Duplicate job id without a new generation.
    #[error("duplicate job: {0}")]
    DuplicateJob(String),

    /// Job HASH not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Client-side wait for completion expired (the job keeps running).
    #[error("timed out waiting for job {0}")]
    PubSubTimeout(String),
}

impl MeshError {
    /// The wire status code for this error kind.
    pub fn code(&self) -> u32 {
        match self {
            Self::Retryable { .. } => codes::RETRYABLE,
            Self::MaxAttempts { .. } => codes::MAX_ATTEMPTS,
            Self::Timeout { .. } | Self::PubSubTimeout(_) => codes::TIMEOUT,
            _ => codes::FATAL,
        }
    }

    /// Shorthand constructors used throughout the engine.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }
}

/// Wire form of a terminal job error.
///
/// Stored under the job's `$error` slot and propagated to parent workflows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobError {
    /// Human-readable message.
    pub message: String,

    /// Terminal status code (596, 597, or 598).
    pub code: u32,

    /// Optional captured stack / provenance text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl JobError {
    pub fn new(message: impl Into<String>, code: u32) -> Self {
        Self {
            message: message.into(),
            code,
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl From<&MeshError> for JobError {
    fn from(err: &MeshError) -> Self {
        JobError::new(err.to_string(), err.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(MeshError::retryable("x").code(), 599);
        assert_eq!(
            MeshError::MaxAttempts {
                message: "x".into()
            }
            .code(),
            597
        );
        assert_eq!(
            MeshError::Timeout {
                message: "x".into()
            }
            .code(),
            598
        );
        assert_eq!(MeshError::fatal("x").code(), 596);
        assert_eq!(MeshError::JobNotFound("j".into()).code(), 596);
    }

    #[test]
    fn test_job_error_round_trip() {
        let err = JobError::new("boom", 596).with_stack("at main");
        let json = serde_json::to_string(&err).unwrap();
        let parsed: JobError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, parsed);
    }

    #[test]
    fn test_job_error_from_mesh_error() {
        let err = MeshError::retryable("flaky downstream");
        let wire = JobError::from(&err);
        assert_eq!(wire.code, 599);
        assert!(wire.message.contains("flaky downstream"));
    }
}
