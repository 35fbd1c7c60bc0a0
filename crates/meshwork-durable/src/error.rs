//! Control-flow and failure discipline for workflow functions
//!
//! Suspension is an error value: a durable primitive registers its
//! interruption and returns `Err(DurableError::Interrupted)`, which the user
//! function propagates with `?`. A handler that swallows an interruption
//! breaks determinism — any recovery code must check [`did_interrupt`] and
//! propagate when it returns true.

use meshwork_core::{codes, JobError};

/// Errors inside a workflow or activity function.
#[derive(Debug, thiserror::Error)]
pub enum DurableError {
    /// Control flow, not a failure: the function suspended on a durable
    /// primitive. The interruption details live in the context registry;
    /// the engine consumes them. Must never reach user-visible results.
    #[error("workflow interrupted")]
    Interrupted,

    /// Transient failure; the engine reschedules with exponential backoff.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Unrecoverable failure; terminal.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Retry budget exhausted; terminal.
    #[error("maximum attempts exceeded: {0}")]
    MaxAttempts(String),

    /// Bounded wait exceeded; terminal.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A child workflow or proxied activity failed; rethrown at the call
    /// site with the wire error intact.
    #[error("{}", .0.message)]
    Activity(JobError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(String),
}

impl DurableError {
    /// True for the engine's control-flow signal.
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Interrupted)
    }

    /// The wire status code this outcome maps to.
    pub fn code(&self) -> u32 {
        match self {
            Self::Interrupted => codes::BATCH, // refined by the worker wrapper
            Self::Retryable(_) => codes::RETRYABLE,
            Self::MaxAttempts(_) => codes::MAX_ATTEMPTS,
            Self::Timeout(_) => codes::TIMEOUT,
            Self::Activity(err) if codes::is_fatal(err.code) => err.code,
            _ => codes::FATAL,
        }
    }
}

/// Type guard for user-authored recovery code: when this returns true the
/// error MUST be rethrown.
pub fn did_interrupt(err: &DurableError) -> bool {
    err.is_interruption()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_did_interrupt_guard() {
        assert!(did_interrupt(&DurableError::Interrupted));
        assert!(!did_interrupt(&DurableError::Fatal("x".into())));
        assert!(!did_interrupt(&DurableError::Retryable("x".into())));
    }

    #[test]
    fn test_wire_codes() {
        assert_eq!(DurableError::Retryable("x".into()).code(), 599);
        assert_eq!(DurableError::Fatal("x".into()).code(), 596);
        assert_eq!(DurableError::MaxAttempts("x".into()).code(), 597);
        assert_eq!(DurableError::Timeout("x".into()).code(), 598);
        assert_eq!(
            DurableError::Activity(JobError::new("downstream", 597)).code(),
            597
        );
        assert_eq!(
            DurableError::Activity(JobError::new("odd code", 200)).code(),
            596
        );
    }

    #[test]
    fn test_activity_error_displays_message() {
        let err = DurableError::Activity(JobError::new("boom", 596));
        assert_eq!(err.to_string(), "boom");
    }
}
