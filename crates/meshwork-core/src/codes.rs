//! Wire status codes
//!
//! These values are bit-exact on the stream payloads; peers written against
//! other SDK generations depend on them. `594` is a legacy alias for
//! wait-for-signal that is accepted on ingress and normalized, never emitted.

/// Activity leg completed successfully.
pub const SUCCESS: u32 = 200;

/// Accepted; continuation pending (fire-and-forget acknowledgements).
pub const PENDING: u32 = 202;

/// Durable control: workflow requested a timed sleep.
pub const SLEEP: u32 = 588;

/// Durable control: collated batch of interruptions (`all` fan-out).
pub const BATCH: u32 = 589;

/// Durable control: workflow requested a child workflow.
pub const CHILD: u32 = 590;

/// Durable control: workflow requested a proxied activity.
pub const PROXY: u32 = 591;

/// Legacy wait-for-signal code; normalize to [`WAIT`] on ingress.
pub const WAIT_LEGACY: u32 = 594;

/// Durable control: workflow is waiting for an external signal.
pub const WAIT: u32 = 595;

/// Terminal: unrecoverable user-thrown failure.
pub const FATAL: u32 = 596;

/// Terminal: retry budget exhausted.
pub const MAX_ATTEMPTS: u32 = 597;

/// Terminal: bounded wait exceeded.
pub const TIMEOUT: u32 = 598;

/// Transient failure; the engine reschedules with exponential backoff.
pub const RETRYABLE: u32 = 599;

/// Job status at or below this value means the job was interrupted.
pub const INTERRUPTED_FLOOR: f64 = -100_000_000.0;

/// True for codes that terminate the activity leg successfully.
pub fn is_success(code: u32) -> bool {
    code == SUCCESS || code == PENDING
}

/// True for the three terminal failure categories.
pub fn is_fatal(code: u32) -> bool {
    matches!(code, FATAL | MAX_ATTEMPTS | TIMEOUT)
}

/// True for the durable-control family (sleep/batch/child/proxy/wait).
pub fn is_durable_control(code: u32) -> bool {
    matches!(code, SLEEP | BATCH | CHILD | PROXY | WAIT | WAIT_LEGACY)
}

/// True when the engine should reschedule the leg.
pub fn is_retryable(code: u32) -> bool {
    code == RETRYABLE
}

/// Collapse the legacy wait code into the authoritative one.
pub fn normalize(code: u32) -> u32 {
    if code == WAIT_LEGACY {
        WAIT
    } else {
        code
    }
}
