//! Retry policy for proxied activities and child workflows

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential retry schedule.
///
/// The base delay before retry `n` (0-based) is
/// `min(maximum_interval, backoff_coefficient ^ n)` seconds. With the
/// default `jitter` of `0.0` that schedule is exact; a non-zero jitter
/// spreads each delay by ±`jitter` to avoid thundering-herd retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub maximum_attempts: u32,

    /// Base of the exponential schedule.
    pub backoff_coefficient: f64,

    /// Cap on any single delay, in seconds.
    pub maximum_interval: u64,

    /// When false, a terminal error is returned to the caller as a value
    /// instead of being rethrown.
    pub throw_on_error: bool,

    /// Jitter factor (0.0–1.0); 0.25 means ±25% randomness per delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            maximum_attempts: 5,
            backoff_coefficient: 10.0,
            maximum_interval: 120,
            throw_on_error: true,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry (0-based retry counter), with this
    /// policy's jitter applied.
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        let raw = self.backoff_coefficient.powi(retry_count as i32);
        let capped = raw.min(self.maximum_interval as f64);

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let jitter_range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-jitter_range..jitter_range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Whether another attempt is allowed after `attempt` tries (1-based).
    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.maximum_attempts
    }

    pub fn with_maximum_attempts(mut self, attempts: u32) -> Self {
        self.maximum_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    pub fn with_maximum_interval(mut self, seconds: u64) -> Self {
        self.maximum_interval = seconds;
        self
    }

    pub fn with_throw_on_error(mut self, throw: bool) -> Self {
        self.throw_on_error = throw;
        self
    }

    /// Set the jitter factor (clamped to 0.0–1.0).
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.maximum_attempts, 5);
        assert_eq!(policy.backoff_coefficient, 10.0);
        assert_eq!(policy.maximum_interval, 120);
        assert!(policy.throw_on_error);
        assert_eq!(policy.jitter, 0.0);
    }

    #[test]
    fn test_exponential_schedule() {
        let policy = RetryPolicy::default().with_backoff_coefficient(2.0);
        assert_eq!(policy.delay_for_retry(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(4));
    }

    #[test]
    fn test_maximum_interval_caps() {
        let policy = RetryPolicy::default(); // coefficient 10, cap 120s
        assert_eq!(policy.delay_for_retry(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(100));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(120));
        assert_eq!(policy.delay_for_retry(9), Duration::from_secs(120));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default()
            .with_backoff_coefficient(2.0)
            .with_jitter(0.25);

        // base delay for retry 2 is 4s; ±25% keeps every sample in [3, 5]
        for _ in 0..50 {
            let delay = policy.delay_for_retry(2);
            assert!(delay >= Duration::from_secs(3), "delay {delay:?} below bound");
            assert!(delay <= Duration::from_secs(5), "delay {delay:?} above bound");
        }
    }

    #[test]
    fn test_jitter_clamped() {
        let policy = RetryPolicy::default().with_jitter(7.0);
        assert_eq!(policy.jitter, 1.0);
        let policy = RetryPolicy::default().with_jitter(-1.0);
        assert_eq!(policy.jitter, 0.0);
    }

    #[test]
    fn test_attempts_remaining() {
        let policy = RetryPolicy::default().with_maximum_attempts(3);
        assert!(policy.has_attempts_remaining(1));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
    }

    #[test]
    fn test_camel_case_wire_names() {
        let parsed: RetryPolicy = serde_json::from_str(
            r#"{"maximumAttempts": 3, "backoffCoefficient": 2, "maximumInterval": 30, "throwOnError": false, "jitter": 0.1}"#,
        )
        .unwrap();
        assert_eq!(parsed.maximum_attempts, 3);
        assert_eq!(parsed.maximum_interval, 30);
        assert!(!parsed.throw_on_error);
        assert_eq!(parsed.jitter, 0.1);

        // jitter is optional on the wire
        let parsed: RetryPolicy =
            serde_json::from_str(r#"{"maximumAttempts": 2}"#).unwrap();
        assert_eq!(parsed.jitter, 0.0);
    }
}
