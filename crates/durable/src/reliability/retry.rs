//! Retry policy for activity calls made through
//! [`WorkflowContext::call_activity_with_retry`](crate::WorkflowContext::call_activity_with_retry)

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::activity::{ActivityError, UNKNOWN_HANDLER_ERROR};
use crate::config::duration_millis;

/// How often and how patiently a failed activity call is retried
///
/// Every attempt is a separate activity execution with its own record. The
/// workflow body sees only the final outcome.
///
/// # Example
///
/// ```
/// use tallyloom_durable::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(4)
///     .with_initial_interval(Duration::from_millis(200))
///     .with_non_retryable_error("InvalidInput");
///
/// assert_eq!(policy.max_attempts, 4);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Attempts in total, including the first
    pub max_attempts: u32,

    /// Delay before the second attempt
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Upper bound on any single delay
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth factor between consecutive delays
    pub backoff_coefficient: f64,

    /// Relative randomness applied to each delay, 0.0 to 1.0
    pub jitter: f64,

    /// `error_type` values that end the call immediately
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff: 3 attempts, 100ms doubling up to 10s, 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            backoff_coefficient: 2.0,
            jitter: 0.1,
            non_retryable_errors: vec![],
        }
    }

    /// Single attempt
    pub fn no_retry() -> Self {
        Self::fixed(Duration::ZERO, 1)
    }

    /// Constant delay between attempts
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_non_retryable_error(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_errors.push(error_type.into());
        self
    }

    /// Delay to wait before `attempt` (1-based); the first attempt has none
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(2).min(i32::MAX as u32) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let range = capped * self.jitter;
            (capped + rand::thread_rng().gen_range(-range..=range)).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Whether a failed attempt may be followed by another one
    ///
    /// Unknown activity names are never retried: no row was written and
    /// another attempt cannot succeed.
    pub fn should_retry(&self, error: &ActivityError, attempt: u32) -> bool {
        if attempt >= self.max_attempts || !error.retryable {
            return false;
        }
        match error.error_type.as_deref() {
            Some(UNKNOWN_HANDLER_ERROR) => false,
            Some(error_type) => !self.non_retryable_errors.iter().any(|e| e == error_type),
            None => true,
        }
    }
}
