//! Exponential backoff for transient connection failures.
//!
//! Only failures that classify as transient ([`ExchangeError::is_transient`])
//! are retried. Transaction outcomes are never retried automatically: a failed
//! commit may or may not have been applied by the broker.

use crate::config::RetrySettings;
use crate::error::ExchangeError;
use rand::Rng;
use std::time::Duration;

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;

/// Retry policy with exponential backoff and jitter
///
/// # Examples
///
/// ```rust
/// use queue_exchange::retry::RetryPolicy;
/// use std::time::Duration;
///
/// // Default policy: 3 retries, 500ms initial, 10s max, 2.0x multiplier
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.total_attempts(), 4);
///
/// let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(16), 2.0)
///     .without_jitter();
/// assert_eq!(policy.calculate_delay(2), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,

    /// Exponential growth factor
    pub backoff_multiplier: f64,

    pub use_jitter: bool,

    /// Jitter range as a fraction of the delay (0.25 = ±25%)
    pub jitter_percent: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            use_jitter: true,
            jitter_percent: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Create a jittered policy
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_multiplier,
            use_jitter: true,
            jitter_percent: 0.25,
        }
    }

    /// Build a policy from loaded settings
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_millis(settings.initial_delay_ms),
            Duration::from_millis(settings.max_delay_ms),
            settings.backoff_multiplier,
        )
    }

    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Set custom jitter percentage (clamped to 0.0..=1.0)
    pub fn with_jitter_percent(mut self, percent: f64) -> Self {
        self.jitter_percent = percent.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (0-based): `initial * multiplier^attempt`,
    /// capped at `max_delay`, then jittered
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped_delay_secs = base_delay_secs.min(self.max_delay.as_secs_f64());

        let final_delay_secs = if self.use_jitter {
            Self::add_jitter(capped_delay_secs, self.jitter_percent)
        } else {
            capped_delay_secs
        };

        Duration::from_secs_f64(final_delay_secs)
    }

    /// Delay to wait after `error` on retry number `attempt`
    ///
    /// A broker-suggested delay wins when it is longer than the backoff.
    pub fn delay_for(&self, error: &ExchangeError, attempt: u32) -> Duration {
        let backoff = self.calculate_delay(attempt);
        match error.retry_after() {
            Some(suggested) if suggested > backoff => suggested.min(self.max_delay),
            _ => backoff,
        }
    }

    /// Check if retry number `attempt` (0-based) is still allowed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Initial attempt plus retries
    pub fn total_attempts(&self) -> u32 {
        self.max_attempts.saturating_add(1)
    }

    fn add_jitter(delay_secs: f64, jitter_percent: f64) -> f64 {
        let jitter_range = delay_secs * jitter_percent;
        if jitter_range <= 0.0 {
            return delay_secs;
        }

        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        (delay_secs + jitter).max(0.0)
    }
}

/// Attempt counter for one retried operation
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Current retry attempt (0-based)
    pub attempt: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_attempt(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }

    /// Check if `error` may be retried under `policy` at this point
    pub fn can_retry(&self, policy: &RetryPolicy, error: &ExchangeError) -> bool {
        error.should_retry() && policy.should_retry(self.attempt)
    }

    /// Delay before the next attempt
    pub fn get_delay(&self, policy: &RetryPolicy, error: &ExchangeError) -> Duration {
        policy.delay_for(error, self.attempt)
    }
}
