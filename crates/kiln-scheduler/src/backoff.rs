//! Retry policy for transient dispatch failures.

use std::time::Duration;

/// Bounds and pacing for redispatch after a transient failure.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of dispatch attempts before a request is finalized
    /// as an exception.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Ceiling on the backoff delay in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given attempt becomes eligible again.
    ///
    /// Formula: min(base_delay * 2^(attempt-1), max_delay)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let scaled = (self.base_delay_ms as f64) * 2f64.powi(exp);
        let capped = scaled.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// True once the attempt budget is spent.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
