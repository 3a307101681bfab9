//! Exponential backoff for failed cycles.

use std::time::Duration;

use crate::config::BackoffConfig;

/// Stateless policy: computes the delay for the n-th consecutive failure.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: multiplier.max(1.0),
        }
    }

    /// Delay before the `attempt`-th retry (1-based), capped at the maximum.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let ms = self.initial.as_millis() as f64 * self.multiplier.powi(exp);
        let capped = ms.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay for a bounded retry budget; `None` once `attempt > max_retries`.
    pub fn delay_within(&self, attempt: u32, max_retries: u32) -> Option<Duration> {
        (attempt <= max_retries).then(|| self.delay(attempt))
    }
}

impl From<&BackoffConfig> for Backoff {
    fn from(c: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(c.initial_ms),
            Duration::from_millis(c.max_ms),
            c.multiplier,
        )
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}
