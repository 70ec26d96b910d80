//! Retry delays for connect and listen attempts

use std::time::Duration;

use tk_core::config::BackoffConfig;

/// Backoff with optional growth and jitter between retries.
///
/// With the default [`BackoffConfig`] (multiplier 1.0, no jitter) every delay
/// is the same fixed interval.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Current delay
    current: Duration,
    /// Maximum delay
    max: Duration,
    /// Multiplier
    multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    jitter: f64,
}

impl ExponentialBackoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier, config.jitter)
    }

    /// Create a new backoff with custom parameters.
    ///
    /// Non-finite factors fall back to no growth and no jitter.
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        let multiplier = if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 };
        let jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
        Self {
            current: initial,
            max: std::cmp::max(initial, max),
            multiplier,
            jitter,
        }
    }

    /// Get the next delay and advance the backoff
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        // Saturate at max instead of overflowing Duration
        let next = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max);
        self.current = std::cmp::min(next, self.max);

        if self.jitter == 0.0 {
            return delay;
        }
        let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
        delay.saturating_add(Duration::try_from_secs_f64(jitter_amount).unwrap_or_default())
    }
}
