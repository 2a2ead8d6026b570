//! Retry Policy
//!
//! Retry budget and exponential backoff curve for failed export cycles.

use rand::Rng;
use std::time::Duration;

/// Retry behavior after a failed export.
///
/// The first retry happens on the next tick; subsequent retries back off
/// exponentially up to `max_backoff`. The attempt counter lives in the
/// processor and resets on restart.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Failed cycles tolerated before the batch is surfaced to the
    /// fault handler. A value of 0 surfaces the first failure.
    pub max_attempts: u32,
    /// Delay before the second retry.
    pub initial_backoff: Duration,
    /// Ceiling on the computed delay.
    pub max_backoff: Duration,
    /// Growth factor between consecutive retries. Must be positive.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Nominal (pre-jitter) delay before retry `attempt`.
    ///
    /// `backoff(1)` is zero so the first retry runs on the next tick;
    /// from the second retry on the delay grows as
    /// `initial * multiplier^(attempt - 2)`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = self.multiplier.powi(attempt as i32 - 2);
        let delay = self.initial_backoff.as_secs_f64() * exp;
        let capped = delay.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Backoff with a bounded jitter of up to ±12.5% applied, so peer
    /// processes retrying the same outage do not synchronize.
    pub fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let nominal = self.backoff(attempt).as_secs_f64();
        if nominal == 0.0 {
            return Duration::ZERO;
        }
        let jitter = 0.25 * nominal * (rand::thread_rng().gen::<f64>() - 0.5);
        Duration::from_secs_f64((nominal + jitter).max(0.0))
    }
}
