//! Retry policy with exponential backoff
//!
//! Delay before retry n (1-indexed) is `base * 2^(n-1)`, capped at
//! `max_delay`, then randomized by +/- `jitter` and clamped back under the cap.

use rand::Rng;
use std::time::Duration;

/// Bounded retry configuration for a publish
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per publish, including the first
    pub max_attempts: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Upper bound for any retry delay
    pub max_delay: Duration,

    /// Jitter fraction (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait before retry number `retry` (1 = first retry)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let unit = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        self.delay_with_jitter(retry, unit)
    }

    /// Delay with an explicit jitter sample in [-1.0, 1.0]
    pub fn delay_with_jitter(&self, retry: u32, unit: f64) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        // 2^31 is already far past any sane cap
        let exponent = (retry - 1).min(31);
        let base = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        let factor = 1.0 + self.jitter * unit.clamp(-1.0, 1.0);
        let nanos = (base.as_nanos() as f64 * factor).round().max(0.0);

        Duration::from_nanos(nanos as u64).min(self.max_delay)
    }
}
