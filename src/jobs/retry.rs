//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Backoff schedule for retried work: `min(max, base · 2^(attempt-1))`,
/// jittered ±20 %.  `attempt` is 1-based (the attempt that just failed).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// The un-jittered delay for a given failed attempt.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let scaled = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp));
        scaled.min(self.max_delay)
    }

    /// The jittered delay actually applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        jitter(self.raw_delay(attempt))
    }
}

/// Apply ±20 % uniform jitter to a duration.
pub fn jitter(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    base.mul_f64(factor)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
