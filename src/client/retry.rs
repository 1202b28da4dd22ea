//! Exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// Retry schedule: attempt `i` (zero-based) backs off
/// `backoff * 2^i` plus up to 25% random jitter, capped.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_backoff_ms: u64) -> Self {
        Self {
            max_retries,
            base_backoff: Duration::from_millis(base_backoff_ms),
            max_backoff: Duration::from_secs(30),
        }
    }

    /// Backoff before retry attempt `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_backoff);
        let jitter_frac = rand::thread_rng().gen_range(0.0..0.25);
        exp + exp.mul_f64(jitter_frac)
    }
}
