//! Async token bucket.
//!
//! Tokens accrue at a fixed rate up to a burst cap. `acquire` waits
//! cooperatively for a token up to the caller's deadline, then fails
//! with `RateLimited` carrying the wait that would have been needed.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{PipelineError, Result};

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Process-wide token bucket, one per external service.
pub struct TokenBucket {
    rate_per_s: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate_per_s: f64, burst: u32) -> Self {
        Self {
            rate_per_s: rate_per_s.max(f64::MIN_POSITIVE),
            burst: burst.max(1) as f64,
            state: Mutex::new(BucketState {
                tokens: burst.max(1) as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token without waiting.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("bucket lock poisoned");
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take one token, waiting until `deadline` if the bucket is empty.
    pub async fn acquire(&self, deadline: Instant) -> Result<()> {
        loop {
            let wait = {
                let mut state = self.state.lock().expect("bucket lock poisoned");
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.rate_per_s)
            };

            if Instant::now() + wait > deadline {
                return Err(PipelineError::RateLimited {
                    retry_after_ms: wait.as_millis() as u64,
                });
            }
            tokio::time::sleep(wait).await;
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_s).min(self.burst);
        state.last_refill = now;
    }
}
