//! Circuit breaker: fail fast after repeated failures, probe after a
//! cool-down.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{PipelineError, Result};

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow normally.
    Closed,
    /// Calls fail fast with `Unavailable`.
    Open,
    /// One probe call is in flight; everyone else still fails fast.
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Consecutive-failure breaker guarding one external service.
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    cool_down: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, threshold: u32, cool_down: Duration) -> Self {
        Self {
            name: name.to_string(),
            threshold: threshold.max(1),
            cool_down,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Admission check before an outbound call. While open, fails fast
    /// until the cool-down elapses, then admits exactly one probe.
    pub fn check(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => Err(PipelineError::Unavailable(format!(
                "{}: probe in flight",
                self.name
            ))),
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.cool_down)
                    .unwrap_or(true);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    tracing::info!(breaker = %self.name, "cool-down elapsed, admitting probe");
                    Ok(())
                } else {
                    Err(PipelineError::Unavailable(format!(
                        "{}: circuit open",
                        self.name
                    )))
                }
            }
        }
    }

    /// Record a successful call: closes the breaker and resets the count.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state != BreakerState::Closed {
            tracing::info!(breaker = %self.name, "probe succeeded, closing circuit");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    /// Record a failed call. Opens at the threshold; a failed probe
    /// re-opens immediately with a fresh cool-down.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                tracing::warn!(breaker = %self.name, "probe failed, re-opening circuit");
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "threshold reached, opening circuit"
                    );
                }
            }
            BreakerState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cool_down_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new("test", threshold, Duration::from_millis(cool_down_ms))
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let b = breaker(3, 10_000);
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.check().unwrap_err().kind(), "unavailable");
    }

    #[test]
    fn success_resets_the_count() {
        let b = breaker(3, 10_000);
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn probe_after_cool_down_closes_on_success() {
        let b = breaker(1, 20);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.check().is_err());

        tokio::time::sleep(Duration::from_millis(30)).await;
        // First check admits the probe, a concurrent one fails fast.
        assert!(b.check().is_ok());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(b.check().is_err());

        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.check().is_ok());
    }

    #[tokio::test]
    async fn failed_probe_reopens_with_fresh_cool_down() {
        let b = breaker(1, 20);
        b.record_failure();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(b.check().is_ok());
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        // Cool-down restarted: still open right away.
        assert!(b.check().is_err());
    }
}
