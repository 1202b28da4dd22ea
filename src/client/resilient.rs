//! `ResilientCaller`: one abstraction composing the token bucket, the
//! circuit breaker, the retry policy, and the per-call deadline.
//! Instantiated once per external service; both clients share the same
//! failure semantics through it.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::ServiceSettings;
use crate::error::{PipelineError, Result};

use super::breaker::CircuitBreaker;
use super::limiter::TokenBucket;
use super::retry::RetryPolicy;

/// Shared call harness for one external service.
pub struct ResilientCaller {
    name: String,
    bucket: TokenBucket,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    timeout: Duration,
}

impl ResilientCaller {
    pub fn from_settings(name: &str, settings: &ServiceSettings) -> Self {
        Self {
            name: name.to_string(),
            bucket: TokenBucket::new(settings.rate_limit_rps, settings.burst),
            breaker: CircuitBreaker::new(
                name,
                settings.breaker.threshold,
                Duration::from_millis(settings.breaker.cool_down_ms),
            ),
            retry: RetryPolicy::new(settings.retry.max, settings.retry.backoff_ms),
            timeout: Duration::from_millis(settings.timeout_ms),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run `op` under the full resilience stack.
    ///
    /// - The breaker is checked first; open fails fast with `Unavailable`.
    /// - Every attempt (including retries) charges the bucket; waiting
    ///   for a token counts against the call deadline.
    /// - `Transient` results retry with backoff; `RateLimited` from the
    ///   upstream (HTTP 429) retries after its indicated wait.
    /// - The deadline covers the whole call including waits and retries;
    ///   exceeding it surfaces `DeadlineExceeded`.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let deadline = Instant::now() + self.timeout;
        self.breaker.check()?;

        let mut attempt: u32 = 0;
        loop {
            self.bucket.acquire(deadline).await?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.breaker.record_failure();
                return Err(PipelineError::DeadlineExceeded(self.timeout));
            }

            let outcome = tokio::time::timeout(remaining, op()).await;
            match outcome {
                Ok(Ok(value)) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Ok(Err(err)) if err.is_retryable() && attempt < self.retry.max_retries => {
                    self.breaker.record_failure();
                    let delay = match &err {
                        PipelineError::RateLimited { retry_after_ms } => {
                            Duration::from_millis(*retry_after_ms)
                        }
                        _ => self.retry.delay_for(attempt),
                    };
                    tracing::debug!(
                        service = %self.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off"
                    );
                    if Instant::now() + delay > deadline {
                        return Err(PipelineError::DeadlineExceeded(self.timeout));
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Ok(Err(err)) => {
                    // Exhausted retries or a permanent error. Only
                    // transport-class failures feed the breaker.
                    if err.is_retryable() {
                        self.breaker.record_failure();
                    }
                    return Err(err);
                }
                Err(_elapsed) => {
                    self.breaker.record_failure();
                    return Err(PipelineError::DeadlineExceeded(self.timeout));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn settings(rps: f64, burst: u32, timeout_ms: u64, retries: u32, threshold: u32) -> ServiceSettings {
        let mut s = ServiceSettings::default();
        s.rate_limit_rps = rps;
        s.burst = burst;
        s.timeout_ms = timeout_ms;
        s.retry.max = retries;
        s.retry.backoff_ms = 5;
        s.breaker.threshold = threshold;
        s.breaker.cool_down_ms = 50;
        s
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let caller = ResilientCaller::from_settings("t", &settings(1000.0, 100, 5_000, 5, 100));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let result = caller
            .call(move || {
                let calls = calls_in.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(PipelineError::Transient("flaky".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_do_not_retry() {
        let caller = ResilientCaller::from_settings("t", &settings(1000.0, 100, 5_000, 5, 100));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let err = caller
            .call(move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(PipelineError::Validation("bad request".into()))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "validation");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn breaker_opens_and_fails_fast() {
        let caller = ResilientCaller::from_settings("t", &settings(1000.0, 100, 200, 0, 3));

        for _ in 0..3 {
            let _ = caller
                .call(|| async { Err::<u32, _>(PipelineError::Transient("down".into())) })
                .await;
        }
        // Threshold reached: next call fails fast without running the op.
        let err = caller.call(|| async { Ok(1u32) }).await.unwrap_err();
        assert_eq!(err.kind(), "unavailable");
    }

    #[tokio::test]
    async fn probe_recovers_after_cool_down() {
        let caller = ResilientCaller::from_settings("t", &settings(1000.0, 100, 200, 0, 1));
        let _ = caller
            .call(|| async { Err::<u32, _>(PipelineError::Transient("down".into())) })
            .await;
        assert_eq!(
            caller.call(|| async { Ok(1u32) }).await.unwrap_err().kind(),
            "unavailable"
        );

        tokio::time::sleep(Duration::from_millis(70)).await;
        let value = caller.call(|| async { Ok(7u32) }).await.unwrap();
        assert_eq!(value, 7);
        // Closed again: subsequent calls flow.
        assert_eq!(caller.call(|| async { Ok(8u32) }).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn slow_op_hits_deadline() {
        let caller = ResilientCaller::from_settings("t", &settings(1000.0, 100, 50, 0, 100));
        let err = caller
            .call(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(1u32)
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "deadline_exceeded");
    }

    #[tokio::test]
    async fn concurrent_calls_respect_the_bucket() {
        // 50 rps, burst 5: 15 concurrent calls all succeed within a
        // generous deadline but cannot finish faster than ~200 ms.
        let caller = Arc::new(ResilientCaller::from_settings(
            "t",
            &settings(50.0, 5, 5_000, 0, 100),
        ));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..15 {
            let caller = caller.clone();
            handles.push(tokio::spawn(async move {
                caller.call(|| async { Ok(1u32) }).await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }
        assert!(start.elapsed() >= Duration::from_millis(150));
    }
}
