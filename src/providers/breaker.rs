//! Circuit breaker guarding the model backends.
//!
//! One breaker instance is shared by every worker. State transitions happen
//! under a single mutex; the lock is released while the guarded call runs.

use super::error::ModelError;
use parking_lot::Mutex;
use std::future::Future;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    /// Cooldown elapsed; the next call is a trial.
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    max_failures: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, max_failures: u32, cooldown: Duration) -> Self {
        Self {
            name: name.to_string(),
            max_failures,
            cooldown,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                last_failure: None,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Run `f` under breaker protection. While Open and inside the cooldown,
    /// `f` is never invoked and `BreakerOpen` comes back immediately.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, ModelError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ModelError>>,
    {
        self.before_call()?;

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    fn before_call(&self) -> Result<(), ModelError> {
        let mut inner = self.inner.lock();

        if inner.state == BreakerState::Open {
            let since_failure = inner
                .last_failure
                .map_or(Duration::MAX, |at| at.elapsed());

            if since_failure <= self.cooldown {
                let remaining = self.cooldown.saturating_sub(since_failure).as_secs();
                return Err(ModelError::breaker_open(&self.name, remaining));
            }

            // Timed edge: failure count resets here, not on the trial call's
            // outcome.
            inner.state = BreakerState::HalfOpen;
            inner.failures = 0;
            tracing::info!("circuit breaker {} half-open, allowing trial call", self.name);
        }

        Ok(())
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.failures > 0 || inner.state != BreakerState::Closed {
            tracing::info!(
                "circuit breaker {} closed (recovered after {} failures)",
                self.name,
                inner.failures
            );
        }
        inner.failures = 0;
        inner.state = BreakerState::Closed;
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failures += 1;
        inner.last_failure = Some(Instant::now());

        if inner.failures >= self.max_failures {
            inner.state = BreakerState::Open;
            tracing::warn!(
                "circuit breaker {} opened after {} failures (cooldown {:?})",
                self.name,
                inner.failures,
                self.cooldown
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::error::{ErrorKind, ModelError};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn failing() -> Result<(), ModelError> {
        Err(ModelError::from_status(503, "unavailable"))
    }

    #[tokio::test]
    async fn opens_after_max_failures() {
        let cb = CircuitBreaker::new("test", 3, Duration::from_secs(60));

        for _ in 0..2 {
            let _ = cb.call(|| async { failing() }).await;
            assert_eq!(cb.state(), BreakerState::Closed);
        }
        let _ = cb.call(|| async { failing() }).await;
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn open_breaker_fast_fails_without_invoking() {
        let cb = CircuitBreaker::new("test", 1, Duration::from_secs(60));
        let _ = cb.call(|| async { failing() }).await;
        assert_eq!(cb.state(), BreakerState::Open);

        let invocations = AtomicU32::new(0);
        let err = cb
            .call(|| async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::BreakerOpen);
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn half_open_after_cooldown_then_closes_on_success() {
        let cb = CircuitBreaker::new("test", 1, Duration::from_millis(20));
        let _ = cb.call(|| async { failing() }).await;
        assert_eq!(cb.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;

        // Open -> Closed must pass through HalfOpen: the pre-check flips the
        // state before the trial call runs.
        let result = cb
            .call(|| async {
                assert_eq!(cb.state(), BreakerState::HalfOpen);
                Ok("ok")
            })
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn failed_trial_call_counts_from_zero() {
        let cb = CircuitBreaker::new("test", 2, Duration::from_millis(20));
        let _ = cb.call(|| async { failing() }).await;
        let _ = cb.call(|| async { failing() }).await;
        assert_eq!(cb.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;

        // Failure count reset on the timed edge: one failed trial does not
        // re-open a breaker with max_failures = 2.
        let _ = cb.call(|| async { failing() }).await;
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        let _ = cb.call(|| async { failing() }).await;
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let cb = CircuitBreaker::new("test", 3, Duration::from_secs(60));
        let _ = cb.call(|| async { failing() }).await;
        let _ = cb.call(|| async { failing() }).await;
        cb.call(|| async { Ok(()) }).await.unwrap();

        // Two more failures should not open a breaker with threshold 3.
        let _ = cb.call(|| async { failing() }).await;
        let _ = cb.call(|| async { failing() }).await;
        assert_eq!(cb.state(), BreakerState::Closed);
    }
}
