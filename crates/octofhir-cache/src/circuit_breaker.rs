//! Circuit breaker guarding backend calls.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: backend assumed down, calls are served by the fallback
//! - Half-Open: the reset timeout elapsed and a single probe call is in flight
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= failure_threshold
//! Open → Half-Open: reset_timeout elapsed since the last failure
//! Half-Open → Closed: probe succeeds (failure_count reset to 0)
//! Half-Open → Open: probe fails or is dropped before completing
//! ```

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{CacheError, CacheResult};
use crate::metrics;

/// Snapshot of the breaker counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitState {
    pub failure_count: u32,
    pub is_open: bool,
    pub last_failure_time: Option<Instant>,
}

/// Observable breaker status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Default)]
struct Inner {
    failure_count: u32,
    is_open: bool,
    last_failure_time: Option<Instant>,
    probe_in_flight: bool,
}

enum Admission {
    Allowed,
    Probe,
    Rejected,
}

/// Held for the duration of a half-open probe. A probe future dropped before
/// it completes counts as a failure, so the breaker can probe again once the
/// reset timeout elapses.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.breaker.abandon_probe();
    }
}

/// Failure-counting circuit breaker with a single-probe half-open state.
///
/// All three counters change together under one lock per call, so concurrent
/// failures cannot lose updates.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    state: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            reset_timeout_ms = config.reset_timeout_ms,
            "Circuit breaker initialized"
        );
        Self {
            name,
            failure_threshold: config.failure_threshold.max(1),
            reset_timeout: config.reset_timeout(),
            state: Mutex::new(Inner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> CircuitState {
        let state = self.state.lock();
        CircuitState {
            failure_count: state.failure_count,
            is_open: state.is_open,
            last_failure_time: state.last_failure_time,
        }
    }

    pub fn status(&self) -> CircuitStatus {
        let state = self.state.lock();
        if state.probe_in_flight {
            CircuitStatus::HalfOpen
        } else if state.is_open {
            CircuitStatus::Open
        } else {
            CircuitStatus::Closed
        }
    }

    /// Run `operation`; failures and rejections surface as errors.
    pub async fn call<T, F, Fut>(&self, operation: F) -> CacheResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        self.execute(operation, None::<fn() -> T>).await
    }

    /// Run `operation`, serving `fallback` when the circuit is open or the
    /// operation fails.
    pub async fn call_with_fallback<T, F, Fut, FB>(&self, operation: F, fallback: FB) -> CacheResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
        FB: FnOnce() -> T,
    {
        self.execute(operation, Some(fallback)).await
    }

    async fn execute<T, F, Fut, FB>(&self, operation: F, fallback: Option<FB>) -> CacheResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
        FB: FnOnce() -> T,
    {
        let admission = self.admit();
        if let Admission::Rejected = admission {
            metrics::record_circuit_rejection();
            return match fallback {
                Some(fallback) => Ok(fallback()),
                None => Err(CacheError::CircuitOpen {
                    component: self.name.clone(),
                }),
            };
        }

        let _probe = matches!(admission, Admission::Probe).then(|| ProbeGuard { breaker: self });

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                match fallback {
                    Some(fallback) => Ok(fallback()),
                    None => Err(e),
                }
            }
        }
    }

    fn admit(&self) -> Admission {
        let mut state = self.state.lock();
        if state.probe_in_flight {
            return Admission::Rejected;
        }
        if !state.is_open {
            return Admission::Allowed;
        }

        let elapsed = state
            .last_failure_time
            .map(|at| at.elapsed())
            .unwrap_or(self.reset_timeout);
        if elapsed < self.reset_timeout {
            return Admission::Rejected;
        }

        // Optimistically close and let exactly one trial call through
        state.is_open = false;
        state.probe_in_flight = true;
        info!(component = %self.name, "Circuit half-open, probing backend");
        metrics::record_circuit_transition("half_open");
        Admission::Probe
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        let was_probe = std::mem::take(&mut state.probe_in_flight);
        state.failure_count = 0;
        if was_probe {
            info!(component = %self.name, "Circuit closed, backend recovered");
            metrics::record_circuit_transition("closed");
        }
    }

    /// Clears a probe that never reported an outcome.
    fn abandon_probe(&self) {
        let mut state = self.state.lock();
        if state.probe_in_flight {
            warn!(component = %self.name, "Circuit probe dropped before completing");
            self.fail_locked(&mut state);
        }
    }

    fn record_failure(&self) {
        let mut state = self.state.lock();
        self.fail_locked(&mut state);
    }

    fn fail_locked(&self, state: &mut Inner) {
        state.probe_in_flight = false;
        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure_time = Some(Instant::now());
        debug!(
            component = %self.name,
            failure_count = state.failure_count,
            "Circuit breaker recorded failure"
        );
        if !state.is_open && state.failure_count >= self.failure_threshold {
            state.is_open = true;
            warn!(
                component = %self.name,
                failure_count = state.failure_count,
                reset_timeout_ms = self.reset_timeout.as_millis() as u64,
                "Circuit opened"
            );
            metrics::record_circuit_transition("open");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            &CircuitBreakerConfig {
                enabled: true,
                failure_threshold: threshold,
                reset_timeout_ms: reset_ms,
            },
        )
    }

    async fn fail(cb: &CircuitBreaker, calls: &AtomicU32) -> CacheResult<i32> {
        cb.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CacheError::Unavailable("down".into()))
        })
        .await
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let cb = breaker(3, 1000);
        let value = cb.call(|| async { Ok::<_, CacheError>(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(cb.status(), CircuitStatus::Closed);
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let cb = breaker(3, 1000);
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            assert!(matches!(fail(&cb, &calls).await, Err(CacheError::Unavailable(_))));
            assert_eq!(cb.status(), CircuitStatus::Closed);
        }
        assert!(fail(&cb, &calls).await.is_err());

        let snapshot = cb.snapshot();
        assert!(snapshot.is_open);
        assert_eq!(snapshot.failure_count, 3);

        // Rejected without reaching the operation
        let err = fail(&cb, &calls).await.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, 1000);
        let calls = AtomicU32::new(0);
        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;
        cb.call(|| async { Ok::<_, CacheError>(()) }).await.unwrap();
        assert_eq!(cb.snapshot().failure_count, 0);

        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;
        assert!(!cb.snapshot().is_open);
    }

    #[tokio::test]
    async fn test_fallback_on_failure_and_when_open() {
        let cb = breaker(1, 1000);
        let value = cb
            .call_with_fallback(
                || async { Err::<i32, _>(CacheError::Unavailable("down".into())) },
                || -1,
            )
            .await
            .unwrap();
        assert_eq!(value, -1);
        assert_eq!(cb.status(), CircuitStatus::Open);

        let calls = AtomicU32::new(0);
        let value = cb
            .call_with_fallback(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(5)
                },
                || -1,
            )
            .await
            .unwrap();
        assert_eq!(value, -1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_closes_on_success() {
        let cb = breaker(2, 500);
        let calls = AtomicU32::new(0);
        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.status(), CircuitStatus::Open);

        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(fail(&cb, &calls).await.unwrap_err().is_circuit_open());

        tokio::time::advance(Duration::from_millis(1)).await;
        let value = cb.call(|| async { Ok::<_, CacheError>("ok") }).await.unwrap();
        assert_eq!(value, "ok");
        assert_eq!(cb.status(), CircuitStatus::Closed);
        assert_eq!(cb.snapshot().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_failure_reopens() {
        let cb = breaker(2, 500);
        let calls = AtomicU32::new(0);
        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;

        tokio::time::advance(Duration::from_millis(600)).await;
        let err = fail(&cb, &calls).await.unwrap_err();
        assert!(matches!(err, CacheError::Unavailable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cb.status(), CircuitStatus::Open);

        // The reset window restarts from the failed probe
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(fail(&cb, &calls).await.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_probe_in_flight() {
        let cb = breaker(1, 100);
        let calls = AtomicU32::new(0);
        let _ = fail(&cb, &calls).await;
        tokio::time::advance(Duration::from_millis(150)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = cb.call(|| async {
            let _ = release_rx.await;
            Ok::<_, CacheError>(1)
        });
        let concurrent = async {
            tokio::task::yield_now().await;
            assert_eq!(cb.status(), CircuitStatus::HalfOpen);
            let rejected = cb.call(|| async { Ok::<_, CacheError>(2) }).await;
            let _ = release_tx.send(());
            rejected
        };

        let (probe, rejected) = tokio::join!(probe, concurrent);
        assert_eq!(probe.unwrap(), 1);
        assert!(rejected.unwrap_err().is_circuit_open());
        assert_eq!(cb.status(), CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_probe_does_not_wedge_breaker() {
        let cb = breaker(1, 100);
        let calls = AtomicU32::new(0);
        let _ = fail(&cb, &calls).await;
        tokio::time::advance(Duration::from_millis(150)).await;

        let timed_out = tokio::time::timeout(
            Duration::from_millis(10),
            cb.call(|| std::future::pending::<CacheResult<i32>>()),
        )
        .await;
        assert!(timed_out.is_err());
        assert_eq!(cb.status(), CircuitStatus::Open);

        // Still inside the reset window restarted by the dropped probe
        assert!(fail(&cb, &calls).await.unwrap_err().is_circuit_open());

        tokio::time::advance(Duration::from_millis(100)).await;
        let value = cb.call(|| async { Ok::<_, CacheError>(1) }).await.unwrap();
        assert_eq!(value, 1);
        assert_eq!(cb.status(), CircuitStatus::Closed);
    }
}
