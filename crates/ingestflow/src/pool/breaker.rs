//! Circuit breaker for the vector store dependency
//!
//! Halts calls to a failing dependency for a cooldown period, then probes
//! recovery through a limited half-open state.

use parking_lot::Mutex;
use serde::Serialize;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Breaker states
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls flow normally; failures are counted
    Closed,
    /// Calls fail fast without touching the dependency
    Open,
    /// Probation: limited trial calls test recovery
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    failures: u32,
    half_open_successes: u32,
    last_failure: Option<Instant>,
}

/// Three-state circuit breaker
///
/// closed -> open once failures reach the threshold; open -> half-open after
/// the recovery timeout; half-open -> closed after enough successes, or back
/// to open on any failure.
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    success_threshold: u32,
    recovery_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, success_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                half_open_successes: 0,
                last_failure: None,
            }),
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            recovery_timeout,
        }
    }

    /// Gate a call attempt.
    ///
    /// Returns `Error::CircuitOpen` while open; transitions open -> half-open
    /// once the recovery timeout has elapsed since the last failure.
    pub fn check(&self) -> Result<()> {
        let inner = &mut *self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(self.recovery_timeout);
                if elapsed > self.recovery_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    tracing::info!("Circuit breaker half-open, probing recovery");
                    Ok(())
                } else {
                    Err(Error::CircuitOpen(format!(
                        "dependency cooling down, {}s remaining",
                        self.recovery_timeout
                            .saturating_sub(elapsed)
                            .as_secs()
                            .max(1)
                    )))
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let inner = &mut *self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.failures = 0;
                    inner.half_open_successes = 0;
                    tracing::info!("Circuit breaker closed, dependency recovered");
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let inner = &mut *self.inner.lock();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            BreakerState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    tracing::warn!(
                        "Circuit breaker opened after {} failures",
                        inner.failures
                    );
                }
            }
            BreakerState::HalfOpen => {
                // Any failure during probation re-opens immediately
                inner.state = BreakerState::Open;
                inner.half_open_successes = 0;
                tracing::warn!("Circuit breaker re-opened, recovery probe failed");
            }
            BreakerState::Open => {}
        }
    }

    /// Current state (open -> half-open transitions happen in `check`)
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Failure count since the breaker last closed
    pub fn failures(&self) -> u32 {
        self.inner.lock().failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_at_failure_threshold() {
        let breaker = CircuitBreaker::new(3, 2, Duration::from_secs(30));
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        // Fast-fail before the recovery timeout elapses
        assert!(matches!(breaker.check(), Err(Error::CircuitOpen(_))));
    }

    #[test]
    fn test_success_resets_closed_failure_count() {
        let breaker = CircuitBreaker::new(3, 1, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_recovery_through_half_open() {
        let breaker = CircuitBreaker::new(1, 2, Duration::from_millis(0));
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        // Zero recovery timeout: the next check enters half-open
        std::thread::sleep(Duration::from_millis(5));
        assert!(breaker.check().is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(1, 2, Duration::from_millis(0));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert!(breaker.check().is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
