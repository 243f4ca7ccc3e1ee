//! Circuit breaker around a failing callee.
//!
//! Closed passes through and resets its failure count on any success. Open
//! fast-fails with a stats snapshot until the reset timeout elapses, then
//! admits probes in half-open. Half-open closes after enough consecutive
//! successes and re-opens on any failure.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use vellum_core::error::{Error, Result};

/// Breaker configuration.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before probing.
    pub reset_timeout: Duration,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Passing requests through.
    Closed,
    /// Fast-failing requests.
    Open,
    /// Admitting probe requests.
    HalfOpen,
}

#[derive(Debug)]
enum Gate {
    Closed {
        consecutive_failures: u32,
    },
    Open {
        since: Instant,
        opened_at: DateTime<Utc>,
        tripping_failures: u32,
    },
    HalfOpen {
        consecutive_successes: u32,
    },
}

#[derive(Debug)]
struct BreakerState {
    gate: Gate,
    total_requests: u64,
    total_failures: u64,
}

/// Closed/Open/Half-Open gate around a callee.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                gate: Gate::Closed {
                    consecutive_failures: 0,
                },
                total_requests: 0,
                total_failures: 0,
            }),
        }
    }

    /// Admits or rejects a request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] with a stats snapshot while the
    /// breaker is open and the reset timeout has not elapsed.
    pub fn check(&self) -> Result<()> {
        let mut state = self.lock();
        state.total_requests += 1;
        match &state.gate {
            Gate::Closed { .. } | Gate::HalfOpen { .. } => Ok(()),
            Gate::Open {
                since,
                opened_at,
                tripping_failures,
            } => {
                if since.elapsed() >= self.config.reset_timeout {
                    state.gate = Gate::HalfOpen {
                        consecutive_successes: 0,
                    };
                    Ok(())
                } else {
                    Err(Error::CircuitOpen {
                        consecutive_failures: *tripping_failures,
                        total_requests: state.total_requests,
                        total_failures: state.total_failures,
                        opened_at: *opened_at,
                    })
                }
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut state = self.lock();
        match &mut state.gate {
            Gate::Closed {
                consecutive_failures,
            } => *consecutive_failures = 0,
            Gate::HalfOpen {
                consecutive_successes,
            } => {
                *consecutive_successes += 1;
                if *consecutive_successes >= self.config.success_threshold {
                    state.gate = Gate::Closed {
                        consecutive_failures: 0,
                    };
                }
            }
            Gate::Open { .. } => {}
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        let mut state = self.lock();
        state.total_failures += 1;
        match &mut state.gate {
            Gate::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.config.failure_threshold {
                    let failures = *consecutive_failures;
                    state.gate = Gate::Open {
                        since: Instant::now(),
                        opened_at: Utc::now(),
                        tripping_failures: failures,
                    };
                }
            }
            Gate::HalfOpen { .. } => {
                state.gate = Gate::Open {
                    since: Instant::now(),
                    opened_at: Utc::now(),
                    tripping_failures: self.config.failure_threshold,
                };
            }
            Gate::Open { .. } => {}
        }
    }

    /// Forces the breaker closed.
    pub fn reset(&self) {
        self.lock().gate = Gate::Closed {
            consecutive_failures: 0,
        };
    }

    /// Current observable state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        match &self.lock().gate {
            Gate::Closed { .. } => CircuitState::Closed,
            Gate::Open { .. } => CircuitState::Open,
            Gate::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failures: u32, reset: Duration, successes: u32) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: failures,
            reset_timeout: reset,
            success_threshold: successes,
        })
    }

    #[test]
    fn opens_after_threshold_failures() {
        let b = breaker(3, Duration::from_secs(30), 1);
        for _ in 0..2 {
            b.check().unwrap();
            b.record_failure();
        }
        assert_eq!(b.state(), CircuitState::Closed);
        b.check().unwrap();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(matches!(b.check(), Err(Error::CircuitOpen { .. })));
    }

    #[test]
    fn success_resets_closed_failure_count() {
        let b = breaker(2, Duration::from_secs(30), 1);
        b.record_failure();
        b.record_success();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn open_transitions_to_half_open_after_reset_timeout() {
        let b = breaker(1, Duration::from_secs(10), 1);
        b.record_failure();
        assert!(b.check().is_err());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(b.check().is_ok());
        assert_eq!(b.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let b = breaker(1, Duration::from_secs(10), 2);
        b.record_failure();
        tokio::time::sleep(Duration::from_secs(11)).await;
        b.check().unwrap();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_closes_after_success_threshold() {
        let b = breaker(1, Duration::from_secs(10), 2);
        b.record_failure();
        tokio::time::sleep(Duration::from_secs(11)).await;
        b.check().unwrap();
        b.record_success();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn reset_forces_closed() {
        let b = breaker(1, Duration::from_secs(30), 1);
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.check().is_ok());
    }

    #[test]
    fn open_error_carries_stats_snapshot() {
        let b = breaker(2, Duration::from_secs(30), 1);
        for _ in 0..2 {
            b.check().unwrap();
            b.record_failure();
        }
        match b.check() {
            Err(Error::CircuitOpen {
                consecutive_failures,
                total_requests,
                total_failures,
                ..
            }) => {
                assert_eq!(consecutive_failures, 2);
                assert_eq!(total_requests, 3);
                assert_eq!(total_failures, 2);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
