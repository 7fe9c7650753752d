// Copyright (C) 2026 Novita Labs
// SPDX-License-Identifier: AGPL-3.0-or-later
//! A closed/open/half-open circuit breaker guarding the upstream adapter.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Observable circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through normally.
    Closed,
    /// Calls are short-circuited without reaching upstream.
    Open,
    /// A single probe call is allowed through to test recovery.
    HalfOpen,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

/// Opens after `failure_threshold` consecutive failures; after
/// `recovery_timeout` allows one probe call (half-open); closes again
/// after `success_threshold` consecutive successes in half-open.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    failure_threshold: u32,
    success_threshold: u32,
    recovery_timeout: Duration,
}

impl CircuitBreaker {
    /// Construct a breaker with the spec's defaults: opens after 5
    /// consecutive failures, probes after 60s, closes after 3 consecutive
    /// successes.
    pub fn new(failure_threshold: u32, success_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            }),
            failure_threshold,
            success_threshold,
            recovery_timeout,
        }
    }

    /// Current observable state, advancing `Open` to `HalfOpen` if the
    /// recovery timeout has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().unwrap();
        self.maybe_enter_half_open(&mut inner);
        inner.state
    }

    fn maybe_enter_half_open(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                }
            }
        }
    }

    /// Whether a call is currently allowed through.
    pub fn allow_request(&self) -> bool {
        !matches!(self.state(), CircuitState::Open)
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures = 0;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.opened_at = None;
                    inner.consecutive_successes = 0;
                }
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_successes = 0;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let cb = CircuitBreaker::new(5, 3, Duration::from_secs(60));
        for _ in 0..4 {
            cb.record_failure();
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn half_open_after_recovery_timeout() {
        let cb = CircuitBreaker::new(1, 1, Duration::from_millis(10));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow_request());
    }

    #[test]
    fn closes_after_success_threshold_in_half_open() {
        let cb = CircuitBreaker::new(1, 2, Duration::from_millis(1));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn a_single_failure_in_half_open_reopens() {
        let cb = CircuitBreaker::new(1, 3, Duration::from_millis(1));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
