//! Circuit breaker gating broker consumption.
//!
//! Closed is normal operation. Sustained failures trip the breaker to Open,
//! which rejects consumption outright. After `recovery_timeout` the next state
//! read moves it to HalfOpen, where a run of consecutive successes closes it
//! again and any failure reopens it. Messages already consumed keep flowing
//! even if the breaker opens mid-flight.

use std::sync::Arc;
use std::sync::Mutex;

use serde::Serialize;

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<f64>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<f64>,
}

pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: f64,
    half_open_max_calls: u32,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_thresholds(clock, 5, 60.0, 3)
    }

    pub fn with_thresholds(
        clock: Arc<dyn Clock>,
        failure_threshold: u32,
        recovery_timeout: f64,
        half_open_max_calls: u32,
    ) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            half_open_max_calls,
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
            }),
        }
    }

    /// Current state. Reading performs the timed Open -> HalfOpen transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().expect("breaker lock");
        self.refresh(&mut inner);
        inner.state
    }

    pub fn is_available(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.half_open_max_calls {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    tracing::info!("circuit breaker closed, service recovered");
                }
            }
            CircuitState::Closed => {
                inner.failure_count = inner.failure_count.saturating_sub(1);
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, error: &str) {
        let mut inner = self.inner.lock().expect("breaker lock");
        self.refresh(&mut inner);
        inner.failure_count += 1;
        inner.last_failure_time = Some(self.clock.now());

        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            inner.success_count = 0;
            tracing::warn!(error, "circuit breaker reopened from half-open");
        } else if inner.failure_count >= self.failure_threshold {
            inner.state = CircuitState::Open;
            tracing::warn!(
                failures = inner.failure_count,
                error,
                "circuit breaker opened"
            );
        }
    }

    pub fn stats(&self) -> CircuitStats {
        let mut inner = self.inner.lock().expect("breaker lock");
        self.refresh(&mut inner);
        CircuitStats {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_time: inner.last_failure_time,
        }
    }

    fn refresh(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open {
            if let Some(last) = inner.last_failure_time {
                if self.clock.now() - last >= self.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker() -> (Arc<ManualClock>, CircuitBreaker) {
        let clock = Arc::new(ManualClock::new(1_000.0));
        let breaker = CircuitBreaker::new(Arc::clone(&clock) as Arc<dyn Clock>);
        (clock, breaker)
    }

    #[test]
    fn opens_after_failure_threshold() {
        let (_clock, breaker) = breaker();
        for _ in 0..4 {
            breaker.record_failure("503");
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        breaker.record_failure("503");
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.is_available());
    }

    #[test]
    fn half_opens_after_recovery_timeout() {
        let (clock, breaker) = breaker();
        for _ in 0..5 {
            breaker.record_failure("timeout");
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(59.0);
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(1.0);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.is_available());
    }

    #[test]
    fn closes_after_three_half_open_successes() {
        let (clock, breaker) = breaker();
        for _ in 0..5 {
            breaker.record_failure("down");
        }
        clock.advance(60.0);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().failure_count, 0);
    }

    #[test]
    fn any_half_open_failure_reopens() {
        let (clock, breaker) = breaker();
        for _ in 0..5 {
            breaker.record_failure("down");
        }
        clock.advance(60.0);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        breaker.record_failure("still down");
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn closed_success_decrements_failure_count() {
        let (_clock, breaker) = breaker();
        breaker.record_failure("blip");
        breaker.record_failure("blip");
        assert_eq!(breaker.stats().failure_count, 2);
        breaker.record_success();
        assert_eq!(breaker.stats().failure_count, 1);
        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.stats().failure_count, 0);
    }
}
