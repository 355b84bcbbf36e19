//! Wall-clock capability.
//!
//! Everything time-dependent (dedup windows, backoff scheduling, visibility
//! reclaim, circuit-breaker recovery) reads the clock through this trait so
//! tests can drive time forward without sleeping.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch, as the broker stores them.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> f64;
}

/// Production clock backed by [`SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default()
    }
}

/// Manually driven clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, secs: f64) {
        let mut now = self.now.lock().expect("clock lock");
        *now += secs;
    }

    pub fn set(&self, secs: f64) {
        let mut now = self.now.lock().expect("clock lock");
        *now = secs;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock().expect("clock lock")
    }
}
