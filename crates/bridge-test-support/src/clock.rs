//! A mockable monotonic clock, modeled on the `MonotonicClock` abstraction
//! used to make MQTT loop-breaking logic unit-testable without real time
//! passing.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub trait MonotonicClock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The real clock, for production wiring.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl MonotonicClock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock whose `now()` only advances when the test tells it to, so
/// correlation-window, rate-limiter and sweep tests don't depend on wall
/// time or `tokio::time::pause`.
#[derive(Clone)]
pub struct FakeClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().expect("fake clock mutex poisoned");
        *offset += by;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for FakeClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().expect("fake clock mutex poisoned")
    }
}
