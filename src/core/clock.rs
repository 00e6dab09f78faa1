//! Time source used by the breaker and the backoff gate.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::domain::now_ms;

pub trait Clock: Send + Sync {
    /// Monotonic time, for cooldowns
    fn now(&self) -> Instant;

    /// Wall-clock epoch milliseconds, for persisted timestamps
    fn epoch_ms(&self) -> i64;
}

/// Real time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn epoch_ms(&self) -> i64 {
        now_ms()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    base_ms: i64,
    elapsed: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            base_ms: now_ms(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut elapsed) = self.elapsed.lock() {
            *elapsed += by;
        }
    }

    fn elapsed(&self) -> Duration {
        self.elapsed.lock().map(|e| *e).unwrap_or_default()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    fn epoch_ms(&self) -> i64 {
        self.base_ms + self.elapsed().as_millis() as i64
    }
}
