use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::util::lock_unpoisoned;

/// Monotonic time source measured from the clock's own origin.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;

    fn now_secs(&self) -> f64 {
        self.now().as_secs_f64()
    }
}

/// Clock backed by the tokio timer, so paused test runtimes advance it too.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Hand-driven clock for deterministic schedules.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new(start: Duration) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn from_secs_f64(seconds: f64) -> Self {
        Self::new(Duration::from_secs_f64(seconds.max(0.0)))
    }

    pub fn set(&self, now: Duration) {
        *lock_unpoisoned(&self.now) = now;
    }

    pub fn set_secs_f64(&self, seconds: f64) {
        self.set(Duration::from_secs_f64(seconds.max(0.0)));
    }

    pub fn advance(&self, by: Duration) {
        let mut now = lock_unpoisoned(&self.now);
        *now = now.saturating_add(by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *lock_unpoisoned(&self.now)
    }
}
