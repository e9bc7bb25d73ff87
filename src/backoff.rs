use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::util::lock_unpoisoned;

/// Growth factor of the exponential envelope.
pub const BACKOFF_BASE: f64 = 2.0;

const MAX_EXPONENT: u32 = 64;

/// `BACKOFF_BASE^attempt` in seconds, with the exponent capped so the value
/// stays finite.
pub(crate) fn exponential_envelope_secs(attempt: u32) -> f64 {
    BACKOFF_BASE.powi(attempt.min(MAX_EXPONENT) as i32)
}

pub(crate) fn secs_to_duration(seconds: f64, max: Duration) -> Duration {
    if !seconds.is_finite() || seconds <= 0.0 {
        return Duration::ZERO;
    }
    if seconds >= max.as_secs_f64() {
        return max;
    }
    Duration::from_secs_f64(seconds)
}

/// Exponential backoff with full jitter:
/// `delay(attempt) = min(random[0, 1) * 2^attempt seconds, max_backoff)`.
///
/// `attempt` is the zero-based retry count. The random source can be seeded
/// for reproducible delays.
#[derive(Debug)]
pub struct ExponentialBackoff {
    max_backoff: Duration,
    rng: Mutex<StdRng>,
}

impl ExponentialBackoff {
    pub fn new(max_backoff: Duration) -> Self {
        Self {
            max_backoff,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    pub fn with_seed(max_backoff: Duration, seed: u64) -> Self {
        Self {
            max_backoff,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter: f64 = lock_unpoisoned(&self.rng).random();
        secs_to_duration(jitter * exponential_envelope_secs(attempt), self.max_backoff)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(20))
    }
}
