//! Adaptive client-side send-rate limiting.
//!
//! The limiter follows TCP CUBIC: after a throttling response the allowed
//! rate drops multiplicatively, then recovers along a cubic curve that
//! flattens near the rate that last triggered throttling. A token bucket
//! refilled at the computed rate gates each attempt. The bucket stays
//! disabled until the first throttling response is seen.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::util::lock_unpoisoned;

const SMOOTH: f64 = 0.8;
/// Multiplicative decrease applied on throttling.
pub const BETA: f64 = 0.7;
/// CUBIC scaling constant `C`.
pub const SCALE_CONSTANT: f64 = 0.4;
const MIN_FILL_RATE: f64 = 0.5;
const MIN_CAPACITY: f64 = 1.0;
const REQUEST_COST: f64 = 1.0;

/// The pure CUBIC rate calculation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Cubic {
    last_max_rate: f64,
    last_throttle_time: f64,
    time_window: f64,
}

impl Cubic {
    pub fn new(last_max_rate: f64, last_throttle_time: f64) -> Self {
        Self {
            last_max_rate,
            last_throttle_time,
            time_window: time_window(last_max_rate),
        }
    }

    pub fn last_max_rate(&self) -> f64 {
        self.last_max_rate
    }

    pub fn last_throttle_time(&self) -> f64 {
        self.last_throttle_time
    }

    /// Rate allowed at `timestamp` when no throttle happened since the last one.
    pub fn success(&self, timestamp: f64) -> f64 {
        let elapsed = timestamp - self.last_throttle_time - self.time_window;
        SCALE_CONSTANT * elapsed.powi(3) + self.last_max_rate
    }

    /// Records a throttle observed while sending at `rate` and returns the reduced rate.
    pub fn throttle(&mut self, rate: f64, timestamp: f64) -> f64 {
        self.last_max_rate = rate;
        self.last_throttle_time = timestamp;
        self.time_window = time_window(rate);
        rate * BETA
    }
}

fn time_window(last_max_rate: f64) -> f64 {
    (last_max_rate * (1.0 - BETA) / SCALE_CONSTANT).cbrt()
}

/// Point-in-time view of the limiter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateLimiterSnapshot {
    pub enabled: bool,
    pub measured_tx_rate: f64,
    pub fill_rate: f64,
    pub max_capacity: f64,
    pub current_capacity: f64,
    pub last_max_rate: f64,
    pub last_throttle_time: f64,
}

#[derive(Debug)]
struct LimiterState {
    cubic: Cubic,
    enabled: bool,
    fill_rate: f64,
    max_capacity: f64,
    current_capacity: f64,
    last_refill: Option<f64>,
    measured_tx_rate: f64,
    last_tx_rate_bucket: f64,
    request_count: u64,
}

impl LimiterState {
    fn new(now: f64) -> Self {
        Self {
            cubic: Cubic::new(0.0, now),
            enabled: false,
            fill_rate: 0.0,
            max_capacity: f64::MAX,
            current_capacity: 0.0,
            last_refill: None,
            measured_tx_rate: 0.0,
            last_tx_rate_bucket: now.floor(),
            request_count: 0,
        }
    }

    fn refill(&mut self, now: f64) {
        if let Some(last_refill) = self.last_refill {
            let amount = (now - last_refill).max(0.0) * self.fill_rate;
            self.current_capacity = (self.current_capacity + amount).min(self.max_capacity);
        }
        self.last_refill = Some(now);
    }

    fn update_measured_rate(&mut self, now: f64) {
        let bucket = (now * 2.0).floor() / 2.0;
        self.request_count = self.request_count.saturating_add(1);
        if bucket > self.last_tx_rate_bucket {
            let current_rate = self.request_count as f64 / (bucket - self.last_tx_rate_bucket);
            self.measured_tx_rate =
                current_rate * SMOOTH + self.measured_tx_rate * (1.0 - SMOOTH);
            self.request_count = 0;
            self.last_tx_rate_bucket = bucket;
        }
    }

    fn update_fill_rate(&mut self, now: f64, new_rate: f64) {
        self.refill(now);
        self.fill_rate = new_rate.max(MIN_FILL_RATE);
        self.max_capacity = new_rate.max(MIN_CAPACITY);
        self.current_capacity = self.current_capacity.min(self.max_capacity);
    }

    fn snapshot(&self) -> RateLimiterSnapshot {
        RateLimiterSnapshot {
            enabled: self.enabled,
            measured_tx_rate: self.measured_tx_rate,
            fill_rate: self.fill_rate,
            max_capacity: self.max_capacity,
            current_capacity: self.current_capacity,
            last_max_rate: self.cubic.last_max_rate(),
            last_throttle_time: self.cubic.last_throttle_time(),
        }
    }
}

/// Send-rate limiter shared by every operation of one client.
#[derive(Clone)]
pub struct ClientRateLimiter {
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<LimiterState>>,
}

impl ClientRateLimiter {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_secs();
        Self {
            clock,
            state: Arc::new(Mutex::new(LimiterState::new(now))),
        }
    }

    /// Takes one send token and returns how long the caller must wait before sending.
    ///
    /// The token is reserved even when a wait is returned, so concurrent
    /// callers queue up behind each other instead of waking together.
    pub fn acquire(&self) -> Duration {
        let now = self.clock.now_secs();
        let mut state = lock_unpoisoned(&self.state);
        if !state.enabled {
            return Duration::ZERO;
        }
        state.refill(now);
        let wait = wait_for(&state, REQUEST_COST);
        state.current_capacity -= REQUEST_COST;
        wait
    }

    /// Takes one send token only if it is available right now.
    ///
    /// Returns the wait that [`acquire`](Self::acquire) would have imposed
    /// when no token is available, leaving the bucket untouched.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = self.clock.now_secs();
        let mut state = lock_unpoisoned(&self.state);
        if !state.enabled {
            return Ok(());
        }
        state.refill(now);
        let wait = wait_for(&state, REQUEST_COST);
        if !wait.is_zero() {
            return Err(wait);
        }
        state.current_capacity -= REQUEST_COST;
        Ok(())
    }

    /// Feeds the outcome of one completed attempt into the rate calculation.
    pub fn update(&self, throttled: bool) {
        let now = self.clock.now_secs();
        let mut state = lock_unpoisoned(&self.state);
        state.update_measured_rate(now);

        let calculated_rate = if throttled {
            let rate_to_use = if state.enabled {
                state.measured_tx_rate.min(state.fill_rate)
            } else {
                state.measured_tx_rate
            };
            state.enabled = true;
            let reduced = state.cubic.throttle(rate_to_use, now);
            tracing::debug!(
                last_max_rate = rate_to_use,
                reduced_rate = reduced,
                "client rate limiter observed throttling"
            );
            reduced
        } else {
            state.cubic.success(now)
        };

        let new_rate = calculated_rate.min(2.0 * state.measured_tx_rate);
        state.update_fill_rate(now, new_rate);
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        lock_unpoisoned(&self.state).snapshot()
    }
}

impl Default for ClientRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ClientRateLimiter {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ClientRateLimiter")
            .field("state", &self.snapshot())
            .finish()
    }
}

fn wait_for(state: &LimiterState, amount: f64) -> Duration {
    if amount <= state.current_capacity {
        return Duration::ZERO;
    }
    let seconds = (amount - state.current_capacity) / state.fill_rate.max(MIN_FILL_RATE);
    Duration::from_secs_f64(seconds)
}
