//! Polling waiters.
//!
//! A waiter re-issues a read operation until one of its acceptors reports
//! success or failure, or until its wait budget runs out. Delays between polls
//! grow exponentially from `min_delay` to `max_delay`, with jitter.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Result;
use crate::backoff::exponential_envelope_secs;
use crate::clock::{Clock, SystemClock};
use crate::error::Error;

/// Delay state of one waiter invocation.
pub struct WaiterScheduler {
    min_delay: Duration,
    max_delay: Duration,
    max_wait_time: Duration,
    clock: Arc<dyn Clock>,
    rng: StdRng,
    attempts: usize,
    is_expired: bool,
    start: Option<Duration>,
    next_request: Option<Duration>,
    current_delay: Duration,
}

impl WaiterScheduler {
    pub fn new(
        min_delay: Duration,
        max_delay: Duration,
        max_wait_time: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_rng(
            min_delay,
            max_delay,
            max_wait_time,
            clock,
            StdRng::from_os_rng(),
        )
    }

    pub fn with_seed(
        min_delay: Duration,
        max_delay: Duration,
        max_wait_time: Duration,
        clock: Arc<dyn Clock>,
        seed: u64,
    ) -> Self {
        Self::with_rng(
            min_delay,
            max_delay,
            max_wait_time,
            clock,
            StdRng::seed_from_u64(seed),
        )
    }

    fn with_rng(
        min_delay: Duration,
        max_delay: Duration,
        max_wait_time: Duration,
        clock: Arc<dyn Clock>,
        rng: StdRng,
    ) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
            max_wait_time,
            clock,
            rng,
            attempts: 0,
            is_expired: false,
            start: None,
            next_request: None,
            current_delay: Duration::ZERO,
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// True once the most recent delay is the last one the budget allows.
    pub fn is_expired(&self) -> bool {
        self.is_expired
    }

    pub fn start_time(&self) -> Option<Duration> {
        self.start
    }

    pub fn next_request_time(&self) -> Option<Duration> {
        self.next_request
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Time left until the next poll is due; zero before the first update.
    pub fn time_until_next_request(&self) -> Duration {
        match self.next_request {
            Some(next_request) => next_request.saturating_sub(self.clock.now()),
            None => Duration::ZERO,
        }
    }

    /// Starts the wait budget now unless an earlier call already did.
    pub fn mark_started(&mut self) {
        let now = self.clock.now();
        self.start.get_or_insert(now);
    }

    pub fn update_after_retry(&mut self) {
        let now = self.clock.now();
        self.attempts += 1;
        let start = *self.start.get_or_insert(now);

        let min_secs = self.min_delay.as_secs_f64();
        let max_secs = self.max_delay.as_secs_f64();
        let attempt_ceiling = (max_secs / min_secs).log2() + 1.0;
        let candidate = if self.attempts as f64 > attempt_ceiling {
            max_secs
        } else {
            let exponent = (self.attempts - 1).min(u32::MAX as usize) as u32;
            (min_secs * exponential_envelope_secs(exponent)).min(max_secs)
        };
        let mut delay = if candidate > min_secs {
            self.rng.random_range(min_secs..=candidate)
        } else {
            min_secs
        };

        let elapsed = now.saturating_sub(start).as_secs_f64();
        let remaining = self.max_wait_time.as_secs_f64() - elapsed;
        if remaining - delay <= min_secs {
            delay = (remaining - min_secs).max(0.0);
            self.is_expired = true;
        }

        self.current_delay = Duration::from_secs_f64(delay);
        self.next_request = Some(now + self.current_delay);
    }
}

impl fmt::Debug for WaiterScheduler {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("WaiterScheduler")
            .field("min_delay", &self.min_delay)
            .field("max_delay", &self.max_delay)
            .field("max_wait_time", &self.max_wait_time)
            .field("attempts", &self.attempts)
            .field("is_expired", &self.is_expired)
            .field("start", &self.start)
            .field("next_request", &self.next_request)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptorState {
    Success,
    Failure,
    Retry,
}

type Matcher<I, O> = dyn Fn(&I, &Result<O>) -> bool + Send + Sync;

/// Maps one poll result to a waiter state when its matcher applies.
pub struct Acceptor<I, O> {
    state: AcceptorState,
    matcher: Arc<Matcher<I, O>>,
}

impl<I, O> Acceptor<I, O> {
    pub fn new<F>(state: AcceptorState, matcher: F) -> Self
    where
        F: Fn(&I, &Result<O>) -> bool + Send + Sync + 'static,
    {
        Self {
            state,
            matcher: Arc::new(matcher),
        }
    }

    pub fn success_when<F>(matcher: F) -> Self
    where
        F: Fn(&I, &O) -> bool + Send + Sync + 'static,
    {
        Self::new(AcceptorState::Success, move |input, result| {
            result.as_ref().is_ok_and(|output| matcher(input, output))
        })
    }

    pub fn failure_when<F>(matcher: F) -> Self
    where
        F: Fn(&I, &O) -> bool + Send + Sync + 'static,
    {
        Self::new(AcceptorState::Failure, move |input, result| {
            result.as_ref().is_ok_and(|output| matcher(input, output))
        })
    }

    pub fn retry_when<F>(matcher: F) -> Self
    where
        F: Fn(&I, &Result<O>) -> bool + Send + Sync + 'static,
    {
        Self::new(AcceptorState::Retry, matcher)
    }

    /// Matches errors carrying the service error `code`.
    pub fn on_error_code(state: AcceptorState, code: impl Into<String>) -> Self {
        let code = code.into();
        Self::new(state, move |_, result| {
            matches!(result, Err(error) if error.service_code() == Some(code.as_str()))
        })
    }

    pub fn retry_on_error_code(code: impl Into<String>) -> Self {
        Self::on_error_code(AcceptorState::Retry, code)
    }

    pub fn state(&self) -> AcceptorState {
        self.state
    }

    pub fn matches(&self, input: &I, result: &Result<O>) -> bool {
        (self.matcher)(input, result)
    }
}

impl<I, O> Clone for Acceptor<I, O> {
    fn clone(&self) -> Self {
        Self {
            state: self.state,
            matcher: Arc::clone(&self.matcher),
        }
    }
}

impl<I, O> fmt::Debug for Acceptor<I, O> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Acceptor")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Validated delays and acceptors of a waiter.
pub struct WaiterConfig<I, O> {
    min_delay: Duration,
    max_delay: Duration,
    acceptors: Vec<Acceptor<I, O>>,
}

impl<I, O> WaiterConfig<I, O> {
    pub fn new(
        min_delay: Duration,
        max_delay: Duration,
        acceptors: Vec<Acceptor<I, O>>,
    ) -> Result<Self> {
        if min_delay.is_zero() {
            return Err(Error::configuration("waiter min_delay must be positive"));
        }
        if min_delay > max_delay {
            return Err(Error::configuration(format!(
                "waiter min_delay ({}ms) exceeds max_delay ({}ms)",
                min_delay.as_millis(),
                max_delay.as_millis()
            )));
        }
        if !acceptors
            .iter()
            .any(|acceptor| acceptor.state() == AcceptorState::Success)
        {
            return Err(Error::configuration(
                "waiter needs at least one success acceptor",
            ));
        }
        Ok(Self {
            min_delay,
            max_delay,
            acceptors,
        })
    }

    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn acceptors(&self) -> &[Acceptor<I, O>] {
        &self.acceptors
    }

    /// State of the first acceptor matching the poll result.
    pub fn evaluate(&self, input: &I, result: &Result<O>) -> Option<AcceptorState> {
        self.acceptors
            .iter()
            .find(|acceptor| acceptor.matches(input, result))
            .map(Acceptor::state)
    }
}

impl<I, O> Clone for WaiterConfig<I, O> {
    fn clone(&self) -> Self {
        Self {
            min_delay: self.min_delay,
            max_delay: self.max_delay,
            acceptors: self.acceptors.clone(),
        }
    }
}

impl<I, O> fmt::Debug for WaiterConfig<I, O> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("WaiterConfig")
            .field("min_delay", &self.min_delay)
            .field("max_delay", &self.max_delay)
            .field("acceptors", &self.acceptors)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct WaiterOptions {
    pub max_wait_time: Duration,
    pub cancellation: Option<CancellationToken>,
}

impl WaiterOptions {
    pub fn new(max_wait_time: Duration) -> Self {
        Self {
            max_wait_time,
            cancellation: None,
        }
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = Some(cancellation);
        self
    }
}

#[derive(Debug)]
pub struct WaiterOutcome<O> {
    /// Polls made, including the one that matched.
    pub attempts: usize,
    /// The poll result that a success acceptor matched.
    pub output: Result<O>,
}

pub struct Waiter<I, O> {
    config: WaiterConfig<I, O>,
    clock: Arc<dyn Clock>,
    seed: Option<u64>,
}

impl<I, O> Waiter<I, O>
where
    I: Clone,
{
    pub fn new(config: WaiterConfig<I, O>) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock::new()),
            seed: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn config(&self) -> &WaiterConfig<I, O> {
        &self.config
    }

    /// Polls with a clone of `input` until an acceptor decides the outcome.
    ///
    /// The first poll happens immediately. An error no acceptor matches ends
    /// the wait with [`Error::WaiterUnexpectedError`].
    pub async fn wait<F, Fut>(
        &self,
        options: WaiterOptions,
        input: I,
        mut poll: F,
    ) -> Result<WaiterOutcome<O>>
    where
        F: FnMut(I) -> Fut,
        Fut: Future<Output = Result<O>>,
    {
        if options.max_wait_time <= self.config.min_delay {
            return Err(Error::configuration(format!(
                "waiter max_wait_time ({}ms) must exceed min_delay ({}ms)",
                options.max_wait_time.as_millis(),
                self.config.min_delay.as_millis()
            )));
        }
        let cancellation = options.cancellation.unwrap_or_default();
        let mut scheduler = match self.seed {
            Some(seed) => WaiterScheduler::with_seed(
                self.config.min_delay,
                self.config.max_delay,
                options.max_wait_time,
                Arc::clone(&self.clock),
                seed,
            ),
            None => WaiterScheduler::new(
                self.config.min_delay,
                self.config.max_delay,
                options.max_wait_time,
                Arc::clone(&self.clock),
            ),
        };
        scheduler.mark_started();

        loop {
            if scheduler.attempts() > 0 {
                let delay = scheduler.time_until_next_request();
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => return Err(Error::Cancelled),
                    _ = sleep(delay) => {}
                }
            }

            let result = tokio::select! {
                biased;
                _ = cancellation.cancelled() => return Err(Error::Cancelled),
                result = poll(input.clone()) => result,
            };
            let attempts = scheduler.attempts() + 1;

            match self.config.evaluate(&input, &result) {
                Some(AcceptorState::Success) => {
                    debug!(attempts, "waiter reached success state");
                    return Ok(WaiterOutcome {
                        attempts,
                        output: result,
                    });
                }
                Some(AcceptorState::Failure) => {
                    debug!(attempts, "waiter reached failure state");
                    return Err(Error::WaiterFailure { attempts });
                }
                Some(AcceptorState::Retry) => {}
                None => {
                    if let Err(error) = result {
                        return Err(Error::WaiterUnexpectedError {
                            attempts,
                            source: Box::new(error),
                        });
                    }
                }
            }

            if scheduler.is_expired() {
                return Err(Error::WaiterTimeout {
                    attempts,
                    max_wait_ms: options.max_wait_time.as_millis(),
                });
            }
            scheduler.update_after_retry();
            debug!(
                attempts,
                delay_ms = scheduler.current_delay().as_millis() as u64,
                "waiter scheduled next poll"
            );
        }
    }
}

impl<I, O> fmt::Debug for Waiter<I, O> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Waiter")
            .field("config", &self.config)
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}
