//! Retry strategy contract and the standard token-bucket strategy.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::backoff::ExponentialBackoff;
use crate::config::{RetryConfig, RetryMode};
use crate::error::{Error, TransportErrorKind};
use crate::rate_limit::ClientRateLimiter;
use crate::util::lock_unpoisoned;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RetryErrorType {
    /// Connection-level failure or other fault expected to clear on its own.
    Transient,
    Throttling,
    ServerError,
    ClientError,
}

impl RetryErrorType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Throttling => "throttling",
            Self::ServerError => "server_error",
            Self::ClientError => "client_error",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryErrorInfo {
    pub error_type: RetryErrorType,
    pub retry_after_hint: Option<Duration>,
    pub is_timeout: bool,
}

impl RetryErrorInfo {
    pub const fn new(error_type: RetryErrorType) -> Self {
        Self {
            error_type,
            retry_after_hint: None,
            is_timeout: false,
        }
    }

    pub const fn timeout() -> Self {
        Self {
            error_type: RetryErrorType::Transient,
            retry_after_hint: None,
            is_timeout: true,
        }
    }

    pub const fn with_retry_after(mut self, hint: Option<Duration>) -> Self {
        self.retry_after_hint = hint;
        self
    }
}

/// Decides whether a failed attempt may be retried. `None` means "do not retry".
pub trait RetryErrorClassifier: Send + Sync {
    fn classify(&self, error: &Error) -> Option<RetryErrorInfo>;
}

impl<F> RetryErrorClassifier for F
where
    F: Fn(&Error) -> Option<RetryErrorInfo> + Send + Sync,
{
    fn classify(&self, error: &Error) -> Option<RetryErrorInfo> {
        self(error)
    }
}

const THROTTLING_ERROR_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestThrottledException",
    "TooManyRequestsException",
    "ProvisionedThroughputExceededException",
    "TransactionInProgressException",
    "RequestLimitExceeded",
    "BandwidthLimitExceeded",
    "LimitExceededException",
    "RequestThrottled",
    "SlowDown",
    "PriorRequestNotComplete",
    "EC2ThrottledException",
];

const TRANSIENT_ERROR_CODES: &[&str] =
    &["RequestTimeout", "RequestTimeoutException", "InternalError"];

/// Classifier for the runtime's own [`Error`] taxonomy.
#[derive(Clone, Debug)]
pub struct DefaultRetryErrorClassifier {
    throttling_codes: BTreeSet<String>,
    transient_codes: BTreeSet<String>,
}

impl DefaultRetryErrorClassifier {
    pub fn new() -> Self {
        Self {
            throttling_codes: THROTTLING_ERROR_CODES
                .iter()
                .map(|code| (*code).to_owned())
                .collect(),
            transient_codes: TRANSIENT_ERROR_CODES
                .iter()
                .map(|code| (*code).to_owned())
                .collect(),
        }
    }

    pub fn with_throttling_code(mut self, code: impl Into<String>) -> Self {
        self.throttling_codes.insert(code.into());
        self
    }

    pub fn with_transient_code(mut self, code: impl Into<String>) -> Self {
        self.transient_codes.insert(code.into());
        self
    }
}

impl Default for DefaultRetryErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryErrorClassifier for DefaultRetryErrorClassifier {
    fn classify(&self, error: &Error) -> Option<RetryErrorInfo> {
        match error {
            Error::Transport { kind, .. } => match kind {
                TransportErrorKind::Timeout => Some(RetryErrorInfo::timeout()),
                TransportErrorKind::Dns
                | TransportErrorKind::Connect
                | TransportErrorKind::Read => Some(RetryErrorInfo::new(RetryErrorType::Transient)),
                TransportErrorKind::Tls | TransportErrorKind::Other => None,
            },
            Error::Service {
                status,
                code,
                retry_after,
                ..
            } => {
                let error_type = if *status == 429 || self.throttling_codes.contains(code) {
                    RetryErrorType::Throttling
                } else if self.transient_codes.contains(code) {
                    RetryErrorType::Transient
                } else if matches!(status, 500 | 502 | 503 | 504) {
                    RetryErrorType::ServerError
                } else if (400..500).contains(status) {
                    RetryErrorType::ClientError
                } else {
                    return None;
                };
                Some(RetryErrorInfo::new(error_type).with_retry_after(*retry_after))
            }
            _ => None,
        }
    }
}

/// Why a strategy declined to retry.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum RetryRefusal {
    #[error("reached the maximum of {max_attempts} attempts")]
    MaxAttemptsReached { max_attempts: usize },
    #[error("retry quota has {available} tokens left but a retry costs {cost}")]
    QuotaExhausted { available: usize, cost: usize },
    #[error("{error_type} errors are not retried")]
    NotRetryable { error_type: &'static str },
}

/// A freshly acquired token plus the delay to observe before the first attempt.
#[derive(Debug)]
pub struct AcquiredToken<T> {
    pub token: T,
    pub delay: Duration,
}

/// Retry budget contract driven by the client's retry loop.
///
/// A token is acquired once per invocation, refreshed after each retryable
/// failure and handed back through [`record_success`](Self::record_success)
/// when an attempt succeeds. Tokens are opaque to the loop.
pub trait RetryStrategy: Send + Sync {
    type Token: Send + 'static;

    fn max_attempts(&self) -> usize;

    fn acquire_initial_retry_token(
        &self,
        partition: &str,
    ) -> crate::Result<AcquiredToken<Self::Token>>;

    /// Updates `token` for one more attempt and returns the delay to sleep first.
    fn refresh_retry_token_for_retry(
        &self,
        token: &mut Self::Token,
        error_info: &RetryErrorInfo,
    ) -> Result<Duration, RetryRefusal>;

    fn record_success(&self, token: Self::Token);

    /// When true, the loop reports a refused retry as [`Error::RetryExhausted`]
    /// instead of the last attempt's error.
    fn synthesizes_exhausted_error(&self) -> bool {
        false
    }
}

/// Shared retry-token bucket.
#[derive(Debug)]
pub struct RetryQuota {
    capacity: usize,
    available: Mutex<usize>,
}

impl RetryQuota {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            available: Mutex::new(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        *lock_unpoisoned(&self.available)
    }

    pub fn try_acquire(&self, cost: usize) -> Result<(), RetryRefusal> {
        let mut available = lock_unpoisoned(&self.available);
        if *available < cost {
            return Err(RetryRefusal::QuotaExhausted {
                available: *available,
                cost,
            });
        }
        *available -= cost;
        Ok(())
    }

    pub fn release(&self, amount: usize) {
        let mut available = lock_unpoisoned(&self.available);
        *available = available.saturating_add(amount).min(self.capacity);
    }
}

#[derive(Debug)]
struct Partition {
    quota: RetryQuota,
    rate_limiter: Option<ClientRateLimiter>,
}

/// Opaque per-invocation token of [`StandardRetryStrategy`].
#[derive(Debug)]
pub struct StandardRetryToken {
    partition: Arc<Partition>,
    attempts: usize,
    last_retry_cost: Option<usize>,
}

impl StandardRetryToken {
    /// Attempts made so far, counting the one in flight.
    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

/// Standard strategy: bounded attempts, jittered exponential backoff and a
/// retry quota per partition; adaptive mode adds the CUBIC rate limiter.
pub struct StandardRetryStrategy {
    config: RetryConfig,
    backoff: ExponentialBackoff,
    rate_limiter_factory: Box<dyn Fn() -> ClientRateLimiter + Send + Sync>,
    partitions: Mutex<HashMap<String, Arc<Partition>>>,
}

impl StandardRetryStrategy {
    pub fn new(config: RetryConfig) -> Self {
        let config = config.normalize();
        let backoff = ExponentialBackoff::new(config.max_backoff());
        Self::from_parts(config, backoff)
    }

    /// Same as [`new`](Self::new) with a seeded backoff random source.
    pub fn with_seed(config: RetryConfig, seed: u64) -> Self {
        let config = config.normalize();
        let backoff = ExponentialBackoff::with_seed(config.max_backoff(), seed);
        Self::from_parts(config, backoff)
    }

    fn from_parts(config: RetryConfig, backoff: ExponentialBackoff) -> Self {
        Self {
            config,
            backoff,
            rate_limiter_factory: Box::new(ClientRateLimiter::new),
            partitions: Mutex::new(HashMap::new()),
        }
    }

    /// Builds adaptive-mode limiters with `factory`, e.g. to inject a clock.
    pub fn with_rate_limiter_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> ClientRateLimiter + Send + Sync + 'static,
    {
        self.rate_limiter_factory = Box::new(factory);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Tokens left in the quota of `partition`, if it has been used.
    pub fn available_quota(&self, partition: &str) -> Option<usize> {
        lock_unpoisoned(&self.partitions)
            .get(partition)
            .map(|partition| partition.quota.available())
    }

    pub fn rate_limiter(&self, partition: &str) -> Option<ClientRateLimiter> {
        lock_unpoisoned(&self.partitions)
            .get(partition)
            .and_then(|partition| partition.rate_limiter.clone())
    }

    fn partition(&self, name: &str) -> Arc<Partition> {
        let mut partitions = lock_unpoisoned(&self.partitions);
        if let Some(existing) = partitions.get(name) {
            return Arc::clone(existing);
        }
        let rate_limiter = match self.config.mode() {
            RetryMode::Adaptive => Some((self.rate_limiter_factory)()),
            RetryMode::Standard => None,
        };
        let partition = Arc::new(Partition {
            quota: RetryQuota::new(self.config.initial_retry_tokens()),
            rate_limiter,
        });
        partitions.insert(name.to_owned(), Arc::clone(&partition));
        partition
    }
}

impl std::fmt::Debug for StandardRetryStrategy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("StandardRetryStrategy")
            .field("config", &self.config)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl Default for StandardRetryStrategy {
    fn default() -> Self {
        Self::new(RetryConfig::standard())
    }
}

impl RetryStrategy for StandardRetryStrategy {
    type Token = StandardRetryToken;

    fn max_attempts(&self) -> usize {
        self.config.max_attempts()
    }

    fn acquire_initial_retry_token(
        &self,
        partition_name: &str,
    ) -> crate::Result<AcquiredToken<StandardRetryToken>> {
        let partition = self.partition(partition_name);
        let delay = match &partition.rate_limiter {
            Some(limiter) if self.config.adaptive_fail_fast() => {
                limiter.try_acquire().map_err(|wait| Error::RetryQuotaExhausted {
                    partition: partition_name.to_owned(),
                    reason: format!(
                        "client rate limiter would delay the request by {}ms",
                        wait.as_millis()
                    ),
                })?;
                Duration::ZERO
            }
            Some(limiter) => limiter.acquire(),
            None => Duration::ZERO,
        };
        Ok(AcquiredToken {
            token: StandardRetryToken {
                partition,
                attempts: 1,
                last_retry_cost: None,
            },
            delay,
        })
    }

    fn refresh_retry_token_for_retry(
        &self,
        token: &mut StandardRetryToken,
        error_info: &RetryErrorInfo,
    ) -> Result<Duration, RetryRefusal> {
        if let Some(limiter) = &token.partition.rate_limiter {
            limiter.update(error_info.error_type == RetryErrorType::Throttling);
        }
        if error_info.error_type == RetryErrorType::ClientError {
            return Err(RetryRefusal::NotRetryable {
                error_type: error_info.error_type.as_str(),
            });
        }
        if token.attempts >= self.config.max_attempts() {
            return Err(RetryRefusal::MaxAttemptsReached {
                max_attempts: self.config.max_attempts(),
            });
        }

        let cost = if error_info.is_timeout {
            self.config.timeout_retry_cost()
        } else {
            self.config.retry_cost()
        };
        token.partition.quota.try_acquire(cost)?;

        let retry_index = (token.attempts - 1).min(u32::MAX as usize) as u32;
        let mut delay = match error_info.retry_after_hint {
            Some(hint) => hint.min(self.config.max_retry_after()),
            None => self.backoff.delay(retry_index),
        };
        if let Some(limiter) = &token.partition.rate_limiter {
            delay = delay.max(limiter.acquire());
        }

        token.attempts += 1;
        token.last_retry_cost = Some(cost);
        Ok(delay)
    }

    fn record_success(&self, token: StandardRetryToken) {
        let refund = token
            .last_retry_cost
            .unwrap_or(self.config.no_retry_increment());
        token.partition.quota.release(refund);
        if let Some(limiter) = &token.partition.rate_limiter {
            limiter.update(false);
        }
    }

    fn synthesizes_exhausted_error(&self) -> bool {
        self.config.synthesize_exhausted_error()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{
        DefaultRetryErrorClassifier, RetryErrorClassifier, RetryErrorInfo, RetryErrorType,
        RetryQuota, RetryRefusal, RetryStrategy, StandardRetryStrategy,
    };
    use crate::clock::ManualClock;
    use crate::config::RetryConfig;
    use crate::error::{Error, ErrorCode, TransportErrorKind};
    use crate::rate_limit::ClientRateLimiter;

    fn io_error() -> std::io::Error {
        std::io::Error::other("boom")
    }

    #[test]
    fn default_classifier_maps_error_taxonomy() {
        let classifier = DefaultRetryErrorClassifier::new();
        let classify = |error: Error| classifier.classify(&error);

        assert_eq!(
            classify(Error::transport(TransportErrorKind::Timeout, io_error())),
            Some(RetryErrorInfo::timeout())
        );
        assert_eq!(
            classify(Error::transport(TransportErrorKind::Connect, io_error()))
                .map(|info| info.error_type),
            Some(RetryErrorType::Transient)
        );
        assert_eq!(
            classify(Error::transport(TransportErrorKind::Tls, io_error())),
            None
        );
        assert_eq!(
            classify(Error::service(400, "ThrottlingException", "slow down"))
                .map(|info| info.error_type),
            Some(RetryErrorType::Throttling)
        );
        assert_eq!(
            classify(Error::service(429, "Custom", "slow down")).map(|info| info.error_type),
            Some(RetryErrorType::Throttling)
        );
        assert_eq!(
            classify(Error::service(503, "Unavailable", "try later")).map(|info| info.error_type),
            Some(RetryErrorType::ServerError)
        );
        assert_eq!(
            classify(Error::service(404, "NotFound", "missing")).map(|info| info.error_type),
            Some(RetryErrorType::ClientError)
        );
        assert_eq!(classify(Error::configuration("bad")), None);
    }

    #[test]
    fn classifier_carries_retry_after_hint() {
        let classifier = DefaultRetryErrorClassifier::new().with_throttling_code("Busy");
        let error = Error::service(400, "Busy", "later")
            .with_retry_after(Some(Duration::from_millis(250)));
        let info = classifier.classify(&error).expect("busy should be retryable");
        assert_eq!(info.error_type, RetryErrorType::Throttling);
        assert_eq!(info.retry_after_hint, Some(Duration::from_millis(250)));
    }

    #[test]
    fn quota_refuses_when_empty_and_refunds_up_to_capacity() {
        let quota = RetryQuota::new(12);
        assert_eq!(quota.try_acquire(5), Ok(()));
        assert_eq!(quota.try_acquire(5), Ok(()));
        assert_eq!(
            quota.try_acquire(5),
            Err(RetryRefusal::QuotaExhausted {
                available: 2,
                cost: 5
            })
        );
        quota.release(100);
        assert_eq!(quota.available(), 12);
    }

    #[test]
    fn strategy_stops_at_max_attempts() {
        let strategy = StandardRetryStrategy::with_seed(
            RetryConfig::standard()
                .with_max_attempts(3)
                .with_max_backoff(Duration::from_millis(100)),
            1,
        );
        let mut token = strategy
            .acquire_initial_retry_token("items")
            .expect("token should be available")
            .token;
        let info = RetryErrorInfo::new(RetryErrorType::ServerError);

        for _ in 0..2 {
            let delay = strategy
                .refresh_retry_token_for_retry(&mut token, &info)
                .expect("retry should be allowed");
            assert!(delay <= Duration::from_millis(100));
        }
        assert_eq!(token.attempts(), 3);
        assert_eq!(
            strategy.refresh_retry_token_for_retry(&mut token, &info),
            Err(RetryRefusal::MaxAttemptsReached { max_attempts: 3 })
        );
        assert_eq!(strategy.available_quota("items"), Some(490));
    }

    #[test]
    fn success_refunds_last_retry_cost_or_increment() {
        let strategy = StandardRetryStrategy::new(
            RetryConfig::standard()
                .with_initial_retry_tokens(20)
                .with_max_attempts(5),
        );
        let mut token = strategy
            .acquire_initial_retry_token("p")
            .expect("token")
            .token;
        strategy
            .refresh_retry_token_for_retry(&mut token, &RetryErrorInfo::timeout())
            .expect("timeout retry allowed");
        assert_eq!(strategy.available_quota("p"), Some(10));
        strategy.record_success(token);
        assert_eq!(strategy.available_quota("p"), Some(20));

        let mut token = strategy.acquire_initial_retry_token("p").expect("token").token;
        strategy
            .refresh_retry_token_for_retry(&mut token, &RetryErrorInfo::timeout())
            .expect("timeout retry allowed");
        strategy
            .refresh_retry_token_for_retry(&mut token, &RetryErrorInfo::timeout())
            .expect("timeout retry allowed");
        assert_eq!(strategy.available_quota("p"), Some(0));
        assert_eq!(
            strategy
                .refresh_retry_token_for_retry(&mut token, &RetryErrorInfo::timeout())
                .expect_err("quota should be empty"),
            RetryRefusal::QuotaExhausted {
                available: 0,
                cost: 10
            }
        );
        drop(token);

        let token = strategy.acquire_initial_retry_token("p").expect("token").token;
        strategy.record_success(token);
        assert_eq!(strategy.available_quota("p"), Some(1));
    }

    #[test]
    fn retry_after_hint_is_capped() {
        let strategy = StandardRetryStrategy::new(
            RetryConfig::standard().with_max_retry_after(Duration::from_secs(2)),
        );
        let mut token = strategy.acquire_initial_retry_token("p").expect("token").token;
        let info = RetryErrorInfo::new(RetryErrorType::Throttling)
            .with_retry_after(Some(Duration::from_secs(30)));
        assert_eq!(
            strategy.refresh_retry_token_for_retry(&mut token, &info),
            Ok(Duration::from_secs(2))
        );
    }

    #[test]
    fn client_errors_are_refused() {
        let strategy = StandardRetryStrategy::default();
        let mut token = strategy.acquire_initial_retry_token("p").expect("token").token;
        assert!(matches!(
            strategy.refresh_retry_token_for_retry(
                &mut token,
                &RetryErrorInfo::new(RetryErrorType::ClientError)
            ),
            Err(RetryRefusal::NotRetryable { .. })
        ));
    }

    #[test]
    fn adaptive_mode_throttles_send_rate_and_can_fail_fast() {
        let clock = Arc::new(ManualClock::new(Duration::ZERO));
        let factory_clock = clock.clone();
        let strategy = StandardRetryStrategy::new(
            RetryConfig::adaptive()
                .with_max_attempts(5)
                .with_max_backoff(Duration::from_millis(1)),
        )
        .with_rate_limiter_factory(move || ClientRateLimiter::with_clock(factory_clock.clone()));

        let acquired = strategy.acquire_initial_retry_token("p").expect("token");
        assert_eq!(acquired.delay, Duration::ZERO);
        let mut token = acquired.token;

        let delay = strategy
            .refresh_retry_token_for_retry(
                &mut token,
                &RetryErrorInfo::new(RetryErrorType::Throttling),
            )
            .expect("throttled retry allowed");
        assert_eq!(delay, Duration::from_secs(2));
        assert!(
            strategy
                .rate_limiter("p")
                .expect("adaptive partition has a limiter")
                .snapshot()
                .enabled
        );

        let fail_fast = StandardRetryStrategy::new(
            RetryConfig::adaptive().with_adaptive_fail_fast(true),
        )
        .with_rate_limiter_factory(move || ClientRateLimiter::with_clock(clock.clone()));
        let mut token = fail_fast.acquire_initial_retry_token("p").expect("token").token;
        fail_fast
            .refresh_retry_token_for_retry(
                &mut token,
                &RetryErrorInfo::new(RetryErrorType::Throttling),
            )
            .expect("throttled retry allowed");
        let error = fail_fast
            .acquire_initial_retry_token("p")
            .expect_err("bucket is empty");
        assert_eq!(error.code(), ErrorCode::RetryQuotaExhausted);
    }
}
