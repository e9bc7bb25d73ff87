use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::duration_millis;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    #[default]
    Standard,
    /// Standard retries plus the client-side CUBIC send-rate limiter.
    Adaptive,
}

/// Retry behaviour of a client.
///
/// Durations are written as milliseconds when (de)serialized:
///
/// ```
/// use sdk_runtime::config::{RetryConfig, RetryMode};
///
/// let config: RetryConfig =
///     serde_json::from_str(r#"{ "mode": "adaptive", "max_attempts": 5, "max_backoff_ms": 2000 }"#)
///         .expect("valid retry config");
/// assert_eq!(config.mode(), RetryMode::Adaptive);
/// assert_eq!(config.max_attempts(), 5);
/// ```
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    mode: RetryMode,
    max_attempts: usize,
    #[serde(rename = "max_backoff_ms", with = "duration_millis")]
    max_backoff: Duration,
    #[serde(rename = "max_retry_after_ms", with = "duration_millis")]
    max_retry_after: Duration,
    initial_retry_tokens: usize,
    retry_cost: usize,
    timeout_retry_cost: usize,
    no_retry_increment: usize,
    adaptive_fail_fast: bool,
    synthesize_exhausted_error: bool,
}

impl RetryConfig {
    pub const fn standard() -> Self {
        Self {
            mode: RetryMode::Standard,
            max_attempts: 3,
            max_backoff: Duration::from_secs(20),
            max_retry_after: Duration::from_secs(20),
            initial_retry_tokens: 500,
            retry_cost: 5,
            timeout_retry_cost: 10,
            no_retry_increment: 1,
            adaptive_fail_fast: false,
            synthesize_exhausted_error: false,
        }
    }

    pub const fn adaptive() -> Self {
        let mut config = Self::standard();
        config.mode = RetryMode::Adaptive;
        config
    }

    /// A single attempt and no retries.
    pub const fn disabled() -> Self {
        let mut config = Self::standard();
        config.max_attempts = 1;
        config
    }

    pub const fn mode(&self) -> RetryMode {
        self.mode
    }

    pub const fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub const fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    pub const fn max_retry_after(&self) -> Duration {
        self.max_retry_after
    }

    pub const fn initial_retry_tokens(&self) -> usize {
        self.initial_retry_tokens
    }

    pub const fn retry_cost(&self) -> usize {
        self.retry_cost
    }

    pub const fn timeout_retry_cost(&self) -> usize {
        self.timeout_retry_cost
    }

    pub const fn no_retry_increment(&self) -> usize {
        self.no_retry_increment
    }

    pub const fn adaptive_fail_fast(&self) -> bool {
        self.adaptive_fail_fast
    }

    pub const fn synthesize_exhausted_error(&self) -> bool {
        self.synthesize_exhausted_error
    }

    pub const fn with_mode(mut self, mode: RetryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff.max(Duration::from_millis(1));
        self
    }

    pub const fn with_max_retry_after(mut self, max_retry_after: Duration) -> Self {
        self.max_retry_after = max_retry_after;
        self
    }

    pub const fn with_initial_retry_tokens(mut self, initial_retry_tokens: usize) -> Self {
        self.initial_retry_tokens = initial_retry_tokens;
        self
    }

    pub const fn with_retry_cost(mut self, retry_cost: usize) -> Self {
        self.retry_cost = retry_cost;
        self
    }

    pub const fn with_timeout_retry_cost(mut self, timeout_retry_cost: usize) -> Self {
        self.timeout_retry_cost = timeout_retry_cost;
        self
    }

    pub const fn with_no_retry_increment(mut self, no_retry_increment: usize) -> Self {
        self.no_retry_increment = no_retry_increment;
        self
    }

    pub const fn with_adaptive_fail_fast(mut self, adaptive_fail_fast: bool) -> Self {
        self.adaptive_fail_fast = adaptive_fail_fast;
        self
    }

    pub const fn with_synthesize_exhausted_error(mut self, synthesize: bool) -> Self {
        self.synthesize_exhausted_error = synthesize;
        self
    }

    /// Applies the same clamping as the setters to values that came from a document.
    pub(crate) fn normalize(self) -> Self {
        let max_attempts = self.max_attempts;
        let max_backoff = self.max_backoff;
        self.with_max_attempts(max_attempts)
            .with_max_backoff(max_backoff)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{RetryConfig, RetryMode};

    #[test]
    fn setters_clamp_invalid_values() {
        let config = RetryConfig::standard()
            .with_max_attempts(0)
            .with_max_backoff(Duration::ZERO);
        assert_eq!(config.max_attempts(), 1);
        assert_eq!(config.max_backoff(), Duration::from_millis(1));
    }

    #[test]
    fn presets_differ_only_where_expected() {
        assert_eq!(RetryConfig::adaptive().mode(), RetryMode::Adaptive);
        assert_eq!(RetryConfig::adaptive().max_attempts(), 3);
        assert_eq!(RetryConfig::disabled().max_attempts(), 1);
        assert_eq!(RetryConfig::default(), RetryConfig::standard());
    }

    #[test]
    fn deserializes_partial_documents_with_defaults() {
        let config: RetryConfig = serde_json::from_str(
            r#"{
                "max_attempts": 0,
                "max_backoff_ms": 0,
                "max_retry_after_ms": 1500,
                "synthesize_exhausted_error": true
            }"#,
        )
        .expect("config should parse");
        assert_eq!(config.mode(), RetryMode::Standard);
        assert_eq!(config.max_retry_after(), Duration::from_millis(1_500));
        assert_eq!(config.initial_retry_tokens(), 500);
        assert!(config.synthesize_exhausted_error());

        let normalized = config.normalize();
        assert_eq!(normalized.max_attempts(), 1);
        assert_eq!(normalized.max_backoff(), Duration::from_millis(1));
    }

    #[test]
    fn rejects_unknown_fields() {
        let parsed = serde_json::from_str::<RetryConfig>(r#"{ "max_attempt": 4 }"#);
        assert!(parsed.is_err());
    }
}
