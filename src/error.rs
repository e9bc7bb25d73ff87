use std::time::Duration;

use thiserror::Error;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Timeout,
    Read,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Timeout => "timeout",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    Transport,
    Serialization,
    Deserialization,
    Service,
    Auth,
    Configuration,
    RetryQuotaExhausted,
    RetryExhausted,
    Cancelled,
    DeadlineExceeded,
    WaiterTimeout,
    WaiterFailure,
    WaiterUnexpectedError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Serialization => "serialization",
            Self::Deserialization => "deserialization",
            Self::Service => "service",
            Self::Auth => "auth",
            Self::Configuration => "configuration",
            Self::RetryQuotaExhausted => "retry_quota_exhausted",
            Self::RetryExhausted => "retry_exhausted",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::WaiterTimeout => "waiter_timeout",
            Self::WaiterFailure => "waiter_failure",
            Self::WaiterUnexpectedError => "waiter_unexpected_error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("transport error ({kind}): {source}")]
    Transport {
        kind: TransportErrorKind,
        #[source]
        source: BoxError,
    },
    #[error("failed to serialize operation input: {source}")]
    Serialization {
        #[source]
        source: BoxError,
    },
    #[error("failed to deserialize operation output: {source}")]
    Deserialization {
        #[source]
        source: BoxError,
    },
    #[error("service error {status} {code}: {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("auth error: {message}")]
    Auth {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
    #[error("invalid configuration: {message}")]
    Configuration { message: String },
    #[error("failed to acquire retry token for partition {partition}: {reason}")]
    RetryQuotaExhausted { partition: String, reason: String },
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: usize,
        #[source]
        source: Box<Error>,
    },
    #[error("operation was cancelled")]
    Cancelled,
    #[error("operation deadline exceeded after {timeout_ms}ms")]
    DeadlineExceeded { timeout_ms: u128 },
    #[error("waiter exceeded its maximum wait time of {max_wait_ms}ms after {attempts} attempts")]
    WaiterTimeout { attempts: usize, max_wait_ms: u128 },
    #[error("waiter reached a failure state after {attempts} attempts")]
    WaiterFailure { attempts: usize },
    #[error("waiter stopped on an unexpected error after {attempts} attempts: {source}")]
    WaiterUnexpectedError {
        attempts: usize,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Serialization { .. } => ErrorCode::Serialization,
            Self::Deserialization { .. } => ErrorCode::Deserialization,
            Self::Service { .. } => ErrorCode::Service,
            Self::Auth { .. } => ErrorCode::Auth,
            Self::Configuration { .. } => ErrorCode::Configuration,
            Self::RetryQuotaExhausted { .. } => ErrorCode::RetryQuotaExhausted,
            Self::RetryExhausted { .. } => ErrorCode::RetryExhausted,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::DeadlineExceeded { .. } => ErrorCode::DeadlineExceeded,
            Self::WaiterTimeout { .. } => ErrorCode::WaiterTimeout,
            Self::WaiterFailure { .. } => ErrorCode::WaiterFailure,
            Self::WaiterUnexpectedError { .. } => ErrorCode::WaiterUnexpectedError,
        }
    }

    pub fn transport(
        kind: TransportErrorKind,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Transport {
            kind,
            source: source.into(),
        }
    }

    pub fn serialization(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Serialization {
            source: source.into(),
        }
    }

    pub fn deserialization(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Deserialization {
            source: source.into(),
        }
    }

    pub fn service(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Service {
            status,
            code: code.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
            source: None,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Attaches a retry-after hint to a service error; other variants are returned unchanged.
    pub fn with_retry_after(mut self, hint: Option<Duration>) -> Self {
        if let Self::Service { retry_after, .. } = &mut self {
            *retry_after = hint;
        }
        self
    }

    /// True when the service answered with a well-formed response, whatever its status.
    pub fn is_response_received(&self) -> bool {
        match self {
            Self::Service { .. } | Self::Deserialization { .. } => true,
            Self::RetryExhausted { source, .. } | Self::WaiterUnexpectedError { source, .. } => {
                source.is_response_received()
            }
            _ => false,
        }
    }

    pub fn is_transport(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::RetryExhausted { source, .. } | Self::WaiterUnexpectedError { source, .. } => {
                source.is_transport()
            }
            _ => false,
        }
    }

    pub fn service_code(&self) -> Option<&str> {
        match self {
            Self::Service { code, .. } => Some(code.as_str()),
            Self::RetryExhausted { source, .. } => source.service_code(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorCode, TransportErrorKind};

    #[test]
    fn retry_exhausted_keeps_the_cause_classification() {
        let error = Error::RetryExhausted {
            attempts: 3,
            source: Box::new(Error::transport(TransportErrorKind::Connect, "refused")),
        };
        assert_eq!(error.code(), ErrorCode::RetryExhausted);
        assert!(error.is_transport());
        assert!(!error.is_response_received());
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn service_errors_report_a_received_response() {
        let error = Error::service(503, "SlowDown", "please slow down")
            .with_retry_after(Some(std::time::Duration::from_secs(2)));
        assert!(error.is_response_received());
        assert_eq!(error.service_code(), Some("SlowDown"));
        match error {
            Error::Service { retry_after, .. } => {
                assert_eq!(retry_after, Some(std::time::Duration::from_secs(2)));
            }
            other => panic!("unexpected error variant: {other}"),
        }
    }

    #[test]
    fn codes_have_stable_names() {
        assert_eq!(Error::Cancelled.code().as_str(), "cancelled");
        assert_eq!(
            Error::configuration("bad").code().as_str(),
            "configuration"
        );
    }
}
