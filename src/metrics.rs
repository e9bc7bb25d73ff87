use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, ErrorCode};
use crate::retry::RetryErrorType;
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientMetricsSnapshot {
    pub operations_started: u64,
    pub operations_succeeded: u64,
    pub operations_failed: u64,
    pub attempts: u64,
    pub retries: u64,
    pub throttling_responses: u64,
    pub cancellations: u64,
    pub deadline_exceeded: u64,
    pub quota_rejections: u64,
    pub in_flight: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub error_counts: BTreeMap<String, u64>,
}

/// Counters shared by every operation of one client.
#[derive(Clone, Debug, Default)]
pub struct ClientMetrics {
    inner: Arc<ClientMetricsInner>,
}

#[derive(Debug, Default)]
struct ClientMetricsInner {
    operations_started: AtomicU64,
    operations_succeeded: AtomicU64,
    operations_failed: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    throttling_responses: AtomicU64,
    cancellations: AtomicU64,
    deadline_exceeded: AtomicU64,
    quota_rejections: AtomicU64,
    in_flight: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    metrics: ClientMetrics,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

impl ClientMetrics {
    pub(crate) fn record_operation_started(&self) -> InFlightGuard {
        self.inner
            .operations_started
            .fetch_add(1, Ordering::Relaxed);
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            metrics: self.clone(),
        }
    }

    pub(crate) fn record_attempt(&self) {
        self.inner.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self, error_type: RetryErrorType) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
        if error_type == RetryErrorType::Throttling {
            self.inner
                .throttling_responses
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_operation_completed<T>(
        &self,
        result: &Result<T, Error>,
        latency: Duration,
    ) {
        let latency_ms = latency.as_millis().min(u64::MAX as u128) as u64;
        self.inner
            .latency_total_ms
            .fetch_add(latency_ms, Ordering::Relaxed);
        self.inner.latency_samples.fetch_add(1, Ordering::Relaxed);

        let error = match result {
            Ok(_) => {
                self.inner
                    .operations_succeeded
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(error) => error,
        };

        self.inner.operations_failed.fetch_add(1, Ordering::Relaxed);
        match error.code() {
            ErrorCode::Cancelled => {
                self.inner.cancellations.fetch_add(1, Ordering::Relaxed);
            }
            ErrorCode::DeadlineExceeded => {
                self.inner.deadline_exceeded.fetch_add(1, Ordering::Relaxed);
            }
            ErrorCode::RetryQuotaExhausted => {
                self.inner.quota_rejections.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        let mut error_counts = lock_unpoisoned(&self.inner.error_counts);
        *error_counts
            .entry(error.code().as_str().to_owned())
            .or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> ClientMetricsSnapshot {
        let latency_samples = self.inner.latency_samples.load(Ordering::Relaxed);
        let latency_total_ms = self.inner.latency_total_ms.load(Ordering::Relaxed);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };
        ClientMetricsSnapshot {
            operations_started: self.inner.operations_started.load(Ordering::Relaxed),
            operations_succeeded: self.inner.operations_succeeded.load(Ordering::Relaxed),
            operations_failed: self.inner.operations_failed.load(Ordering::Relaxed),
            attempts: self.inner.attempts.load(Ordering::Relaxed),
            retries: self.inner.retries.load(Ordering::Relaxed),
            throttling_responses: self.inner.throttling_responses.load(Ordering::Relaxed),
            cancellations: self.inner.cancellations.load(Ordering::Relaxed),
            deadline_exceeded: self.inner.deadline_exceeded.load(Ordering::Relaxed),
            quota_rejections: self.inner.quota_rejections.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.load(Ordering::Relaxed),
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            error_counts: lock_unpoisoned(&self.inner.error_counts).clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ClientMetrics;
    use crate::error::Error;
    use crate::retry::RetryErrorType;

    #[test]
    fn counts_outcomes_and_tracks_in_flight() {
        let metrics = ClientMetrics::default();
        let guard = metrics.record_operation_started();
        metrics.record_attempt();
        metrics.record_retry(RetryErrorType::Throttling);
        metrics.record_attempt();
        assert_eq!(metrics.snapshot().in_flight, 1);
        drop(guard);

        metrics.record_operation_completed(&Ok::<_, Error>(()), Duration::from_millis(10));
        metrics.record_operation_completed(
            &Err::<(), _>(Error::Cancelled),
            Duration::from_millis(30),
        );

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.operations_started, 1);
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(snapshot.attempts, 2);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.throttling_responses, 1);
        assert_eq!(snapshot.operations_succeeded, 1);
        assert_eq!(snapshot.operations_failed, 1);
        assert_eq!(snapshot.cancellations, 1);
        assert_eq!(snapshot.error_counts.get("cancelled"), Some(&1));
        assert_eq!(snapshot.latency_avg_ms, 20.0);
    }
}
