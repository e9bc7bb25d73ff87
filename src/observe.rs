//! Telemetry boundary.
//!
//! Observers are registered on an explicit [`Telemetry`] registry that the
//! client places in every invocation [`Context`]. Code without a registry in
//! reach gets [`Telemetry::disabled`], on which every call is a no-op.

use std::sync::Arc;
use std::time::Duration;

use crate::context::{Context, keys};
use crate::error::Error;
use crate::retry::RetryErrorInfo;

pub trait Observer: Send + Sync {
    fn on_operation_start(&self, _context: &Context) {}

    fn on_attempt_start(&self, _context: &Context, _attempt: usize) {}

    fn on_attempt_error(
        &self,
        _context: &Context,
        _attempt: usize,
        _error: &Error,
        _classification: Option<&RetryErrorInfo>,
    ) {
    }

    fn on_retry_scheduled(&self, _context: &Context, _attempt: usize, _delay: Duration) {}

    fn on_operation_complete(
        &self,
        _context: &Context,
        _outcome: Result<(), &Error>,
        _elapsed: Duration,
    ) {
    }

    /// Free-form event emitted by middleware.
    fn on_event(&self, _context: &Context, _name: &str, _detail: &str) {}
}

#[derive(Clone, Default)]
pub struct Telemetry {
    inner: Option<Arc<TelemetryInner>>,
}

struct TelemetryInner {
    name: String,
    observers: Vec<Arc<dyn Observer>>,
}

impl Telemetry {
    pub fn builder() -> TelemetryBuilder {
        TelemetryBuilder::default()
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// Registry stored in `context`, or the disabled registry when there is none.
    pub fn from_context(context: &Context) -> Self {
        context.get(&keys::TELEMETRY).cloned().unwrap_or_default()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.as_deref().map(|inner| inner.name.as_str())
    }

    fn observers(&self) -> &[Arc<dyn Observer>] {
        match &self.inner {
            Some(inner) => &inner.observers,
            None => &[],
        }
    }

    pub fn operation_start(&self, context: &Context) {
        for observer in self.observers() {
            observer.on_operation_start(context);
        }
    }

    pub fn attempt_start(&self, context: &Context, attempt: usize) {
        for observer in self.observers() {
            observer.on_attempt_start(context, attempt);
        }
    }

    pub fn attempt_error(
        &self,
        context: &Context,
        attempt: usize,
        error: &Error,
        classification: Option<&RetryErrorInfo>,
    ) {
        for observer in self.observers() {
            observer.on_attempt_error(context, attempt, error, classification);
        }
    }

    pub fn retry_scheduled(&self, context: &Context, attempt: usize, delay: Duration) {
        for observer in self.observers() {
            observer.on_retry_scheduled(context, attempt, delay);
        }
    }

    pub fn operation_complete(
        &self,
        context: &Context,
        outcome: Result<(), &Error>,
        elapsed: Duration,
    ) {
        for observer in self.observers() {
            observer.on_operation_complete(context, outcome, elapsed);
        }
    }

    pub fn emit(&self, context: &Context, name: &str, detail: &str) {
        if !self.is_enabled() {
            return;
        }
        tracing::debug!(
            operation = context.operation_name(),
            event = name,
            detail,
            "telemetry event"
        );
        for observer in self.observers() {
            observer.on_event(context, name, detail);
        }
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Telemetry")
            .field("name", &self.name())
            .field("observers", &self.observers().len())
            .finish()
    }
}

#[derive(Default)]
pub struct TelemetryBuilder {
    name: Option<String>,
    observers: Vec<Arc<dyn Observer>>,
}

impl TelemetryBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn build(self) -> Telemetry {
        Telemetry {
            inner: Some(Arc::new(TelemetryInner {
                name: self.name.unwrap_or_else(|| env!("CARGO_PKG_NAME").to_owned()),
                observers: self.observers,
            })),
        }
    }
}
