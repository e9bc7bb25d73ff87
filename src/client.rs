use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::Result;
use crate::config::RetryConfig;
use crate::context::{Context, keys};
use crate::error::Error;
use crate::metrics::{ClientMetrics, ClientMetricsSnapshot};
use crate::observe::Telemetry;
use crate::retry::{
    AcquiredToken, DefaultRetryErrorClassifier, RetryErrorClassifier, RetryErrorType,
    RetryStrategy, StandardRetryStrategy,
};
use crate::stack::OperationStack;
use crate::transport::Transport;

const DEFAULT_CLIENT_NAME: &str = "sdk-runtime";

/// Per-call overrides for one invocation.
#[derive(Clone, Debug, Default)]
pub struct ExecutionOptions {
    pub total_timeout: Option<Duration>,
    pub cancellation: Option<CancellationToken>,
}

impl ExecutionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_total_timeout(mut self, total_timeout: Duration) -> Self {
        self.total_timeout = Some(total_timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = Some(cancellation);
        self
    }
}

/// Executes operation stacks against one transport under one retry strategy.
///
/// Clones share the transport, the retry strategy (and with it the retry
/// quota and rate limiter state) and the metrics.
pub struct Client<R = StandardRetryStrategy> {
    client_name: Arc<str>,
    transport: Arc<dyn Transport>,
    retry_strategy: Arc<R>,
    classifier: Arc<dyn RetryErrorClassifier>,
    telemetry: Telemetry,
    total_timeout: Option<Duration>,
    metrics: ClientMetrics,
}

impl<R> Clone for Client<R> {
    fn clone(&self) -> Self {
        Self {
            client_name: Arc::clone(&self.client_name),
            transport: Arc::clone(&self.transport),
            retry_strategy: Arc::clone(&self.retry_strategy),
            classifier: Arc::clone(&self.classifier),
            telemetry: self.telemetry.clone(),
            total_timeout: self.total_timeout,
            metrics: self.metrics.clone(),
        }
    }
}

impl<R> std::fmt::Debug for Client<R> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Client")
            .field("client_name", &self.client_name)
            .field("total_timeout", &self.total_timeout)
            .field("telemetry", &self.telemetry)
            .finish_non_exhaustive()
    }
}

impl Client<StandardRetryStrategy> {
    pub fn builder<T>(transport: T) -> ClientBuilder<StandardRetryStrategy>
    where
        T: Transport + 'static,
    {
        ClientBuilder::new(Arc::new(transport))
    }
}

impl<R> Client<R>
where
    R: RetryStrategy,
{
    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub fn retry_strategy(&self) -> &R {
        &self.retry_strategy
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn metrics_snapshot(&self) -> ClientMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn invoke<I, O>(
        &self,
        stack: &OperationStack<I, O>,
        context: &mut Context,
        input: I,
    ) -> Result<O>
    where
        I: Clone + Send + Sync + 'static,
        O: Send + 'static,
    {
        self.invoke_with(stack, context, input, ExecutionOptions::default())
            .await
    }

    /// Runs `stack` until it succeeds, the retry strategy gives up, the
    /// total timeout fires or `options.cancellation` is cancelled.
    pub async fn invoke_with<I, O>(
        &self,
        stack: &OperationStack<I, O>,
        context: &mut Context,
        input: I,
        options: ExecutionOptions,
    ) -> Result<O>
    where
        I: Clone + Send + Sync + 'static,
        O: Send + 'static,
    {
        let total_timeout = options.total_timeout.or(self.total_timeout);
        let cancellation = options.cancellation.unwrap_or_default();
        if !context.contains(&keys::OPERATION_NAME) {
            context.set(&keys::OPERATION_NAME, stack.id().to_owned());
        }
        context.set(&keys::TELEMETRY, self.telemetry.clone());

        let span = info_span!(
            "sdk.operation",
            client = %self.client_name,
            service = context.service_name(),
            operation = context.operation_name(),
        );
        let started = Instant::now();
        let _in_flight = self.metrics.record_operation_started();
        self.telemetry.operation_start(context);

        let result = async {
            let attempts = async {
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => {
                        debug!("operation cancelled");
                        Err(Error::Cancelled)
                    }
                    result = self.run_attempts(stack, &mut *context, input) => result,
                }
            };
            match total_timeout {
                Some(limit) => match timeout(limit, attempts).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(
                            timeout_ms = limit.as_millis() as u64,
                            "operation deadline exceeded"
                        );
                        Err(Error::DeadlineExceeded {
                            timeout_ms: limit.as_millis(),
                        })
                    }
                },
                None => attempts.await,
            }
        }
        .instrument(span)
        .await;

        let elapsed = started.elapsed();
        self.metrics.record_operation_completed(&result, elapsed);
        self.telemetry
            .operation_complete(context, result.as_ref().map(|_| ()), elapsed);
        result
    }

    async fn run_attempts<I, O>(
        &self,
        stack: &OperationStack<I, O>,
        context: &mut Context,
        input: I,
    ) -> Result<O>
    where
        I: Clone + Send + Sync + 'static,
        O: Send + 'static,
    {
        let partition = match context.get(&keys::SERVICE_NAME) {
            Some(service) => service.clone(),
            None => self.client_name.to_string(),
        };
        let AcquiredToken { mut token, delay } = self
            .retry_strategy
            .acquire_initial_retry_token(&partition)?;
        if !delay.is_zero() {
            debug!(
                delay_ms = delay.as_millis() as u64,
                "waiting for send capacity"
            );
            sleep(delay).await;
        }

        let max_attempts = self.retry_strategy.max_attempts();
        context.set(&keys::MAX_ATTEMPTS, max_attempts);
        let mut attempt = 1_usize;
        loop {
            context.set(&keys::ATTEMPT, attempt);
            self.metrics.record_attempt();
            self.telemetry.attempt_start(context, attempt);
            debug!(attempt, max_attempts, "sending attempt");

            let error = match stack
                .handle(context, input.clone(), self.transport.as_ref())
                .await
            {
                Ok(output) => {
                    self.retry_strategy.record_success(token);
                    return Ok(output);
                }
                Err(error) => error,
            };

            let classification = self.classifier.classify(&error);
            self.telemetry
                .attempt_error(context, attempt, &error, classification.as_ref());
            let Some(info) = classification else {
                debug!(attempt, error = %error, "error is not retryable");
                return Err(error);
            };
            if info.error_type == RetryErrorType::ClientError {
                debug!(attempt, error = %error, "client errors are not retried");
                return Err(error);
            }

            match self
                .retry_strategy
                .refresh_retry_token_for_retry(&mut token, &info)
            {
                Ok(delay) => {
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error_type = info.error_type.as_str(),
                        error = %error,
                        "retrying operation"
                    );
                    self.metrics.record_retry(info.error_type);
                    self.telemetry.retry_scheduled(context, attempt, delay);
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(refusal) => {
                    debug!(attempt, reason = %refusal, "retry refused");
                    if self.retry_strategy.synthesizes_exhausted_error() {
                        return Err(Error::RetryExhausted {
                            attempts: attempt,
                            source: Box::new(error),
                        });
                    }
                    return Err(error);
                }
            }
        }
    }
}

pub struct ClientBuilder<R = StandardRetryStrategy> {
    client_name: String,
    transport: Arc<dyn Transport>,
    retry_strategy: R,
    classifier: Arc<dyn RetryErrorClassifier>,
    telemetry: Telemetry,
    total_timeout: Option<Duration>,
}

impl ClientBuilder<StandardRetryStrategy> {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            transport,
            retry_strategy: StandardRetryStrategy::default(),
            classifier: Arc::new(DefaultRetryErrorClassifier::new()),
            telemetry: Telemetry::disabled(),
            total_timeout: None,
        }
    }

    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_strategy = StandardRetryStrategy::new(config);
        self
    }
}

impl<R> ClientBuilder<R>
where
    R: RetryStrategy,
{
    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn retry_strategy<S>(self, retry_strategy: S) -> ClientBuilder<S>
    where
        S: RetryStrategy,
    {
        ClientBuilder {
            client_name: self.client_name,
            transport: self.transport,
            retry_strategy,
            classifier: self.classifier,
            telemetry: self.telemetry,
            total_timeout: self.total_timeout,
        }
    }

    pub fn classifier(mut self, classifier: Arc<dyn RetryErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn total_timeout(mut self, total_timeout: Duration) -> Self {
        self.total_timeout = Some(total_timeout.max(Duration::from_millis(1)));
        self
    }

    pub fn build(self) -> Client<R> {
        Client {
            client_name: Arc::from(self.client_name),
            transport: self.transport,
            retry_strategy: Arc::new(self.retry_strategy),
            classifier: self.classifier,
            telemetry: self.telemetry,
            total_timeout: self.total_timeout,
            metrics: ClientMetrics::default(),
        }
    }
}
