use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::Method;
use sdk_runtime::prelude::*;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct TableStatusTransport {
    replies: Mutex<VecDeque<(u16, &'static str)>>,
    calls: AtomicUsize,
}

impl TableStatusTransport {
    fn new(replies: impl IntoIterator<Item = (u16, &'static str)>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().collect()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transport for TableStatusTransport {
    fn send(&self, _request: Request) -> BoxFuture<'_, sdk_runtime::Result<Response>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (status, body) = lock_unpoisoned(&self.replies)
            .pop_front()
            .unwrap_or((200, "CREATING"));
        Box::pin(async move {
            let mut response = http::Response::new(Bytes::from_static(body.as_bytes()));
            *response.status_mut() =
                http::StatusCode::from_u16(status).map_err(Error::deserialization)?;
            Ok(response)
        })
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn encode(
    table: &String,
    _context: &Context,
    request: &mut RequestBuilder,
) -> sdk_runtime::Result<()> {
    request.set_method(Method::GET).set_path(format!("tables/{table}"));
    Ok(())
}

fn decode(response: &Response, _context: &Context) -> sdk_runtime::Result<String> {
    match response.status().as_u16() {
        200 => String::from_utf8(response.body().to_vec()).map_err(Error::deserialization),
        404 => Err(Error::service(404, "ResourceNotFoundException", "no such table")),
        status => Err(Error::service(status, "InternalFailure", "describe failed")),
    }
}

fn describe_table_stack() -> OperationStack<String, String> {
    let mut stack = OperationStack::new("DescribeTable");
    stack
        .serialize_mut()
        .append(SerializeMiddleware::new(encode))
        .expect("serializer should register");
    stack
        .build_mut()
        .append(EndpointMiddleware::with_fallback(
            Endpoint::parse("https://tables.example.com").expect("valid endpoint"),
        ))
        .expect("endpoint should register");
    stack
        .deserialize_mut()
        .append(DeserializeMiddleware::new(decode))
        .expect("deserializer should register");
    stack
}

fn table_active_waiter(min_delay: Duration, max_delay: Duration) -> Waiter<String, String> {
    let config = WaiterConfig::new(
        min_delay,
        max_delay,
        vec![
            Acceptor::success_when(|_: &String, status: &String| status == "ACTIVE"),
            Acceptor::failure_when(|_: &String, status: &String| status == "FAILED"),
            Acceptor::retry_on_error_code("ResourceNotFoundException"),
        ],
    )
    .expect("valid waiter config");
    Waiter::new(config).with_seed(11)
}

async fn wait_for_table(
    transport: Arc<TableStatusTransport>,
    waiter: &Waiter<String, String>,
    options: WaiterOptions,
) -> sdk_runtime::Result<WaiterOutcome<String>> {
    let client = Client::builder(transport)
        .retry_config(RetryConfig::disabled())
        .build();
    let stack = describe_table_stack();
    let base = Context::for_operation("Tables", "DescribeTable");

    waiter
        .wait(options, "orders".to_owned(), |table| {
            let client = &client;
            let stack = &stack;
            let mut context = base.derive();
            async move { client.invoke(stack, &mut context, table).await }
        })
        .await
}

#[tokio::test(start_paused = true)]
async fn waits_until_the_success_acceptor_matches() {
    let transport =
        TableStatusTransport::new([(200, "CREATING"), (200, "CREATING"), (200, "ACTIVE")]);
    let waiter = table_active_waiter(Duration::from_secs(2), Duration::from_secs(20));

    let started = Instant::now();
    let outcome = wait_for_table(
        Arc::clone(&transport),
        &waiter,
        WaiterOptions::new(Duration::from_secs(300)),
    )
    .await
    .expect("table becomes active");

    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.output.expect("success output"), "ACTIVE");
    assert_eq!(transport.calls(), 3);
    assert!(started.elapsed() >= Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn first_poll_is_immediate() {
    let transport = TableStatusTransport::new([(200, "ACTIVE")]);
    let waiter = table_active_waiter(Duration::from_secs(5), Duration::from_secs(20));

    let started = Instant::now();
    let outcome = wait_for_table(transport, &waiter, WaiterOptions::new(Duration::from_secs(60)))
        .await
        .expect("already active");

    assert_eq!(outcome.attempts, 1);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn matched_error_codes_keep_polling() {
    let transport = TableStatusTransport::new([(404, ""), (404, ""), (200, "ACTIVE")]);
    let waiter = table_active_waiter(Duration::from_secs(1), Duration::from_secs(8));

    let outcome = wait_for_table(
        Arc::clone(&transport),
        &waiter,
        WaiterOptions::new(Duration::from_secs(120)),
    )
    .await
    .expect("table appears");

    assert_eq!(outcome.attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn failure_acceptor_ends_the_wait() {
    let transport = TableStatusTransport::new([(200, "CREATING"), (200, "FAILED")]);
    let waiter = table_active_waiter(Duration::from_secs(2), Duration::from_secs(20));

    let error = wait_for_table(transport, &waiter, WaiterOptions::new(Duration::from_secs(300)))
        .await
        .expect_err("table creation failed");

    assert!(matches!(error, Error::WaiterFailure { attempts: 2 }));
}

#[tokio::test(start_paused = true)]
async fn unmatched_errors_surface_as_unexpected() {
    let transport = TableStatusTransport::new([(200, "CREATING"), (500, "")]);
    let waiter = table_active_waiter(Duration::from_secs(2), Duration::from_secs(20));

    let error = wait_for_table(transport, &waiter, WaiterOptions::new(Duration::from_secs(300)))
        .await
        .expect_err("server failure is not an acceptor state");

    assert_eq!(error.code(), ErrorCode::WaiterUnexpectedError);
    match &error {
        Error::WaiterUnexpectedError { attempts, source } => {
            assert_eq!(*attempts, 2);
            assert_eq!(source.service_code(), Some("InternalFailure"));
        }
        other => panic!("unexpected error variant: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn gives_up_within_the_wait_budget() {
    let transport = TableStatusTransport::new([]);
    let waiter = table_active_waiter(Duration::from_secs(1), Duration::from_secs(4));

    let started = Instant::now();
    let error = wait_for_table(
        Arc::clone(&transport),
        &waiter,
        WaiterOptions::new(Duration::from_secs(20)),
    )
    .await
    .expect_err("table never becomes active");
    let elapsed = started.elapsed();

    assert!(
        matches!(error, Error::WaiterTimeout { max_wait_ms: 20_000, .. }),
        "{error}"
    );
    assert!(elapsed <= Duration::from_secs(20), "elapsed {elapsed:?}");
    assert!(elapsed >= Duration::from_secs(18), "elapsed {elapsed:?}");
    assert!(transport.calls() >= 5);
}

#[tokio::test(start_paused = true)]
async fn slow_first_poll_counts_against_the_wait_budget() {
    let waiter = table_active_waiter(Duration::from_secs(2), Duration::from_secs(2));
    let polls = AtomicUsize::new(0);

    let started = Instant::now();
    let error = waiter
        .wait(
            WaiterOptions::new(Duration::from_secs(10)),
            "orders".to_owned(),
            |_table| {
                let first = polls.fetch_add(1, Ordering::SeqCst) == 0;
                async move {
                    if first {
                        tokio::time::sleep(Duration::from_secs(8)).await;
                    }
                    Ok::<String, Error>("CREATING".to_owned())
                }
            },
        )
        .await
        .expect_err("table never becomes active");
    let elapsed = started.elapsed();

    assert!(
        matches!(error, Error::WaiterTimeout { attempts: 2, max_wait_ms: 10_000 }),
        "{error}"
    );
    assert_eq!(polls.load(Ordering::SeqCst), 2);
    assert!(elapsed <= Duration::from_secs(10), "elapsed {elapsed:?}");
    assert!(elapsed >= Duration::from_secs(8), "elapsed {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_the_delay() {
    let transport = TableStatusTransport::new([]);
    let waiter = table_active_waiter(Duration::from_secs(30), Duration::from_secs(60));
    let cancellation = CancellationToken::new();

    let trigger = cancellation.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let error = wait_for_table(
        Arc::clone(&transport),
        &waiter,
        WaiterOptions::new(Duration::from_secs(600)).with_cancellation(cancellation),
    )
    .await
    .expect_err("cancelled waiter fails");

    assert_eq!(error.code(), ErrorCode::Cancelled);
    assert_eq!(transport.calls(), 1);
    assert!(started.elapsed() < Duration::from_secs(30));
}

#[tokio::test]
async fn wait_budget_must_exceed_the_minimum_delay() {
    let transport = TableStatusTransport::new([]);
    let waiter = table_active_waiter(Duration::from_secs(5), Duration::from_secs(20));

    let error = wait_for_table(
        Arc::clone(&transport),
        &waiter,
        WaiterOptions::new(Duration::from_secs(5)),
    )
    .await
    .expect_err("budget equal to min_delay is rejected");

    assert_eq!(error.code(), ErrorCode::Configuration);
    assert_eq!(transport.calls(), 0);
}
