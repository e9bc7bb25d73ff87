//! `sdk-runtime` is the request-execution core shared by generated API SDK clients.
//!
//! An operation is described by an [`OperationStack`]: five fixed phases
//! (initialize, serialize, build, finalize, deserialize), each holding an
//! ordered list of middleware. A [`Client`] runs the stack against a
//! [`Transport`] inside a retry loop driven by a [`RetryStrategy`]. Wire
//! formats, signing algorithms and the HTTP engine plug in from outside.
//!
//! # Quick Start
//!
//! ```
//! use bytes::Bytes;
//! use futures_util::future::BoxFuture;
//! use sdk_runtime::prelude::*;
//!
//! struct Echo;
//!
//! impl Transport for Echo {
//!     fn send(&self, request: Request) -> BoxFuture<'_, sdk_runtime::Result<Response>> {
//!         Box::pin(async move { Ok(http::Response::new(request.into_body())) })
//!     }
//! }
//!
//! fn encode(
//!     input: &String,
//!     _: &Context,
//!     request: &mut RequestBuilder,
//! ) -> sdk_runtime::Result<()> {
//!     request.set_method(http::Method::POST).set_body(Bytes::from(input.clone()));
//!     Ok(())
//! }
//!
//! fn decode(response: &Response, _: &Context) -> sdk_runtime::Result<String> {
//!     String::from_utf8(response.body().to_vec()).map_err(Error::deserialization)
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> sdk_runtime::Result<()> {
//! let mut stack: OperationStack<String, String> = OperationStack::new("Echo");
//! stack.serialize_mut().append(SerializeMiddleware::new(encode))?;
//! stack.deserialize_mut().append(DeserializeMiddleware::new(decode))?;
//!
//! let client = Client::builder(Echo)
//!     .client_name("echo-sdk")
//!     .retry_config(RetryConfig::standard().with_max_attempts(3))
//!     .build();
//! let mut context = Context::for_operation("EchoService", "Echo");
//! let output = client.invoke(&stack, &mut context, "hello".to_owned()).await?;
//! assert_eq!(output, "hello");
//! # Ok(())
//! # }
//! ```
//!
//! # Recommended Defaults
//!
//! - Use `RetryConfig::standard()`; switch to `RetryConfig::adaptive()` for
//!   services that throttle aggressively.
//! - Set a total timeout, either on the client or per call.
//! - Register middleware by id and position, never by index, so generated and
//!   hand-written customizations compose.

pub mod auth;
pub mod backoff;
pub mod client;
pub mod clock;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod middleware;
pub mod observe;
pub mod rate_limit;
pub mod request;
pub mod retry;
pub mod stack;
pub mod transport;
mod util;
pub mod waiter;

pub use crate::client::{Client, ClientBuilder, ExecutionOptions};
pub use crate::context::{AttributeKey, Attributes, Context};
pub use crate::error::{Error, ErrorCode, TransportErrorKind};
pub use crate::handler::{Handler, Middleware, Next};
pub use crate::request::{Request, RequestBuilder, Response};
pub use crate::retry::{RetryStrategy, StandardRetryStrategy};
pub use crate::stack::{OperationStack, Phase, Position};
pub use crate::transport::Transport;
pub use crate::util::retry_after_from_headers;

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::auth::{Identity, SelectedAuthScheme, Signer, SigningMiddleware};
    pub use crate::backoff::ExponentialBackoff;
    pub use crate::client::{Client, ClientBuilder, ExecutionOptions};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::codec::{
        DeserializeMiddleware, RequestEncoder, ResponseDecoder, SerializeMiddleware,
    };
    pub use crate::config::{RetryConfig, RetryMode};
    pub use crate::context::{AttributeKey, Attributes, Context, keys};
    pub use crate::error::{Error, ErrorCode, TransportErrorKind};
    pub use crate::handler::{Handler, Middleware, Next, handler_fn, middleware_fn};
    pub use crate::metrics::ClientMetricsSnapshot;
    pub use crate::middleware::{
        ContentLengthMiddleware, Endpoint, EndpointMiddleware, RetryInfoMiddleware,
        UserAgentMiddleware,
    };
    pub use crate::observe::{Observer, Telemetry};
    pub use crate::rate_limit::ClientRateLimiter;
    pub use crate::request::{Request, RequestBuilder, Response};
    pub use crate::retry::{
        DefaultRetryErrorClassifier, RetryErrorClassifier, RetryErrorInfo, RetryErrorType,
        RetryRefusal, RetryStrategy, StandardRetryStrategy,
    };
    pub use crate::stack::{OperationResponse, OperationStack, Phase, Position, SerializeInput};
    pub use crate::transport::Transport;
    pub use crate::waiter::{
        Acceptor, AcceptorState, Waiter, WaiterConfig, WaiterOptions, WaiterOutcome,
    };
}
