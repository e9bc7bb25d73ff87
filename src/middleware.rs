//! Built-in middleware that is independent of any wire protocol.

use futures_util::future::BoxFuture;
use http::header::{CONTENT_LENGTH, HeaderName, HeaderValue, USER_AGENT};
use http::{HeaderMap, Method};

use crate::Result;
use crate::context::{Context, keys};
use crate::error::Error;
use crate::handler::{Middleware, Next};
use crate::request::{Request, RequestBuilder};
use crate::util::redact_uri_for_logs;

pub const ENDPOINT_MIDDLEWARE_ID: &str = "ResolveEndpoint";
pub const CONTENT_LENGTH_MIDDLEWARE_ID: &str = "ComputeContentLength";
pub const USER_AGENT_MIDDLEWARE_ID: &str = "UserAgent";
pub const RETRY_INFO_MIDDLEWARE_ID: &str = "RetryMetricsHeader";

pub const INVOCATION_ID_HEADER: &str = "amz-sdk-invocation-id";
pub const REQUEST_INFO_HEADER: &str = "amz-sdk-request";

/// A resolved service endpoint, usually produced by an external resolver and
/// stored under [`keys::ENDPOINT`].
#[derive(Clone, Debug, PartialEq)]
pub struct Endpoint {
    url: url::Url,
    headers: HeaderMap,
}

impl Endpoint {
    pub fn new(url: url::Url) -> Self {
        Self {
            url,
            headers: HeaderMap::new(),
        }
    }

    pub fn parse(url: &str) -> Result<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|error| Error::configuration(format!("invalid endpoint `{url}`: {error}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::configuration(format!(
                "endpoint `{url}` must use http or https"
            )));
        }
        Ok(Self::new(parsed))
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn url(&self) -> &url::Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// Applies the resolved endpoint to the request.
///
/// The [`keys::ENDPOINT`] attribute wins over the fallback endpoint given at
/// construction. Endpoint headers never replace headers set by earlier
/// middleware.
#[derive(Debug, Default)]
pub struct EndpointMiddleware {
    fallback: Option<Endpoint>,
}

impl EndpointMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(endpoint: Endpoint) -> Self {
        Self {
            fallback: Some(endpoint),
        }
    }
}

impl<O> Middleware<RequestBuilder, O> for EndpointMiddleware
where
    O: Send + 'static,
{
    fn id(&self) -> &str {
        ENDPOINT_MIDDLEWARE_ID
    }

    fn handle<'a>(
        &'a self,
        context: &'a mut Context,
        mut request: RequestBuilder,
        next: Next<'a, RequestBuilder, O>,
    ) -> BoxFuture<'a, Result<O>> {
        Box::pin(async move {
            let endpoint = context
                .get(&keys::ENDPOINT)
                .or(self.fallback.as_ref())
                .ok_or_else(|| {
                    Error::configuration(format!(
                        "no endpoint resolved for {}",
                        context.operation_name()
                    ))
                })?;
            tracing::debug!(
                operation = context.operation_name(),
                endpoint = %redact_uri_for_logs(endpoint.url.as_str()),
                "resolved endpoint"
            );
            request.set_endpoint(endpoint.url.clone());
            for (name, value) in &endpoint.headers {
                if !request.headers().contains_key(name) {
                    request.headers_mut().insert(name.clone(), value.clone());
                }
            }
            next.run(context, request).await
        })
    }
}

/// Sets `content-length` from the body when the request does not carry one.
#[derive(Debug, Default)]
pub struct ContentLengthMiddleware;

impl<O> Middleware<RequestBuilder, O> for ContentLengthMiddleware
where
    O: Send + 'static,
{
    fn id(&self) -> &str {
        CONTENT_LENGTH_MIDDLEWARE_ID
    }

    fn handle<'a>(
        &'a self,
        context: &'a mut Context,
        mut request: RequestBuilder,
        next: Next<'a, RequestBuilder, O>,
    ) -> BoxFuture<'a, Result<O>> {
        Box::pin(async move {
            let expects_body = matches!(
                *request.method(),
                Method::POST | Method::PUT | Method::PATCH
            );
            if !request.headers().contains_key(CONTENT_LENGTH)
                && (expects_body || !request.body().is_empty())
            {
                let length = HeaderValue::from(request.body().len());
                request.header(CONTENT_LENGTH, length);
            }
            next.run(context, request).await
        })
    }
}

/// Adds the runtime identifier (and optional application id) to `user-agent`.
#[derive(Debug)]
pub struct UserAgentMiddleware {
    value: HeaderValue,
}

impl UserAgentMiddleware {
    pub fn new() -> Self {
        Self {
            value: HeaderValue::from_static(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            )),
        }
    }

    pub fn with_app_id(app_id: &str) -> Result<Self> {
        let text = format!(
            "{}/{} app/{}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            app_id.trim()
        );
        let value = HeaderValue::from_str(&text)
            .map_err(|_| Error::configuration(format!("invalid app id `{app_id}`")))?;
        Ok(Self { value })
    }

    pub fn value(&self) -> &HeaderValue {
        &self.value
    }
}

impl Default for UserAgentMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> Middleware<RequestBuilder, O> for UserAgentMiddleware
where
    O: Send + 'static,
{
    fn id(&self) -> &str {
        USER_AGENT_MIDDLEWARE_ID
    }

    fn handle<'a>(
        &'a self,
        context: &'a mut Context,
        mut request: RequestBuilder,
        next: Next<'a, RequestBuilder, O>,
    ) -> BoxFuture<'a, Result<O>> {
        Box::pin(async move {
            let combined = match request.headers().get(USER_AGENT) {
                Some(existing) => {
                    let mut bytes = existing.as_bytes().to_vec();
                    bytes.push(b' ');
                    bytes.extend_from_slice(self.value.as_bytes());
                    HeaderValue::from_bytes(&bytes).map_err(|_| {
                        Error::configuration("user-agent header is not a valid header value")
                    })?
                }
                None => self.value.clone(),
            };
            request.header(USER_AGENT, combined);
            next.run(context, request).await
        })
    }
}

/// Stamps each attempt with the invocation id and `attempt=N; max=M`.
///
/// The invocation id is generated on the first attempt and kept in the
/// [`Context`], so every retry of one invocation reports the same id.
#[derive(Debug, Default)]
pub struct RetryInfoMiddleware;

impl<O> Middleware<Request, O> for RetryInfoMiddleware
where
    O: Send + 'static,
{
    fn id(&self) -> &str {
        RETRY_INFO_MIDDLEWARE_ID
    }

    fn handle<'a>(
        &'a self,
        context: &'a mut Context,
        mut request: Request,
        next: Next<'a, Request, O>,
    ) -> BoxFuture<'a, Result<O>> {
        Box::pin(async move {
            let invocation_id = match context.get(&keys::INVOCATION_ID) {
                Some(existing) => existing.clone(),
                None => {
                    let generated = generate_invocation_id();
                    context.set(&keys::INVOCATION_ID, generated.clone());
                    generated
                }
            };
            let attempt = context.attempt().unwrap_or(1);
            let info = match context.get(&keys::MAX_ATTEMPTS) {
                Some(max) => format!("attempt={attempt}; max={max}"),
                None => format!("attempt={attempt}"),
            };

            let headers = request.headers_mut();
            headers.insert(
                HeaderName::from_static(INVOCATION_ID_HEADER),
                HeaderValue::from_str(&invocation_id).map_err(|_| {
                    Error::configuration("invocation id is not a valid header value")
                })?,
            );
            headers.insert(
                HeaderName::from_static(REQUEST_INFO_HEADER),
                HeaderValue::from_str(&info)
                    .map_err(|_| Error::configuration("attempt info is not a valid header value"))?,
            );
            next.run(context, request).await
        })
    }
}

/// Random version-4 UUID in its hyphenated text form.
pub fn generate_invocation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
