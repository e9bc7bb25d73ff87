//! Auth boundary: attribute types read by the signing middleware.
//!
//! Scheme selection and the signing algorithms themselves are supplied by the
//! caller; the runtime only moves the selected scheme from the [`Context`] to
//! the outgoing request during the finalize phase.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use futures_util::future::BoxFuture;

use crate::Result;
use crate::context::{Attributes, Context, keys};
use crate::error::Error;
use crate::handler::{Middleware, Next};
use crate::request::Request;

pub const NO_AUTH_SCHEME_ID: &str = "smithy.api#noAuth";
pub const SIGNING_MIDDLEWARE_ID: &str = "Signer";

/// Resolved credentials of some kind (keys, bearer token, ...).
pub trait Identity: Send + Sync + fmt::Debug {
    fn expiration(&self) -> Option<SystemTime> {
        None
    }

    fn as_any(&self) -> &dyn std::any::Any;
}

pub trait Signer: Send + Sync {
    fn sign<'a>(
        &'a self,
        request: Request,
        identity: &'a dyn Identity,
        signing_properties: &'a Attributes,
    ) -> BoxFuture<'a, Result<Request>>;
}

#[derive(Clone)]
pub struct SelectedAuthScheme {
    scheme_id: String,
    identity: Option<Arc<dyn Identity>>,
    signer: Option<Arc<dyn Signer>>,
    signing_properties: Attributes,
}

impl SelectedAuthScheme {
    pub fn new(
        scheme_id: impl Into<String>,
        identity: Arc<dyn Identity>,
        signer: Arc<dyn Signer>,
    ) -> Self {
        Self {
            scheme_id: scheme_id.into(),
            identity: Some(identity),
            signer: Some(signer),
            signing_properties: Attributes::new(),
        }
    }

    /// Scheme that leaves requests unsigned.
    pub fn anonymous() -> Self {
        Self {
            scheme_id: NO_AUTH_SCHEME_ID.to_owned(),
            identity: None,
            signer: None,
            signing_properties: Attributes::new(),
        }
    }

    pub fn with_signing_properties(mut self, signing_properties: Attributes) -> Self {
        self.signing_properties = signing_properties;
        self
    }

    pub fn scheme_id(&self) -> &str {
        &self.scheme_id
    }

    pub fn identity(&self) -> Option<&Arc<dyn Identity>> {
        self.identity.as_ref()
    }

    pub fn signing_properties(&self) -> &Attributes {
        &self.signing_properties
    }

    pub fn signing_properties_mut(&mut self) -> &mut Attributes {
        &mut self.signing_properties
    }
}

impl fmt::Debug for SelectedAuthScheme {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SelectedAuthScheme")
            .field("scheme_id", &self.scheme_id)
            .field("identity", &self.identity)
            .field("has_signer", &self.signer.is_some())
            .field("signing_properties", &self.signing_properties)
            .finish()
    }
}

/// Finalize middleware that signs the outgoing request with the selected scheme.
#[derive(Debug, Default)]
pub struct SigningMiddleware;

impl<O> Middleware<Request, O> for SigningMiddleware
where
    O: Send + 'static,
{
    fn id(&self) -> &str {
        SIGNING_MIDDLEWARE_ID
    }

    fn handle<'a>(
        &'a self,
        context: &'a mut Context,
        request: Request,
        next: Next<'a, Request, O>,
    ) -> BoxFuture<'a, Result<O>> {
        Box::pin(async move {
            let scheme = context
                .get(&keys::SELECTED_AUTH_SCHEME)
                .cloned()
                .ok_or_else(|| Error::auth("no auth scheme was selected for this operation"))?;

            let request = match (&scheme.identity, &scheme.signer) {
                (Some(identity), Some(signer)) => {
                    if let Some(expiration) = identity.expiration()
                        && expiration <= SystemTime::now()
                    {
                        return Err(Error::auth(format!(
                            "identity for auth scheme {} has expired",
                            scheme.scheme_id
                        )));
                    }
                    signer
                        .sign(request, identity.as_ref(), &scheme.signing_properties)
                        .await
                        .map_err(|error| match error {
                            Error::Auth { .. } => error,
                            other => Error::Auth {
                                message: format!("signing with {} failed", scheme.scheme_id),
                                source: Some(Box::new(other)),
                            },
                        })?
                }
                (None, None) => request,
                _ => {
                    return Err(Error::auth(format!(
                        "auth scheme {} is missing its identity or signer",
                        scheme.scheme_id
                    )));
                }
            };
            next.run(context, request).await
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    use futures_util::future::BoxFuture;
    use http::header::HeaderValue;

    use super::{Identity, SelectedAuthScheme, Signer, SigningMiddleware};
    use crate::Result;
    use crate::context::{AttributeKey, Attributes, Context, keys};
    use crate::error::ErrorCode;
    use crate::handler::{Handler, Middleware, Next, handler_fn};
    use crate::request::Request;

    const SIGNING_NAME: AttributeKey<String> = AttributeKey::new("signing_name");

    #[derive(Debug)]
    struct Token {
        value: String,
        expires_at: Option<SystemTime>,
    }

    impl Identity for Token {
        fn expiration(&self) -> Option<SystemTime> {
            self.expires_at
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct BearerSigner;

    impl Signer for BearerSigner {
        fn sign<'a>(
            &'a self,
            mut request: Request,
            identity: &'a dyn Identity,
            signing_properties: &'a Attributes,
        ) -> BoxFuture<'a, Result<Request>> {
            Box::pin(async move {
                let token = identity
                    .as_any()
                    .downcast_ref::<Token>()
                    .map(|token| token.value.clone())
                    .unwrap_or_default();
                let name = signing_properties
                    .get(&SIGNING_NAME)
                    .cloned()
                    .unwrap_or_default();
                let value = HeaderValue::from_str(&format!("Bearer {name}:{token}"))
                    .map_err(|_| crate::Error::auth("token is not a valid header value"))?;
                request.headers_mut().insert("authorization", value);
                Ok(request)
            })
        }
    }

    fn capture_terminal() -> impl Handler<Request, Option<String>> {
        handler_fn::<Request, Option<String>, _>(|_context, request| {
            Box::pin(async move {
                Ok(request
                    .headers()
                    .get("authorization")
                    .and_then(|value| value.to_str().ok())
                    .map(ToOwned::to_owned))
            })
        })
    }

    async fn sign_with(context: &mut Context) -> Result<Option<String>> {
        let terminal = capture_terminal();
        let middleware: &dyn Middleware<Request, Option<String>> = &SigningMiddleware;
        middleware
            .handle(
                context,
                http::Request::new(bytes::Bytes::new()),
                Next::new(&[], &terminal),
            )
            .await
    }

    #[tokio::test]
    async fn signs_with_the_selected_scheme() {
        let mut properties = Attributes::new();
        properties.set(&SIGNING_NAME, "items".to_owned());
        let scheme = SelectedAuthScheme::new(
            "smithy.api#httpBearerAuth",
            Arc::new(Token {
                value: "t0ken".to_owned(),
                expires_at: None,
            }),
            Arc::new(BearerSigner),
        )
        .with_signing_properties(properties);
        let mut context = Context::new();
        context.set(&keys::SELECTED_AUTH_SCHEME, scheme);

        let header = sign_with(&mut context).await.expect("signing should succeed");
        assert_eq!(header.as_deref(), Some("Bearer items:t0ken"));
    }

    #[tokio::test]
    async fn anonymous_scheme_passes_request_through() {
        let mut context = Context::new();
        context.set(&keys::SELECTED_AUTH_SCHEME, SelectedAuthScheme::anonymous());
        let header = sign_with(&mut context).await.expect("no-auth should pass");
        assert_eq!(header, None);
    }

    #[tokio::test]
    async fn missing_scheme_and_expired_identity_are_auth_errors() {
        let mut context = Context::new();
        let error = sign_with(&mut context)
            .await
            .expect_err("missing scheme should fail");
        assert_eq!(error.code(), ErrorCode::Auth);

        context.set(
            &keys::SELECTED_AUTH_SCHEME,
            SelectedAuthScheme::new(
                "smithy.api#httpBearerAuth",
                Arc::new(Token {
                    value: "old".to_owned(),
                    expires_at: Some(SystemTime::now() - Duration::from_secs(60)),
                }),
                Arc::new(BearerSigner),
            ),
        );
        let error = sign_with(&mut context)
            .await
            .expect_err("expired identity should fail");
        assert_eq!(error.code(), ErrorCode::Auth);
    }
}
