//! Serialization boundary.
//!
//! Wire formats live outside this crate. A generated client supplies a
//! [`RequestEncoder`] and a [`ResponseDecoder`] per operation and registers
//! them through [`SerializeMiddleware`] and [`DeserializeMiddleware`].
//! Because a fresh request builder is created for every attempt, the encoder
//! runs again from the original typed input on each retry.

use futures_util::future::BoxFuture;

use crate::Result;
use crate::context::Context;
use crate::handler::{Middleware, Next};
use crate::request::{Request, RequestBuilder, Response};
use crate::stack::{OperationResponse, SerializeInput};

pub trait RequestEncoder<I>: Send + Sync {
    /// Writes `input` into `request`. Failures should be [`crate::Error::Serialization`].
    fn encode(&self, input: &I, context: &Context, request: &mut RequestBuilder) -> Result<()>;
}

pub trait ResponseDecoder<O>: Send + Sync {
    /// Turns a raw response into the typed output, or into a
    /// [`crate::Error::Service`] for well-formed error responses.
    fn decode(&self, response: &Response, context: &Context) -> Result<O>;
}

impl<I, F> RequestEncoder<I> for F
where
    F: Fn(&I, &Context, &mut RequestBuilder) -> Result<()> + Send + Sync,
{
    fn encode(&self, input: &I, context: &Context, request: &mut RequestBuilder) -> Result<()> {
        self(input, context, request)
    }
}

impl<O, F> ResponseDecoder<O> for F
where
    F: Fn(&Response, &Context) -> Result<O> + Send + Sync,
{
    fn decode(&self, response: &Response, context: &Context) -> Result<O> {
        self(response, context)
    }
}

pub const SERIALIZE_MIDDLEWARE_ID: &str = "OperationInputSerializer";
pub const DESERIALIZE_MIDDLEWARE_ID: &str = "OperationOutputDeserializer";

pub struct SerializeMiddleware<E> {
    id: String,
    encoder: E,
}

impl<E> SerializeMiddleware<E> {
    pub fn new(encoder: E) -> Self {
        Self::with_id(SERIALIZE_MIDDLEWARE_ID, encoder)
    }

    pub fn with_id(id: impl Into<String>, encoder: E) -> Self {
        Self {
            id: id.into(),
            encoder,
        }
    }
}

impl<I, O, E> Middleware<SerializeInput<I>, O> for SerializeMiddleware<E>
where
    I: Send + 'static,
    O: Send + 'static,
    E: RequestEncoder<I>,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn handle<'a>(
        &'a self,
        context: &'a mut Context,
        mut subject: SerializeInput<I>,
        next: Next<'a, SerializeInput<I>, O>,
    ) -> BoxFuture<'a, Result<O>> {
        Box::pin(async move {
            self.encoder
                .encode(&subject.input, context, &mut subject.request)?;
            next.run(context, subject).await
        })
    }
}

pub struct DeserializeMiddleware<D> {
    id: String,
    decoder: D,
}

impl<D> DeserializeMiddleware<D> {
    pub fn new(decoder: D) -> Self {
        Self::with_id(DESERIALIZE_MIDDLEWARE_ID, decoder)
    }

    pub fn with_id(id: impl Into<String>, decoder: D) -> Self {
        Self {
            id: id.into(),
            decoder,
        }
    }
}

impl<O, D> Middleware<Request, OperationResponse<O>> for DeserializeMiddleware<D>
where
    O: Send + 'static,
    D: ResponseDecoder<O>,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn handle<'a>(
        &'a self,
        context: &'a mut Context,
        request: Request,
        next: Next<'a, Request, OperationResponse<O>>,
    ) -> BoxFuture<'a, Result<OperationResponse<O>>> {
        Box::pin(async move {
            let mut response = next.run(&mut *context, request).await?;
            if response.output.is_none() {
                response.output = Some(self.decoder.decode(&response.response, context)?);
            }
            Ok(response)
        })
    }
}
