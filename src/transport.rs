use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::Result;
use crate::request::{Request, Response};

/// Engine that puts a finished request on the wire.
///
/// Any failure is reported as an [`crate::Error`]; network level failures
/// should use [`crate::Error::Transport`] so the retry classifier can tell
/// "no response" apart from an error response.
pub trait Transport: Send + Sync {
    fn send(&self, request: Request) -> BoxFuture<'_, Result<Response>>;
}

impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    fn send(&self, request: Request) -> BoxFuture<'_, Result<Response>> {
        (**self).send(request)
    }
}

impl<T> Transport for Box<T>
where
    T: Transport + ?Sized,
{
    fn send(&self, request: Request) -> BoxFuture<'_, Result<Response>> {
        (**self).send(request)
    }
}
