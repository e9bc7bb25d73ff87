//! Handler chain composition.
//!
//! A [`Middleware`] receives the subject of its phase together with a [`Next`]
//! handle for the rest of the chain. Calling [`Next::run`] delegates; returning
//! without calling it short-circuits everything after it.

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::Result;
use crate::context::Context;

/// Terminal callable at the end of a chain.
pub trait Handler<S, R>: Send + Sync {
    fn handle<'a>(&'a self, context: &'a mut Context, subject: S) -> BoxFuture<'a, Result<R>>;
}

pub trait Middleware<S, R>: Send + Sync {
    /// Stable identifier used for positional insertion.
    fn id(&self) -> &str;

    fn handle<'a>(
        &'a self,
        context: &'a mut Context,
        subject: S,
        next: Next<'a, S, R>,
    ) -> BoxFuture<'a, Result<R>>;
}

pub type SharedMiddleware<S, R> = Arc<dyn Middleware<S, R>>;

/// The remainder of a chain: the middleware still to run and the terminal handler.
pub struct Next<'a, S, R> {
    middleware: &'a [SharedMiddleware<S, R>],
    terminal: &'a dyn Handler<S, R>,
}

impl<'a, S, R> Next<'a, S, R>
where
    S: Send + 'static,
    R: Send + 'static,
{
    pub fn new(middleware: &'a [SharedMiddleware<S, R>], terminal: &'a dyn Handler<S, R>) -> Self {
        Self {
            middleware,
            terminal,
        }
    }

    /// Number of middleware between this point and the terminal handler.
    pub fn remaining(&self) -> usize {
        self.middleware.len()
    }

    pub fn run<'c>(self, context: &'c mut Context, subject: S) -> BoxFuture<'c, Result<R>>
    where
        'a: 'c,
    {
        match self.middleware.split_first() {
            Some((current, rest)) => current.handle(
                context,
                subject,
                Next {
                    middleware: rest,
                    terminal: self.terminal,
                },
            ),
            None => self.terminal.handle(context, subject),
        }
    }
}

/// Middleware built from a closure.
pub struct MiddlewareFn<F> {
    id: String,
    f: F,
}

impl<S, R, F> Middleware<S, R> for MiddlewareFn<F>
where
    S: Send + 'static,
    R: Send + 'static,
    F: for<'a> Fn(&'a mut Context, S, Next<'a, S, R>) -> BoxFuture<'a, Result<R>> + Send + Sync,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn handle<'a>(
        &'a self,
        context: &'a mut Context,
        subject: S,
        next: Next<'a, S, R>,
    ) -> BoxFuture<'a, Result<R>> {
        (self.f)(context, subject, next)
    }
}

/// Wraps a closure as middleware.
///
/// ```
/// use sdk_runtime::handler::middleware_fn;
/// use sdk_runtime::request::RequestBuilder;
///
/// let tag = middleware_fn::<RequestBuilder, (), _>("AddTag", |context, mut builder, next| {
///     Box::pin(async move {
///         builder.set_header("x-tag", "demo")?;
///         next.run(context, builder).await
///     })
/// });
/// # let _ = tag;
/// ```
pub fn middleware_fn<S, R, F>(id: impl Into<String>, f: F) -> MiddlewareFn<F>
where
    S: Send + 'static,
    R: Send + 'static,
    F: for<'a> Fn(&'a mut Context, S, Next<'a, S, R>) -> BoxFuture<'a, Result<R>> + Send + Sync,
{
    MiddlewareFn { id: id.into(), f }
}

/// Terminal handler built from a closure.
pub struct HandlerFn<F> {
    f: F,
}

impl<S, R, F> Handler<S, R> for HandlerFn<F>
where
    S: Send + 'static,
    R: Send + 'static,
    F: for<'a> Fn(&'a mut Context, S) -> BoxFuture<'a, Result<R>> + Send + Sync,
{
    fn handle<'a>(&'a self, context: &'a mut Context, subject: S) -> BoxFuture<'a, Result<R>> {
        (self.f)(context, subject)
    }
}

pub fn handler_fn<S, R, F>(f: F) -> HandlerFn<F>
where
    S: Send + 'static,
    R: Send + 'static,
    F: for<'a> Fn(&'a mut Context, S) -> BoxFuture<'a, Result<R>> + Send + Sync,
{
    HandlerFn { f }
}

/// Runs `subject` through `middleware` (first element outermost) and then `terminal`.
pub async fn run_chain<S, R>(
    middleware: &[SharedMiddleware<S, R>],
    terminal: &dyn Handler<S, R>,
    context: &mut Context,
    subject: S,
) -> Result<R>
where
    S: Send + 'static,
    R: Send + 'static,
{
    Next::new(middleware, terminal).run(context, subject).await
}
