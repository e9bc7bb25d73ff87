//! The operation stack: five fixed phases of ordered middleware.
//!
//! ```text
//! Initialize(I) -> Serialize(SerializeInput<I>) -> Build(RequestBuilder)
//!     -> Finalize(Request) -> Deserialize(Request) -> transport
//! ```
//!
//! Every phase is a [`Step`] whose payload type is fixed at the phase
//! boundary. The terminal handler of one phase starts the next one, so the
//! whole stack behaves as one composed handler.

use std::fmt;

use futures_util::future::BoxFuture;

use crate::Result;
use crate::context::Context;
use crate::error::Error;
use crate::handler::{Handler, Middleware, SharedMiddleware, run_chain};
use crate::request::{Request, RequestBuilder, Response};
use crate::transport::Transport;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Initialize,
    Serialize,
    Build,
    Finalize,
    Deserialize,
}

impl Phase {
    /// Execution order; it cannot be changed by configuration.
    pub const ALL: [Phase; 5] = [
        Phase::Initialize,
        Phase::Serialize,
        Phase::Build,
        Phase::Finalize,
        Phase::Deserialize,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Serialize => "serialize",
            Self::Build => "build",
            Self::Finalize => "finalize",
            Self::Deserialize => "deserialize",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Where a middleware is inserted within its phase.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Position {
    #[default]
    Append,
    Before(String),
    After(String),
    At(usize),
}

impl Position {
    pub fn before(id: impl Into<String>) -> Self {
        Self::Before(id.into())
    }

    pub fn after(id: impl Into<String>) -> Self {
        Self::After(id.into())
    }
}

/// Ordered middleware of one phase; list order is execution order.
pub struct Step<S, R> {
    phase: Phase,
    middleware: Vec<SharedMiddleware<S, R>>,
}

impl<S, R> Step<S, R>
where
    S: Send + 'static,
    R: Send + 'static,
{
    fn new(phase: Phase) -> Self {
        Self {
            phase,
            middleware: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn intercept<M>(&mut self, position: Position, middleware: M) -> Result<&mut Self>
    where
        M: Middleware<S, R> + 'static,
    {
        self.intercept_shared(position, std::sync::Arc::new(middleware))
    }

    /// Inserts `middleware` at `position`.
    ///
    /// Fails with a configuration error when the id is already present or when
    /// the position references an id (or index) this phase does not have.
    pub fn intercept_shared(
        &mut self,
        position: Position,
        middleware: SharedMiddleware<S, R>,
    ) -> Result<&mut Self> {
        if self.contains(middleware.id()) {
            return Err(Error::configuration(format!(
                "middleware `{}` is already registered in the {} phase",
                middleware.id(),
                self.phase
            )));
        }

        let index = match &position {
            Position::Append => self.middleware.len(),
            Position::Before(id) => self.index_of(id)?,
            Position::After(id) => self.index_of(id)? + 1,
            Position::At(index) => {
                if *index > self.middleware.len() {
                    return Err(Error::configuration(format!(
                        "position {index} is out of range for the {} phase with {} middleware",
                        self.phase,
                        self.middleware.len()
                    )));
                }
                *index
            }
        };
        self.middleware.insert(index, middleware);
        Ok(self)
    }

    pub fn append<M>(&mut self, middleware: M) -> Result<&mut Self>
    where
        M: Middleware<S, R> + 'static,
    {
        self.intercept(Position::Append, middleware)
    }

    pub fn remove(&mut self, id: &str) -> Option<SharedMiddleware<S, R>> {
        let index = self.middleware.iter().position(|item| item.id() == id)?;
        Some(self.middleware.remove(index))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.middleware.iter().any(|item| item.id() == id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.middleware
            .iter()
            .map(|item| item.id().to_owned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    pub(crate) fn middleware(&self) -> &[SharedMiddleware<S, R>] {
        &self.middleware
    }

    fn index_of(&self, id: &str) -> Result<usize> {
        self.middleware
            .iter()
            .position(|item| item.id() == id)
            .ok_or_else(|| {
                Error::configuration(format!(
                    "unknown middleware id `{id}` in the {} phase",
                    self.phase
                ))
            })
    }
}

impl<S, R> Clone for Step<S, R> {
    fn clone(&self) -> Self {
        Self {
            phase: self.phase,
            middleware: self.middleware.clone(),
        }
    }
}

/// Payload of the serialize phase: the typed input next to the request being built.
#[derive(Clone, Debug)]
pub struct SerializeInput<I> {
    pub input: I,
    pub request: RequestBuilder,
}

/// Payload returned through the deserialize phase.
///
/// The transport fills `response`; a decoder middleware fills `output` on
/// the way back out.
#[derive(Debug)]
pub struct OperationResponse<O> {
    pub response: Response,
    pub output: Option<O>,
}

pub struct OperationStack<I, O> {
    id: String,
    initialize: Step<I, O>,
    serialize: Step<SerializeInput<I>, O>,
    build: Step<RequestBuilder, O>,
    finalize: Step<Request, O>,
    deserialize: Step<Request, OperationResponse<O>>,
}

impl<I, O> OperationStack<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            initialize: Step::new(Phase::Initialize),
            serialize: Step::new(Phase::Serialize),
            build: Step::new(Phase::Build),
            finalize: Step::new(Phase::Finalize),
            deserialize: Step::new(Phase::Deserialize),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn initialize(&self) -> &Step<I, O> {
        &self.initialize
    }

    pub fn initialize_mut(&mut self) -> &mut Step<I, O> {
        &mut self.initialize
    }

    pub fn serialize(&self) -> &Step<SerializeInput<I>, O> {
        &self.serialize
    }

    pub fn serialize_mut(&mut self) -> &mut Step<SerializeInput<I>, O> {
        &mut self.serialize
    }

    pub fn build(&self) -> &Step<RequestBuilder, O> {
        &self.build
    }

    pub fn build_mut(&mut self) -> &mut Step<RequestBuilder, O> {
        &mut self.build
    }

    pub fn finalize(&self) -> &Step<Request, O> {
        &self.finalize
    }

    pub fn finalize_mut(&mut self) -> &mut Step<Request, O> {
        &mut self.finalize
    }

    pub fn deserialize(&self) -> &Step<Request, OperationResponse<O>> {
        &self.deserialize
    }

    pub fn deserialize_mut(&mut self) -> &mut Step<Request, OperationResponse<O>> {
        &mut self.deserialize
    }

    /// Middleware ids per phase, in execution order.
    pub fn describe(&self) -> Vec<(Phase, Vec<String>)> {
        vec![
            (Phase::Initialize, self.initialize.ids()),
            (Phase::Serialize, self.serialize.ids()),
            (Phase::Build, self.build.ids()),
            (Phase::Finalize, self.finalize.ids()),
            (Phase::Deserialize, self.deserialize.ids()),
        ]
    }

    /// Runs one attempt: every phase in order, then `transport`.
    ///
    /// The request representation is rebuilt from `input`; only `context`
    /// carries state from one attempt to the next.
    pub async fn handle(
        &self,
        context: &mut Context,
        input: I,
        transport: &dyn Transport,
    ) -> Result<O> {
        let serialize = SerializeBridge {
            stack: self,
            transport,
        };
        run_chain(self.initialize.middleware(), &serialize, context, input).await
    }
}

impl<I, O> Clone for OperationStack<I, O> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            initialize: self.initialize.clone(),
            serialize: self.serialize.clone(),
            build: self.build.clone(),
            finalize: self.finalize.clone(),
            deserialize: self.deserialize.clone(),
        }
    }
}

impl<I, O> fmt::Debug for OperationStack<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("OperationStack")
            .field("id", &self.id)
            .field("phases", &self.describe())
            .finish()
    }
}

struct SerializeBridge<'s, I, O> {
    stack: &'s OperationStack<I, O>,
    transport: &'s dyn Transport,
}

impl<I, O> Handler<I, O> for SerializeBridge<'_, I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn handle<'a>(&'a self, context: &'a mut Context, input: I) -> BoxFuture<'a, Result<O>> {
        Box::pin(async move {
            let build = BuildBridge {
                stack: self.stack,
                transport: self.transport,
            };
            let subject = SerializeInput {
                input,
                request: RequestBuilder::new(),
            };
            run_chain(self.stack.serialize.middleware(), &build, context, subject).await
        })
    }
}

struct BuildBridge<'s, I, O> {
    stack: &'s OperationStack<I, O>,
    transport: &'s dyn Transport,
}

impl<I, O> Handler<SerializeInput<I>, O> for BuildBridge<'_, I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn handle<'a>(
        &'a self,
        context: &'a mut Context,
        subject: SerializeInput<I>,
    ) -> BoxFuture<'a, Result<O>> {
        Box::pin(async move {
            let finalize = FinalizeBridge {
                stack: self.stack,
                transport: self.transport,
            };
            run_chain(
                self.stack.build.middleware(),
                &finalize,
                context,
                subject.request,
            )
            .await
        })
    }
}

struct FinalizeBridge<'s, I, O> {
    stack: &'s OperationStack<I, O>,
    transport: &'s dyn Transport,
}

impl<I, O> Handler<RequestBuilder, O> for FinalizeBridge<'_, I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn handle<'a>(
        &'a self,
        context: &'a mut Context,
        builder: RequestBuilder,
    ) -> BoxFuture<'a, Result<O>> {
        Box::pin(async move {
            let request = builder.build()?;
            let deserialize = DeserializeBridge {
                stack: self.stack,
                transport: self.transport,
            };
            run_chain(
                self.stack.finalize.middleware(),
                &deserialize,
                context,
                request,
            )
            .await
        })
    }
}

struct DeserializeBridge<'s, I, O> {
    stack: &'s OperationStack<I, O>,
    transport: &'s dyn Transport,
}

impl<I, O> Handler<Request, O> for DeserializeBridge<'_, I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn handle<'a>(
        &'a self,
        context: &'a mut Context,
        request: Request,
    ) -> BoxFuture<'a, Result<O>> {
        Box::pin(async move {
            let terminal = TransportHandler {
                transport: self.transport,
            };
            let response = run_chain(
                self.stack.deserialize.middleware(),
                &terminal,
                context,
                request,
            )
            .await?;
            response.output.ok_or_else(|| {
                Error::configuration(format!(
                    "no deserialize middleware produced an output for operation `{}`",
                    self.stack.id
                ))
            })
        })
    }
}

struct TransportHandler<'s> {
    transport: &'s dyn Transport,
}

impl<O> Handler<Request, OperationResponse<O>> for TransportHandler<'_>
where
    O: Send + 'static,
{
    fn handle<'a>(
        &'a self,
        _context: &'a mut Context,
        request: Request,
    ) -> BoxFuture<'a, Result<OperationResponse<O>>> {
        Box::pin(async move {
            let response = self.transport.send(request).await?;
            Ok(OperationResponse {
                response,
                output: None,
            })
        })
    }
}
