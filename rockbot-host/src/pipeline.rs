//! Typed dispatch: envelope → handler through the middleware chain.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rockbot_bus::{BusMessage, Envelope, MessageHandler, MessageResult};
use tokio_util::sync::CancellationToken;

use crate::error::HandlerError;
use crate::middleware::{
    ErrorHandlingMiddleware, LoggingMiddleware, Middleware, TracingMiddleware,
};

/// Shared state threaded through the middleware chain for one delivery.
///
/// Middleware may read the envelope and set [`HandlerContext::result`]; the
/// final result drives broker disposition.
pub struct HandlerContext {
    pub envelope: Envelope,
    pub agent: String,
    pub token: CancellationToken,
    pub result: Option<MessageResult>,
}

/// A handler for one message type.
///
/// The payload type's [`BusMessage::MESSAGE_TYPE`] is the routing key:
/// registering the handler associates that name with this handler and the
/// expected payload type.
#[async_trait]
pub trait TypedHandler: Send + Sync + 'static {
    type Message: BusMessage;

    async fn handle(
        &self,
        message: Self::Message,
        ctx: &HandlerContext,
    ) -> Result<(), HandlerError>;
}

/// Object-safe inner handler: decodes the payload and invokes the typed
/// handler. Decode failure is a validation error.
#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    fn message_type(&self) -> &'static str;
    async fn call(&self, ctx: &mut HandlerContext) -> Result<(), HandlerError>;
}

struct TypedAdapter<H>(Arc<H>);

#[async_trait]
impl<H: TypedHandler> ErasedHandler for TypedAdapter<H> {
    fn message_type(&self) -> &'static str {
        H::Message::MESSAGE_TYPE
    }

    async fn call(&self, ctx: &mut HandlerContext) -> Result<(), HandlerError> {
        let message: H::Message = ctx.envelope.payload().ok_or_else(|| {
            HandlerError::Validation(format!(
                "body of '{}' does not decode as {}",
                ctx.envelope.message_type(),
                std::any::type_name::<H::Message>()
            ))
        })?;
        self.0.handle(message, ctx).await
    }
}

/// Continuation of the middleware chain.
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Middleware>],
    handler: &'a dyn ErasedHandler,
}

impl<'a> Next<'a> {
    pub async fn run(self, ctx: &mut HandlerContext) -> Result<(), HandlerError> {
        match self.remaining.split_first() {
            Some((middleware, rest)) => {
                middleware
                    .handle(
                        ctx,
                        Next {
                            remaining: rest,
                            handler: self.handler,
                        },
                    )
                    .await
            }
            None => self.handler.call(ctx).await,
        }
    }
}

/// Routes envelopes to typed handlers via the middleware chain.
pub struct DispatchPipeline {
    agent: String,
    handlers: HashMap<&'static str, Arc<dyn ErasedHandler>>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl DispatchPipeline {
    /// Pipeline with the standard chain: Tracing → Logging → ErrorHandling.
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            handlers: HashMap::new(),
            middleware: vec![
                Arc::new(TracingMiddleware),
                Arc::new(LoggingMiddleware),
                Arc::new(ErrorHandlingMiddleware),
            ],
        }
    }

    /// Replace the middleware chain. Test hook; production agents keep the
    /// standard chain.
    pub fn with_middleware(mut self, middleware: Vec<Arc<dyn Middleware>>) -> Self {
        self.middleware = middleware;
        self
    }

    /// Register a typed handler. The last registration for a message type
    /// wins.
    pub fn register<H: TypedHandler>(&mut self, handler: Arc<H>) {
        self.handlers
            .insert(H::Message::MESSAGE_TYPE, Arc::new(TypedAdapter(handler)));
    }

    pub fn registered_types(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }

    /// Dispatch one envelope. Runs the chain exactly once and returns
    /// exactly one result.
    pub async fn dispatch(&self, envelope: Envelope, token: CancellationToken) -> MessageResult {
        let handler = match self.handlers.get(envelope.message_type()) {
            Some(handler) => handler.clone(),
            None => {
                tracing::warn!(
                    agent = %self.agent,
                    message_type = %envelope.message_type(),
                    message_id = %envelope.message_id(),
                    "no handler registered, dead-lettering"
                );
                return MessageResult::DeadLetter;
            }
        };

        let mut ctx = HandlerContext {
            envelope,
            agent: self.agent.clone(),
            token,
            result: None,
        };

        let outcome = Next {
            remaining: &self.middleware,
            handler: handler.as_ref(),
        }
        .run(&mut ctx)
        .await;

        match (ctx.result, outcome) {
            (Some(result), _) => result,
            // Chain completed without anyone recording a result: treat as
            // handled.
            (None, Ok(())) => MessageResult::Ack,
            // An error escaped the chain (only possible with a custom
            // middleware stack that drops ErrorHandling).
            (None, Err(HandlerError::Validation(_))) => MessageResult::DeadLetter,
            (None, Err(_)) => MessageResult::Retry,
        }
    }
}

/// Adapter that lets the pipeline consume a bus subscription directly.
pub(crate) struct PipelineHandler(pub Arc<DispatchPipeline>);

#[async_trait]
impl MessageHandler for PipelineHandler {
    async fn handle(&self, envelope: Envelope, token: CancellationToken) -> MessageResult {
        self.0.dispatch(envelope, token).await
    }
}
