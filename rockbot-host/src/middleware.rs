//! The standard middleware chain.

use std::time::Instant;

use async_trait::async_trait;
use rockbot_bus::MessageResult;
use tracing::Instrument;

use crate::error::HandlerError;
use crate::pipeline::{HandlerContext, Next};

/// One link in the dispatch chain. Middleware may mutate the context and
/// must call `next.run` exactly once (or record a result and skip it).
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: &mut HandlerContext, next: Next<'_>)
        -> Result<(), HandlerError>;
}

/// Opens a span per dispatch, carrying the envelope's trace context when
/// present, and records the final disposition.
pub struct TracingMiddleware;

#[async_trait]
impl Middleware for TracingMiddleware {
    async fn handle(
        &self,
        ctx: &mut HandlerContext,
        next: Next<'_>,
    ) -> Result<(), HandlerError> {
        let trace_id = ctx
            .envelope
            .trace_context()
            .map(|t| t.trace_id().to_string())
            .unwrap_or_default();
        let span = tracing::info_span!(
            "dispatch",
            message_type = %ctx.envelope.message_type(),
            message_id = %ctx.envelope.message_id(),
            agent = %ctx.agent,
            correlation_id = ctx.envelope.correlation_id().unwrap_or(""),
            trace_id = %trace_id,
            result = tracing::field::Empty,
        );

        let outcome = next.run(ctx).instrument(span.clone()).await;

        let result = match (&ctx.result, &outcome) {
            (Some(result), _) => format!("{:?}", result),
            (None, Ok(())) => format!("{:?}", MessageResult::Ack),
            (None, Err(_)) => format!("{:?}", MessageResult::Retry),
        };
        span.record("result", result.as_str());
        outcome
    }
}

/// Emits dispatch begin/end with elapsed time.
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(
        &self,
        ctx: &mut HandlerContext,
        next: Next<'_>,
    ) -> Result<(), HandlerError> {
        let message_type = ctx.envelope.message_type().to_string();
        let message_id = ctx.envelope.message_id().to_string();
        tracing::debug!(%message_type, %message_id, "dispatch begin");
        let started = Instant::now();

        let outcome = next.run(ctx).await;

        tracing::debug!(
            %message_type,
            %message_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            result = ?ctx.result,
            "dispatch end"
        );
        outcome
    }
}

/// Converts handler failures into broker dispositions.
///
/// Validation failures dead-letter; cancellation of the context token and
/// every other failure retry. After this middleware the chain always
/// reports success with a recorded result, so outer middleware observe the
/// disposition rather than the error.
pub struct ErrorHandlingMiddleware;

#[async_trait]
impl Middleware for ErrorHandlingMiddleware {
    async fn handle(
        &self,
        ctx: &mut HandlerContext,
        next: Next<'_>,
    ) -> Result<(), HandlerError> {
        match next.run(ctx).await {
            Ok(()) => {
                ctx.result.get_or_insert(MessageResult::Ack);
                Ok(())
            }
            Err(HandlerError::Validation(message)) => {
                tracing::warn!(
                    message_type = %ctx.envelope.message_type(),
                    message_id = %ctx.envelope.message_id(),
                    %message,
                    "payload validation failed, dead-lettering"
                );
                ctx.result = Some(MessageResult::DeadLetter);
                Ok(())
            }
            Err(HandlerError::Cancelled) => {
                ctx.result = Some(MessageResult::Retry);
                Ok(())
            }
            Err(HandlerError::Failed(message)) => {
                if ctx.token.is_cancelled() {
                    // Cancellation surfacing as a failure is still a
                    // retry, not an error worth logging loudly.
                    tracing::debug!(
                        message_type = %ctx.envelope.message_type(),
                        "handler cancelled mid-delivery, requeueing"
                    );
                } else {
                    tracing::error!(
                        message_type = %ctx.envelope.message_type(),
                        message_id = %ctx.envelope.message_id(),
                        error = %message,
                        "handler failed, requeueing"
                    );
                }
                ctx.result = Some(MessageResult::Retry);
                Ok(())
            }
        }
    }
}
