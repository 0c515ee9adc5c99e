//! User feedback handling.
//!
//! Positive feedback is recorded in the logs. Negative feedback triggers
//! a re-evaluation of the session's last user message at scheduled
//! priority, yielding to user work and exiting silently if a new user
//! message arrives mid-run.

use std::sync::Arc;

use async_trait::async_trait;
use rockbot_host::{HandlerContext, HandlerError, TypedHandler};
use rockbot_proto::UserFeedback;

use crate::orchestrator::TurnOrchestrator;

pub struct FeedbackHandler(pub Arc<TurnOrchestrator>);

#[async_trait]
impl TypedHandler for FeedbackHandler {
    type Message = UserFeedback;

    async fn handle(
        &self,
        message: UserFeedback,
        ctx: &HandlerContext,
    ) -> Result<(), HandlerError> {
        if message.is_positive {
            tracing::info!(
                session = %message.session_id,
                message_id = %message.message_id,
                "positive feedback received"
            );
            return Ok(());
        }

        tracing::info!(
            session = %message.session_id,
            message_id = %message.message_id,
            "negative feedback received, scheduling re-evaluation"
        );
        let orchestrator = self.0.clone();
        let reply_to = ctx.envelope.reply_to().map(str::to_string);
        let correlation = ctx
            .envelope
            .correlation_id()
            .unwrap_or_else(|| ctx.envelope.message_id())
            .to_string();
        let token = ctx.token.clone();
        tokio::spawn(async move {
            orchestrator
                .re_evaluate(message.session_id, reply_to, correlation, token)
                .await;
        });
        Ok(())
    }
}
