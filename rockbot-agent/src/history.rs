//! Conversation-history request handling.

use std::sync::Arc;

use async_trait::async_trait;
use rockbot_bus::{Envelope, MessageBus};
use rockbot_host::{HandlerContext, HandlerError, TypedHandler};
use rockbot_proto::{ConversationHistoryRequest, ConversationHistoryResponse, HistoryTurn};

use crate::memory::ConversationMemory;

/// Answers `conversationHistoryRequest` with the session's recorded
/// turns, newest last, bounded by the request's `maxTurns`.
pub struct ConversationHistoryHandler {
    bus: Arc<dyn MessageBus>,
    conversation: Arc<dyn ConversationMemory>,
    agent_name: String,
    default_reply_topic: String,
}

impl ConversationHistoryHandler {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        conversation: Arc<dyn ConversationMemory>,
        agent_name: impl Into<String>,
        default_reply_topic: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            conversation,
            agent_name: agent_name.into(),
            default_reply_topic: default_reply_topic.into(),
        }
    }
}

#[async_trait]
impl TypedHandler for ConversationHistoryHandler {
    type Message = ConversationHistoryRequest;

    async fn handle(
        &self,
        message: ConversationHistoryRequest,
        ctx: &HandlerContext,
    ) -> Result<(), HandlerError> {
        let turns = self
            .conversation
            .turns(&message.session_id)
            .await
            .map_err(|e| HandlerError::failed(e.to_string()))?;

        let skip = message
            .max_turns
            .map(|max| turns.len().saturating_sub(max))
            .unwrap_or(0);
        let response = ConversationHistoryResponse {
            session_id: message.session_id.clone(),
            turns: turns[skip..]
                .iter()
                .map(|t| HistoryTurn {
                    role: t.role.as_str().to_string(),
                    content: t.content.clone(),
                    timestamp: t.timestamp,
                })
                .collect(),
        };

        let envelope = Envelope::from_payload(&response, &self.agent_name)
            .map_err(|e| HandlerError::failed(e.to_string()))?
            .correlated_to(&ctx.envelope);
        let topic = ctx
            .envelope
            .reply_to()
            .unwrap_or(&self.default_reply_topic)
            .to_string();
        self.bus
            .publish(&topic, envelope)
            .await
            .map_err(|e| HandlerError::failed(e.to_string()))
    }
}
