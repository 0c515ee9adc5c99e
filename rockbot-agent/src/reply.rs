//! Reply publication.

use std::sync::Arc;

use rockbot_bus::{BusError, Envelope, MessageBus};
use rockbot_proto::AgentReply;

/// Publishes [`AgentReply`] envelopes to the incoming `ReplyTo` topic, or
/// the configured default when the request carried none. Non-final
/// replies are streamed progress; the final reply terminates the turn.
pub struct ReplyPublisher {
    bus: Arc<dyn MessageBus>,
    agent_name: String,
    default_topic: String,
}

impl ReplyPublisher {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        agent_name: impl Into<String>,
        default_topic: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            agent_name: agent_name.into(),
            default_topic: default_topic.into(),
        }
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub async fn publish(
        &self,
        reply_to: Option<&str>,
        session_id: &str,
        content: impl Into<String>,
        is_final: bool,
        correlation_id: Option<&str>,
    ) -> Result<(), BusError> {
        let reply = AgentReply {
            content: content.into(),
            session_id: session_id.to_string(),
            agent_name: self.agent_name.clone(),
            is_final,
        };
        let mut envelope = Envelope::from_payload(&reply, &self.agent_name)?;
        if let Some(correlation_id) = correlation_id {
            envelope = envelope.with_correlation_id(correlation_id);
        }
        let topic = reply_to.unwrap_or(&self.default_topic);
        self.bus.publish(topic, envelope).await
    }
}
