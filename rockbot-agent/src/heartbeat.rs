//! Heartbeat publication for agent discovery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rockbot_bus::{Envelope, MessageBus};
use rockbot_host::{HostError, HostedService};
use rockbot_proto::{topics, AgentCard, AgentHeartbeat};
use tokio_util::sync::CancellationToken;

/// Periodically publishes this agent's card on the heartbeat topic so
/// directories across the fleet stay fresh.
pub struct HeartbeatService {
    bus: Arc<dyn MessageBus>,
    card: AgentCard,
    interval: Duration,
}

impl HeartbeatService {
    pub fn new(bus: Arc<dyn MessageBus>, card: AgentCard, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            bus,
            card,
            interval,
        })
    }
}

#[async_trait]
impl HostedService for HeartbeatService {
    fn service_name(&self) -> &str {
        "heartbeat"
    }

    async fn run(self: Arc<Self>, token: CancellationToken) -> Result<(), HostError> {
        loop {
            let heartbeat = AgentHeartbeat {
                agent_name: self.card.name.clone(),
                card: self.card.clone(),
                timestamp: Utc::now(),
            };
            match Envelope::from_payload(&heartbeat, &self.card.name) {
                Ok(envelope) => {
                    if let Err(err) = self.bus.publish(topics::AGENT_HEARTBEAT, envelope).await {
                        tracing::warn!(error = %err, "heartbeat publish failed");
                    }
                }
                Err(err) => tracing::warn!(error = %err, "heartbeat encode failed"),
            }
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

/// Handler keeping a directory fresh from fleet heartbeats.
pub struct HeartbeatDirectoryHandler(pub Arc<crate::a2a::AgentDirectory>);

#[async_trait]
impl rockbot_host::TypedHandler for HeartbeatDirectoryHandler {
    type Message = AgentHeartbeat;

    async fn handle(
        &self,
        message: AgentHeartbeat,
        _ctx: &rockbot_host::HandlerContext,
    ) -> Result<(), rockbot_host::HandlerError> {
        self.0.upsert(message.card);
        Ok(())
    }
}
