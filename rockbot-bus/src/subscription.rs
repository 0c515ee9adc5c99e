//! Subscription handles and the self-healing reconnect policy.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Backoff schedule for subscription reconnects.
///
/// Defaults to the contract every adapter honors: first retry after 2 s,
/// doubling on each failure, capped at 30 s. Only disposal stops the loop.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given 1-based reconnect attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .saturating_pow(attempt.saturating_sub(1).min(16));
        let delay = self.initial_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// An active consumer bound to a `(topic, subscription name)` pair.
///
/// The subscription owns its consumer task. Dropping or disposing it
/// cancels the consumer and closes the channel; this is the one shutdown
/// initiator that does not trigger reconnection. The durable queue itself
/// outlives the subscription, so a later subscribe with the same name
/// resumes from the same queue.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    name: String,
    disposal: CancellationToken,
    consumer: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(
        topic: impl Into<String>,
        name: impl Into<String>,
        disposal: CancellationToken,
        consumer: JoinHandle<()>,
    ) -> Self {
        Self {
            topic: topic.into(),
            name: name.into(),
            disposal,
            consumer: Some(consumer),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancel the consumer and wait for it to wind down.
    pub async fn dispose(mut self) {
        self.disposal.cancel();
        if let Some(consumer) = self.consumer.take() {
            let _ = consumer.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.disposal.cancel();
    }
}
