//! The publish/subscribe contract.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::envelope::Envelope;
use crate::error::BusError;
use crate::subscription::Subscription;

/// A typed bus payload with a fixed logical message-type name.
///
/// Implemented by every wire payload in `rockbot-proto`; the dispatch
/// pipeline uses the name to route envelopes to typed handlers.
pub trait BusMessage: Serialize + DeserializeOwned + Send + Sync {
    /// Logical message-type name carried in the envelope.
    const MESSAGE_TYPE: &'static str;
}

/// Disposition of a handled delivery.
///
/// Every handler returns exactly one of these; the bus adapter converts it
/// into the broker operation (ack, nack-requeue, or nack-to-DLQ).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageResult {
    /// Handled successfully; remove from the queue.
    Ack,
    /// Transient failure; requeue for redelivery.
    Retry,
    /// Permanent failure; route to the dead-letter queue.
    DeadLetter,
}

/// A consumer of deliveries on a subscription.
///
/// The token trips when the subscription is disposed or the host shuts
/// down; handlers must stop promptly when it does.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope, token: CancellationToken) -> MessageResult;
}

/// Adapt an async closure into a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Envelope, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MessageResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Envelope, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MessageResult> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope, token: CancellationToken) -> MessageResult {
        (self.0)(envelope, token).await
    }
}

/// The topic-based message bus.
///
/// Implementations: [`crate::InMemoryBus`] for single-process and test use,
/// `AmqpBus` (feature `amqp`) for distributed deployments.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish an envelope to a topic. Fail-fast: errors bubble to the
    /// caller, nothing is buffered.
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), BusError>;

    /// Open a durable, self-healing subscription.
    ///
    /// Idempotently declares the queue `<prefix>.<subscription_name>` with a
    /// dead-letter queue `<queue>.dlq`, binds it to `topic` (wildcards `*`
    /// and `#` supported), and starts a consumer that invokes `handler` for
    /// each delivery. Dropping the returned [`Subscription`] cancels the
    /// consumer without triggering reconnection.
    async fn subscribe(
        &self,
        topic: &str,
        subscription_name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError>;
}
