//! An in-process topic exchange.
//!
//! Implements the full bus contract without a broker: durable named queues,
//! wildcard bindings, per-queue dead-letter queues, prefetch limits, and a
//! channel abstraction that can be force-closed to exercise the
//! self-healing reconnect path. Used by tests and by single-process agent
//! deployments; distributed deployments use the AMQP adapter.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::bus::{MessageBus, MessageHandler, MessageResult};
use crate::envelope::Envelope;
use crate::error::BusError;
use crate::subscription::{ReconnectPolicy, Subscription};
use crate::topic::TopicPattern;
use crate::trace::TraceContext;

const DEFAULT_PREFETCH: usize = 10;

/// In-memory topic-exchange bus.
pub struct InMemoryBus {
    queue_prefix: String,
    prefetch: usize,
    reconnect: ReconnectPolicy,
    state: Arc<Mutex<ExchangeState>>,
}

#[derive(Default)]
struct ExchangeState {
    queues: HashMap<String, Arc<Queue>>,
    bindings: Vec<Binding>,
    channels: HashMap<String, Arc<Channel>>,
}

struct Binding {
    pattern: TopicPattern,
    queue: String,
}

/// A durable queue. Queues outlive subscriptions; reconnecting consumers
/// resume from the same queue without losing buffered messages.
struct Queue {
    messages: Mutex<VecDeque<Envelope>>,
    notify: Notify,
}

impl Queue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        })
    }

    fn push_back(&self, envelope: Envelope) {
        self.messages.lock().push_back(envelope);
        self.notify.notify_one();
    }

    fn push_front(&self, envelope: Envelope) {
        self.messages.lock().push_front(envelope);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Envelope {
        loop {
            let notified = self.notify.notified();
            if let Some(envelope) = self.messages.lock().pop_front() {
                return envelope;
            }
            notified.await;
        }
    }

    fn len(&self) -> usize {
        self.messages.lock().len()
    }

    fn drain(&self) -> Vec<Envelope> {
        self.messages.lock().drain(..).collect()
    }
}

/// The in-memory stand-in for an AMQP channel: a kill switch the broker
/// side can trip.
struct Channel {
    closed: CancellationToken,
}

enum ChannelOutcome {
    Disposed,
    Closed,
}

impl InMemoryBus {
    pub fn new(queue_prefix: impl Into<String>) -> Self {
        Self {
            queue_prefix: queue_prefix.into(),
            prefetch: DEFAULT_PREFETCH,
            reconnect: ReconnectPolicy::default(),
            state: Arc::new(Mutex::new(ExchangeState::default())),
        }
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Force-close the active channel of a subscription, simulating a
    /// broker-initiated shutdown. The subscription reconnects on its own.
    pub fn force_close_channel(&self, subscription_name: &str) -> bool {
        let state = self.state.lock();
        match state.channels.get(subscription_name) {
            Some(channel) => {
                channel.closed.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of messages currently buffered in a queue. Test hook.
    pub fn queue_depth(&self, queue_name: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue_name)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Drain the dead-letter queue of a subscription. Test hook.
    pub fn drain_dead_letters(&self, subscription_name: &str) -> Vec<Envelope> {
        let dlq_name = format!("{}.{}.dlq", self.queue_prefix, subscription_name);
        self.state
            .lock()
            .queues
            .get(&dlq_name)
            .map(|q| q.drain())
            .unwrap_or_default()
    }

    fn declare_queue(state: &mut ExchangeState, name: &str) -> Arc<Queue> {
        state
            .queues
            .entry(name.to_string())
            .or_insert_with(Queue::new)
            .clone()
    }

    fn bind(state: &mut ExchangeState, pattern: &str, queue: &str) {
        let pattern = TopicPattern::new(pattern);
        let already_bound = state
            .bindings
            .iter()
            .any(|b| b.pattern == pattern && b.queue == queue);
        if !already_bound {
            state.bindings.push(Binding {
                pattern,
                queue: queue.to_string(),
            });
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), BusError> {
        let envelope = if envelope.trace_context().is_some() {
            envelope
        } else {
            envelope.with_trace_context(&TraceContext::new_root())
        };

        let targets: Vec<Arc<Queue>> = {
            let state = self.state.lock();
            state
                .bindings
                .iter()
                .filter(|b| b.pattern.matches(topic))
                .filter_map(|b| state.queues.get(&b.queue).cloned())
                .collect()
        };

        // Topic-exchange semantics: no matching binding means the message
        // is dropped, not an error.
        for queue in targets {
            queue.push_back(envelope.clone());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        subscription_name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError> {
        let queue_name = format!("{}.{}", self.queue_prefix, subscription_name);
        let dlq_name = format!("{}.dlq", queue_name);

        let (queue, dlq) = {
            let mut state = self.state.lock();
            let queue = Self::declare_queue(&mut state, &queue_name);
            let dlq = Self::declare_queue(&mut state, &dlq_name);
            Self::bind(&mut state, topic, &queue_name);
            (queue, dlq)
        };

        let disposal = CancellationToken::new();
        let consumer = tokio::spawn(consume_loop(
            self.state.clone(),
            subscription_name.to_string(),
            queue,
            dlq,
            handler,
            self.prefetch,
            self.reconnect,
            disposal.clone(),
        ));

        Ok(Subscription::new(
            topic,
            subscription_name,
            disposal,
            consumer,
        ))
    }
}

/// The self-healing consumer loop: open a channel, consume until it dies,
/// back off, reopen. Disposal is the only exit.
#[allow(clippy::too_many_arguments)]
async fn consume_loop(
    state: Arc<Mutex<ExchangeState>>,
    subscription_name: String,
    queue: Arc<Queue>,
    dlq: Arc<Queue>,
    handler: Arc<dyn MessageHandler>,
    prefetch: usize,
    reconnect: ReconnectPolicy,
    disposal: CancellationToken,
) {
    let mut attempt: u32 = 0;
    loop {
        let channel = Arc::new(Channel {
            closed: CancellationToken::new(),
        });
        state
            .lock()
            .channels
            .insert(subscription_name.clone(), channel.clone());
        attempt = 0;

        let outcome = consume_on_channel(
            &queue,
            &dlq,
            handler.clone(),
            prefetch,
            &channel,
            &disposal,
        )
        .await;

        match outcome {
            ChannelOutcome::Disposed => {
                state.lock().channels.remove(&subscription_name);
                return;
            }
            ChannelOutcome::Closed => {
                attempt += 1;
                let delay = reconnect.delay_for_attempt(attempt);
                tracing::warn!(
                    subscription = %subscription_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "channel closed unexpectedly, reconnecting"
                );
                tokio::select! {
                    _ = disposal.cancelled() => {
                        state.lock().channels.remove(&subscription_name);
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn consume_on_channel(
    queue: &Arc<Queue>,
    dlq: &Arc<Queue>,
    handler: Arc<dyn MessageHandler>,
    prefetch: usize,
    channel: &Arc<Channel>,
    disposal: &CancellationToken,
) -> ChannelOutcome {
    let permits = Arc::new(Semaphore::new(prefetch));

    loop {
        let permit = tokio::select! {
            _ = disposal.cancelled() => return ChannelOutcome::Disposed,
            _ = channel.closed.cancelled() => return ChannelOutcome::Closed,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return ChannelOutcome::Closed,
            },
        };

        let envelope = tokio::select! {
            _ = disposal.cancelled() => return ChannelOutcome::Disposed,
            _ = channel.closed.cancelled() => return ChannelOutcome::Closed,
            envelope = queue.pop() => envelope,
        };

        let handler = handler.clone();
        let queue = queue.clone();
        let dlq = dlq.clone();
        let token = disposal.child_token();
        tokio::spawn(async move {
            let result = handler.handle(envelope.clone(), token).await;
            match result {
                MessageResult::Ack => {}
                MessageResult::Retry => queue.push_front(envelope),
                MessageResult::DeadLetter => dlq.push_back(envelope),
            }
            drop(permit);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::handler_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn fast_bus() -> InMemoryBus {
        InMemoryBus::new("test").with_reconnect_policy(ReconnectPolicy {
            initial_delay: Duration::from_millis(20),
            multiplier: 2,
            max_delay: Duration::from_millis(100),
        })
    }

    async fn recv_timeout(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_publish_delivers_to_matching_subscription() {
        let bus = fast_bus();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _sub = bus
            .subscribe(
                "user.*.userMessage",
                "sub-a",
                handler_fn(move |env, _| {
                    let tx = tx.clone();
                    async move {
                        tx.send(env).unwrap();
                        MessageResult::Ack
                    }
                }),
            )
            .await
            .unwrap();

        bus.publish(
            "user.proxy.userMessage",
            Envelope::new("userMessage", b"{}".to_vec(), "proxy"),
        )
        .await
        .unwrap();

        let delivered = recv_timeout(&mut rx).await;
        assert_eq!(delivered.message_type(), "userMessage");
        // The bus injects a trace context when none is present.
        assert!(delivered.trace_context().is_some());
    }

    #[tokio::test]
    async fn test_non_matching_topic_not_delivered() {
        let bus = fast_bus();
        let counter = Arc::new(AtomicUsize::new(0));
        let counted = counter.clone();

        let _sub = bus
            .subscribe(
                "tool.invoke",
                "sub-b",
                handler_fn(move |_, _| {
                    let counted = counted.clone();
                    async move {
                        counted.fetch_add(1, Ordering::SeqCst);
                        MessageResult::Ack
                    }
                }),
            )
            .await
            .unwrap();

        bus.publish("tool.result.agent", Envelope::new("t", vec![], "s"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dead_letter_routes_to_dlq() {
        let bus = fast_bus();
        let _sub = bus
            .subscribe(
                "poison.topic",
                "sub-c",
                handler_fn(|_, _| async { MessageResult::DeadLetter }),
            )
            .await
            .unwrap();

        bus.publish("poison.topic", Envelope::new("bad", vec![], "s"))
            .await
            .unwrap();

        // Wait for the handler round-trip.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let dead = bus.drain_dead_letters("sub-c");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message_type(), "bad");
    }

    #[tokio::test]
    async fn test_retry_redelivers() {
        let bus = fast_bus();
        let attempts = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let counted = attempts.clone();

        let _sub = bus
            .subscribe(
                "retry.topic",
                "sub-d",
                handler_fn(move |env, _| {
                    let counted = counted.clone();
                    let tx = tx.clone();
                    async move {
                        if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                            MessageResult::Retry
                        } else {
                            tx.send(env).unwrap();
                            MessageResult::Ack
                        }
                    }
                }),
            )
            .await
            .unwrap();

        bus.publish("retry.topic", Envelope::new("flaky", vec![], "s"))
            .await
            .unwrap();

        let delivered = recv_timeout(&mut rx).await;
        assert_eq!(delivered.message_type(), "flaky");
        assert!(attempts.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_force_closed_channel_reconnects_and_resumes() {
        let bus = fast_bus();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _sub = bus
            .subscribe(
                "heal.topic",
                "sub-e",
                handler_fn(move |env, _| {
                    let tx = tx.clone();
                    async move {
                        tx.send(env).unwrap();
                        MessageResult::Ack
                    }
                }),
            )
            .await
            .unwrap();

        bus.publish("heal.topic", Envelope::new("before", vec![], "s"))
            .await
            .unwrap();
        assert_eq!(recv_timeout(&mut rx).await.message_type(), "before");

        assert!(bus.force_close_channel("sub-e"));

        // Published while the channel is down: the durable queue buffers it
        // and the reconnected consumer picks it up.
        bus.publish("heal.topic", Envelope::new("after", vec![], "s"))
            .await
            .unwrap();
        assert_eq!(recv_timeout(&mut rx).await.message_type(), "after");
    }

    #[tokio::test]
    async fn test_dispose_stops_consumption_without_reconnect() {
        let bus = fast_bus();
        let counter = Arc::new(AtomicUsize::new(0));
        let counted = counter.clone();

        let sub = bus
            .subscribe(
                "stop.topic",
                "sub-f",
                handler_fn(move |_, _| {
                    let counted = counted.clone();
                    async move {
                        counted.fetch_add(1, Ordering::SeqCst);
                        MessageResult::Ack
                    }
                }),
            )
            .await
            .unwrap();

        sub.dispose().await;

        bus.publish("stop.topic", Envelope::new("late", vec![], "s"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        // The durable queue retained the message for a future subscriber.
        assert_eq!(bus.queue_depth("test.sub-f"), 1);
    }

    #[tokio::test]
    async fn test_two_subscriptions_both_receive() {
        let bus = fast_bus();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        let _a = bus
            .subscribe(
                "fanout.topic",
                "sub-g1",
                handler_fn(move |env, _| {
                    let tx = tx_a.clone();
                    async move {
                        tx.send(env).unwrap();
                        MessageResult::Ack
                    }
                }),
            )
            .await
            .unwrap();
        let _b = bus
            .subscribe(
                "fanout.#",
                "sub-g2",
                handler_fn(move |env, _| {
                    let tx = tx_b.clone();
                    async move {
                        tx.send(env).unwrap();
                        MessageResult::Ack
                    }
                }),
            )
            .await
            .unwrap();

        bus.publish("fanout.topic", Envelope::new("fan", vec![], "s"))
            .await
            .unwrap();

        assert_eq!(recv_timeout(&mut rx_a).await.message_type(), "fan");
        assert_eq!(recv_timeout(&mut rx_b).await.message_type(), "fan");
    }
}
