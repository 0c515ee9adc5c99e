//! # rockbot-bus
//!
//! The messaging substrate for RockBot agents. Every agent process talks to
//! the rest of the system exclusively through a topic-based message bus, and
//! this crate provides the pieces that make that possible:
//!
//! - [`Envelope`] — the immutable message carrier, with a JSON body codec,
//!   well-known headers, and W3C trace-context propagation.
//! - [`MessageBus`] / [`MessageHandler`] — the publish/subscribe contract.
//!   Handlers return a [`MessageResult`] that drives broker disposition
//!   (ack, requeue, or dead-letter).
//! - [`InMemoryBus`] — a full topic exchange in process memory: durable
//!   named queues, `*`/`#` wildcard bindings, per-queue dead-letter queues,
//!   prefetch limits, and force-closable channels so the self-healing
//!   reconnect path can be exercised in tests.
//! - `AmqpBus` (feature `amqp`) — the same contract over a real AMQP topic
//!   exchange via `lapin`, with one connection per process, one channel per
//!   consumer, and a mutex-guarded publisher channel.
//!
//! Subscriptions are self-healing: when a consumer channel dies for any
//! reason other than disposal, the subscription reconnects with exponential
//! backoff (2 s start, doubling, capped at 30 s) and resumes consuming from
//! the same durable queue. Callers never observe the switch.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use rockbot_bus::{handler_fn, Envelope, InMemoryBus, MessageBus, MessageResult};
//!
//! # async fn example() -> Result<(), rockbot_bus::BusError> {
//! let bus = Arc::new(InMemoryBus::new("rockbot"));
//!
//! let _sub = bus
//!     .subscribe(
//!         "user.*.userMessage",
//!         "my-agent.user-messages",
//!         handler_fn(|envelope, _token| async move {
//!             println!("got {}", envelope.message_type());
//!             MessageResult::Ack
//!         }),
//!     )
//!     .await?;
//!
//! bus.publish(
//!     "user.proxy.userMessage",
//!     Envelope::new("userMessage", br#"{"content":"hi"}"#.to_vec(), "proxy"),
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod envelope;
pub mod headers;
pub mod subscription;
pub mod topic;
pub mod trace;

mod bus;
mod error;
mod memory_bus;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use bus::{handler_fn, BusMessage, MessageBus, MessageHandler, MessageResult};
pub use envelope::{ContentTrust, Envelope};
pub use error::BusError;
pub use memory_bus::InMemoryBus;
pub use subscription::{ReconnectPolicy, Subscription};
pub use topic::TopicPattern;
pub use trace::TraceContext;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpBus, AmqpConfig};
