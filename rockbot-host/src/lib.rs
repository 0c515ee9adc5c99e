//! # rockbot-host
//!
//! The reusable host every RockBot agent executable is built from. It owns
//! two things:
//!
//! - The **dispatch pipeline**: envelopes arriving on a subscription are
//!   routed by message-type name to a typed handler through a fixed
//!   middleware chain (Tracing → Logging → ErrorHandling → Handler). The
//!   chain runs exactly once per delivery and produces exactly one
//!   [`rockbot_bus::MessageResult`].
//! - The **lifecycle**: a declarative [`AgentHostBuilder`] collects
//!   identity, handler registrations, subscriptions, and hosted services;
//!   `start()` runs every hosted service and opens every subscription,
//!   `shutdown()` disposes subscriptions in reverse order and then stops
//!   services.

mod error;
mod host;
mod middleware;
mod pipeline;

pub use error::{HandlerError, HostError};
pub use host::{AgentHost, AgentHostBuilder, HostedService};
pub use middleware::{ErrorHandlingMiddleware, LoggingMiddleware, Middleware, TracingMiddleware};
pub use pipeline::{DispatchPipeline, HandlerContext, Next, TypedHandler};
