//! Well-known envelope header keys.
//!
//! Header keys are short ASCII strings. On AMQP they travel prefixed with
//! [`AMQP_PREFIX`] so they never collide with broker or application
//! properties; unknown prefixed headers propagate unchanged through every
//! hop.

/// Prefix applied to every envelope header when carried on AMQP.
pub const AMQP_PREFIX: &str = "rb-";

/// Trust level of the envelope content: `system`, `user-input`, or
/// `tool-output`.
pub const CONTENT_TRUST: &str = "content-trust";

/// Name of the tool provider that produced a tool result.
pub const TOOL_PROVIDER: &str = "tool-provider";

/// Per-request timeout in milliseconds, honored by tool bridges.
pub const TIMEOUT_MS: &str = "timeout-ms";

/// W3C trace context: `traceparent`.
pub const TRACEPARENT: &str = "traceparent";

/// W3C trace context: `tracestate`.
pub const TRACESTATE: &str = "tracestate";
