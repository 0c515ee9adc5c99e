//! Bus error types.

use thiserror::Error;

/// Errors surfaced by bus operations.
///
/// Transport-level failures inside a running subscription are not errors to
/// the caller: the subscription self-heals. What surfaces here is fail-fast
/// publish failures, subscription setup failures, and codec problems.
#[derive(Debug, Error)]
pub enum BusError {
    /// Broker connection could not be established or was lost while a
    /// caller-visible operation was in flight.
    #[error("connection error: {0}")]
    Connection(String),

    /// Publish failed. Publishes are fail-fast and never buffered.
    #[error("publish failed: {0}")]
    Publish(String),

    /// Subscription could not be established.
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    /// Envelope body or metadata could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The bus has been shut down.
    #[error("bus is closed")]
    Closed,
}
