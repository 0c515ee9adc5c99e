//! Host and handler error types.

use thiserror::Error;

/// Failure of a typed message handler.
///
/// The error-handling middleware converts these into broker dispositions:
/// `Validation` dead-letters, everything else retries (bounded by the
/// broker's redelivery count).
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Malformed envelope or payload. Caller's error, never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The handler's cancellation token tripped mid-work.
    #[error("handler cancelled")]
    Cancelled,

    /// Anything else that went wrong inside the handler.
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Failure of host construction or lifecycle.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("agent identity is required")]
    MissingIdentity,

    #[error("a message bus is required")]
    MissingBus,

    #[error(transparent)]
    Bus(#[from] rockbot_bus::BusError),

    #[error("hosted service '{name}' failed: {message}")]
    Service { name: String, message: String },
}
