//! Agent-side error taxonomy.

use std::time::Duration;

use thiserror::Error;

/// Failure of a backing store. Stores are external collaborators; this is
/// the one error kind their contracts surface.
#[derive(Debug, Error)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failure of a chat-model call, classified from the provider response.
///
/// LLM errors abort the turn: the orchestrator records an assistant turn
/// with an apology and publishes it as the final reply.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("model call timed out: {0}")]
    Timeout(String),

    #[error("context too long: {0}")]
    ContextTooLong(String),

    #[error("{0}")]
    Unknown(String),
}

impl LlmError {
    /// Rate limits and timeouts are worth retrying; the rest are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Timeout(_))
    }
}

/// Failure inside a tool executor.
///
/// Tool errors never abort the orchestrator loop; they become tool-result
/// messages so the model may recover.
#[derive(Debug, Error)]
pub enum ToolExecError {
    #[error("tool '{0}' is already registered")]
    Duplicate(String),

    #[error("tool '{0}' not found")]
    NotFound(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("tool timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Failed(String),
}

impl ToolExecError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Top-level agent error, flattening the layers below it.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Tool(#[from] ToolExecError),

    #[error(transparent)]
    Bus(#[from] rockbot_bus::BusError),

    #[error("configuration error: {0}")]
    Config(String),
}
