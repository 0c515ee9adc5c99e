//! Bridge error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("tool execution error: {0}")]
    ToolExecution(String),

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
