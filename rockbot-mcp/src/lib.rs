//! # rockbot-mcp
//!
//! The MCP bridge: a hosted service that owns connections to external
//! Model Context Protocol servers and adapts them to the bus's
//! tool-invocation contract. It subscribes to `tool.invoke` and
//! `tool.meta.mcp.refresh`, publishes tool availability on
//! `tool.meta.mcp.<agent>`, and watches its configuration file for
//! changes with a 500 ms debounce.
//!
//! Server failures never terminate the service: a server that cannot
//! connect stays disconnected and is retried on the next config change or
//! refresh request.

mod bridge;
mod client;
mod config;
mod error;

pub use bridge::{McpBridge, McpBridgeConfig, McpConnection, McpConnector, McpToolResult};
pub use client::RmcpConnector;
pub use config::{load_config, McpConfigFile, McpServerEntry};
pub use error::BridgeError;
