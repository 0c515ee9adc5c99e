//! MCP bridge configuration file.
//!
//! The format matches the common `mcpServers` JSON shape, with per-server
//! allow/deny tool filters. The allow-list wins whenever it is non-empty.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::BridgeError;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct McpConfigFile {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: HashMap<String, McpServerEntry>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerEntry {
    /// Transport type; `sse` is the only supported value today and is
    /// served over the streamable HTTP client transport.
    #[serde(rename = "type", default)]
    pub server_type: Option<String>,
    pub url: String,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub denied_tools: Vec<String>,
}

impl McpServerEntry {
    /// Allow-list wins when non-empty; otherwise everything not denied.
    pub fn should_include_tool(&self, name: &str) -> bool {
        if !self.allowed_tools.is_empty() {
            return self.allowed_tools.iter().any(|t| t == name);
        }
        !self.denied_tools.iter().any(|t| t == name)
    }
}

/// Load and parse the config file. A missing file is an empty config.
pub async fn load_config(path: &Path) -> Result<McpConfigFile, BridgeError> {
    let expanded = shellexpand::tilde(&path.to_string_lossy().to_string()).to_string();
    let raw = match tokio::fs::read_to_string(&expanded).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(McpConfigFile::default())
        }
        Err(err) => return Err(err.into()),
    };
    let config: McpConfigFile = serde_json::from_str(&raw)
        .map_err(|e| BridgeError::Config(format!("malformed {expanded}: {e}")))?;
    Ok(config)
}
