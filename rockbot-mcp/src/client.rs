//! rmcp-backed connector.
//!
//! `sse` server entries are served over the streamable HTTP client
//! transport. Each connection owns one running rmcp service; closing the
//! connection cancels it.

use std::sync::Arc;

use async_trait::async_trait;
use rmcp::model::CallToolRequestParam;
use rmcp::service::RunningService;
use rmcp::transport::streamable_http_client::{
    StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
};
use rmcp::{RoleClient, ServiceExt};
use rockbot_proto::ToolDescriptor;
use tokio::sync::Mutex;

use crate::bridge::{McpConnection, McpConnector, McpToolResult};
use crate::config::McpServerEntry;
use crate::error::BridgeError;

/// Production connector over rmcp.
#[derive(Default)]
pub struct RmcpConnector;

impl RmcpConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl McpConnector for RmcpConnector {
    async fn connect(
        &self,
        name: &str,
        entry: &McpServerEntry,
    ) -> Result<Arc<dyn McpConnection>, BridgeError> {
        let config = StreamableHttpClientTransportConfig::with_uri(entry.url.clone());
        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|e| BridgeError::Connection(format!("http client: {e}")))?;
        let transport = StreamableHttpClientTransport::with_client(http_client, config);
        let service = ().serve(transport).await.map_err(|e| {
            BridgeError::Connection(format!("server '{name}' at {}: {e}", entry.url))
        })?;
        Ok(Arc::new(RmcpConnection {
            service: Mutex::new(Some(service)),
        }))
    }
}

struct RmcpConnection {
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
}

#[async_trait]
impl McpConnection for RmcpConnection {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, BridgeError> {
        let guard = self.service.lock().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| BridgeError::Connection("connection closed".to_string()))?;
        let result = service
            .list_tools(Default::default())
            .await
            .map_err(|e| BridgeError::Protocol(format!("list_tools failed: {e}")))?;
        Ok(result
            .tools
            .into_iter()
            .map(|tool| ToolDescriptor {
                name: tool.name.to_string(),
                description: tool.description.unwrap_or_default().to_string(),
                parameters_schema: serde_json::Value::Object((*tool.input_schema).clone())
                    .to_string(),
            })
            .collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<McpToolResult, BridgeError> {
        let guard = self.service.lock().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| BridgeError::Connection("connection closed".to_string()))?;
        let params = CallToolRequestParam {
            name: name.to_string().into(),
            arguments: arguments.as_object().cloned(),
        };
        let result = service
            .call_tool(params)
            .await
            .map_err(|e| BridgeError::ToolExecution(format!("call_tool failed: {e}")))?;
        let is_error = result.is_error.unwrap_or(false);
        let content = serde_json::to_value(&result.content)
            .map(|v| v.to_string())
            .unwrap_or_default();
        Ok(McpToolResult { content, is_error })
    }

    async fn close(&self) {
        if let Some(service) = self.service.lock().await.take() {
            if let Err(err) = service.cancel().await {
                tracing::debug!(error = %err, "mcp connection close");
            }
        }
    }
}
