//! The MCP bridge hosted service.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rockbot_bus::{handler_fn, ContentTrust, Envelope, MessageBus, MessageResult};
use rockbot_host::{HostError, HostedService};
use rockbot_proto::{
    topics, McpMetadataRefreshRequest, McpToolsAvailable, ToolDescriptor, ToolError,
    ToolErrorCode, ToolInvokeRequest, ToolInvokeResponse,
};
use tokio_util::sync::CancellationToken;

use crate::config::{load_config, McpConfigFile, McpServerEntry};
use crate::error::BridgeError;

const ARGUMENT_HINT: &str = "\n\nHint: this tool expects its arguments as a JSON object \
     (e.g. {\"param\": \"value\"}), not a plain string.";

/// Result of one MCP tool call.
#[derive(Debug, Clone)]
pub struct McpToolResult {
    pub content: String,
    pub is_error: bool,
}

/// An open connection to one MCP server.
#[async_trait]
pub trait McpConnection: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, BridgeError>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<McpToolResult, BridgeError>;

    async fn close(&self);
}

/// Opens connections; the production implementation is
/// [`crate::RmcpConnector`].
#[async_trait]
pub trait McpConnector: Send + Sync {
    async fn connect(
        &self,
        name: &str,
        entry: &McpServerEntry,
    ) -> Result<Arc<dyn McpConnection>, BridgeError>;
}

#[derive(Debug, Clone)]
pub struct McpBridgeConfig {
    pub agent_name: String,
    /// Path to the watched `mcp.json`.
    pub config_path: PathBuf,
    /// Default per-tool timeout; a request's `timeout-ms` header can only
    /// shorten it.
    pub default_timeout: Duration,
    /// Debounce window for config-file changes.
    pub watch_debounce: Duration,
}

impl McpBridgeConfig {
    pub fn new(agent_name: impl Into<String>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            agent_name: agent_name.into(),
            config_path: config_path.into(),
            default_timeout: Duration::from_secs(30),
            watch_debounce: Duration::from_millis(500),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_watch_debounce(mut self, debounce: Duration) -> Self {
        self.watch_debounce = debounce;
        self
    }
}

struct ServerState {
    entry: McpServerEntry,
    connection: Arc<dyn McpConnection>,
    tools: Vec<ToolDescriptor>,
}

/// The bridge. One per agent process; runs as a hosted service.
pub struct McpBridge {
    config: McpBridgeConfig,
    bus: Arc<dyn MessageBus>,
    connector: Arc<dyn McpConnector>,
    servers: tokio::sync::Mutex<HashMap<String, ServerState>>,
    startup_completed_at: parking_lot::RwLock<Option<DateTime<Utc>>>,
}

impl McpBridge {
    pub fn new(
        config: McpBridgeConfig,
        bus: Arc<dyn MessageBus>,
        connector: Arc<dyn McpConnector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            bus,
            connector,
            servers: tokio::sync::Mutex::new(HashMap::new()),
            startup_completed_at: parking_lot::RwLock::new(None),
        })
    }

    pub fn startup_completed_at(&self) -> Option<DateTime<Utc>> {
        *self.startup_completed_at.read()
    }

    /// Names of tools currently advertised, per server. Test hook.
    pub async fn advertised_tools(&self) -> HashMap<String, Vec<String>> {
        self.servers
            .lock()
            .await
            .iter()
            .map(|(name, state)| {
                (
                    name.clone(),
                    state.tools.iter().map(|t| t.name.clone()).collect(),
                )
            })
            .collect()
    }

    async fn publish_availability(
        &self,
        server_name: &str,
        tools: Vec<ToolDescriptor>,
        removed_tools: Vec<String>,
    ) {
        let message = McpToolsAvailable {
            server_name: server_name.to_string(),
            tools,
            removed_tools,
        };
        let envelope = match Envelope::from_payload(&message, &self.config.agent_name) {
            Ok(envelope) => envelope.with_content_trust(ContentTrust::System),
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode availability");
                return;
            }
        };
        let topic = topics::mcp_tools_meta(&self.config.agent_name);
        if let Err(err) = self.bus.publish(&topic, envelope).await {
            tracing::warn!(error = %err, "failed to publish availability");
        }
    }

    /// Connect one server, list and filter its tools, publish
    /// availability. Failures log and leave the server disconnected.
    async fn connect_server(
        &self,
        servers: &mut HashMap<String, ServerState>,
        name: &str,
        entry: &McpServerEntry,
    ) {
        tracing::info!(server = %name, url = %entry.url, "mcp server connecting");
        let connection = match self.connector.connect(name, entry).await {
            Ok(connection) => connection,
            Err(err) => {
                tracing::warn!(server = %name, error = %err, "mcp server connect failed, staying disconnected");
                return;
            }
        };
        let tools = match connection.list_tools().await {
            Ok(tools) => tools
                .into_iter()
                .filter(|t| entry.should_include_tool(&t.name))
                .collect::<Vec<_>>(),
            Err(err) => {
                tracing::warn!(server = %name, error = %err, "mcp list_tools failed, disconnecting");
                connection.close().await;
                return;
            }
        };
        tracing::info!(server = %name, tools = tools.len(), "mcp server active");
        self.publish_availability(name, tools.clone(), Vec::new())
            .await;
        servers.insert(
            name.to_string(),
            ServerState {
                entry: entry.clone(),
                connection,
                tools,
            },
        );
    }

    /// Diff a freshly loaded config against the active servers:
    /// disconnect removed or changed servers (publishing their tools as
    /// removed), connect new or changed ones.
    async fn apply_config(&self, config: &McpConfigFile) {
        let mut servers = self.servers.lock().await;

        let active: Vec<String> = servers.keys().cloned().collect();
        for name in active {
            let keep = config
                .mcp_servers
                .get(&name)
                .map(|entry| *entry == servers[&name].entry)
                .unwrap_or(false);
            if keep {
                continue;
            }
            if let Some(state) = servers.remove(&name) {
                tracing::info!(server = %name, "mcp server disconnecting");
                state.connection.close().await;
                let removed: Vec<String> =
                    state.tools.iter().map(|t| t.name.clone()).collect();
                self.publish_availability(&name, Vec::new(), removed).await;
            }
        }

        for (name, entry) in &config.mcp_servers {
            if !servers.contains_key(name) {
                self.connect_server(&mut servers, name, entry).await;
            }
        }
    }

    async fn handle_invoke(&self, envelope: Envelope) -> MessageResult {
        let Some(request) = envelope.payload::<ToolInvokeRequest>() else {
            tracing::warn!(message_id = %envelope.message_id(), "malformed tool invoke request");
            return MessageResult::DeadLetter;
        };
        let reply_topic = envelope
            .reply_to()
            .map(str::to_string)
            .unwrap_or_else(|| topics::tool_result(&self.config.agent_name));

        let target = {
            let servers = self.servers.lock().await;
            servers
                .iter()
                .find(|(_, state)| state.tools.iter().any(|t| t.name == request.tool_name))
                .map(|(name, state)| (name.clone(), state.connection.clone()))
        };
        let Some((server_name, connection)) = target else {
            self.publish_tool_error(
                &reply_topic,
                &envelope,
                &request,
                ToolErrorCode::ToolNotFound,
                format!("no connected MCP server advertises '{}'", request.tool_name),
                false,
            )
            .await;
            return MessageResult::Ack;
        };

        // Arguments arrive as a JSON string; decode them here so each
        // server sees structured values.
        let raw = request.arguments.trim();
        let parsed: Result<serde_json::Value, _> = if raw.is_empty() {
            Ok(serde_json::json!({}))
        } else {
            serde_json::from_str(raw)
        };
        let mut arguments = match parsed {
            Ok(value) => value,
            Err(err) => {
                self.publish_tool_error(
                    &reply_topic,
                    &envelope,
                    &request,
                    ToolErrorCode::InvalidArguments,
                    format!("arguments are not valid JSON: {err}"),
                    false,
                )
                .await;
                return MessageResult::Ack;
            }
        };

        // Unwrap a self-referential double-wrapped invoke_tool: models
        // sometimes wrap an aggregator's invoke_tool inside itself.
        if server_name.contains("aggregator") && request.tool_name == "invoke_tool" {
            if let Some(inner) = double_wrapped_arguments(&arguments) {
                tracing::debug!(server = %server_name, "unwrapping double-wrapped invoke_tool");
                arguments = inner;
            }
        }
        let arguments_not_object = !arguments.is_object();

        let timeout = envelope
            .header(rockbot_bus::headers::TIMEOUT_MS)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .map(|requested| requested.min(self.config.default_timeout))
            .unwrap_or(self.config.default_timeout);

        let outcome =
            tokio::time::timeout(timeout, connection.call_tool(&request.tool_name, arguments))
                .await;
        match outcome {
            Err(_) => {
                self.publish_tool_error(
                    &reply_topic,
                    &envelope,
                    &request,
                    ToolErrorCode::Timeout,
                    format!(
                        "'{}' on '{}' timed out after {:?}",
                        request.tool_name, server_name, timeout
                    ),
                    true,
                )
                .await;
            }
            Ok(Err(err)) => {
                self.publish_tool_error(
                    &reply_topic,
                    &envelope,
                    &request,
                    ToolErrorCode::ExecutionFailed,
                    err.to_string(),
                    false,
                )
                .await;
            }
            Ok(Ok(result)) => {
                let mut content = result.content;
                if result.is_error && arguments_not_object {
                    content.push_str(ARGUMENT_HINT);
                }
                let response = ToolInvokeResponse {
                    tool_call_id: request.tool_call_id.clone(),
                    tool_name: request.tool_name.clone(),
                    content,
                    is_error: result.is_error,
                };
                match Envelope::from_payload(&response, &self.config.agent_name) {
                    Ok(out) => {
                        let out = out
                            .correlated_to(&envelope)
                            .with_content_trust(ContentTrust::ToolOutput)
                            .with_header(
                                rockbot_bus::headers::TOOL_PROVIDER,
                                server_name.clone(),
                            );
                        if let Err(err) = self.bus.publish(&reply_topic, out).await {
                            tracing::warn!(error = %err, "failed to publish tool response");
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "failed to encode tool response"),
                }
            }
        }
        MessageResult::Ack
    }

    async fn publish_tool_error(
        &self,
        reply_topic: &str,
        request_envelope: &Envelope,
        request: &ToolInvokeRequest,
        code: ToolErrorCode,
        message: String,
        is_retryable: bool,
    ) {
        let error = ToolError {
            tool_call_id: request.tool_call_id.clone(),
            tool_name: request.tool_name.clone(),
            code,
            message,
            is_retryable,
        };
        match Envelope::from_payload(&error, &self.config.agent_name) {
            Ok(envelope) => {
                let envelope = envelope.correlated_to(request_envelope);
                if let Err(err) = self.bus.publish(reply_topic, envelope).await {
                    tracing::warn!(error = %err, "failed to publish tool error");
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to encode tool error"),
        }
    }

    async fn handle_refresh(&self, envelope: Envelope) -> MessageResult {
        let Some(request) = envelope.payload::<McpMetadataRefreshRequest>() else {
            return MessageResult::DeadLetter;
        };
        // Requests predating startup are stale: the startup publication
        // already covered them.
        match self.startup_completed_at() {
            Some(started) if envelope.timestamp() >= started => {}
            _ => {
                tracing::debug!(
                    message_id = %envelope.message_id(),
                    "ignoring stale metadata refresh"
                );
                return MessageResult::Ack;
            }
        }

        let mut servers = self.servers.lock().await;
        let targets: Vec<String> = match &request.server_name {
            Some(name) => servers.keys().filter(|k| *k == name).cloned().collect(),
            None => servers.keys().cloned().collect(),
        };
        for name in targets {
            let Some(state) = servers.get_mut(&name) else {
                continue;
            };
            let fresh = match state.connection.list_tools().await {
                Ok(tools) => tools
                    .into_iter()
                    .filter(|t| state.entry.should_include_tool(&t.name))
                    .collect::<Vec<_>>(),
                Err(err) => {
                    tracing::warn!(server = %name, error = %err, "refresh list_tools failed");
                    continue;
                }
            };
            let removed: Vec<String> = state
                .tools
                .iter()
                .filter(|old| !fresh.iter().any(|new| new.name == old.name))
                .map(|old| old.name.clone())
                .collect();
            state.tools = fresh.clone();
            self.publish_availability(&name, fresh, removed).await;
        }
        MessageResult::Ack
    }

    fn config_mtime(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.config.config_path)
            .and_then(|m| m.modified())
            .ok()
    }

    /// Poll the config file and re-apply on change, debounced.
    async fn watch_config(&self, token: &CancellationToken) {
        let mut last = self.config_mtime();
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.config.watch_debounce) => {}
            }
            let current = self.config_mtime();
            if current == last {
                continue;
            }
            // Debounce: wait for the file to stop changing.
            tokio::time::sleep(self.config.watch_debounce).await;
            last = self.config_mtime();
            match load_config(&self.config.config_path).await {
                Ok(config) => {
                    tracing::info!(
                        servers = config.mcp_servers.len(),
                        "mcp config changed, re-applying"
                    );
                    self.apply_config(&config).await;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "mcp config reload failed, keeping current set");
                }
            }
        }
    }
}

#[async_trait]
impl HostedService for McpBridge {
    fn service_name(&self) -> &str {
        "mcp-bridge"
    }

    async fn run(self: Arc<Self>, token: CancellationToken) -> Result<(), HostError> {
        let invoke_bridge = self.clone();
        let invoke_sub = self
            .bus
            .subscribe(
                topics::TOOL_INVOKE,
                &format!("{}.tool-invoke", self.config.agent_name),
                handler_fn(move |envelope, _token| {
                    let bridge = invoke_bridge.clone();
                    async move { bridge.handle_invoke(envelope).await }
                }),
            )
            .await
            .map_err(|e| HostError::Service {
                name: "mcp-bridge".to_string(),
                message: e.to_string(),
            })?;

        let refresh_bridge = self.clone();
        let refresh_sub = self
            .bus
            .subscribe(
                topics::MCP_REFRESH,
                &format!("{}.mcp-refresh", self.config.agent_name),
                handler_fn(move |envelope, _token| {
                    let bridge = refresh_bridge.clone();
                    async move { bridge.handle_refresh(envelope).await }
                }),
            )
            .await
            .map_err(|e| HostError::Service {
                name: "mcp-bridge".to_string(),
                message: e.to_string(),
            })?;

        match load_config(&self.config.config_path).await {
            Ok(config) => self.apply_config(&config).await,
            Err(err) => {
                tracing::warn!(error = %err, "initial mcp config load failed, starting empty");
            }
        }
        *self.startup_completed_at.write() = Some(Utc::now());

        self.watch_config(&token).await;

        invoke_sub.dispose().await;
        refresh_sub.dispose().await;
        let mut servers = self.servers.lock().await;
        for (name, state) in servers.drain() {
            tracing::debug!(server = %name, "mcp server disconnecting on shutdown");
            state.connection.close().await;
        }
        Ok(())
    }
}

/// Inner arguments of a double-wrapped `invoke_tool`, when present.
fn double_wrapped_arguments(arguments: &serde_json::Value) -> Option<serde_json::Value> {
    let object = arguments.as_object()?;
    let inner_tool = object
        .get("tool_name")
        .or_else(|| object.get("name"))?
        .as_str()?;
    if inner_tool != "invoke_tool" {
        return None;
    }
    let inner = object.get("arguments")?;
    match inner {
        serde_json::Value::String(raw) => serde_json::from_str(raw).ok().or_else(|| {
            Some(serde_json::Value::String(raw.clone()))
        }),
        other => Some(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_wrap_detection() {
        let wrapped = serde_json::json!({
            "tool_name": "invoke_tool",
            "arguments": {"tool_name": "search", "arguments": {"q": "x"}}
        });
        let inner = double_wrapped_arguments(&wrapped).unwrap();
        assert_eq!(inner["tool_name"], "search");

        // Stringified inner arguments are parsed.
        let stringified = serde_json::json!({
            "tool_name": "invoke_tool",
            "arguments": "{\"tool_name\": \"search\"}"
        });
        let inner = double_wrapped_arguments(&stringified).unwrap();
        assert_eq!(inner["tool_name"], "search");

        // Anything else is left alone.
        assert!(double_wrapped_arguments(&serde_json::json!({
            "tool_name": "search", "arguments": {}
        }))
        .is_none());
        assert!(double_wrapped_arguments(&serde_json::json!("plain")).is_none());
    }
}
