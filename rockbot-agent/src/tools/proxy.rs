//! Bus-proxied tool execution.
//!
//! Tools advertised by a bridge in another process execute by publishing a
//! `ToolInvokeRequest` to `tool.invoke` and awaiting the correlated
//! response on this agent's `tool.result.<agent>` topic. The correlation
//! map hands each in-flight call a oneshot; the result router completes it
//! when the response or error arrives.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rockbot_bus::{headers, Envelope, MessageBus};
use rockbot_host::{HandlerContext, HandlerError, TypedHandler};
use rockbot_proto::{topics, ToolError, ToolInvokeRequest, ToolInvokeResponse};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::{error_response, ToolExecutor};

/// Terminal outcome of a bus-proxied invocation.
#[derive(Debug)]
pub enum ToolOutcome {
    Response(ToolInvokeResponse),
    Error(ToolError),
}

/// Correlation map: tool-call id → waiting caller.
#[derive(Default)]
pub struct PendingInvocations {
    waiting: Mutex<HashMap<String, oneshot::Sender<ToolOutcome>>>,
}

impl PendingInvocations {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin(&self, tool_call_id: &str) -> oneshot::Receiver<ToolOutcome> {
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert(tool_call_id.to_string(), tx);
        rx
    }

    fn abandon(&self, tool_call_id: &str) {
        self.waiting.lock().remove(tool_call_id);
    }

    /// Complete a pending call. Unmatched outcomes are dropped: they
    /// belong to a call that already timed out or was cancelled.
    pub fn complete(&self, tool_call_id: &str, outcome: ToolOutcome) {
        if let Some(tx) = self.waiting.lock().remove(tool_call_id) {
            let _ = tx.send(outcome);
        } else {
            tracing::debug!(%tool_call_id, "late tool outcome dropped");
        }
    }

    pub fn len(&self) -> usize {
        self.waiting.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.lock().is_empty()
    }
}

/// Routes `ToolInvokeResponse` envelopes into the correlation map.
pub struct ToolResponseHandler(pub Arc<PendingInvocations>);

#[async_trait]
impl TypedHandler for ToolResponseHandler {
    type Message = ToolInvokeResponse;

    async fn handle(
        &self,
        message: ToolInvokeResponse,
        _ctx: &HandlerContext,
    ) -> Result<(), HandlerError> {
        let tool_call_id = message.tool_call_id.clone();
        self.0.complete(&tool_call_id, ToolOutcome::Response(message));
        Ok(())
    }
}

/// Routes `ToolError` envelopes into the correlation map.
pub struct ToolErrorHandler(pub Arc<PendingInvocations>);

#[async_trait]
impl TypedHandler for ToolErrorHandler {
    type Message = ToolError;

    async fn handle(&self, message: ToolError, _ctx: &HandlerContext) -> Result<(), HandlerError> {
        let tool_call_id = message.tool_call_id.clone();
        self.0.complete(&tool_call_id, ToolOutcome::Error(message));
        Ok(())
    }
}

/// Executor for tools that live behind a bus bridge.
pub struct BusToolExecutor {
    bus: Arc<dyn MessageBus>,
    pending: Arc<PendingInvocations>,
    agent_name: String,
    timeout: Duration,
}

impl BusToolExecutor {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        pending: Arc<PendingInvocations>,
        agent_name: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            bus,
            pending,
            agent_name: agent_name.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ToolExecutor for BusToolExecutor {
    async fn execute(
        &self,
        request: ToolInvokeRequest,
        token: CancellationToken,
    ) -> ToolInvokeResponse {
        let tool_call_id = request.tool_call_id.clone();
        let rx = self.pending.begin(&tool_call_id);

        let envelope = match Envelope::from_payload(&request, &self.agent_name) {
            Ok(envelope) => envelope
                .with_reply_to(topics::tool_result(&self.agent_name))
                .with_header(headers::TIMEOUT_MS, self.timeout.as_millis().to_string()),
            Err(err) => {
                self.pending.abandon(&tool_call_id);
                return error_response(&request, format!("failed to encode request: {err}"));
            }
        };

        if let Err(err) = self.bus.publish(topics::TOOL_INVOKE, envelope).await {
            self.pending.abandon(&tool_call_id);
            return error_response(&request, format!("failed to dispatch tool call: {err}"));
        }

        let outcome = tokio::select! {
            outcome = rx => outcome,
            _ = token.cancelled() => {
                self.pending.abandon(&tool_call_id);
                return error_response(&request, "tool call cancelled");
            }
            _ = tokio::time::sleep(self.timeout) => {
                self.pending.abandon(&tool_call_id);
                return error_response(
                    &request,
                    format!("no response from tool bridge within {:?}", self.timeout),
                );
            }
        };

        match outcome {
            Ok(ToolOutcome::Response(response)) => response,
            Ok(ToolOutcome::Error(error)) => error_response(
                &request,
                format!("{:?}: {}", error.code, error.message),
            ),
            Err(_) => error_response(&request, "tool bridge dropped the call"),
        }
    }
}

/// Keeps the registry in sync with bridge availability announcements:
/// advertised tools become bus-proxied registrations, removed tools are
/// dropped.
pub struct McpToolsAvailableHandler {
    registry: Arc<crate::tools::ToolRegistry>,
    executor: Arc<BusToolExecutor>,
}

impl McpToolsAvailableHandler {
    pub fn new(registry: Arc<crate::tools::ToolRegistry>, executor: Arc<BusToolExecutor>) -> Self {
        Self { registry, executor }
    }
}

#[async_trait]
impl TypedHandler for McpToolsAvailableHandler {
    type Message = rockbot_proto::McpToolsAvailable;

    async fn handle(
        &self,
        message: rockbot_proto::McpToolsAvailable,
        _ctx: &HandlerContext,
    ) -> Result<(), HandlerError> {
        for name in &message.removed_tools {
            if self.registry.remove(name) {
                tracing::info!(tool = %name, server = %message.server_name, "mcp tool withdrawn");
            }
        }
        for tool in message.tools {
            tracing::info!(tool = %tool.name, server = %message.server_name, "mcp tool available");
            self.registry.upsert(
                crate::tools::ToolRegistration {
                    name: tool.name,
                    description: tool.description,
                    parameters_schema: tool.parameters_schema,
                    source: crate::tools::ToolSource::McpProxy {
                        server: message.server_name.clone(),
                    },
                },
                self.executor.clone(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rockbot_proto::ToolErrorCode;

    fn request(id: &str) -> ToolInvokeRequest {
        ToolInvokeRequest {
            tool_call_id: id.to_string(),
            tool_name: "remote_search".to_string(),
            arguments: "{}".to_string(),
            session_id: Some("s1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_response_completes_pending_call() {
        let bus = Arc::new(rockbot_bus::InMemoryBus::new("test"));
        let pending = Arc::new(PendingInvocations::new());
        let executor = BusToolExecutor::new(
            bus,
            pending.clone(),
            "scout",
            Duration::from_secs(5),
        );

        let pending_for_responder = pending.clone();
        let call = tokio::spawn(async move {
            executor.execute(request("call-1"), CancellationToken::new()).await
        });

        // Wait for the call to register, then complete it as the router
        // would on a bus delivery.
        tokio::time::timeout(Duration::from_secs(1), async {
            while pending_for_responder.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        pending_for_responder.complete(
            "call-1",
            ToolOutcome::Response(ToolInvokeResponse {
                tool_call_id: "call-1".to_string(),
                tool_name: "remote_search".to_string(),
                content: "found it".to_string(),
                is_error: false,
            }),
        );

        let response = call.await.unwrap();
        assert!(!response.is_error);
        assert_eq!(response.content, "found it");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_bridge_error_becomes_error_response() {
        let bus = Arc::new(rockbot_bus::InMemoryBus::new("test"));
        let pending = Arc::new(PendingInvocations::new());
        let executor =
            BusToolExecutor::new(bus, pending.clone(), "scout", Duration::from_secs(5));

        let pending_for_responder = pending.clone();
        let call = tokio::spawn(async move {
            executor.execute(request("call-2"), CancellationToken::new()).await
        });
        tokio::time::timeout(Duration::from_secs(1), async {
            while pending_for_responder.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        pending_for_responder.complete(
            "call-2",
            ToolOutcome::Error(ToolError {
                tool_call_id: "call-2".to_string(),
                tool_name: "remote_search".to_string(),
                code: ToolErrorCode::ExecutionFailed,
                message: "backend down".to_string(),
                is_retryable: false,
            }),
        );

        let response = call.await.unwrap();
        assert!(response.is_error);
        assert!(response.content.contains("ExecutionFailed"));
        assert!(response.content.contains("backend down"));
    }

    #[tokio::test]
    async fn test_timeout_produces_error_and_clears_pending() {
        let bus = Arc::new(rockbot_bus::InMemoryBus::new("test"));
        let pending = Arc::new(PendingInvocations::new());
        let executor =
            BusToolExecutor::new(bus, pending.clone(), "scout", Duration::from_millis(50));

        let response = executor
            .execute(request("call-3"), CancellationToken::new())
            .await;
        assert!(response.is_error);
        assert!(response.content.contains("no response"));
        assert!(pending.is_empty());

        // A late completion after timeout is dropped quietly.
        pending.complete(
            "call-3",
            ToolOutcome::Response(ToolInvokeResponse {
                tool_call_id: "call-3".to_string(),
                tool_name: "remote_search".to_string(),
                content: "late".to_string(),
                is_error: false,
            }),
        );
    }

    #[tokio::test]
    async fn test_availability_handler_syncs_registry() {
        use rockbot_proto::{McpToolsAvailable, ToolDescriptor};

        let bus = Arc::new(rockbot_bus::InMemoryBus::new("test"));
        let registry = Arc::new(crate::tools::ToolRegistry::new());
        let executor = Arc::new(BusToolExecutor::new(
            bus,
            Arc::new(PendingInvocations::new()),
            "scout",
            Duration::from_secs(5),
        ));
        let handler = McpToolsAvailableHandler::new(registry.clone(), executor);

        let ctx = rockbot_host::HandlerContext {
            envelope: rockbot_bus::Envelope::new("mcpToolsAvailable", vec![], "bridge"),
            agent: "scout".to_string(),
            token: CancellationToken::new(),
            result: None,
        };
        handler
            .handle(
                McpToolsAvailable {
                    server_name: "web".to_string(),
                    tools: vec![ToolDescriptor {
                        name: "search".to_string(),
                        description: "web search".to_string(),
                        parameters_schema: "{}".to_string(),
                    }],
                    removed_tools: vec![],
                },
                &ctx,
            )
            .await
            .unwrap();
        assert!(registry.contains("search"));
        assert_eq!(registry.names_for_mcp_server("web"), vec!["search"]);

        handler
            .handle(
                McpToolsAvailable {
                    server_name: "web".to_string(),
                    tools: vec![],
                    removed_tools: vec!["search".to_string()],
                },
                &ctx,
            )
            .await
            .unwrap();
        assert!(!registry.contains("search"));
    }

    #[tokio::test]
    async fn test_cancellation_abandons_call() {
        let bus = Arc::new(rockbot_bus::InMemoryBus::new("test"));
        let pending = Arc::new(PendingInvocations::new());
        let executor =
            BusToolExecutor::new(bus, pending.clone(), "scout", Duration::from_secs(30));

        let token = CancellationToken::new();
        token.cancel();
        let response = executor.execute(request("call-4"), token).await;
        assert!(response.is_error);
        assert!(response.content.contains("cancelled"));
        assert!(pending.is_empty());
    }
}
