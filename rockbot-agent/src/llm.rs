//! The abstract chat-client interface.
//!
//! Concrete LLM providers live outside this crate; the orchestrator only
//! depends on this contract. Tool definitions travel as
//! [`rockbot_proto::ToolDescriptor`] (name, description, JSON Schema
//! string) so registry entries can be forwarded verbatim.

use async_trait::async_trait;
use rockbot_proto::ToolDescriptor;
use tokio_util::sync::CancellationToken;

use crate::error::LlmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        }
    }
}

/// A structured function call in a model response.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments, forwarded untouched to the executor.
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Calls requested by an assistant message.
    pub tool_calls: Vec<ToolCall>,
    /// For tool-role messages: which call this result answers.
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant_with_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Tools offered to the model for this call. Empty disables tool use
    /// and forces a text completion.
    pub tools: Vec<ToolDescriptor>,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl ChatResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A chat-completion provider.
///
/// Implementations classify provider failures into [`LlmError`] kinds and
/// honor the cancellation token at every await point. The client's own
/// request timeout is configured at construction (5 minutes by default in
/// deployments, to accommodate large subagent responses).
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Model identifier, matched against model-behavior prefixes.
    fn model_id(&self) -> &str;

    async fn complete(
        &self,
        request: ChatRequest,
        token: CancellationToken,
    ) -> Result<ChatResponse, LlmError>;
}
