//! Bus payload types.

use chrono::{DateTime, Utc};
use rockbot_bus::BusMessage;
use serde::{Deserialize, Serialize};

/// A user turn arriving from a front-end proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    pub user_id: String,
    pub session_id: String,
    pub content: String,
}

impl BusMessage for UserMessage {
    const MESSAGE_TYPE: &'static str = "userMessage";
}

/// A reply streamed back to the user. Non-final replies are progress;
/// the final reply terminates the turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentReply {
    pub content: String,
    pub session_id: String,
    pub agent_name: String,
    pub is_final: bool,
}

impl BusMessage for AgentReply {
    const MESSAGE_TYPE: &'static str = "agentReply";
}

/// Thumbs-up/down on a previous reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserFeedback {
    pub message_id: String,
    pub session_id: String,
    pub is_positive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
}

impl BusMessage for UserFeedback {
    const MESSAGE_TYPE: &'static str = "userFeedback";
}

/// Request for a session's recorded conversation turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationHistoryRequest {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<usize>,
}

impl BusMessage for ConversationHistoryRequest {
    const MESSAGE_TYPE: &'static str = "conversationHistoryRequest";
}

/// One recorded turn in a history response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationHistoryResponse {
    pub session_id: String,
    pub turns: Vec<HistoryTurn>,
}

impl BusMessage for ConversationHistoryResponse {
    const MESSAGE_TYPE: &'static str = "conversationHistoryResponse";
}

/// A tool invocation dispatched over the bus to whichever bridge
/// advertises the tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvokeRequest {
    pub tool_call_id: String,
    pub tool_name: String,
    /// JSON-encoded arguments; decoded by the executor against its
    /// declared schema.
    pub arguments: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl BusMessage for ToolInvokeRequest {
    const MESSAGE_TYPE: &'static str = "toolInvokeRequest";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvokeResponse {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: String,
    pub is_error: bool,
}

impl BusMessage for ToolInvokeResponse {
    const MESSAGE_TYPE: &'static str = "toolInvokeResponse";
}

/// Tool failure classification. `Timeout` is the only retryable code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolErrorCode {
    ToolNotFound,
    Timeout,
    ExecutionFailed,
    InvalidArguments,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolError {
    pub tool_call_id: String,
    pub tool_name: String,
    pub code: ToolErrorCode,
    pub message: String,
    pub is_retryable: bool,
}

impl BusMessage for ToolError {
    const MESSAGE_TYPE: &'static str = "toolError";
}

/// A tool advertised by a bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool parameters, as a string.
    pub parameters_schema: String,
}

/// Published by the MCP bridge whenever a server's tool set changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolsAvailable {
    pub server_name: String,
    pub tools: Vec<ToolDescriptor>,
    pub removed_tools: Vec<String>,
}

impl BusMessage for McpToolsAvailable {
    const MESSAGE_TYPE: &'static str = "mcpToolsAvailable";
}

/// Ask the MCP bridge to re-list tools for one server, or all of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpMetadataRefreshRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

impl BusMessage for McpMetadataRefreshRequest {
    const MESSAGE_TYPE: &'static str = "mcpMetadataRefreshRequest";
}

/// Lifecycle state of an agent-to-agent task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Submitted,
    Working,
    Completed,
    Failed,
}

/// Task error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskErrorCode {
    ExecutionFailed,
    TaskNotCancelable,
}

/// A task delegated to another agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTaskRequest {
    pub task_id: String,
    pub caller_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
    pub message: String,
}

impl BusMessage for AgentTaskRequest {
    const MESSAGE_TYPE: &'static str = "agentTaskRequest";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTaskStatusUpdate {
    pub task_id: String,
    pub agent_name: String,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl BusMessage for AgentTaskStatusUpdate {
    const MESSAGE_TYPE: &'static str = "agentTaskStatusUpdate";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTaskResult {
    pub task_id: String,
    pub agent_name: String,
    pub state: TaskState,
    pub content: String,
}

impl BusMessage for AgentTaskResult {
    const MESSAGE_TYPE: &'static str = "agentTaskResult";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTaskError {
    pub task_id: String,
    pub agent_name: String,
    pub code: TaskErrorCode,
    pub message: String,
}

impl BusMessage for AgentTaskError {
    const MESSAGE_TYPE: &'static str = "agentTaskError";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTaskCancelRequest {
    pub task_id: String,
}

impl BusMessage for AgentTaskCancelRequest {
    const MESSAGE_TYPE: &'static str = "agentTaskCancelRequest";
}

/// Advertised capabilities of an agent, indexed by the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
}

impl BusMessage for AgentCard {
    const MESSAGE_TYPE: &'static str = "agentCard";
}

/// Periodic liveness signal carrying the agent's card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHeartbeat {
    pub agent_name: String,
    pub card: AgentCard,
    pub timestamp: DateTime<Utc>,
}

impl BusMessage for AgentHeartbeat {
    const MESSAGE_TYPE: &'static str = "agentHeartbeat";
}

/// Script execution request; fulfilled by an external runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptInvokeRequest {
    pub invocation_id: String,
    pub script: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl BusMessage for ScriptInvokeRequest {
    const MESSAGE_TYPE: &'static str = "scriptInvokeRequest";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptInvokeResponse {
    pub invocation_id: String,
    pub output: String,
    pub is_error: bool,
}

impl BusMessage for ScriptInvokeResponse {
    const MESSAGE_TYPE: &'static str = "scriptInvokeResponse";
}

/// Terminal message of an in-process subagent, delivered to the parent
/// session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentResultMessage {
    pub task_id: String,
    pub session_id: String,
    pub content: String,
    pub is_error: bool,
}

impl BusMessage for SubagentResultMessage {
    const MESSAGE_TYPE: &'static str = "subagentResult";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_wire_shape() {
        let message = UserMessage {
            user_id: "u1".to_string(),
            session_id: "s1".to_string(),
            content: "hi".to_string(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"userId": "u1", "sessionId": "s1", "content": "hi"})
        );
    }

    #[test]
    fn test_tool_error_code_wire_names() {
        let error = ToolError {
            tool_call_id: "c1".to_string(),
            tool_name: "unknown".to_string(),
            code: ToolErrorCode::ToolNotFound,
            message: "no bridge advertises this tool".to_string(),
            is_retryable: false,
        };
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["code"], "ToolNotFound");
        assert_eq!(json["isRetryable"], false);
    }

    #[test]
    fn test_agent_reply_round_trip() {
        let reply = AgentReply {
            content: "hello".to_string(),
            session_id: "s1".to_string(),
            agent_name: "scout".to_string(),
            is_final: true,
        };
        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains("\"isFinal\":true"));
        let back: AgentReply = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reply);
    }

    #[test]
    fn test_optional_fields_absent_when_none() {
        let request = McpMetadataRefreshRequest { server_name: None };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn test_task_state_names() {
        assert_eq!(
            serde_json::to_value(TaskState::Working).unwrap(),
            serde_json::json!("Working")
        );
        assert_eq!(
            serde_json::to_value(TaskErrorCode::TaskNotCancelable).unwrap(),
            serde_json::json!("TaskNotCancelable")
        );
    }
}
