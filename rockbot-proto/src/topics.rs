//! Topic name conventions.
//!
//! Topics are hierarchical and dot-separated. Per-agent topics embed the
//! agent name as the final segment; per-proxy topics embed the user-proxy
//! name as the first.

/// Inbound tool invocations for any bridge in the process group.
pub const TOOL_INVOKE: &str = "tool.invoke";

/// MCP metadata refresh requests, consumed by every bridge.
pub const MCP_REFRESH: &str = "tool.meta.mcp.refresh";

/// Script execution requests for the external runner.
pub const SCRIPT_INVOKE: &str = "script.invoke";

/// Default topic for script results when no `ReplyTo` was set.
pub const SCRIPT_RESULT: &str = "script.result";

/// Agent liveness heartbeats.
pub const AGENT_HEARTBEAT: &str = "agent.heartbeat";

pub fn user_message(proxy: &str) -> String {
    format!("{proxy}.userMessage")
}

pub fn user_response(proxy: &str) -> String {
    format!("{proxy}.userResponse")
}

pub fn user_feedback(proxy: &str) -> String {
    format!("{proxy}.userFeedback")
}

pub fn conversation_history_request(proxy: &str) -> String {
    format!("{proxy}.conversationHistoryRequest")
}

/// Tool results and errors addressed to one agent.
pub fn tool_result(agent: &str) -> String {
    format!("tool.result.{agent}")
}

/// MCP tool availability announcements from one agent's bridge.
pub fn mcp_tools_meta(agent: &str) -> String {
    format!("tool.meta.mcp.{agent}")
}

/// Task requests addressed to one agent.
pub fn agent_task(target: &str) -> String {
    format!("agent.task.{target}")
}

/// Task cancellation requests addressed to one agent.
pub fn agent_task_cancel(target: &str) -> String {
    format!("agent.task.cancel.{target}")
}
