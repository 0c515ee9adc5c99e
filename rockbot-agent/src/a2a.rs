//! Agent-to-agent task delegation.
//!
//! Requests travel on `agent.task.<target>`, cancellations on
//! `agent.task.cancel.<target>`; status updates and terminal results come
//! back on the caller's result topic. The caller returns a task id
//! immediately and correlates incoming updates to pending tasks; every
//! dispatched task receives exactly one terminal message.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rockbot_bus::{Envelope, MessageBus};
use rockbot_host::{HandlerContext, HandlerError, TypedHandler};
use rockbot_proto::{
    topics, AgentCard, AgentTaskCancelRequest, AgentTaskError, AgentTaskRequest, AgentTaskResult,
    AgentTaskStatusUpdate, TaskErrorCode, TaskState,
};
use schemars::JsonSchema;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ToolExecError;
use crate::memory::{ConversationMemory, ConversationTurn, TurnRole};
use crate::tools::{register_tool, AgentTool, ToolCallContext, ToolRegistry};

/// In-process index of known agents, seeded from `known-agents.json` and
/// kept fresh by heartbeats.
#[derive(Default)]
pub struct AgentDirectory {
    agents: RwLock<HashMap<String, AgentCard>>,
}

impl AgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from the data volume's `known-agents.json` (an array of
    /// cards). Missing file is fine; a malformed one is an error.
    pub async fn load_known_agents(&self, data_volume: &Path) -> Result<(), crate::AgentError> {
        let path = data_volume.join("known-agents.json");
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(_) => return Ok(()),
        };
        let cards: Vec<AgentCard> = serde_json::from_str(&raw).map_err(|e| {
            crate::AgentError::Config(format!("malformed {}: {}", path.display(), e))
        })?;
        for card in cards {
            self.upsert(card);
        }
        Ok(())
    }

    pub fn upsert(&self, card: AgentCard) {
        self.agents.write().insert(card.name.to_lowercase(), card);
    }

    pub fn get(&self, name: &str) -> Option<AgentCard> {
        self.agents.read().get(&name.to_lowercase()).cloned()
    }

    /// Agents advertising a skill, matched case-insensitively.
    pub fn find_by_skill(&self, skill: &str) -> Vec<AgentCard> {
        let needle = skill.to_lowercase();
        let mut found: Vec<AgentCard> = self
            .agents
            .read()
            .values()
            .filter(|c| c.skills.iter().any(|s| s.to_lowercase() == needle))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }

    pub fn all(&self) -> Vec<AgentCard> {
        let mut cards: Vec<AgentCard> = self.agents.read().values().cloned().collect();
        cards.sort_by(|a, b| a.name.cmp(&b.name));
        cards
    }
}

/// A dispatched task awaiting its terminal message.
#[derive(Debug, Clone)]
pub struct PendingA2aTask {
    pub task_id: String,
    pub target_agent: String,
    pub session_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct A2aTracker {
    tasks: Mutex<HashMap<String, PendingA2aTask>>,
}

impl A2aTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, task: PendingA2aTask) {
        self.tasks.lock().insert(task.task_id.clone(), task);
    }

    /// Remove on terminal status. Returns the task if it was pending.
    pub fn resolve(&self, task_id: &str) -> Option<PendingA2aTask> {
        self.tasks.lock().remove(task_id)
    }

    pub fn get(&self, task_id: &str) -> Option<PendingA2aTask> {
        self.tasks.lock().get(task_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

/// Caller side: dispatches tasks and exposes the `invoke_agent` tool.
pub struct A2aClient {
    bus: Arc<dyn MessageBus>,
    tracker: Arc<A2aTracker>,
    directory: Arc<AgentDirectory>,
    agent_name: String,
    /// Base of the caller's result topic; the agent name is appended.
    result_topic_base: String,
}

impl A2aClient {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        tracker: Arc<A2aTracker>,
        directory: Arc<AgentDirectory>,
        agent_name: impl Into<String>,
        result_topic_base: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            tracker,
            directory,
            agent_name: agent_name.into(),
            result_topic_base: result_topic_base.into(),
        })
    }

    /// Topic this caller receives task results on.
    pub fn result_topic(&self) -> String {
        format!("{}.{}", self.result_topic_base, self.agent_name)
    }

    /// Dispatch a task and return `task_id: …` immediately.
    pub async fn invoke_agent(
        &self,
        agent_name: &str,
        skill: Option<String>,
        message: String,
        session_id: Option<String>,
    ) -> Result<String, ToolExecError> {
        if self.directory.get(agent_name).is_none() {
            return Err(ToolExecError::failed(format!(
                "no known agent named '{agent_name}'"
            )));
        }

        let task_id = Uuid::new_v4().to_string();
        let request = AgentTaskRequest {
            task_id: task_id.clone(),
            caller_agent: self.agent_name.clone(),
            skill,
            message,
        };
        let envelope = Envelope::from_payload(&request, &self.agent_name)
            .map_err(|e| ToolExecError::failed(e.to_string()))?
            .with_reply_to(self.result_topic())
            .with_destination(agent_name);

        self.tracker.track(PendingA2aTask {
            task_id: task_id.clone(),
            target_agent: agent_name.to_string(),
            session_id,
            started_at: Utc::now(),
        });

        if let Err(err) = self
            .bus
            .publish(&topics::agent_task(agent_name), envelope)
            .await
        {
            self.tracker.resolve(&task_id);
            return Err(ToolExecError::failed(format!("dispatch failed: {err}")));
        }
        Ok(format!("task_id: {task_id}"))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct InvokeAgentArgs {
    /// Name of the target agent.
    pub agent_name: String,
    /// Skill to request, when the target advertises several.
    pub skill: Option<String>,
    /// The task message for the target agent.
    pub message: String,
}

struct InvokeAgentTool(Arc<A2aClient>);

impl AgentTool for InvokeAgentTool {
    type Args = InvokeAgentArgs;

    fn name(&self) -> &str {
        "invoke_agent"
    }

    fn description(&self) -> &str {
        "Delegate a task to another agent; returns a task id immediately"
    }

    async fn execute(
        &self,
        args: InvokeAgentArgs,
        call: &ToolCallContext,
    ) -> Result<String, ToolExecError> {
        self.0
            .invoke_agent(
                &args.agent_name,
                args.skill,
                args.message,
                call.session_id.clone(),
            )
            .await
    }
}

/// Register the `invoke_agent` tool backed by a client.
pub fn register_invoke_agent_tool(
    registry: &ToolRegistry,
    client: Arc<A2aClient>,
) -> Result<(), ToolExecError> {
    register_tool(registry, InvokeAgentTool(client))
}

/// Caller side: routes status updates and terminal messages back to the
/// parent session as synthetic turns.
pub struct A2aResultRouter {
    tracker: Arc<A2aTracker>,
    conversation: Arc<dyn ConversationMemory>,
}

impl A2aResultRouter {
    pub fn new(tracker: Arc<A2aTracker>, conversation: Arc<dyn ConversationMemory>) -> Arc<Self> {
        Arc::new(Self {
            tracker,
            conversation,
        })
    }

    async fn record(&self, session_id: Option<&str>, content: String) {
        if let Some(session_id) = session_id {
            if let Err(err) = self
                .conversation
                .add_turn(session_id, ConversationTurn::new(TurnRole::System, content))
                .await
            {
                tracing::warn!(error = %err, "failed to record task update turn");
            }
        }
    }
}

pub struct A2aStatusHandler(pub Arc<A2aResultRouter>);

#[async_trait]
impl TypedHandler for A2aStatusHandler {
    type Message = AgentTaskStatusUpdate;

    async fn handle(
        &self,
        message: AgentTaskStatusUpdate,
        _ctx: &HandlerContext,
    ) -> Result<(), HandlerError> {
        // Intermediate status never resolves the task.
        let Some(task) = self.0.tracker.get(&message.task_id) else {
            tracing::debug!(task_id = %message.task_id, "status for unknown task");
            return Ok(());
        };
        tracing::info!(
            task_id = %message.task_id,
            agent = %message.agent_name,
            state = ?message.state,
            "task status update"
        );
        if let Some(text) = message.message {
            self.0
                .record(
                    task.session_id.as_deref(),
                    format!("Update from agent {}: {}", message.agent_name, text),
                )
                .await;
        }
        Ok(())
    }
}

pub struct A2aResultHandler(pub Arc<A2aResultRouter>);

#[async_trait]
impl TypedHandler for A2aResultHandler {
    type Message = AgentTaskResult;

    async fn handle(
        &self,
        message: AgentTaskResult,
        _ctx: &HandlerContext,
    ) -> Result<(), HandlerError> {
        let Some(task) = self.0.tracker.resolve(&message.task_id) else {
            tracing::debug!(task_id = %message.task_id, "result for unknown task");
            return Ok(());
        };
        self.0
            .record(
                task.session_id.as_deref(),
                format!(
                    "Agent {} completed task {}: {}",
                    message.agent_name, message.task_id, message.content
                ),
            )
            .await;
        Ok(())
    }
}

pub struct A2aErrorHandler(pub Arc<A2aResultRouter>);

#[async_trait]
impl TypedHandler for A2aErrorHandler {
    type Message = AgentTaskError;

    async fn handle(
        &self,
        message: AgentTaskError,
        _ctx: &HandlerContext,
    ) -> Result<(), HandlerError> {
        let Some(task) = self.0.tracker.resolve(&message.task_id) else {
            tracing::debug!(task_id = %message.task_id, "error for unknown task");
            return Ok(());
        };
        self.0
            .record(
                task.session_id.as_deref(),
                format!(
                    "Agent {} failed task {} ({:?}): {}",
                    message.agent_name, message.task_id, message.code, message.message
                ),
            )
            .await;
        Ok(())
    }
}

/// The per-agent work behind an incoming task request.
#[async_trait]
pub trait AgentTaskDelegate: Send + Sync {
    async fn execute(
        &self,
        request: &AgentTaskRequest,
        token: CancellationToken,
    ) -> Result<String, String>;
}

/// Handler side: immediate `Working` status, then exactly one terminal
/// message.
pub struct A2aTaskHandler {
    bus: Arc<dyn MessageBus>,
    delegate: Arc<dyn AgentTaskDelegate>,
    agent_name: String,
    status_topic: String,
    default_result_topic: String,
}

impl A2aTaskHandler {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        delegate: Arc<dyn AgentTaskDelegate>,
        agent_name: impl Into<String>,
        status_topic: impl Into<String>,
        default_result_topic: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            delegate,
            agent_name: agent_name.into(),
            status_topic: status_topic.into(),
            default_result_topic: default_result_topic.into(),
        }
    }
}

#[async_trait]
impl TypedHandler for A2aTaskHandler {
    type Message = AgentTaskRequest;

    async fn handle(
        &self,
        message: AgentTaskRequest,
        ctx: &HandlerContext,
    ) -> Result<(), HandlerError> {
        let status = AgentTaskStatusUpdate {
            task_id: message.task_id.clone(),
            agent_name: self.agent_name.clone(),
            state: TaskState::Working,
            message: None,
        };
        let envelope = Envelope::from_payload(&status, &self.agent_name)
            .map_err(|e| HandlerError::failed(e.to_string()))?
            .correlated_to(&ctx.envelope);
        if let Err(err) = self.bus.publish(&self.status_topic, envelope).await {
            tracing::warn!(error = %err, "failed to publish working status");
        }

        let result_topic = ctx
            .envelope
            .reply_to()
            .unwrap_or(&self.default_result_topic)
            .to_string();

        let envelope = match self.delegate.execute(&message, ctx.token.clone()).await {
            Ok(content) => {
                let result = AgentTaskResult {
                    task_id: message.task_id.clone(),
                    agent_name: self.agent_name.clone(),
                    state: TaskState::Completed,
                    content,
                };
                Envelope::from_payload(&result, &self.agent_name)
            }
            Err(error) => {
                let error = AgentTaskError {
                    task_id: message.task_id.clone(),
                    agent_name: self.agent_name.clone(),
                    code: TaskErrorCode::ExecutionFailed,
                    message: error,
                };
                Envelope::from_payload(&error, &self.agent_name)
            }
        }
        .map_err(|e| HandlerError::failed(e.to_string()))?
        .correlated_to(&ctx.envelope);

        self.bus
            .publish(&result_topic, envelope)
            .await
            .map_err(|e| HandlerError::failed(e.to_string()))
    }
}

/// Cancellation requests are acknowledged but tasks are not currently
/// cancelable.
pub struct A2aCancelHandler {
    bus: Arc<dyn MessageBus>,
    agent_name: String,
    default_result_topic: String,
}

impl A2aCancelHandler {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        agent_name: impl Into<String>,
        default_result_topic: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            agent_name: agent_name.into(),
            default_result_topic: default_result_topic.into(),
        }
    }
}

#[async_trait]
impl TypedHandler for A2aCancelHandler {
    type Message = AgentTaskCancelRequest;

    async fn handle(
        &self,
        message: AgentTaskCancelRequest,
        ctx: &HandlerContext,
    ) -> Result<(), HandlerError> {
        let error = AgentTaskError {
            task_id: message.task_id,
            agent_name: self.agent_name.clone(),
            code: TaskErrorCode::TaskNotCancelable,
            message: "tasks cannot be cancelled once dispatched".to_string(),
        };
        let envelope = Envelope::from_payload(&error, &self.agent_name)
            .map_err(|e| HandlerError::failed(e.to_string()))?
            .correlated_to(&ctx.envelope);
        let topic = ctx
            .envelope
            .reply_to()
            .unwrap_or(&self.default_result_topic)
            .to_string();
        self.bus
            .publish(&topic, envelope)
            .await
            .map_err(|e| HandlerError::failed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(name: &str, skills: &[&str]) -> AgentCard {
        AgentCard {
            name: name.to_string(),
            description: format!("{name} agent"),
            version: None,
            skills: skills.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_directory_lookup_case_insensitive() {
        let directory = AgentDirectory::new();
        directory.upsert(card("Scout", &["Research", "summarize"]));

        assert!(directory.get("scout").is_some());
        assert!(directory.get("SCOUT").is_some());
        assert!(directory.get("other").is_none());

        assert_eq!(directory.find_by_skill("research").len(), 1);
        assert_eq!(directory.find_by_skill("RESEARCH").len(), 1);
        assert!(directory.find_by_skill("piloting").is_empty());
    }

    #[tokio::test]
    async fn test_load_known_agents() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("known-agents.json"),
            r#"[{"name": "scout", "description": "scout", "skills": ["research"]}]"#,
        )
        .await
        .unwrap();

        let directory = AgentDirectory::new();
        directory.load_known_agents(dir.path()).await.unwrap();
        assert!(directory.get("scout").is_some());

        // Missing file is not an error.
        let empty = tempfile::tempdir().unwrap();
        AgentDirectory::new()
            .load_known_agents(empty.path())
            .await
            .unwrap();
    }

    #[test]
    fn test_tracker_resolves_once() {
        let tracker = A2aTracker::new();
        tracker.track(PendingA2aTask {
            task_id: "t1".to_string(),
            target_agent: "scout".to_string(),
            session_id: Some("s1".to_string()),
            started_at: Utc::now(),
        });

        assert!(tracker.resolve("t1").is_some());
        assert!(tracker.resolve("t1").is_none());
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_invoke_agent_requires_known_target() {
        let bus = Arc::new(rockbot_bus::InMemoryBus::new("test"));
        let tracker = Arc::new(A2aTracker::new());
        let directory = Arc::new(AgentDirectory::new());
        let client = A2aClient::new(
            bus,
            tracker.clone(),
            directory.clone(),
            "caller",
            "agent.task.result",
        );

        let denied = client
            .invoke_agent("ghost", None, "do things".to_string(), None)
            .await;
        assert!(denied.is_err());
        assert!(tracker.is_empty());

        directory.upsert(card("ghost", &[]));
        let accepted = client
            .invoke_agent("ghost", None, "do things".to_string(), Some("s1".to_string()))
            .await
            .unwrap();
        assert!(accepted.starts_with("task_id: "));
        assert_eq!(tracker.len(), 1);
    }
}
