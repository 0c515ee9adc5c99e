//! In-process subagents.
//!
//! A subagent is a bounded background task spawned from a parent session.
//! `spawn_subagent` allocates a task id and returns immediately; progress
//! reports become synthetic user turns in the parent session, and
//! completion publishes a `SubagentResultMessage`. Concurrency is capped
//! per process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rockbot_bus::{Envelope, MessageBus};
use rockbot_proto::SubagentResultMessage;
use schemars::JsonSchema;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ToolExecError;
use crate::llm::{ChatClient, ChatMessage, ChatRequest};
use crate::memory::{ConversationMemory, ConversationTurn, TurnRole};
use crate::tools::{register_tool, AgentTool, ToolCallContext, ToolRegistry};

pub const DEFAULT_MAX_CONCURRENT: usize = 3;

struct SubagentTask {
    session_id: String,
    token: CancellationToken,
    started_at: DateTime<Utc>,
}

/// Tracks running subagents, capped at `max_concurrent`.
pub struct SubagentTracker {
    tasks: Mutex<HashMap<String, SubagentTask>>,
    max_concurrent: usize,
}

impl SubagentTracker {
    pub fn new(max_concurrent: usize) -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(HashMap::new()),
            max_concurrent: max_concurrent.max(1),
        })
    }

    /// Reserve a task slot. `None` when the cap is reached.
    fn begin(&self, session_id: &str) -> Option<(String, CancellationToken)> {
        let mut tasks = self.tasks.lock();
        if tasks.len() >= self.max_concurrent {
            return None;
        }
        let task_id = Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        tasks.insert(
            task_id.clone(),
            SubagentTask {
                session_id: session_id.to_string(),
                token: token.clone(),
                started_at: Utc::now(),
            },
        );
        Some((task_id, token))
    }

    fn finish(&self, task_id: &str) {
        self.tasks.lock().remove(task_id);
    }

    pub fn running(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn session_of(&self, task_id: &str) -> Option<String> {
        self.tasks.lock().get(task_id).map(|t| t.session_id.clone())
    }

    pub fn started_at(&self, task_id: &str) -> Option<DateTime<Utc>> {
        self.tasks.lock().get(task_id).map(|t| t.started_at)
    }

    /// Cancel everything; used at shutdown.
    pub fn cancel_all(&self) {
        for task in self.tasks.lock().values() {
            task.token.cancel();
        }
    }
}

/// Executes the actual subagent work.
#[async_trait]
pub trait SubagentRunner: Send + Sync {
    async fn run(
        &self,
        task_id: &str,
        prompt: &str,
        token: CancellationToken,
    ) -> Result<String, String>;
}

/// Default runner: a single focused model call under the subagent's own
/// working-memory namespace.
pub struct ChatSubagentRunner {
    chat: Arc<dyn ChatClient>,
}

impl ChatSubagentRunner {
    pub fn new(chat: Arc<dyn ChatClient>) -> Arc<Self> {
        Arc::new(Self { chat })
    }
}

#[async_trait]
impl SubagentRunner for ChatSubagentRunner {
    async fn run(
        &self,
        task_id: &str,
        prompt: &str,
        token: CancellationToken,
    ) -> Result<String, String> {
        let request = ChatRequest {
            messages: vec![
                ChatMessage::system(format!(
                    "You are subagent {task_id}. Complete the task below and answer with the \
                     result only. Your working-memory namespace is subagent/{task_id}."
                )),
                ChatMessage::user(prompt),
            ],
            tools: Vec::new(),
        };
        self.chat
            .complete(request, token)
            .await
            .map(|r| r.content)
            .map_err(|e| e.to_string())
    }
}

/// Owns spawn/report/complete plumbing for subagents.
pub struct SubagentManager {
    tracker: Arc<SubagentTracker>,
    runner: Arc<dyn SubagentRunner>,
    bus: Arc<dyn MessageBus>,
    conversation: Arc<dyn ConversationMemory>,
    agent_name: String,
    result_topic: String,
}

impl SubagentManager {
    pub fn new(
        tracker: Arc<SubagentTracker>,
        runner: Arc<dyn SubagentRunner>,
        bus: Arc<dyn MessageBus>,
        conversation: Arc<dyn ConversationMemory>,
        agent_name: impl Into<String>,
        result_topic: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tracker,
            runner,
            bus,
            conversation,
            agent_name: agent_name.into(),
            result_topic: result_topic.into(),
        })
    }

    pub fn tracker(&self) -> Arc<SubagentTracker> {
        self.tracker.clone()
    }

    /// Spawn a subagent. Returns the task id immediately.
    pub fn spawn(self: Arc<Self>, session_id: &str, prompt: String) -> Result<String, ToolExecError> {
        let Some((task_id, token)) = self.tracker.begin(session_id) else {
            return Err(ToolExecError::failed(format!(
                "subagent limit reached ({} running); wait for one to finish",
                self.tracker.running()
            )));
        };

        let manager = self;
        let session_id = session_id.to_string();
        let spawned_id = task_id.clone();
        tokio::spawn(async move {
            let outcome = manager
                .runner
                .run(&spawned_id, &prompt, token.clone())
                .await;
            manager.tracker.finish(&spawned_id);
            if token.is_cancelled() {
                return;
            }
            let (content, is_error) = match outcome {
                Ok(content) => (content, false),
                Err(error) => (error, true),
            };
            let result = SubagentResultMessage {
                task_id: spawned_id.clone(),
                session_id: session_id.clone(),
                content: content.clone(),
                is_error,
            };
            match Envelope::from_payload(&result, &manager.agent_name) {
                Ok(envelope) => {
                    if let Err(err) = manager.bus.publish(&manager.result_topic, envelope).await {
                        tracing::warn!(error = %err, "failed to publish subagent result");
                    }
                }
                Err(err) => tracing::warn!(error = %err, "failed to encode subagent result"),
            }
            // The parent session sees the result on its next turn.
            let prefix = if is_error { "failed" } else { "finished" };
            if let Err(err) = manager
                .conversation
                .add_turn(
                    &session_id,
                    ConversationTurn::new(
                        TurnRole::System,
                        format!("Subagent {spawned_id} {prefix}: {content}"),
                    ),
                )
                .await
            {
                tracing::warn!(error = %err, "failed to record subagent result turn");
            }
        });

        Ok(task_id)
    }

    /// A progress report from a running subagent becomes a synthetic user
    /// turn in the parent session.
    pub async fn report_progress(&self, task_id: &str, update: &str) -> Result<(), ToolExecError> {
        let Some(session_id) = self.tracker.session_of(task_id) else {
            return Err(ToolExecError::failed(format!(
                "no running subagent with task id {task_id}"
            )));
        };
        self.conversation
            .add_turn(
                &session_id,
                ConversationTurn::new(
                    TurnRole::User,
                    format!("[subagent {task_id} progress] {update}"),
                ),
            )
            .await
            .map_err(|e| ToolExecError::failed(e.to_string()))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SpawnSubagentArgs {
    /// The task for the subagent to work on.
    pub prompt: String,
}

struct SpawnSubagentTool(Arc<SubagentManager>);

impl AgentTool for SpawnSubagentTool {
    type Args = SpawnSubagentArgs;

    fn name(&self) -> &str {
        "spawn_subagent"
    }

    fn description(&self) -> &str {
        "Spawn a background subagent for a bounded task; returns its task id immediately"
    }

    async fn execute(
        &self,
        args: SpawnSubagentArgs,
        call: &ToolCallContext,
    ) -> Result<String, ToolExecError> {
        let session_id = call
            .session_id
            .as_deref()
            .ok_or_else(|| ToolExecError::failed("subagents require a session"))?;
        let task_id = self.0.clone().spawn(session_id, args.prompt)?;
        Ok(format!("task_id: {task_id}"))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReportProgressArgs {
    /// Task id of the reporting subagent.
    pub task_id: String,
    pub update: String,
}

struct ReportProgressTool(Arc<SubagentManager>);

impl AgentTool for ReportProgressTool {
    type Args = ReportProgressArgs;

    fn name(&self) -> &str {
        "report_progress"
    }

    fn description(&self) -> &str {
        "Report subagent progress back to the parent session"
    }

    async fn execute(
        &self,
        args: ReportProgressArgs,
        _call: &ToolCallContext,
    ) -> Result<String, ToolExecError> {
        self.0.report_progress(&args.task_id, &args.update).await?;
        Ok("Progress recorded.".to_string())
    }
}

/// Register the subagent tool set.
pub fn register_subagent_tools(
    registry: &ToolRegistry,
    manager: Arc<SubagentManager>,
) -> Result<(), ToolExecError> {
    register_tool(registry, SpawnSubagentTool(manager.clone()))?;
    register_tool(registry, ReportProgressTool(manager))?;
    Ok(())
}
