//! Declarative assembly of a complete agent process.
//!
//! [`AgentRuntimeBuilder`] composes the pieces of this crate onto an
//! [`AgentHost`]: stores, profile, orchestrator, and the optional
//! feature surfaces (feedback, history, MCP tool proxying, A2A,
//! subagents, heartbeat). Every `with_*` call is additive and
//! order-independent; `build` wires handlers and subscriptions and
//! returns the ready-to-start host.

use std::sync::Arc;
use std::time::Duration;

use rockbot_bus::MessageBus;
use rockbot_host::AgentHost;
use rockbot_proto::{topics, AgentCard};

use crate::a2a::{
    register_invoke_agent_tool, A2aCancelHandler, A2aClient, A2aErrorHandler, A2aResultHandler,
    A2aResultRouter, A2aStatusHandler, A2aTaskHandler, A2aTracker, AgentDirectory,
    AgentTaskDelegate,
};
use crate::behavior::ModelBehaviorRegistry;
use crate::config::AgentConfig;
use crate::context::ContextAssembler;
use crate::error::AgentError;
use crate::feedback::FeedbackHandler;
use crate::heartbeat::{HeartbeatDirectoryHandler, HeartbeatService};
use crate::history::ConversationHistoryHandler;
use crate::llm::ChatClient;
use crate::memory::{
    ConversationMemory, InMemoryConversationMemory, InMemoryLongTermMemory, InMemoryRulesStore,
    InMemorySkillStore, InMemoryWorkingMemory, LongTermMemory, RulesStore, SkillStore,
    WorkingMemory,
};
use crate::orchestrator::{TurnOrchestrator, TurnOrchestratorConfig, UserMessageHandler};
use crate::profile::AgentProfile;
use crate::reply::ReplyPublisher;
use crate::serializer::{SessionTaskTracker, WorkSerializer};
use crate::subagent::{
    register_subagent_tools, SubagentManager, SubagentRunner, SubagentTracker,
};
use crate::tools::builtin::register_builtin_tools;
use crate::tools::proxy::{
    BusToolExecutor, McpToolsAvailableHandler, PendingInvocations, ToolErrorHandler,
    ToolResponseHandler,
};
use crate::tools::ToolRegistry;
use crate::whiteboard::{register_whiteboard_tools, Whiteboard};

/// A built agent runtime: the host plus the orchestrator driving it.
pub struct AgentRuntime {
    pub host: AgentHost,
    pub orchestrator: Arc<TurnOrchestrator>,
    pub registry: Arc<ToolRegistry>,
}

pub struct AgentRuntimeBuilder {
    config: AgentConfig,
    bus: Arc<dyn MessageBus>,
    chat: Arc<dyn ChatClient>,
    profile: Option<AgentProfile>,
    conversation: Arc<dyn ConversationMemory>,
    long_term: Arc<dyn LongTermMemory>,
    working: Arc<dyn WorkingMemory>,
    skills: Arc<dyn SkillStore>,
    rules: Arc<dyn RulesStore>,
    behaviors: ModelBehaviorRegistry,
    feedback: bool,
    history: bool,
    mcp_proxy: bool,
    whiteboard: bool,
    heartbeat: Option<Duration>,
    a2a: bool,
    a2a_delegate: Option<Arc<dyn AgentTaskDelegate>>,
    subagent_runner: Option<Arc<dyn SubagentRunner>>,
}

impl AgentRuntimeBuilder {
    /// Start from a bus and a chat client; every store defaults to its
    /// in-memory implementation.
    pub fn new(config: AgentConfig, bus: Arc<dyn MessageBus>, chat: Arc<dyn ChatClient>) -> Self {
        Self {
            config,
            bus,
            chat,
            profile: None,
            conversation: Arc::new(InMemoryConversationMemory::new()),
            long_term: Arc::new(InMemoryLongTermMemory::new()),
            working: Arc::new(InMemoryWorkingMemory::new()),
            skills: Arc::new(InMemorySkillStore::new()),
            rules: Arc::new(InMemoryRulesStore::new()),
            behaviors: ModelBehaviorRegistry::default(),
            feedback: false,
            history: false,
            mcp_proxy: false,
            whiteboard: false,
            heartbeat: None,
            a2a: false,
            a2a_delegate: None,
            subagent_runner: None,
        }
    }

    /// Use an already-loaded profile instead of reading the data volume.
    pub fn with_profile(mut self, profile: AgentProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn with_conversation_log(mut self, conversation: Arc<dyn ConversationMemory>) -> Self {
        self.conversation = conversation;
        self
    }

    pub fn with_memory(
        mut self,
        long_term: Arc<dyn LongTermMemory>,
        working: Arc<dyn WorkingMemory>,
    ) -> Self {
        self.long_term = long_term;
        self.working = working;
        self
    }

    pub fn with_skills(mut self, skills: Arc<dyn SkillStore>) -> Self {
        self.skills = skills;
        self
    }

    pub fn with_rules(mut self, rules: Arc<dyn RulesStore>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_behaviors(mut self, behaviors: ModelBehaviorRegistry) -> Self {
        self.behaviors = behaviors;
        self
    }

    /// React to thumbs-down feedback with a re-evaluation.
    pub fn with_feedback(mut self) -> Self {
        self.feedback = true;
        self
    }

    /// Answer conversation-history requests.
    pub fn with_history(mut self) -> Self {
        self.history = true;
        self
    }

    /// Proxy tools advertised by MCP bridges over the bus.
    pub fn with_mcp_tool_proxy(mut self) -> Self {
        self.mcp_proxy = true;
        self
    }

    /// Shared whiteboard tools for subagent handoff.
    pub fn with_whiteboard(mut self) -> Self {
        self.whiteboard = true;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = Some(interval);
        self
    }

    /// A2A caller side: the `invoke_agent` tool plus result routing.
    pub fn with_a2a(mut self) -> Self {
        self.a2a = true;
        self
    }

    /// A2A handler side: accept incoming task requests via this delegate.
    pub fn with_a2a_handler(mut self, delegate: Arc<dyn AgentTaskDelegate>) -> Self {
        self.a2a = true;
        self.a2a_delegate = Some(delegate);
        self
    }

    /// In-process subagents driven by this runner.
    pub fn with_subagents(mut self, runner: Arc<dyn SubagentRunner>) -> Self {
        self.subagent_runner = Some(runner);
        self
    }

    pub async fn build(mut self) -> Result<AgentRuntime, AgentError> {
        let agent_name = self.config.agent_name.clone();
        let profile = match self.profile.take() {
            Some(profile) => profile,
            None => AgentProfile::load(&self.config.data_volume).await?,
        };
        self.behaviors.load_overrides(&self.config.data_volume).await;

        let session_start = tokio::fs::read_to_string(
            self.config.data_volume.join("session-start.md"),
        )
        .await
        .ok();
        let assembler = Arc::new(
            ContextAssembler::new(
                Arc::new(profile),
                self.conversation.clone(),
                self.long_term.clone(),
                self.working.clone(),
                self.skills.clone(),
                self.rules.clone(),
            )
            .with_session_start_briefing(session_start),
        );

        let registry = Arc::new(ToolRegistry::new());
        register_builtin_tools(
            &registry,
            self.long_term.clone(),
            self.working.clone(),
            self.skills.clone(),
            self.rules.clone(),
        )?;
        if self.whiteboard {
            register_whiteboard_tools(&registry, Whiteboard::new())?;
        }

        let replies = Arc::new(ReplyPublisher::new(
            self.bus.clone(),
            agent_name.clone(),
            self.config.default_reply_topic.clone(),
        ));
        let orchestrator = TurnOrchestrator::new(
            TurnOrchestratorConfig {
                max_tool_iterations: self.config.max_tool_iterations,
                tool_timeout: self.config.tool_timeout,
                progress_interval: self.config.progress_interval,
            },
            self.chat.clone(),
            registry.clone(),
            assembler,
            self.conversation.clone(),
            Arc::new(WorkSerializer::new()),
            Arc::new(SessionTaskTracker::new()),
            Arc::new(self.behaviors),
            replies,
        );

        let mut host = AgentHost::builder()
            .identity(agent_name.clone())
            .bus(self.bus.clone())
            .handle(Arc::new(UserMessageHandler(orchestrator.clone())))
            .subscribe_to(topics::user_message(&self.config.user_proxy));

        if self.feedback {
            host = host
                .handle(Arc::new(FeedbackHandler(orchestrator.clone())))
                .subscribe_to(topics::user_feedback(&self.config.user_proxy));
        }
        if self.history {
            host = host
                .handle(Arc::new(ConversationHistoryHandler::new(
                    self.bus.clone(),
                    self.conversation.clone(),
                    agent_name.clone(),
                    self.config.default_reply_topic.clone(),
                )))
                .subscribe_to(topics::conversation_history_request(&self.config.user_proxy));
        }
        if self.mcp_proxy {
            let pending = Arc::new(PendingInvocations::new());
            let executor = Arc::new(BusToolExecutor::new(
                self.bus.clone(),
                pending.clone(),
                agent_name.clone(),
                self.config.tool_timeout,
            ));
            host = host
                .handle(Arc::new(ToolResponseHandler(pending.clone())))
                .handle(Arc::new(ToolErrorHandler(pending)))
                .handle(Arc::new(McpToolsAvailableHandler::new(
                    registry.clone(),
                    executor,
                )))
                .subscribe_to(topics::tool_result(&agent_name))
                .subscribe_to(topics::mcp_tools_meta(&agent_name));
        }
        if self.a2a {
            let directory = Arc::new(AgentDirectory::new());
            directory
                .load_known_agents(&self.config.data_volume)
                .await?;
            let tracker = Arc::new(A2aTracker::new());
            let client = A2aClient::new(
                self.bus.clone(),
                tracker.clone(),
                directory.clone(),
                agent_name.clone(),
                "agent.task.result",
            );
            register_invoke_agent_tool(&registry, client.clone())?;
            let router = A2aResultRouter::new(tracker, self.conversation.clone());
            host = host
                .handle(Arc::new(A2aStatusHandler(router.clone())))
                .handle(Arc::new(A2aResultHandler(router.clone())))
                .handle(Arc::new(A2aErrorHandler(router)))
                .handle(Arc::new(HeartbeatDirectoryHandler(directory)))
                .subscribe_to(client.result_topic())
                .subscribe_to(topics::AGENT_HEARTBEAT);
            if let Some(delegate) = self.a2a_delegate.take() {
                host = host
                    .handle(Arc::new(A2aTaskHandler::new(
                        self.bus.clone(),
                        delegate,
                        agent_name.clone(),
                        "agent.task.status".to_string(),
                        "agent.task.result".to_string(),
                    )))
                    .handle(Arc::new(A2aCancelHandler::new(
                        self.bus.clone(),
                        agent_name.clone(),
                        "agent.task.result".to_string(),
                    )))
                    .subscribe_to(topics::agent_task(&agent_name))
                    .subscribe_to(topics::agent_task_cancel(&agent_name));
            }
        }
        if let Some(runner) = self.subagent_runner.take() {
            let manager = SubagentManager::new(
                SubagentTracker::new(self.config.max_concurrent_subagents),
                runner,
                self.bus.clone(),
                self.conversation.clone(),
                agent_name.clone(),
                format!("subagent.result.{agent_name}"),
            );
            register_subagent_tools(&registry, manager)?;
        }
        if let Some(interval) = self.heartbeat {
            let card = AgentCard {
                name: agent_name.clone(),
                description: format!("{agent_name} agent"),
                version: None,
                skills: Vec::new(),
            };
            host = host.hosted_service(HeartbeatService::new(self.bus.clone(), card, interval));
        }

        let host = host.build().map_err(|e| AgentError::Config(e.to_string()))?;
        Ok(AgentRuntime {
            host,
            orchestrator,
            registry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatRequest, ChatResponse};
    use crate::profile::MarkdownDoc;
    use crate::LlmError;
    use async_trait::async_trait;
    use rockbot_bus::{handler_fn, Envelope, InMemoryBus, MessageResult};
    use rockbot_proto::{AgentReply, UserMessage};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct CannedChat(&'static str);

    #[async_trait]
    impl ChatClient for CannedChat {
        fn model_id(&self) -> &str {
            "canned"
        }

        async fn complete(
            &self,
            _request: ChatRequest,
            _token: CancellationToken,
        ) -> Result<ChatResponse, LlmError> {
            Ok(ChatResponse {
                content: self.0.to_string(),
                tool_calls: Vec::new(),
            })
        }
    }

    fn test_profile() -> AgentProfile {
        AgentProfile {
            soul: MarkdownDoc::parse("I am Rock."),
            directives: MarkdownDoc::parse("Answer plainly."),
            style: None,
            memory_rules: None,
        }
    }

    #[tokio::test]
    async fn test_runtime_builds_and_serves_a_turn() {
        let bus = Arc::new(InMemoryBus::new("test"));
        let runtime = AgentRuntimeBuilder::new(
            AgentConfig::default(),
            bus.clone(),
            Arc::new(CannedChat("hi there")),
        )
        .with_profile(test_profile())
        .with_feedback()
        .with_history()
        .with_mcp_tool_proxy()
        .with_whiteboard()
        .with_a2a()
        .build()
        .await
        .unwrap();

        // Built-in, whiteboard, and invoke_agent tools are registered.
        assert!(runtime.registry.contains("remember"));
        assert!(runtime.registry.contains("whiteboard_write"));
        assert!(runtime.registry.contains("invoke_agent"));

        runtime.host.start().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = bus
            .subscribe(
                "user.proxy.userResponse",
                "runtime-test-listener",
                handler_fn(move |envelope, _| {
                    let tx = tx.clone();
                    async move {
                        if let Some(reply) = envelope.payload::<AgentReply>() {
                            let _ = tx.send(reply);
                        }
                        MessageResult::Ack
                    }
                }),
            )
            .await
            .unwrap();

        let message = UserMessage {
            user_id: "u1".to_string(),
            session_id: "s1".to_string(),
            content: "hello".to_string(),
        };
        bus.publish(
            "user.proxy.userMessage",
            Envelope::from_payload(&message, "user.proxy").unwrap(),
        )
        .await
        .unwrap();

        let reply = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.content, "hi there");
        assert!(reply.is_final);

        sub.dispose().await;
        runtime.host.shutdown().await;
    }
}
