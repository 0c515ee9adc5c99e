//! Shared test doubles and harness for orchestrator integration tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rockbot_agent::behavior::{ModelBehavior, ModelBehaviorRegistry};
use rockbot_agent::context::ContextAssembler;
use rockbot_agent::feedback::FeedbackHandler;
use rockbot_agent::llm::{ChatClient, ChatRequest, ChatResponse, ToolCall};
use rockbot_agent::memory::{
    InMemoryConversationMemory, InMemoryLongTermMemory, InMemoryRulesStore, InMemorySkillStore,
    InMemoryWorkingMemory,
};
use rockbot_agent::profile::{AgentProfile, MarkdownDoc};
use rockbot_agent::tools::{register_tool, AgentTool, ToolCallContext, ToolRegistry};
use rockbot_agent::{
    LlmError, ReplyPublisher, SessionTaskTracker, ToolExecError, TurnOrchestrator,
    TurnOrchestratorConfig, UserMessageHandler, WorkSerializer,
};
use rockbot_bus::{handler_fn, Envelope, InMemoryBus, MessageBus, MessageResult, ReconnectPolicy};
use rockbot_host::AgentHost;
use rockbot_proto::{topics, AgentReply, UserFeedback, UserMessage};
use schemars::JsonSchema;
use serde::Deserialize;
use tokio::sync::mpsc;

/// One scripted model response.
pub enum Scripted {
    Text(&'static str),
    ToolCall(&'static str, &'static str),
    Error(&'static str),
}

/// A scripted chat client that records the tool count of every request.
#[derive(Clone, Default)]
pub struct MockChatClient {
    script: Arc<Mutex<VecDeque<Scripted>>>,
    tool_counts: Arc<Mutex<Vec<usize>>>,
}

impl MockChatClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, step: Scripted) {
        self.script.lock().push_back(step);
    }

    pub fn call_count(&self) -> usize {
        self.tool_counts.lock().len()
    }

    /// Tools offered on the n-th call (0-based).
    pub fn tools_offered(&self, call: usize) -> usize {
        self.tool_counts.lock()[call]
    }
}

#[async_trait]
impl ChatClient for MockChatClient {
    fn model_id(&self) -> &str {
        "mock-model"
    }

    async fn complete(
        &self,
        request: ChatRequest,
        _token: tokio_util::sync::CancellationToken,
    ) -> Result<ChatResponse, LlmError> {
        self.tool_counts.lock().push(request.tools.len());
        let step = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(Scripted::Text("ok"));
        match step {
            Scripted::Text(text) => Ok(ChatResponse {
                content: text.to_string(),
                tool_calls: Vec::new(),
            }),
            Scripted::ToolCall(name, arguments) => Ok(ChatResponse {
                content: String::new(),
                tool_calls: vec![ToolCall {
                    id: uuid_like(),
                    name: name.to_string(),
                    arguments: arguments.to_string(),
                }],
            }),
            Scripted::Error(message) => Err(LlmError::RateLimited(message.to_string())),
        }
    }
}

fn uuid_like() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    format!("call-{}", NEXT.fetch_add(1, Ordering::SeqCst))
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct NoArgs {}

/// Instant tool returning a fixed string.
pub struct NoopTool;

impl AgentTool for NoopTool {
    type Args = NoArgs;

    fn name(&self) -> &str {
        "noop_tool"
    }

    fn description(&self) -> &str {
        "Does nothing, quickly"
    }

    async fn execute(
        &self,
        _args: NoArgs,
        _call: &ToolCallContext,
    ) -> Result<String, ToolExecError> {
        Ok("noop done".to_string())
    }
}

/// Tool that hangs until cancelled, for cancellation tests.
pub struct SlowTool;

impl AgentTool for SlowTool {
    type Args = NoArgs;

    fn name(&self) -> &str {
        "slow_tool"
    }

    fn description(&self) -> &str {
        "Takes a very long time"
    }

    async fn execute(
        &self,
        _args: NoArgs,
        call: &ToolCallContext,
    ) -> Result<String, ToolExecError> {
        tokio::select! {
            _ = call.token.cancelled() => Err(ToolExecError::failed("cancelled")),
            _ = tokio::time::sleep(Duration::from_secs(30)) => Ok("finally".to_string()),
        }
    }
}

pub struct TestAgent {
    pub bus: Arc<InMemoryBus>,
    pub chat: MockChatClient,
    pub conversation: Arc<InMemoryConversationMemory>,
    pub registry: Arc<ToolRegistry>,
    pub host: AgentHost,
    pub replies: mpsc::UnboundedReceiver<AgentReply>,
}

impl TestAgent {
    pub async fn start() -> Self {
        Self::start_with_config(TurnOrchestratorConfig::default()).await
    }

    pub async fn start_with_config(config: TurnOrchestratorConfig) -> Self {
        let bus = Arc::new(InMemoryBus::new("test").with_reconnect_policy(ReconnectPolicy {
            initial_delay: Duration::from_millis(20),
            multiplier: 2,
            max_delay: Duration::from_millis(100),
        }));
        let chat = MockChatClient::new();

        let profile = Arc::new(AgentProfile {
            soul: MarkdownDoc::parse("I am Rock, a test agent."),
            directives: MarkdownDoc::parse("Answer plainly."),
            style: None,
            memory_rules: None,
        });
        let conversation = Arc::new(InMemoryConversationMemory::new());
        let long_term = Arc::new(InMemoryLongTermMemory::new());
        let working = Arc::new(InMemoryWorkingMemory::new());
        let skills = Arc::new(InMemorySkillStore::new());
        let rules = Arc::new(InMemoryRulesStore::new());
        let assembler = Arc::new(ContextAssembler::new(
            profile,
            conversation.clone(),
            long_term,
            working,
            skills,
            rules,
        ));

        let registry = Arc::new(ToolRegistry::new());
        register_tool(&registry, NoopTool).unwrap();
        register_tool(&registry, SlowTool).unwrap();

        let replies = Arc::new(ReplyPublisher::new(
            bus.clone(),
            "rock",
            topics::user_response("user.proxy"),
        ));
        let orchestrator = TurnOrchestrator::new(
            config,
            Arc::new(chat.clone()),
            registry.clone(),
            assembler,
            conversation.clone(),
            Arc::new(WorkSerializer::new()),
            Arc::new(SessionTaskTracker::new()),
            Arc::new(ModelBehaviorRegistry::new(vec![ModelBehavior::default()])),
            replies,
        );

        let host = AgentHost::builder()
            .identity("rock")
            .bus(bus.clone())
            .handle(Arc::new(UserMessageHandler(orchestrator.clone())))
            .handle(Arc::new(FeedbackHandler(orchestrator)))
            .subscribe_to(topics::user_message("user.proxy"))
            .subscribe_to(topics::user_feedback("user.proxy"))
            .build()
            .unwrap();
        host.start().await.unwrap();

        // Capture everything published to the user-response topic.
        let (tx, rx) = mpsc::unbounded_channel();
        let reply_sub = bus
            .subscribe(
                &topics::user_response("user.proxy"),
                "test-reply-listener",
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
        // The listener lives as long as the test agent.
        std::mem::forget(reply_sub);

        Self {
            bus,
            chat,
            conversation,
            registry,
            host,
            replies: rx,
        }
    }

    pub async fn send_user(&self, session_id: &str, content: &str) {
        let message = UserMessage {
            user_id: "u1".to_string(),
            session_id: session_id.to_string(),
            content: content.to_string(),
        };
        let envelope = Envelope::from_payload(&message, "user.proxy")
            .unwrap()
            .with_reply_to(topics::user_response("user.proxy"));
        self.bus
            .publish(&topics::user_message("user.proxy"), envelope)
            .await
            .unwrap();
    }

    pub async fn send_feedback(&self, session_id: &str, is_positive: bool) {
        let feedback = UserFeedback {
            message_id: "m1".to_string(),
            session_id: session_id.to_string(),
            is_positive,
            agent_name: Some("rock".to_string()),
        };
        let envelope = Envelope::from_payload(&feedback, "user.proxy")
            .unwrap()
            .with_reply_to(topics::user_response("user.proxy"));
        self.bus
            .publish(&topics::user_feedback("user.proxy"), envelope)
            .await
            .unwrap();
    }

    /// Collect replies until the next final one, returning all of them.
    pub async fn replies_until_final(&mut self) -> Vec<AgentReply> {
        let mut collected = Vec::new();
        loop {
            let reply = tokio::time::timeout(Duration::from_secs(5), self.replies.recv())
                .await
                .expect("timed out waiting for a final reply")
                .expect("reply stream closed");
            let is_final = reply.is_final;
            collected.push(reply);
            if is_final {
                return collected;
            }
        }
    }

    /// Assert no further reply arrives within the window.
    pub async fn assert_quiet(&mut self, window: Duration) {
        if let Ok(Some(reply)) = tokio::time::timeout(window, self.replies.recv()).await {
            panic!("unexpected reply: {:?}", reply);
        }
    }
}
