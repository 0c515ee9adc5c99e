//! A complete single-process agent on the in-memory bus.
//!
//! The "model" here just echoes the user's words back, so the example
//! runs without any provider credentials. Run with:
//!
//! ```bash
//! cargo run -p rockbot-agent --example echo_agent
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rockbot_agent::behavior::ModelBehaviorRegistry;
use rockbot_agent::context::ContextAssembler;
use rockbot_agent::llm::{ChatClient, ChatRequest, ChatResponse};
use rockbot_agent::memory::{
    InMemoryConversationMemory, InMemoryLongTermMemory, InMemoryRulesStore, InMemorySkillStore,
    InMemoryWorkingMemory,
};
use rockbot_agent::profile::{AgentProfile, MarkdownDoc};
use rockbot_agent::tools::builtin::register_builtin_tools;
use rockbot_agent::tools::ToolRegistry;
use rockbot_agent::{
    LlmError, ReplyPublisher, SessionTaskTracker, TurnOrchestrator, TurnOrchestratorConfig,
    UserMessageHandler, WorkSerializer,
};
use rockbot_bus::{handler_fn, Envelope, InMemoryBus, MessageBus, MessageResult};
use rockbot_host::AgentHost;
use rockbot_proto::{topics, AgentReply, UserMessage};
use tokio_util::sync::CancellationToken;

struct EchoChatClient;

#[async_trait]
impl ChatClient for EchoChatClient {
    fn model_id(&self) -> &str {
        "echo-1"
    }

    async fn complete(
        &self,
        request: ChatRequest,
        _token: CancellationToken,
    ) -> Result<ChatResponse, LlmError> {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == rockbot_agent::ChatRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(ChatResponse {
            content: format!("You said: {last_user}"),
            tool_calls: Vec::new(),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let bus = Arc::new(InMemoryBus::new("rockbot"));

    let profile = Arc::new(AgentProfile {
        soul: MarkdownDoc::parse("I am Echo, the smallest possible RockBot agent."),
        directives: MarkdownDoc::parse("Repeat what the user says."),
        style: None,
        memory_rules: None,
    });
    let conversation = Arc::new(InMemoryConversationMemory::new());
    let long_term = Arc::new(InMemoryLongTermMemory::new());
    let working = Arc::new(InMemoryWorkingMemory::new());
    let skills = Arc::new(InMemorySkillStore::new());
    let rules = Arc::new(InMemoryRulesStore::new());

    let registry = Arc::new(ToolRegistry::new());
    register_builtin_tools(
        &registry,
        long_term.clone(),
        working.clone(),
        skills.clone(),
        rules.clone(),
    )?;

    let assembler = Arc::new(ContextAssembler::new(
        profile,
        conversation.clone(),
        long_term,
        working,
        skills,
        rules,
    ));
    let replies = Arc::new(ReplyPublisher::new(
        bus.clone(),
        "echo",
        topics::user_response("user.proxy"),
    ));
    let orchestrator = TurnOrchestrator::new(
        TurnOrchestratorConfig::default(),
        Arc::new(EchoChatClient),
        registry,
        assembler,
        conversation,
        Arc::new(WorkSerializer::new()),
        Arc::new(SessionTaskTracker::new()),
        Arc::new(ModelBehaviorRegistry::default()),
        replies,
    );

    let host = AgentHost::builder()
        .identity("echo")
        .bus(bus.clone())
        .handle(Arc::new(UserMessageHandler(orchestrator)))
        .subscribe_to(topics::user_message("user.proxy"))
        .build()?;
    host.start().await?;

    // Stand in for the front-end: print every reply.
    let _listener = bus
        .subscribe(
            &topics::user_response("user.proxy"),
            "demo-front-end",
            handler_fn(|envelope, _| async move {
                if let Some(reply) = envelope.payload::<AgentReply>() {
                    println!(
                        "[{}] {}{}",
                        reply.session_id,
                        reply.content,
                        if reply.is_final { " (final)" } else { "" }
                    );
                }
                MessageResult::Ack
            }),
        )
        .await?;

    let message = UserMessage {
        user_id: "demo".to_string(),
        session_id: "demo-session".to_string(),
        content: "hello from the bus".to_string(),
    };
    bus.publish(
        &topics::user_message("user.proxy"),
        Envelope::from_payload(&message, "user.proxy")?
            .with_reply_to(topics::user_response("user.proxy")),
    )
    .await?;

    tokio::time::sleep(Duration::from_millis(500)).await;
    host.shutdown().await;
    Ok(())
}
