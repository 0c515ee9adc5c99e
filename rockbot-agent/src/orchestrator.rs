//! The turn orchestrator: one user message in, one final reply out.
//!
//! On every incoming user message the handler records the turn, begins a
//! fresh session token (cancelling any background loop still running for
//! the same session), assembles context, and makes the first model call.
//! Plain text ends the turn immediately; tool calls (native, text-parsed,
//! or a model-specific setup phrase) publish a non-final ack and continue
//! in a background loop that holds the process work slot.
//!
//! Tool failures never abort the loop — they become tool-result messages
//! so the model can recover. Model failures abort the turn with a final
//! apology, recorded as an assistant turn before publication.
//! Cancellation caused by a newer user message is always silent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rockbot_host::{HandlerContext, HandlerError, TypedHandler};
use rockbot_proto::{ToolInvokeRequest, UserMessage};
use tokio_util::sync::CancellationToken;

use crate::behavior::{ModelBehavior, ModelBehaviorRegistry};
use crate::context::ContextAssembler;
use crate::llm::{ChatClient, ChatMessage, ChatRequest, ChatResponse, ToolCall};
use crate::memory::{ConversationMemory, ConversationTurn};
use crate::reply::ReplyPublisher;
use crate::serializer::{SessionTaskTracker, WorkSerializer, WorkSlot};
use crate::text_calls::parse_text_tool_calls;
use crate::tools::ToolRegistry;

#[derive(Debug, Clone)]
pub struct TurnOrchestratorConfig {
    pub max_tool_iterations: usize,
    pub tool_timeout: Duration,
    pub progress_interval: Duration,
}

impl Default for TurnOrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: 5,
            tool_timeout: Duration::from_secs(60),
            progress_interval: Duration::from_secs(5),
        }
    }
}

/// The stateful core loop of an agent.
pub struct TurnOrchestrator {
    config: TurnOrchestratorConfig,
    chat: Arc<dyn ChatClient>,
    registry: Arc<ToolRegistry>,
    assembler: Arc<ContextAssembler>,
    conversation: Arc<dyn ConversationMemory>,
    serializer: Arc<WorkSerializer>,
    sessions: Arc<SessionTaskTracker>,
    behaviors: Arc<ModelBehaviorRegistry>,
    replies: Arc<ReplyPublisher>,
}

/// What one model response means for the turn.
enum Interpreted {
    /// Natural text: the turn is over.
    FinalText(String),
    /// The loop continues: ack the user and keep going in the background.
    Continue {
        ack: String,
        assistant: ChatMessage,
        pending: Vec<ToolCall>,
        nudge: bool,
    },
}

/// State carried through one background loop.
struct LoopRun {
    session_id: String,
    generation: u64,
    reply_to: Option<String>,
    correlation: String,
    messages: Vec<ChatMessage>,
    pending: Vec<ToolCall>,
    token: CancellationToken,
    behavior: ModelBehavior,
}

impl TurnOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: TurnOrchestratorConfig,
        chat: Arc<dyn ChatClient>,
        registry: Arc<ToolRegistry>,
        assembler: Arc<ContextAssembler>,
        conversation: Arc<dyn ConversationMemory>,
        serializer: Arc<WorkSerializer>,
        sessions: Arc<SessionTaskTracker>,
        behaviors: Arc<ModelBehaviorRegistry>,
        replies: Arc<ReplyPublisher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            chat,
            registry,
            assembler,
            conversation,
            serializer,
            sessions,
            behaviors,
            replies,
        })
    }

    pub fn sessions(&self) -> Arc<SessionTaskTracker> {
        self.sessions.clone()
    }

    pub fn serializer(&self) -> Arc<WorkSerializer> {
        self.serializer.clone()
    }

    /// Entry point for one user message.
    async fn handle_user_turn(
        self: Arc<Self>,
        message: UserMessage,
        reply_to: Option<String>,
        correlation: String,
        delivery_token: CancellationToken,
    ) -> Result<(), HandlerError> {
        let session_id = message.session_id.clone();
        self.conversation
            .add_turn(&session_id, ConversationTurn::user(&message.content))
            .await
            .map_err(|e| HandlerError::failed(e.to_string()))?;

        // A new user message atomically cancels any background loop still
        // running for this session.
        let (generation, token) = self.sessions.begin_session(&session_id, &delivery_token);
        let behavior = self.behaviors.select(self.chat.model_id());
        let namespace = format!("session/{session_id}");

        let mut messages = self
            .assembler
            .assemble(&session_id, &message.content, &namespace, true, &behavior)
            .await
            .map_err(|e| HandlerError::failed(e.to_string()))?;

        let request = ChatRequest {
            messages: messages.clone(),
            tools: self.registry.descriptors(),
        };
        let response = match self.chat.complete(request, token.clone()).await {
            Ok(response) => response,
            Err(_) if token.is_cancelled() => {
                self.sessions.complete(&session_id, generation);
                return Ok(());
            }
            Err(err) => {
                self.publish_apology(&session_id, reply_to.as_deref(), &correlation, &err.to_string())
                    .await;
                self.sessions.complete(&session_id, generation);
                return Ok(());
            }
        };

        match self.interpret(&response, &behavior, true) {
            Interpreted::FinalText(text) => {
                self.finish_turn(&session_id, reply_to.as_deref(), &correlation, &text)
                    .await;
                self.sessions.complete(&session_id, generation);
            }
            Interpreted::Continue {
                ack,
                assistant,
                pending,
                nudge,
            } => {
                if let Err(err) = self
                    .replies
                    .publish(reply_to.as_deref(), &session_id, &ack, false, Some(&correlation))
                    .await
                {
                    tracing::warn!(error = %err, "failed to publish ack reply");
                }
                messages.push(assistant);
                if nudge {
                    messages.push(ChatMessage::system(
                        "Your previous message referenced a tool call that was not executed. \
                         Use the structured tool-call format, or answer directly.",
                    ));
                }
                let run = LoopRun {
                    session_id,
                    generation,
                    reply_to,
                    correlation,
                    messages,
                    pending,
                    token,
                    behavior,
                };
                let orchestrator = self.clone();
                tokio::spawn(async move {
                    orchestrator.run_tool_loop(run, None).await;
                });
            }
        }
        Ok(())
    }

    /// Re-evaluate the session's last user message after negative
    /// feedback: scheduled priority, a "different approach" nudge, and an
    /// unsolicited final reply. Exits silently if user work is active or a
    /// new user message arrives mid-run.
    pub async fn re_evaluate(
        self: Arc<Self>,
        session_id: String,
        reply_to: Option<String>,
        correlation: String,
        parent_token: CancellationToken,
    ) {
        let Some(slot) = self.serializer.try_acquire_for_scheduled() else {
            tracing::debug!(%session_id, "re-evaluation skipped, user work active");
            return;
        };

        let turns = match self.conversation.turns(&session_id).await {
            Ok(turns) => turns,
            Err(err) => {
                tracing::warn!(error = %err, "re-evaluation aborted, cannot load history");
                return;
            }
        };
        let Some(last_user) = turns
            .iter()
            .rev()
            .find(|t| t.role == crate::memory::TurnRole::User)
            .map(|t| t.content.clone())
        else {
            return;
        };

        let (generation, session_token) = self.sessions.begin_session(&session_id, &parent_token);
        let token = match slot.preemption_token() {
            Some(preempt) => linked_token(&session_token, &preempt),
            None => session_token,
        };

        let behavior = self.behaviors.select(self.chat.model_id());
        let namespace = format!("session/{session_id}");
        let mut messages = match self
            .assembler
            .assemble(&session_id, &last_user, &namespace, true, &behavior)
            .await
        {
            Ok(messages) => messages,
            Err(err) => {
                tracing::warn!(error = %err, "re-evaluation aborted, context assembly failed");
                self.sessions.complete(&session_id, generation);
                return;
            }
        };
        messages.push(ChatMessage::system(
            "The user was not satisfied with the previous answer. Re-examine their request and \
             try a different approach.",
        ));

        let run = LoopRun {
            session_id,
            generation,
            reply_to,
            correlation,
            messages,
            pending: Vec::new(),
            token,
            behavior,
        };
        self.run_tool_loop(run, Some(slot)).await;
    }

    /// The background loop: acquire the slot, iterate tool execution and
    /// model calls until a text completion, then publish the final reply.
    async fn run_tool_loop(self: Arc<Self>, mut run: LoopRun, slot: Option<WorkSlot>) {
        let _slot = match slot {
            Some(slot) => slot,
            // User work preempts any running scheduled task here.
            None => match self.serializer.acquire_for_user(&run.token).await {
                Some(slot) => slot,
                None => {
                    self.sessions.complete(&run.session_id, run.generation);
                    return;
                }
            },
        };

        let max_iterations = run
            .behavior
            .max_tool_iterations_override
            .unwrap_or(self.config.max_tool_iterations)
            .max(1);
        let mut final_text = String::new();

        for iteration in 1..=max_iterations {
            for call in std::mem::take(&mut run.pending) {
                if run.token.is_cancelled() {
                    self.sessions.complete(&run.session_id, run.generation);
                    return;
                }
                let Some(content) = self.execute_tool_call(&run, &call).await else {
                    // Cancelled mid-execution: nothing is appended.
                    self.sessions.complete(&run.session_id, run.generation);
                    return;
                };
                run.messages.push(ChatMessage::tool_result(call.id.clone(), content));
            }
            if run.token.is_cancelled() {
                self.sessions.complete(&run.session_id, run.generation);
                return;
            }

            // The last iteration runs without tools to force a text
            // completion.
            let last = iteration == max_iterations;
            let tools = if last {
                Vec::new()
            } else {
                self.registry.descriptors()
            };
            let request = ChatRequest {
                messages: run.messages.clone(),
                tools,
            };
            let response = match self.chat.complete(request, run.token.clone()).await {
                Ok(response) => response,
                Err(_) if run.token.is_cancelled() => {
                    self.sessions.complete(&run.session_id, run.generation);
                    return;
                }
                Err(err) => {
                    self.publish_apology(
                        &run.session_id,
                        run.reply_to.as_deref(),
                        &run.correlation,
                        &err.to_string(),
                    )
                    .await;
                    self.sessions.complete(&run.session_id, run.generation);
                    return;
                }
            };

            if last {
                final_text = response.content;
                break;
            }
            match self.interpret(&response, &run.behavior, false) {
                Interpreted::FinalText(text) => {
                    final_text = text;
                    break;
                }
                Interpreted::Continue {
                    assistant, pending, ..
                } => {
                    tracing::debug!(
                        session = %run.session_id,
                        iteration,
                        calls = pending.len(),
                        "tool iteration"
                    );
                    run.messages.push(assistant);
                    run.pending = pending;
                }
            }
        }

        if run.token.is_cancelled() {
            self.sessions.complete(&run.session_id, run.generation);
            return;
        }
        self.finish_turn(
            &run.session_id,
            run.reply_to.as_deref(),
            &run.correlation,
            &final_text,
        )
        .await;
        self.sessions.complete(&run.session_id, run.generation);
    }

    /// Execute one call with the per-tool timeout and periodic progress
    /// replies. `None` means the run was cancelled and nothing may be
    /// appended.
    async fn execute_tool_call(&self, run: &LoopRun, call: &ToolCall) -> Option<String> {
        let description = call.name.replace('_', " ");
        self.publish_progress(run, format!("Working on it — checking {description}…"))
            .await;

        let Some(executor) = self.registry.executor(&call.name) else {
            return Some(format!(
                "Error: tool '{}' is not available. Choose another approach.",
                call.name
            ));
        };

        let request = ToolInvokeRequest {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            session_id: Some(run.session_id.clone()),
        };

        // Progress heartbeat while the tool runs long.
        let ticker_stop = CancellationToken::new();
        let ticker = {
            let stop = ticker_stop.clone();
            let interval = self.config.progress_interval;
            let replies = self.replies.clone();
            let reply_to = run.reply_to.clone();
            let session_id = run.session_id.clone();
            let correlation = run.correlation.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    let _ = replies
                        .publish(
                            reply_to.as_deref(),
                            &session_id,
                            format!("Still working on {description}…"),
                            false,
                            Some(&correlation),
                        )
                        .await;
                }
            })
        };

        let outcome = tokio::select! {
            response = executor.execute(request, run.token.child_token()) => Some(response),
            _ = tokio::time::sleep(self.config.tool_timeout) => None,
            _ = run.token.cancelled() => {
                ticker_stop.cancel();
                let _ = ticker.await;
                return None;
            }
        };
        ticker_stop.cancel();
        let _ = ticker.await;

        match outcome {
            Some(response) if response.is_error => Some(format!("Error: {}", response.content)),
            Some(response) => Some(response.content),
            None => {
                self.publish_progress(
                    run,
                    format!(
                        "The {} tool did not answer within {} seconds; trying a different approach.",
                        call.name,
                        self.config.tool_timeout.as_secs()
                    ),
                )
                .await;
                Some(format!(
                    "Error: tool '{}' timed out after {} seconds.",
                    call.name,
                    self.config.tool_timeout.as_secs()
                ))
            }
        }
    }

    /// Classify a model response: natural text ends the turn, anything
    /// tool-shaped continues the loop.
    fn interpret(
        &self,
        response: &ChatResponse,
        behavior: &ModelBehavior,
        first_response: bool,
    ) -> Interpreted {
        if response.has_tool_calls() {
            let ack = if response.content.trim().is_empty() {
                "Working on it…".to_string()
            } else {
                response.content.clone()
            };
            return Interpreted::Continue {
                ack,
                assistant: ChatMessage::assistant_with_calls(
                    response.content.clone(),
                    response.tool_calls.clone(),
                ),
                pending: response.tool_calls.clone(),
                nudge: false,
            };
        }

        let known = self.registry.names();
        if let Some(parsed) = parse_text_tool_calls(&response.content, &known) {
            let pending: Vec<ToolCall> = parsed
                .calls
                .into_iter()
                .map(|c| ToolCall {
                    id: uuid::Uuid::new_v4().to_string(),
                    name: c.name,
                    arguments: c.arguments,
                })
                .collect();
            let ack = if parsed.preamble.is_empty() {
                "Working on it…".to_string()
            } else {
                parsed.preamble.clone()
            };
            return Interpreted::Continue {
                ack,
                // The pre-tool text portion is preserved as the assistant
                // message; the raw markers are not.
                assistant: ChatMessage::assistant(parsed.preamble),
                pending,
                nudge: false,
            };
        }

        if first_response {
            if behavior.is_setup_phrase(&response.content) {
                return Interpreted::Continue {
                    ack: response.content.clone(),
                    assistant: ChatMessage::assistant(response.content.clone()),
                    pending: Vec::new(),
                    nudge: false,
                };
            }
            if behavior.nudge_on_hallucinated_tool_calls
                && response.content.contains("tool_call")
            {
                return Interpreted::Continue {
                    ack: "Working on it…".to_string(),
                    assistant: ChatMessage::assistant(response.content.clone()),
                    pending: Vec::new(),
                    nudge: true,
                };
            }
        }

        Interpreted::FinalText(response.content.clone())
    }

    /// Record the assistant turn and publish the final reply.
    async fn finish_turn(
        &self,
        session_id: &str,
        reply_to: Option<&str>,
        correlation: &str,
        text: &str,
    ) {
        if let Err(err) = self
            .conversation
            .add_turn(session_id, ConversationTurn::assistant(text))
            .await
        {
            tracing::warn!(error = %err, "failed to record assistant turn");
        }
        if let Err(err) = self
            .replies
            .publish(reply_to, session_id, text, true, Some(correlation))
            .await
        {
            tracing::error!(error = %err, "failed to publish final reply");
        }
    }

    /// Conversation memory is updated before the apology is published so
    /// the next turn sees consistent history.
    async fn publish_apology(
        &self,
        session_id: &str,
        reply_to: Option<&str>,
        correlation: &str,
        error: &str,
    ) {
        let text = format!("Sorry, I encountered an error: {error}");
        self.finish_turn(session_id, reply_to, correlation, &text).await;
    }

    async fn publish_progress(&self, run: &LoopRun, content: String) {
        if let Err(err) = self
            .replies
            .publish(
                run.reply_to.as_deref(),
                &run.session_id,
                content,
                false,
                Some(&run.correlation),
            )
            .await
        {
            tracing::debug!(error = %err, "failed to publish progress reply");
        }
    }
}

/// A token that trips when either parent does.
fn linked_token(a: &CancellationToken, b: &CancellationToken) -> CancellationToken {
    let combined = a.child_token();
    let watcher = combined.clone();
    let b = b.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = b.cancelled() => watcher.cancel(),
            _ = watcher.cancelled() => {}
        }
    });
    combined
}

/// Bus handler for `UserMessage` envelopes.
pub struct UserMessageHandler(pub Arc<TurnOrchestrator>);

#[async_trait]
impl TypedHandler for UserMessageHandler {
    type Message = UserMessage;

    async fn handle(
        &self,
        message: UserMessage,
        ctx: &HandlerContext,
    ) -> Result<(), HandlerError> {
        let reply_to = ctx.envelope.reply_to().map(str::to_string);
        let correlation = ctx
            .envelope
            .correlation_id()
            .unwrap_or_else(|| ctx.envelope.message_id())
            .to_string();
        self.0
            .clone()
            .handle_user_turn(message, reply_to, correlation, ctx.token.clone())
            .await
    }
}
