//! # rockbot-agent
//!
//! The agent-side core of the RockBot runtime. Everything between "a user
//! message arrived on the bus" and "the final reply was published" lives
//! here:
//!
//! - **Stores** ([`memory`]): contracts for conversation, long-term and
//!   working memory, skills, and rules, plus in-memory implementations
//!   with BM25 recall.
//! - **Context assembly** ([`context`]): per-turn composition of system
//!   prompt, recalled memories, working-memory inventories, skill index,
//!   and conversation history, with process-wide injection trackers.
//! - **Tools** ([`tools`]): the registry mapping tool name to executor,
//!   the chunking wrapper for oversized results, built-in memory/skill/
//!   rule tools, and the bus-proxied executor for remote bridges.
//! - **The turn orchestrator** ([`orchestrator`]): the stateful loop that
//!   calls the model, executes native or text-parsed tool calls, streams
//!   progress, honors per-session cancellation, and publishes replies.
//! - **Work serialization** ([`serializer`]): the single execution slot
//!   per agent process; user work preempts scheduled work.
//! - **A2A and subagents** ([`a2a`], [`subagent`]): task delegation across
//!   the bus and capped in-process subagents with a shared whiteboard.

pub mod a2a;
pub mod behavior;
pub mod config;
pub mod context;
pub mod feedback;
pub mod heartbeat;
pub mod history;
pub mod llm;
pub mod memory;
pub mod orchestrator;
pub mod profile;
pub mod runtime;
pub mod serializer;
pub mod subagent;
pub mod text_calls;
pub mod tools;
pub mod whiteboard;

mod error;
mod reply;

pub use config::AgentConfig;
pub use error::{AgentError, LlmError, StoreError, ToolExecError};
pub use llm::{ChatClient, ChatMessage, ChatRequest, ChatResponse, ChatRole, ToolCall};
pub use orchestrator::{TurnOrchestrator, TurnOrchestratorConfig, UserMessageHandler};
pub use profile::AgentProfile;
pub use reply::ReplyPublisher;
pub use runtime::{AgentRuntime, AgentRuntimeBuilder};
pub use serializer::{SessionTaskTracker, WorkSerializer, WorkSlot};
pub use tools::{ToolExecutor, ToolRegistration, ToolRegistry, ToolSource};
