//! Tool registry and invocation model.
//!
//! Tools present one uniform execution surface regardless of where they
//! run: in process, behind the MCP bridge, or delegated to another agent.
//! The registry maps tool name to a registration (name, description, JSON
//! Schema) and an executor; the orchestrator forwards arguments as a JSON
//! string and each executor decodes them against its declared schema.

pub mod builtin;
pub mod chunker;
pub mod proxy;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rockbot_proto::{ToolDescriptor, ToolInvokeRequest, ToolInvokeResponse};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::error::ToolExecError;

pub use chunker::{ChunkingConfig, ChunkingExecutor};

/// Where a tool actually executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolSource {
    /// Runs inside this process.
    InProcess,
    /// Proxied over the bus to an MCP bridge advertising the tool.
    McpProxy { server: String },
    /// Proxied over the bus to some other remote bridge.
    RemoteBridge,
    /// Delegated to another agent or a subagent.
    Delegated,
}

/// A registered tool: what the model sees.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRegistration {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool parameters, as a string.
    pub parameters_schema: String,
    pub source: ToolSource,
}

impl ToolRegistration {
    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters_schema: self.parameters_schema.clone(),
        }
    }
}

/// Uniform execution surface. Failures are encoded in the response
/// (`is_error`), never thrown: tool errors become tool-result messages so
/// the model may recover.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        request: ToolInvokeRequest,
        token: CancellationToken,
    ) -> ToolInvokeResponse;
}

pub fn ok_response(request: &ToolInvokeRequest, content: impl Into<String>) -> ToolInvokeResponse {
    ToolInvokeResponse {
        tool_call_id: request.tool_call_id.clone(),
        tool_name: request.tool_name.clone(),
        content: content.into(),
        is_error: false,
    }
}

pub fn error_response(
    request: &ToolInvokeRequest,
    message: impl Into<String>,
) -> ToolInvokeResponse {
    ToolInvokeResponse {
        tool_call_id: request.tool_call_id.clone(),
        tool_name: request.tool_name.clone(),
        content: message.into(),
        is_error: true,
    }
}

/// Name-keyed tool registry. Names are unique within a process.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, (ToolRegistration, Arc<dyn ToolExecutor>)>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        registration: ToolRegistration,
        executor: Arc<dyn ToolExecutor>,
    ) -> Result<(), ToolExecError> {
        let mut tools = self.tools.write();
        if tools.contains_key(&registration.name) {
            return Err(ToolExecError::Duplicate(registration.name));
        }
        tools.insert(registration.name.clone(), (registration, executor));
        Ok(())
    }

    /// Remove a tool. Used when a bridge withdraws its tools.
    pub fn remove(&self, name: &str) -> bool {
        self.tools.write().remove(name).is_some()
    }

    /// Replace-or-insert, for bridges republishing availability.
    pub fn upsert(&self, registration: ToolRegistration, executor: Arc<dyn ToolExecutor>) {
        self.tools
            .write()
            .insert(registration.name.clone(), (registration, executor));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    pub fn registrations(&self) -> Vec<ToolRegistration> {
        let mut regs: Vec<ToolRegistration> = self
            .tools
            .read()
            .values()
            .map(|(registration, _)| registration.clone())
            .collect();
        regs.sort_by(|a, b| a.name.cmp(&b.name));
        regs
    }

    /// Descriptors offered to the model.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.registrations()
            .iter()
            .map(ToolRegistration::descriptor)
            .collect()
    }

    pub fn names(&self) -> HashSet<String> {
        self.tools.read().keys().cloned().collect()
    }

    pub fn executor(&self, name: &str) -> Option<Arc<dyn ToolExecutor>> {
        self.tools.read().get(name).map(|(_, e)| e.clone())
    }

    /// Names of tools registered for one MCP server.
    pub fn names_for_mcp_server(&self, server: &str) -> Vec<String> {
        self.tools
            .read()
            .values()
            .filter(|(r, _)| matches!(&r.source, ToolSource::McpProxy { server: s } if s == server))
            .map(|(r, _)| r.name.clone())
            .collect()
    }
}

/// Ambient facts about one tool call, available to typed tools.
pub struct ToolCallContext {
    pub tool_call_id: String,
    pub session_id: Option<String>,
    pub token: CancellationToken,
}

impl ToolCallContext {
    /// The caller's working-memory namespace, when a session is known.
    ///
    /// User sessions map to `session/{id}`; patrol and subagent contexts
    /// carry their namespace as the session id (`patrol/{name}`,
    /// `subagent/{id}`) and use it directly.
    pub fn session_namespace(&self) -> Option<String> {
        let session = self.session_id.as_deref()?;
        if session.contains('/') {
            Some(crate::memory::namespace_of(session))
        } else {
            Some(format!("session/{session}"))
        }
    }
}

/// A typed in-process tool. The argument type's schema is derived and
/// registered automatically; arguments arriving as a JSON string are
/// decoded before `execute` runs.
pub trait AgentTool: Send + Sync + 'static {
    type Args: DeserializeOwned + JsonSchema + Send;

    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn execute(
        &self,
        args: Self::Args,
        call: &ToolCallContext,
    ) -> impl Future<Output = Result<String, ToolExecError>> + Send;
}

struct TypedToolExecutor<T>(Arc<T>);

#[async_trait]
impl<T: AgentTool> ToolExecutor for TypedToolExecutor<T> {
    async fn execute(
        &self,
        request: ToolInvokeRequest,
        token: CancellationToken,
    ) -> ToolInvokeResponse {
        let raw = if request.arguments.trim().is_empty() {
            "{}"
        } else {
            request.arguments.as_str()
        };
        let args: T::Args = match serde_json::from_str(raw) {
            Ok(args) => args,
            Err(e) => {
                return error_response(
                    &request,
                    format!("invalid arguments for '{}': {}", request.tool_name, e),
                )
            }
        };
        let call = ToolCallContext {
            tool_call_id: request.tool_call_id.clone(),
            session_id: request.session_id.clone(),
            token,
        };
        match self.0.execute(args, &call).await {
            Ok(content) => ok_response(&request, content),
            Err(e) => error_response(&request, e.to_string()),
        }
    }
}

/// Register a typed tool as an in-process executor.
pub fn register_tool<T: AgentTool>(registry: &ToolRegistry, tool: T) -> Result<(), ToolExecError> {
    let tool = Arc::new(tool);
    let schema = schemars::schema_for!(T::Args);
    let parameters_schema = serde_json::to_string(&schema)
        .map_err(|e| ToolExecError::failed(format!("schema serialization: {e}")))?;
    registry.register(
        ToolRegistration {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters_schema,
            source: ToolSource::InProcess,
        },
        Arc::new(TypedToolExecutor(tool)),
    )
}
