//! Shared in-memory whiteboard for structured data handoff between a
//! parent session and its subagents.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use schemars::JsonSchema;
use serde::Deserialize;

use crate::error::ToolExecError;
use crate::tools::{register_tool, AgentTool, ToolCallContext, ToolRegistry};

#[derive(Default)]
pub struct Whiteboard {
    entries: RwLock<HashMap<String, String>>,
}

impl Whiteboard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn write(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.write().insert(key.into(), value.into());
    }

    pub fn read(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WhiteboardWriteArgs {
    pub key: String,
    pub value: String,
}

struct WhiteboardWriteTool(Arc<Whiteboard>);

impl AgentTool for WhiteboardWriteTool {
    type Args = WhiteboardWriteArgs;

    fn name(&self) -> &str {
        "whiteboard_write"
    }

    fn description(&self) -> &str {
        "Write a value to the shared whiteboard"
    }

    async fn execute(
        &self,
        args: WhiteboardWriteArgs,
        _call: &ToolCallContext,
    ) -> Result<String, ToolExecError> {
        self.0.write(&args.key, &args.value);
        Ok(format!("Wrote {}", args.key))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WhiteboardReadArgs {
    pub key: String,
}

struct WhiteboardReadTool(Arc<Whiteboard>);

impl AgentTool for WhiteboardReadTool {
    type Args = WhiteboardReadArgs;

    fn name(&self) -> &str {
        "whiteboard_read"
    }

    fn description(&self) -> &str {
        "Read a value from the shared whiteboard"
    }

    async fn execute(
        &self,
        args: WhiteboardReadArgs,
        _call: &ToolCallContext,
    ) -> Result<String, ToolExecError> {
        Ok(self
            .0
            .read(&args.key)
            .unwrap_or_else(|| format!("No whiteboard entry at {}", args.key)))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WhiteboardListArgs {}

struct WhiteboardListTool(Arc<Whiteboard>);

impl AgentTool for WhiteboardListTool {
    type Args = WhiteboardListArgs;

    fn name(&self) -> &str {
        "whiteboard_list"
    }

    fn description(&self) -> &str {
        "List whiteboard keys"
    }

    async fn execute(
        &self,
        _args: WhiteboardListArgs,
        _call: &ToolCallContext,
    ) -> Result<String, ToolExecError> {
        let keys = self.0.list();
        if keys.is_empty() {
            return Ok("Whiteboard is empty.".to_string());
        }
        Ok(keys
            .into_iter()
            .map(|k| format!("- {k}"))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WhiteboardDeleteArgs {
    pub key: String,
}

struct WhiteboardDeleteTool(Arc<Whiteboard>);

impl AgentTool for WhiteboardDeleteTool {
    type Args = WhiteboardDeleteArgs;

    fn name(&self) -> &str {
        "whiteboard_delete"
    }

    fn description(&self) -> &str {
        "Delete a whiteboard entry"
    }

    async fn execute(
        &self,
        args: WhiteboardDeleteArgs,
        _call: &ToolCallContext,
    ) -> Result<String, ToolExecError> {
        Ok(if self.0.delete(&args.key) {
            format!("Deleted {}", args.key)
        } else {
            format!("No whiteboard entry at {}", args.key)
        })
    }
}

/// Register the whiteboard tool set.
pub fn register_whiteboard_tools(
    registry: &ToolRegistry,
    whiteboard: Arc<Whiteboard>,
) -> Result<(), ToolExecError> {
    register_tool(registry, WhiteboardWriteTool(whiteboard.clone()))?;
    register_tool(registry, WhiteboardReadTool(whiteboard.clone()))?;
    register_tool(registry, WhiteboardListTool(whiteboard.clone()))?;
    register_tool(registry, WhiteboardDeleteTool(whiteboard))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whiteboard_crud() {
        let board = Whiteboard::new();
        board.write("plan", "step 1");
        assert_eq!(board.read("plan").as_deref(), Some("step 1"));

        board.write("plan", "step 2");
        assert_eq!(board.read("plan").as_deref(), Some("step 2"));

        board.write("notes", "x");
        assert_eq!(board.list(), vec!["notes", "plan"]);

        assert!(board.delete("plan"));
        assert!(!board.delete("plan"));
        assert!(board.read("plan").is_none());
    }
}
