//! Built-in in-process tools: long-term memory, working memory, skills,
//! rules, and the tool guide.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use schemars::JsonSchema;
use serde::Deserialize;
use uuid::Uuid;

use super::{register_tool, AgentTool, ToolCallContext, ToolRegistry};
use crate::error::ToolExecError;
use crate::memory::{
    namespace_of, LongTermMemory, MemoryEntry, MemorySearch, RulesStore, Skill, SkillStore,
    WorkingMemory,
};

pub const WORKING_MEMORY_READ: &str = "working_memory_read";

/// Register the full built-in tool set.
pub fn register_builtin_tools(
    registry: &ToolRegistry,
    long_term: Arc<dyn LongTermMemory>,
    working: Arc<dyn WorkingMemory>,
    skills: Arc<dyn SkillStore>,
    rules: Arc<dyn RulesStore>,
) -> Result<(), ToolExecError> {
    register_tool(registry, RememberTool(long_term.clone()))?;
    register_tool(registry, SearchMemoryTool(long_term.clone()))?;
    register_tool(registry, ForgetMemoryTool(long_term))?;
    register_tool(registry, WorkingMemoryWriteTool(working.clone()))?;
    register_tool(registry, WorkingMemoryReadTool(working.clone()))?;
    register_tool(registry, WorkingMemoryListTool(working.clone()))?;
    register_tool(registry, WorkingMemoryDeleteTool(working))?;
    register_tool(registry, GetSkillTool(skills.clone()))?;
    register_tool(registry, SaveSkillTool(skills.clone()))?;
    register_tool(registry, ListSkillsTool(skills))?;
    register_tool(registry, AddRuleTool(rules))?;
    Ok(())
}

fn require_own_namespace(call: &ToolCallContext, key: &str) -> Result<(), ToolExecError> {
    let namespace = call.session_namespace().ok_or_else(|| {
        ToolExecError::failed("no working-memory namespace available in this context")
    })?;
    if namespace_of(key) != namespace {
        return Err(ToolExecError::failed(format!(
            "key '{}' is outside your namespace '{}'; writes may only target your own namespace",
            key, namespace
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Long-term memory
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RememberArgs {
    /// The fact to remember.
    pub content: String,
    /// Optional slash-separated category path, e.g. `people/family`.
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

struct RememberTool(Arc<dyn LongTermMemory>);

impl AgentTool for RememberTool {
    type Args = RememberArgs;

    fn name(&self) -> &str {
        "remember"
    }

    fn description(&self) -> &str {
        "Save a fact to long-term memory"
    }

    async fn execute(
        &self,
        args: RememberArgs,
        _call: &ToolCallContext,
    ) -> Result<String, ToolExecError> {
        let id = Uuid::new_v4().to_string();
        let mut entry = MemoryEntry::new(&id, args.content);
        entry.category = args.category;
        entry.tags = args.tags;
        self.0
            .save(entry)
            .await
            .map_err(|e| ToolExecError::failed(e.to_string()))?;
        Ok(format!("Remembered (id: {id})"))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchMemoryArgs {
    pub query: String,
    pub category: Option<String>,
    /// Cap on results; default 8.
    pub max_results: Option<usize>,
}

struct SearchMemoryTool(Arc<dyn LongTermMemory>);

impl AgentTool for SearchMemoryTool {
    type Args = SearchMemoryArgs;

    fn name(&self) -> &str {
        "search_memory"
    }

    fn description(&self) -> &str {
        "Search long-term memory by relevance"
    }

    async fn execute(
        &self,
        args: SearchMemoryArgs,
        _call: &ToolCallContext,
    ) -> Result<String, ToolExecError> {
        let criteria = MemorySearch {
            query: Some(args.query),
            category: args.category,
            tags: Vec::new(),
            max_results: args.max_results.unwrap_or(8),
        };
        let entries = self
            .0
            .search(&criteria)
            .await
            .map_err(|e| ToolExecError::failed(e.to_string()))?;
        if entries.is_empty() {
            return Ok("No matching memories.".to_string());
        }
        let mut out = String::new();
        for entry in entries {
            out.push_str(&format!("- [{}] {}\n", entry.id, entry.content));
        }
        Ok(out)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ForgetMemoryArgs {
    pub id: String,
}

struct ForgetMemoryTool(Arc<dyn LongTermMemory>);

impl AgentTool for ForgetMemoryTool {
    type Args = ForgetMemoryArgs;

    fn name(&self) -> &str {
        "forget_memory"
    }

    fn description(&self) -> &str {
        "Delete a long-term memory by id"
    }

    async fn execute(
        &self,
        args: ForgetMemoryArgs,
        _call: &ToolCallContext,
    ) -> Result<String, ToolExecError> {
        let removed = self
            .0
            .delete(&args.id)
            .await
            .map_err(|e| ToolExecError::failed(e.to_string()))?;
        Ok(if removed {
            format!("Forgot {}", args.id)
        } else {
            format!("No memory with id {}", args.id)
        })
    }
}

// ---------------------------------------------------------------------------
// Working memory
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WorkingMemoryWriteArgs {
    /// Full key path inside your namespace, e.g. `session/s1/notes`.
    pub key: String,
    pub value: String,
    /// Time to live in minutes; store default when omitted.
    pub ttl_minutes: Option<u64>,
}

struct WorkingMemoryWriteTool(Arc<dyn WorkingMemory>);

impl AgentTool for WorkingMemoryWriteTool {
    type Args = WorkingMemoryWriteArgs;

    fn name(&self) -> &str {
        "working_memory_write"
    }

    fn description(&self) -> &str {
        "Store a value in your working-memory namespace"
    }

    async fn execute(
        &self,
        args: WorkingMemoryWriteArgs,
        call: &ToolCallContext,
    ) -> Result<String, ToolExecError> {
        require_own_namespace(call, &args.key)?;
        let ttl = args.ttl_minutes.map(|m| Duration::from_secs(m * 60));
        self.0
            .set(&args.key, &args.value, ttl, None, vec![])
            .await
            .map_err(|e| ToolExecError::failed(e.to_string()))?;
        Ok(format!("Stored {}", args.key))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WorkingMemoryReadArgs {
    pub key: String,
}

struct WorkingMemoryReadTool(Arc<dyn WorkingMemory>);

impl AgentTool for WorkingMemoryReadTool {
    type Args = WorkingMemoryReadArgs;

    fn name(&self) -> &str {
        WORKING_MEMORY_READ
    }

    fn description(&self) -> &str {
        "Read a working-memory entry by key (any namespace)"
    }

    async fn execute(
        &self,
        args: WorkingMemoryReadArgs,
        _call: &ToolCallContext,
    ) -> Result<String, ToolExecError> {
        match self
            .0
            .get(&args.key)
            .await
            .map_err(|e| ToolExecError::failed(e.to_string()))?
        {
            Some(entry) => Ok(entry.value),
            None => Ok(format!("No entry at {}", args.key)),
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WorkingMemoryListArgs {
    /// Key prefix to filter on; all entries when omitted.
    pub prefix: Option<String>,
}

struct WorkingMemoryListTool(Arc<dyn WorkingMemory>);

impl AgentTool for WorkingMemoryListTool {
    type Args = WorkingMemoryListArgs;

    fn name(&self) -> &str {
        "working_memory_list"
    }

    fn description(&self) -> &str {
        "List working-memory keys and expiries"
    }

    async fn execute(
        &self,
        args: WorkingMemoryListArgs,
        _call: &ToolCallContext,
    ) -> Result<String, ToolExecError> {
        let entries = self
            .0
            .list(args.prefix.as_deref())
            .await
            .map_err(|e| ToolExecError::failed(e.to_string()))?;
        if entries.is_empty() {
            return Ok("No entries.".to_string());
        }
        let mut out = String::new();
        for entry in entries {
            out.push_str(&format!(
                "- {} (expires {})\n",
                entry.key,
                entry.expires_at.to_rfc3339()
            ));
        }
        Ok(out)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WorkingMemoryDeleteArgs {
    pub key: String,
}

struct WorkingMemoryDeleteTool(Arc<dyn WorkingMemory>);

impl AgentTool for WorkingMemoryDeleteTool {
    type Args = WorkingMemoryDeleteArgs;

    fn name(&self) -> &str {
        "working_memory_delete"
    }

    fn description(&self) -> &str {
        "Delete an entry from your working-memory namespace"
    }

    async fn execute(
        &self,
        args: WorkingMemoryDeleteArgs,
        call: &ToolCallContext,
    ) -> Result<String, ToolExecError> {
        require_own_namespace(call, &args.key)?;
        let removed = self
            .0
            .delete(&args.key)
            .await
            .map_err(|e| ToolExecError::failed(e.to_string()))?;
        Ok(if removed {
            format!("Deleted {}", args.key)
        } else {
            format!("No entry at {}", args.key)
        })
    }
}

// ---------------------------------------------------------------------------
// Skills and rules
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetSkillArgs {
    pub name: String,
}

struct GetSkillTool(Arc<dyn SkillStore>);

impl AgentTool for GetSkillTool {
    type Args = GetSkillArgs;

    fn name(&self) -> &str {
        "get_skill"
    }

    fn description(&self) -> &str {
        "Retrieve a skill's full content by name"
    }

    async fn execute(
        &self,
        args: GetSkillArgs,
        _call: &ToolCallContext,
    ) -> Result<String, ToolExecError> {
        let skill = self
            .0
            .get(&args.name)
            .await
            .map_err(|e| ToolExecError::failed(e.to_string()))?;
        match skill {
            Some(mut skill) => {
                skill.last_used_at = Some(Utc::now());
                let content = skill.content.clone();
                self.0
                    .save(skill)
                    .await
                    .map_err(|e| ToolExecError::failed(e.to_string()))?;
                Ok(content)
            }
            None => Ok(format!("No skill named '{}'", args.name)),
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SaveSkillArgs {
    /// Lowercase, hyphenated, optional `/`-separated category prefix.
    pub name: String,
    pub summary: String,
    /// Markdown body of the skill.
    pub content: String,
}

struct SaveSkillTool(Arc<dyn SkillStore>);

impl AgentTool for SaveSkillTool {
    type Args = SaveSkillArgs;

    fn name(&self) -> &str {
        "save_skill"
    }

    fn description(&self) -> &str {
        "Create or update a skill"
    }

    async fn execute(
        &self,
        args: SaveSkillArgs,
        _call: &ToolCallContext,
    ) -> Result<String, ToolExecError> {
        let name = args.name.to_lowercase();
        let existing = self
            .0
            .get(&name)
            .await
            .map_err(|e| ToolExecError::failed(e.to_string()))?;
        let now = Utc::now();
        let skill = Skill {
            name: name.clone(),
            summary: args.summary,
            content: args.content,
            created_at: existing.as_ref().map(|s| s.created_at).unwrap_or(now),
            updated_at: now,
            last_used_at: existing.and_then(|s| s.last_used_at),
        };
        self.0
            .save(skill)
            .await
            .map_err(|e| ToolExecError::failed(e.to_string()))?;
        Ok(format!("Saved skill '{name}'"))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListSkillsArgs {}

struct ListSkillsTool(Arc<dyn SkillStore>);

impl AgentTool for ListSkillsTool {
    type Args = ListSkillsArgs;

    fn name(&self) -> &str {
        "list_skills"
    }

    fn description(&self) -> &str {
        "List all skills with summaries"
    }

    async fn execute(
        &self,
        _args: ListSkillsArgs,
        _call: &ToolCallContext,
    ) -> Result<String, ToolExecError> {
        let skills = self
            .0
            .list()
            .await
            .map_err(|e| ToolExecError::failed(e.to_string()))?;
        if skills.is_empty() {
            return Ok("No skills on file.".to_string());
        }
        let mut out = String::new();
        for skill in skills {
            out.push_str(&format!("- {} — {}\n", skill.name, skill.summary));
        }
        Ok(out)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AddRuleArgs {
    /// The permanent behavioral rule to append.
    pub rule: String,
}

struct AddRuleTool(Arc<dyn RulesStore>);

impl AgentTool for AddRuleTool {
    type Args = AddRuleArgs;

    fn name(&self) -> &str {
        "add_rule"
    }

    fn description(&self) -> &str {
        "Append a permanent behavioral rule, consulted every turn"
    }

    async fn execute(
        &self,
        args: AddRuleArgs,
        _call: &ToolCallContext,
    ) -> Result<String, ToolExecError> {
        self.0
            .append(&args.rule)
            .await
            .map_err(|e| ToolExecError::failed(e.to_string()))?;
        Ok("Rule added.".to_string())
    }
}
