//! Store contracts: conversation log, long-term memory, working memory,
//! skills, rules.
//!
//! The orchestrator consumes these traits only. The in-memory
//! implementations in [`in_memory`] back tests and single-process agents;
//! persistent backends are external collaborators implementing the same
//! contracts.

pub mod bm25;
pub mod in_memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;

pub use in_memory::{
    InMemoryConversationMemory, InMemoryLongTermMemory, InMemoryRulesStore, InMemorySkillStore,
    InMemoryWorkingMemory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    User,
    Assistant,
    System,
    Tool,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
            TurnRole::System => "system",
            TurnRole::Tool => "tool",
        }
    }
}

/// One turn in a session's conversation, ordered by completion time.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(TurnRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, content)
    }
}

/// A long-term memory entry. Ids are stable opaque strings; categories are
/// slash-separated hierarchical paths.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryEntry {
    pub id: String,
    pub content: String,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

impl MemoryEntry {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            category: None,
            tags: Vec::new(),
            created_at: Utc::now(),
            updated_at: None,
            metadata: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Search criteria for long-term recall.
#[derive(Debug, Clone, Default)]
pub struct MemorySearch {
    pub query: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub max_results: usize,
}

impl MemorySearch {
    pub fn query(text: impl Into<String>, max_results: usize) -> Self {
        Self {
            query: Some(text.into()),
            max_results,
            ..Default::default()
        }
    }
}

/// A working-memory entry: short-lived scratch state keyed by full path.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingMemoryEntry {
    pub key: String,
    pub value: String,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub category: Option<String>,
    pub tags: Vec<String>,
}

/// Namespace of a working-memory key: its first two path segments
/// (`session/{id}`, `patrol/{name}`, `subagent/{id}`).
pub fn namespace_of(key: &str) -> String {
    key.split('/').take(2).collect::<Vec<_>>().join("/")
}

/// A stored skill. Names are lowercase with hyphens and an optional
/// `/`-separated category prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct Skill {
    pub name: String,
    pub summary: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ConversationMemory: Send + Sync {
    async fn add_turn(&self, session_id: &str, turn: ConversationTurn) -> Result<(), StoreError>;

    /// All recorded turns for a session, oldest first. Bounded replay is
    /// the caller's concern.
    async fn turns(&self, session_id: &str) -> Result<Vec<ConversationTurn>, StoreError>;
}

#[async_trait]
pub trait LongTermMemory: Send + Sync {
    async fn save(&self, entry: MemoryEntry) -> Result<(), StoreError>;

    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Ranked recall: BM25 over content, tags, and category tokens when a
    /// query is present, filtered by category and tags.
    async fn search(&self, criteria: &MemorySearch) -> Result<Vec<MemoryEntry>, StoreError>;

    /// Most recently created entries, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<MemoryEntry>, StoreError>;
}

#[async_trait]
pub trait WorkingMemory: Send + Sync {
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        category: Option<String>,
        tags: Vec<String>,
    ) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<WorkingMemoryEntry>, StoreError>;

    /// Entries under a key prefix (all entries when `None`), expired ones
    /// excluded.
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<WorkingMemoryEntry>, StoreError>;

    async fn search(
        &self,
        query: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<WorkingMemoryEntry>, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait SkillStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Skill>, StoreError>;

    async fn save(&self, skill: Skill) -> Result<(), StoreError>;

    async fn delete(&self, name: &str) -> Result<bool, StoreError>;

    async fn list(&self) -> Result<Vec<Skill>, StoreError>;
}

/// Ordered list of permanent behavioral rules, appended by tool calls and
/// consulted every turn.
#[async_trait]
pub trait RulesStore: Send + Sync {
    async fn append(&self, rule: &str) -> Result<(), StoreError>;

    async fn rules(&self) -> Result<Vec<String>, StoreError>;
}
