//! In-memory store implementations.
//!
//! These back tests and single-process agents. Each store guards its state
//! with its own lock; none holds a lock across an await point.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::bm25::Bm25Index;
use super::{
    namespace_of, ConversationMemory, ConversationTurn, LongTermMemory, MemoryEntry, MemorySearch,
    RulesStore, Skill, SkillStore, WorkingMemory, WorkingMemoryEntry,
};
use crate::error::StoreError;

/// Per-session conversation log.
#[derive(Default)]
pub struct InMemoryConversationMemory {
    sessions: RwLock<HashMap<String, Vec<ConversationTurn>>>,
}

impl InMemoryConversationMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationMemory for InMemoryConversationMemory {
    async fn add_turn(&self, session_id: &str, turn: ConversationTurn) -> Result<(), StoreError> {
        self.sessions
            .write()
            .entry(session_id.to_string())
            .or_default()
            .push(turn);
        Ok(())
    }

    async fn turns(&self, session_id: &str) -> Result<Vec<ConversationTurn>, StoreError> {
        Ok(self
            .sessions
            .read()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }
}

struct LongTermState {
    entries: HashMap<String, MemoryEntry>,
    index: Bm25Index,
}

/// Long-term memory with BM25 recall.
pub struct InMemoryLongTermMemory {
    state: RwLock<LongTermState>,
}

impl InMemoryLongTermMemory {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LongTermState {
                entries: HashMap::new(),
                index: Bm25Index::new(),
            }),
        }
    }

    fn index_text(entry: &MemoryEntry) -> String {
        let mut text = entry.content.clone();
        for tag in &entry.tags {
            text.push(' ');
            text.push_str(tag);
        }
        if let Some(category) = &entry.category {
            // Category paths contribute their individual tokens.
            text.push(' ');
            text.push_str(&category.replace('/', " "));
        }
        text
    }

    fn matches_filters(entry: &MemoryEntry, criteria: &MemorySearch) -> bool {
        if let Some(category) = &criteria.category {
            let own = entry.category.as_deref().unwrap_or("");
            if own != category && !own.starts_with(&format!("{category}/")) {
                return false;
            }
        }
        criteria.tags.iter().all(|t| entry.tags.contains(t))
    }
}

impl Default for InMemoryLongTermMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LongTermMemory for InMemoryLongTermMemory {
    async fn save(&self, entry: MemoryEntry) -> Result<(), StoreError> {
        let mut state = self.state.write();
        state.index.insert(&entry.id, &Self::index_text(&entry));
        state.entries.insert(entry.id.clone(), entry);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        state.index.remove(id);
        Ok(state.entries.remove(id).is_some())
    }

    async fn search(&self, criteria: &MemorySearch) -> Result<Vec<MemoryEntry>, StoreError> {
        let state = self.state.read();
        let max = if criteria.max_results == 0 {
            8
        } else {
            criteria.max_results
        };

        match criteria.query.as_deref().filter(|q| !q.trim().is_empty()) {
            Some(query) => {
                // Over-fetch so post-filtering can still fill `max`.
                let ranked = state.index.search(query, max * 4);
                Ok(ranked
                    .into_iter()
                    .filter_map(|(id, _)| state.entries.get(&id).cloned())
                    .filter(|e| Self::matches_filters(e, criteria))
                    .take(max)
                    .collect())
            }
            None => {
                let mut entries: Vec<MemoryEntry> = state
                    .entries
                    .values()
                    .filter(|e| Self::matches_filters(e, criteria))
                    .cloned()
                    .collect();
                entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                entries.truncate(max);
                Ok(entries)
            }
        }
    }

    async fn recent(&self, limit: usize) -> Result<Vec<MemoryEntry>, StoreError> {
        let state = self.state.read();
        let mut entries: Vec<MemoryEntry> = state.entries.values().cloned().collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(limit);
        Ok(entries)
    }
}

/// Working memory with TTL expiry and a per-namespace entry cap that
/// evicts the oldest entry on overflow.
pub struct InMemoryWorkingMemory {
    entries: RwLock<HashMap<String, WorkingMemoryEntry>>,
    default_ttl: Duration,
    namespace_cap: usize,
}

impl InMemoryWorkingMemory {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);
    pub const DEFAULT_NAMESPACE_CAP: usize = 100;

    pub fn new() -> Self {
        Self::with_limits(Self::DEFAULT_TTL, Self::DEFAULT_NAMESPACE_CAP)
    }

    pub fn with_limits(default_ttl: Duration, namespace_cap: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
            namespace_cap: namespace_cap.max(1),
        }
    }

    fn purge_expired(entries: &mut HashMap<String, WorkingMemoryEntry>) {
        let now = Utc::now();
        entries.retain(|_, e| e.expires_at > now);
    }
}

impl Default for InMemoryWorkingMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkingMemory for InMemoryWorkingMemory {
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        category: Option<String>,
        tags: Vec<String>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| StoreError::new(format!("ttl out of range: {e}")))?;

        let mut entries = self.entries.write();
        Self::purge_expired(&mut entries);

        let namespace = namespace_of(key);
        let in_namespace: Vec<&WorkingMemoryEntry> = entries
            .values()
            .filter(|e| namespace_of(&e.key) == namespace && e.key != key)
            .collect();
        if in_namespace.len() >= self.namespace_cap {
            // Evict the oldest entry in the namespace.
            if let Some(oldest) = in_namespace
                .iter()
                .min_by_key(|e| e.stored_at)
                .map(|e| e.key.clone())
            {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key.to_string(),
            WorkingMemoryEntry {
                key: key.to_string(),
                value: value.to_string(),
                stored_at: now,
                expires_at,
                category,
                tags,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<WorkingMemoryEntry>, StoreError> {
        let entries = self.entries.read();
        Ok(entries
            .get(key)
            .filter(|e| e.expires_at > Utc::now())
            .cloned())
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<WorkingMemoryEntry>, StoreError> {
        let now = Utc::now();
        let entries = self.entries.read();
        let mut found: Vec<WorkingMemoryEntry> = entries
            .values()
            .filter(|e| e.expires_at > now)
            .filter(|e| prefix.map_or(true, |p| e.key.starts_with(p)))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(found)
    }

    async fn search(
        &self,
        query: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<WorkingMemoryEntry>, StoreError> {
        let needle = query.to_lowercase();
        Ok(self
            .list(prefix)
            .await?
            .into_iter()
            .filter(|e| {
                e.key.to_lowercase().contains(&needle)
                    || e.value.to_lowercase().contains(&needle)
                    || e.tags.iter().any(|t| t.to_lowercase().contains(&needle))
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.write().remove(key).is_some())
    }
}

#[derive(Default)]
pub struct InMemorySkillStore {
    skills: RwLock<HashMap<String, Skill>>,
}

impl InMemorySkillStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SkillStore for InMemorySkillStore {
    async fn get(&self, name: &str) -> Result<Option<Skill>, StoreError> {
        Ok(self.skills.read().get(name).cloned())
    }

    async fn save(&self, skill: Skill) -> Result<(), StoreError> {
        self.skills.write().insert(skill.name.clone(), skill);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.skills.write().remove(name).is_some())
    }

    async fn list(&self) -> Result<Vec<Skill>, StoreError> {
        let mut skills: Vec<Skill> = self.skills.read().values().cloned().collect();
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(skills)
    }
}

#[derive(Default)]
pub struct InMemoryRulesStore {
    rules: RwLock<Vec<String>>,
}

impl InMemoryRulesStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RulesStore for InMemoryRulesStore {
    async fn append(&self, rule: &str) -> Result<(), StoreError> {
        self.rules.write().push(rule.to_string());
        Ok(())
    }

    async fn rules(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.rules.read().clone())
    }
}
