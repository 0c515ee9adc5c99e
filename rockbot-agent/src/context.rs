//! Per-turn context assembly.
//!
//! For every `(session, user message)` the assembler produces the ordered
//! chat-message list the orchestrator sends to the model: system prompt,
//! recalled memories, working-memory inventories, skill index, briefing,
//! then the tail of the conversation history.
//!
//! The trackers are process-wide and reset on restart. That is
//! intentional: the model's context is also fresh after a restart, so
//! re-injecting once is correct.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use crate::behavior::ModelBehavior;
use crate::error::AgentError;
use crate::llm::{ChatMessage, ChatRole};
use crate::memory::{
    ConversationMemory, LongTermMemory, MemoryEntry, MemorySearch, RulesStore, SkillStore,
    TurnRole, WorkingMemory,
};
use crate::profile::AgentProfile;

const DEFAULT_MAX_TURNS: usize = 20;
const DEFAULT_MAX_RECALL: usize = 8;
const FIRST_TURN_RECENT_FALLBACK: usize = 5;

/// Per-session record of long-term entry ids already surfaced to the
/// model. An id is never injected twice while the process lives.
#[derive(Default)]
pub struct InjectedMemoryTracker {
    sessions: Mutex<HashMap<String, HashSet<String>>>,
}

impl InjectedMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only entries not yet surfaced this session, marking the
    /// survivors as surfaced.
    pub fn filter_unseen(&self, session_id: &str, entries: Vec<MemoryEntry>) -> Vec<MemoryEntry> {
        let mut sessions = self.sessions.lock();
        let seen = sessions.entry(session_id.to_string()).or_default();
        entries
            .into_iter()
            .filter(|e| seen.insert(e.id.clone()))
            .collect()
    }

    pub fn clear(&self) {
        self.sessions.lock().clear();
    }
}

/// One-shot-per-session gate, used for the skill index and the
/// session-start briefing.
#[derive(Default)]
pub struct OncePerSession {
    seen: Mutex<HashSet<String>>,
}

impl OncePerSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// True exactly once per session id.
    pub fn first_visit(&self, session_id: &str) -> bool {
        self.seen.lock().insert(session_id.to_string())
    }

    pub fn clear(&self) {
        self.seen.lock().clear();
    }
}

/// Builds the model context for a turn.
pub struct ContextAssembler {
    profile: Arc<AgentProfile>,
    conversation: Arc<dyn ConversationMemory>,
    long_term: Arc<dyn LongTermMemory>,
    working: Arc<dyn WorkingMemory>,
    skills: Arc<dyn SkillStore>,
    rules: Arc<dyn RulesStore>,
    injected: Arc<InjectedMemoryTracker>,
    skill_index_gate: Arc<OncePerSession>,
    briefing_gate: Arc<OncePerSession>,
    /// `session-start.md` contents, when present on the data volume.
    session_start_briefing: Option<String>,
    max_turns: usize,
    max_recall: usize,
}

impl ContextAssembler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        profile: Arc<AgentProfile>,
        conversation: Arc<dyn ConversationMemory>,
        long_term: Arc<dyn LongTermMemory>,
        working: Arc<dyn WorkingMemory>,
        skills: Arc<dyn SkillStore>,
        rules: Arc<dyn RulesStore>,
    ) -> Self {
        Self {
            profile,
            conversation,
            long_term,
            working,
            skills,
            rules,
            injected: Arc::new(InjectedMemoryTracker::new()),
            skill_index_gate: Arc::new(OncePerSession::new()),
            briefing_gate: Arc::new(OncePerSession::new()),
            session_start_briefing: None,
            max_turns: DEFAULT_MAX_TURNS,
            max_recall: DEFAULT_MAX_RECALL,
        }
    }

    pub fn with_session_start_briefing(mut self, briefing: Option<String>) -> Self {
        self.session_start_briefing = briefing.filter(|b| !b.trim().is_empty());
        self
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }

    pub fn injected_tracker(&self) -> Arc<InjectedMemoryTracker> {
        self.injected.clone()
    }

    /// Assemble the ordered message list for one turn.
    ///
    /// `namespace` is the caller's own working-memory namespace
    /// (`session/{id}` for user sessions, `patrol/...` or
    /// `subagent/...` otherwise); `is_user_session` additionally surfaces
    /// patrol findings.
    pub async fn assemble(
        &self,
        session_id: &str,
        user_message: &str,
        namespace: &str,
        is_user_session: bool,
        behavior: &ModelBehavior,
    ) -> Result<Vec<ChatMessage>, AgentError> {
        let mut messages = Vec::new();

        // 1. System prompt: profile + rules + model-specific additions.
        let mut system = self.profile.system_prompt();
        let rules = self.rules.rules().await?;
        if !rules.is_empty() {
            system.push_str("\n\nStanding rules, in order:\n");
            for (i, rule) in rules.iter().enumerate() {
                system.push_str(&format!("{}. {}\n", i + 1, rule));
            }
        }
        if let Some(pre_loop) = &behavior.pre_tool_loop_prompt {
            system.push_str("\n\n");
            system.push_str(pre_loop);
        }
        if let Some(additional) = &behavior.additional_system_prompt {
            system.push_str("\n\n");
            system.push_str(additional);
        }
        messages.push(ChatMessage::system(system));

        let turns = self.conversation.turns(session_id).await?;
        // The current user turn is recorded before assembly, so "first
        // turn of the session" means no prior turns beyond it.
        let first_turn = turns.len() <= 1;

        // 2. Long-term recall: BM25 on the user message, falling back to
        // recent entries only on a first turn with no hits.
        let mut recalled = self
            .long_term
            .search(&MemorySearch::query(user_message, self.max_recall))
            .await?;
        if recalled.is_empty() && first_turn {
            recalled = self.long_term.recent(FIRST_TURN_RECENT_FALLBACK).await?;
        }
        let recalled = self.injected.filter_unseen(session_id, recalled);
        if !recalled.is_empty() {
            let mut text = String::from("Recalled from long-term memory:");
            for entry in &recalled {
                match &entry.category {
                    Some(category) => {
                        text.push_str(&format!("\n- [{}] {}", category, entry.content))
                    }
                    None => text.push_str(&format!("\n- {}", entry.content)),
                }
            }
            messages.push(ChatMessage::system(text));
        }

        // 3. Own-namespace working-memory inventory: keys and expiries
        // only, never contents.
        let own = self.working.list(Some(namespace)).await?;
        if !own.is_empty() {
            let mut text = format!(
                "Working-memory entries in your namespace ({}). Retrieve any of them with the working-memory read tool:",
                namespace
            );
            for entry in &own {
                text.push_str(&format!(
                    "\n- {} (expires {})",
                    entry.key,
                    entry.expires_at.format("%H:%M:%S")
                ));
            }
            messages.push(ChatMessage::system(text));
        }

        // 4. Patrol findings inventory, user sessions only.
        if is_user_session {
            let patrol = self.working.list(Some("patrol/")).await?;
            if !patrol.is_empty() {
                let mut text = String::from("Patrol findings currently on record:");
                for entry in &patrol {
                    text.push_str(&format!(
                        "\n- {} (expires {})",
                        entry.key,
                        entry.expires_at.format("%H:%M:%S")
                    ));
                }
                messages.push(ChatMessage::system(text));
            }
        }

        // 5. Skill index, once per session.
        if self.skill_index_gate.first_visit(session_id) {
            let skills = self.skills.list().await?;
            if !skills.is_empty() {
                let now = Utc::now();
                let mut text = String::from("Skills on file (retrieve by name when relevant):");
                for skill in &skills {
                    let age_days = (now - skill.updated_at).num_days();
                    text.push_str(&format!(
                        "\n- {} — {} (updated {}d ago)",
                        skill.name, skill.summary, age_days
                    ));
                }
                messages.push(ChatMessage::system(text));
            }
        }

        // 6. Session-start briefing, once per session, first turn only.
        if first_turn {
            if let Some(briefing) = &self.session_start_briefing {
                if self.briefing_gate.first_visit(session_id) {
                    messages.push(ChatMessage::system(briefing.clone()));
                }
            }
        }

        // 7. The last N turns, oldest first.
        let tail_start = turns.len().saturating_sub(self.max_turns);
        for turn in &turns[tail_start..] {
            let role = match turn.role {
                TurnRole::User => ChatRole::User,
                TurnRole::Assistant => ChatRole::Assistant,
                TurnRole::System => ChatRole::System,
                TurnRole::Tool => ChatRole::Tool,
            };
            messages.push(ChatMessage {
                role,
                content: turn.content.clone(),
                tool_calls: Vec::new(),
                tool_call_id: None,
            });
        }

        Ok(messages)
    }
}
