//! Model-specific behavior records.
//!
//! Models differ in how they signal tool use, how many iterations they
//! need, and what extra prompting keeps them on the rails. A
//! [`ModelBehavior`] captures those knobs; the registry selects one by
//! longest matching model-id prefix. Prompt files on the data volume
//! (`model-behaviors/<prefix>/additional-system-prompt.md`,
//! `model-behaviors/<prefix>/pre-tool-loop-prompt.md`) override inline
//! configuration.

use std::path::Path;

/// How a scheduled task's output is folded into its report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledTaskResultMode {
    Summarize,
    VerbatimOutput,
    SummarizeWithOutput,
}

pub const DEFAULT_CHUNKING_THRESHOLD: usize = 16_000;

#[derive(Debug, Clone)]
pub struct ModelBehavior {
    /// Model-id prefix this behavior applies to. Empty matches everything.
    pub model_prefix: String,
    pub additional_system_prompt: Option<String>,
    pub pre_tool_loop_prompt: Option<String>,
    /// Phrases that, as a first response, indicate the model is "setting
    /// up" and needs the loop to continue instead of ending the turn.
    pub setup_phrases: Vec<String>,
    pub nudge_on_hallucinated_tool_calls: bool,
    pub max_tool_iterations_override: Option<usize>,
    pub scheduled_task_result_mode: ScheduledTaskResultMode,
    pub tool_result_chunking_threshold: usize,
}

impl Default for ModelBehavior {
    fn default() -> Self {
        Self {
            model_prefix: String::new(),
            additional_system_prompt: None,
            pre_tool_loop_prompt: None,
            setup_phrases: Vec::new(),
            nudge_on_hallucinated_tool_calls: false,
            max_tool_iterations_override: None,
            scheduled_task_result_mode: ScheduledTaskResultMode::Summarize,
            tool_result_chunking_threshold: DEFAULT_CHUNKING_THRESHOLD,
        }
    }
}

impl ModelBehavior {
    pub fn for_prefix(prefix: impl Into<String>) -> Self {
        Self {
            model_prefix: prefix.into(),
            ..Default::default()
        }
    }

    /// Whether a first response looks like a known setup phrase rather
    /// than an answer.
    pub fn is_setup_phrase(&self, content: &str) -> bool {
        let content = content.trim().to_lowercase();
        self.setup_phrases
            .iter()
            .any(|p| content.starts_with(&p.to_lowercase()))
    }
}

/// Registry of behaviors with longest-prefix selection.
#[derive(Default)]
pub struct ModelBehaviorRegistry {
    behaviors: Vec<ModelBehavior>,
}

impl ModelBehaviorRegistry {
    pub fn new(behaviors: Vec<ModelBehavior>) -> Self {
        Self { behaviors }
    }

    pub fn push(&mut self, behavior: ModelBehavior) {
        self.behaviors.push(behavior);
    }

    /// Behavior for a model id: the registered entry with the longest
    /// matching prefix, or the default when nothing matches.
    pub fn select(&self, model_id: &str) -> ModelBehavior {
        self.behaviors
            .iter()
            .filter(|b| model_id.starts_with(&b.model_prefix))
            .max_by_key(|b| b.model_prefix.len())
            .cloned()
            .unwrap_or_default()
    }

    /// Merge prompt files under `{base}/model-behaviors/<prefix>/` into
    /// the registry. File contents take precedence over inline values;
    /// directories for unknown prefixes create new entries.
    pub async fn load_overrides(&mut self, base: &Path) {
        let dir = base.join("model-behaviors");
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(read_dir) => read_dir,
            Err(_) => return,
        };

        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let prefix = entry.file_name().to_string_lossy().to_string();
            let additional =
                tokio::fs::read_to_string(entry.path().join("additional-system-prompt.md"))
                    .await
                    .ok()
                    .map(|s| s.trim().to_string());
            let pre_loop = tokio::fs::read_to_string(entry.path().join("pre-tool-loop-prompt.md"))
                .await
                .ok()
                .map(|s| s.trim().to_string());
            if additional.is_none() && pre_loop.is_none() {
                continue;
            }

            match self
                .behaviors
                .iter_mut()
                .find(|b| b.model_prefix == prefix)
            {
                Some(behavior) => {
                    if additional.is_some() {
                        behavior.additional_system_prompt = additional;
                    }
                    if pre_loop.is_some() {
                        behavior.pre_tool_loop_prompt = pre_loop;
                    }
                }
                None => {
                    let mut behavior = ModelBehavior::for_prefix(prefix);
                    behavior.additional_system_prompt = additional;
                    behavior.pre_tool_loop_prompt = pre_loop;
                    self.behaviors.push(behavior);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_prefix_wins() {
        let registry = ModelBehaviorRegistry::new(vec![
            ModelBehavior {
                max_tool_iterations_override: Some(3),
                ..ModelBehavior::for_prefix("qwen")
            },
            ModelBehavior {
                max_tool_iterations_override: Some(8),
                ..ModelBehavior::for_prefix("qwen3-coder")
            },
        ]);

        assert_eq!(
            registry.select("qwen3-coder-480b").max_tool_iterations_override,
            Some(8)
        );
        assert_eq!(
            registry.select("qwen2-72b").max_tool_iterations_override,
            Some(3)
        );
        // No match falls back to the default behavior.
        assert_eq!(
            registry.select("claude-sonnet").max_tool_iterations_override,
            None
        );
    }

    #[test]
    fn test_setup_phrase_detection() {
        let behavior = ModelBehavior {
            setup_phrases: vec!["Let me check".to_string()],
            ..Default::default()
        };
        assert!(behavior.is_setup_phrase("let me check the calendar."));
        assert!(!behavior.is_setup_phrase("The meeting is at noon."));
    }

    #[tokio::test]
    async fn test_file_overrides_beat_inline() {
        let dir = tempfile::tempdir().unwrap();
        let prefix_dir = dir.path().join("model-behaviors").join("qwen");
        tokio::fs::create_dir_all(&prefix_dir).await.unwrap();
        tokio::fs::write(
            prefix_dir.join("additional-system-prompt.md"),
            "From the file.\n",
        )
        .await
        .unwrap();

        let mut registry = ModelBehaviorRegistry::new(vec![ModelBehavior {
            additional_system_prompt: Some("Inline.".to_string()),
            ..ModelBehavior::for_prefix("qwen")
        }]);
        registry.load_overrides(dir.path()).await;

        assert_eq!(
            registry.select("qwen3").additional_system_prompt.as_deref(),
            Some("From the file.")
        );
    }

    #[tokio::test]
    async fn test_override_dir_creates_new_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let prefix_dir = dir.path().join("model-behaviors").join("llama");
        tokio::fs::create_dir_all(&prefix_dir).await.unwrap();
        tokio::fs::write(prefix_dir.join("pre-tool-loop-prompt.md"), "Plan first.")
            .await
            .unwrap();

        let mut registry = ModelBehaviorRegistry::default();
        registry.load_overrides(dir.path()).await;

        assert_eq!(
            registry.select("llama3-70b").pre_tool_loop_prompt.as_deref(),
            Some("Plan first.")
        );
    }
}
