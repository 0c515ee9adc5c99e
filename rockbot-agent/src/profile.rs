//! Agent identity and profile.
//!
//! The profile is loaded once at startup from the agent's data volume
//! (`soul.md`, `directives.md`, `style.md`, `memory-rules.md`) and is
//! immutable thereafter.

use std::path::Path;

use crate::error::AgentError;

/// Process-wide agent identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub name: String,
}

impl AgentIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A markdown document split into `##`-headed sections.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarkdownDoc {
    raw: String,
    sections: Vec<(String, String)>,
}

impl MarkdownDoc {
    pub fn parse(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let mut sections: Vec<(String, String)> = Vec::new();
        let mut current: Option<(String, Vec<&str>)> = None;
        let mut preamble: Vec<&str> = Vec::new();

        for line in raw.lines() {
            if let Some(title) = line.strip_prefix("## ") {
                if let Some((t, body)) = current.take() {
                    sections.push((t, body.join("\n").trim().to_string()));
                }
                current = Some((title.trim().to_string(), Vec::new()));
            } else {
                match &mut current {
                    Some((_, body)) => body.push(line),
                    None => preamble.push(line),
                }
            }
        }
        if let Some((t, body)) = current.take() {
            sections.push((t, body.join("\n").trim().to_string()));
        }
        if !preamble.is_empty() {
            let text = preamble.join("\n").trim().to_string();
            if !text.is_empty() {
                sections.insert(0, (String::new(), text));
            }
        }

        Self { raw, sections }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn sections(&self) -> &[(String, String)] {
        &self.sections
    }

    pub fn section(&self, title: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|(t, _)| t.eq_ignore_ascii_case(title))
            .map(|(_, body)| body.as_str())
    }
}

/// The agent's personality and standing instructions.
#[derive(Debug, Clone, Default)]
pub struct AgentProfile {
    pub soul: MarkdownDoc,
    pub directives: MarkdownDoc,
    pub style: Option<MarkdownDoc>,
    pub memory_rules: Option<MarkdownDoc>,
}

impl AgentProfile {
    /// Load from the data volume. `soul.md` and `directives.md` are
    /// required; `style.md` and `memory-rules.md` are optional.
    pub async fn load(data_volume: &Path) -> Result<Self, AgentError> {
        let required = |name: &str| {
            let path = data_volume.join(name);
            async move {
                tokio::fs::read_to_string(&path).await.map_err(|e| {
                    AgentError::Config(format!("cannot read {}: {}", path.display(), e))
                })
            }
        };
        let optional = |name: &str| {
            let path = data_volume.join(name);
            async move { tokio::fs::read_to_string(&path).await.ok() }
        };

        Ok(Self {
            soul: MarkdownDoc::parse(required("soul.md").await?),
            directives: MarkdownDoc::parse(required("directives.md").await?),
            style: optional("style.md").await.map(MarkdownDoc::parse),
            memory_rules: optional("memory-rules.md").await.map(MarkdownDoc::parse),
        })
    }

    /// The profile portion of the system prompt: soul, directives, and
    /// style in that order.
    pub fn system_prompt(&self) -> String {
        let mut parts = vec![self.soul.raw().trim(), self.directives.raw().trim()];
        if let Some(style) = &self.style {
            parts.push(style.raw().trim());
        }
        parts.retain(|p| !p.is_empty());
        parts.join("\n\n")
    }
}
