//! Topic name matching for subscriptions.
//!
//! Topics are hierarchical, dot-separated names (`agent.task.scout`).
//! Binding patterns support the AMQP topic-exchange wildcards: `*` matches
//! exactly one segment, `#` matches zero or more segments.

/// A parsed binding pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Single,
    Multi,
}

impl TopicPattern {
    pub fn new(pattern: impl AsRef<str>) -> Self {
        let segments = pattern
            .as_ref()
            .split('.')
            .map(|s| match s {
                "*" => Segment::Single,
                "#" => Segment::Multi,
                literal => Segment::Literal(literal.to_string()),
            })
            .collect();
        Self { segments }
    }

    /// Whether a concrete topic matches this pattern.
    pub fn matches(&self, topic: &str) -> bool {
        let parts: Vec<&str> = topic.split('.').collect();
        matches_at(&self.segments, &parts)
    }
}

fn matches_at(pattern: &[Segment], topic: &[&str]) -> bool {
    match pattern.first() {
        None => topic.is_empty(),
        Some(Segment::Literal(lit)) => {
            topic.first() == Some(&lit.as_str()) && matches_at(&pattern[1..], &topic[1..])
        }
        Some(Segment::Single) => !topic.is_empty() && matches_at(&pattern[1..], &topic[1..]),
        Some(Segment::Multi) => {
            // `#` may swallow zero or more segments.
            (0..=topic.len()).any(|skip| matches_at(&pattern[1..], &topic[skip..]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let pattern = TopicPattern::new("tool.invoke");
        assert!(pattern.matches("tool.invoke"));
        assert!(!pattern.matches("tool.invoke.extra"));
        assert!(!pattern.matches("tool"));
        assert!(!pattern.matches("tool.result"));
    }

    #[test]
    fn test_single_segment_wildcard() {
        let pattern = TopicPattern::new("user.*.userMessage");
        assert!(pattern.matches("user.proxy.userMessage"));
        assert!(pattern.matches("user.other.userMessage"));
        assert!(!pattern.matches("user.userMessage"));
        assert!(!pattern.matches("user.a.b.userMessage"));
    }

    #[test]
    fn test_multi_segment_wildcard() {
        let pattern = TopicPattern::new("agent.task.#");
        assert!(pattern.matches("agent.task"));
        assert!(pattern.matches("agent.task.scout"));
        assert!(pattern.matches("agent.task.cancel.scout"));
        assert!(!pattern.matches("agent.card"));
    }

    #[test]
    fn test_multi_wildcard_in_middle() {
        let pattern = TopicPattern::new("tool.#.refresh");
        assert!(pattern.matches("tool.refresh"));
        assert!(pattern.matches("tool.meta.mcp.refresh"));
        assert!(!pattern.matches("tool.meta.mcp"));
    }

    #[test]
    fn test_bare_hash_matches_everything() {
        let pattern = TopicPattern::new("#");
        assert!(pattern.matches("a"));
        assert!(pattern.matches("a.b.c.d"));
    }
}
