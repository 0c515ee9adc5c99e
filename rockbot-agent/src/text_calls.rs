//! Text-based tool-call parsing.
//!
//! Some models emit tool invocations as plain text instead of structured
//! function calls. Two formats are recognized:
//!
//! 1. `tool_call_name: <name>` followed by `tool_call_arguments: {...}`,
//!    where the JSON may span multiple lines.
//! 2. A bare, known tool name on its own line, optionally followed by a
//!    balanced-brace JSON block.
//!
//! Markdown fences around either format are stripped. JSON bodies are
//! recovered with a brace-depth balance check that respects strings and
//! escapes, so multi-line arguments reassemble correctly.

use std::collections::HashSet;

/// One parsed invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub name: String,
    /// JSON-encoded arguments; `{}` when the model supplied none.
    pub arguments: String,
}

/// Result of scanning a response for textual tool calls.
#[derive(Debug, Clone, PartialEq)]
pub struct TextToolCalls {
    /// Text preceding the first call, preserved as the assistant message.
    pub preamble: String,
    pub calls: Vec<ParsedToolCall>,
}

/// Scan a model response for textual tool calls. Returns `None` when the
/// text contains no recognizable invocation.
pub fn parse_text_tool_calls(text: &str, known_tools: &HashSet<String>) -> Option<TextToolCalls> {
    let cleaned = strip_fences(text);
    let mut calls = Vec::new();
    let mut preamble: Option<String> = None;
    let mut consumed_until = 0;

    let mut offset = 0;
    for line in cleaned.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        if line_start < consumed_until {
            continue;
        }
        let trimmed = line.trim();

        // Format 1: explicit name/arguments markers.
        if let Some(name) = trimmed.strip_prefix("tool_call_name:") {
            let name = name.trim().to_string();
            if name.is_empty() {
                continue;
            }
            let rest = &cleaned[line_start + line.len()..];
            let (arguments, consumed) = parse_arguments_marker(rest);
            if preamble.is_none() {
                preamble = Some(cleaned[..line_start].trim().to_string());
            }
            calls.push(ParsedToolCall { name, arguments });
            consumed_until = line_start + line.len() + consumed;
            continue;
        }

        // Format 2: a bare known tool name, optional JSON block below.
        let bare = trimmed.trim_matches('`');
        if known_tools.contains(bare) {
            let rest = &cleaned[line_start + line.len()..];
            let (arguments, consumed) = leading_json_block(rest)
                .map(|(json, end)| (json.to_string(), end))
                .unwrap_or_else(|| ("{}".to_string(), 0));
            if preamble.is_none() {
                preamble = Some(cleaned[..line_start].trim().to_string());
            }
            calls.push(ParsedToolCall {
                name: bare.to_string(),
                arguments,
            });
            consumed_until = line_start + line.len() + consumed;
        }
    }

    if calls.is_empty() {
        return None;
    }
    Some(TextToolCalls {
        preamble: preamble.unwrap_or_default(),
        calls,
    })
}

/// Parse the `tool_call_arguments:` marker that follows a name marker.
/// Returns the JSON (or `{}`) and how many bytes of `rest` were consumed.
fn parse_arguments_marker(rest: &str) -> (String, usize) {
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            offset += line.len();
            continue;
        }
        if let Some(after) = trimmed.strip_prefix("tool_call_arguments:") {
            // JSON may start on this line or a following one.
            let marker_pos = offset + line.find("tool_call_arguments:").unwrap_or(0);
            let json_region = &rest[marker_pos + "tool_call_arguments:".len()..];
            if after.trim().is_empty() || after.trim().starts_with('{') || json_region.contains('{')
            {
                if let Some((json, end)) = leading_json_block(json_region) {
                    let consumed = marker_pos + "tool_call_arguments:".len() + end;
                    return (json.to_string(), consumed);
                }
            }
            // Marker present but no balanced JSON: treat as empty args.
            return ("{}".to_string(), offset + line.len());
        }
        // The next non-empty line is not an arguments marker.
        break;
    }
    ("{}".to_string(), 0)
}

/// Find a balanced JSON object at the start of `input` (ignoring leading
/// whitespace). Returns the JSON slice and the end index within `input`.
fn leading_json_block(input: &str) -> Option<(&str, usize)> {
    let start = input.find(|c: char| !c.is_whitespace())?;
    if input.as_bytes()[start] != b'{' {
        return None;
    }
    let body = &input[start..];
    let len = balanced_brace_length(body)?;
    Some((&body[..len], start + len))
}

/// Length of the balanced `{...}` block at the start of `input`, honoring
/// strings and escape sequences. `None` if the braces never balance.
pub fn balanced_brace_length(input: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

/// Remove markdown fence lines (``` with optional language tag) while
/// keeping their contents.
fn strip_fences(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_format_one_single_line() {
        let text = "Checking now.\ntool_call_name: search_memory\ntool_call_arguments: {\"query\": \"meeting\"}";
        let parsed = parse_text_tool_calls(text, &known(&[])).unwrap();
        assert_eq!(parsed.preamble, "Checking now.");
        assert_eq!(parsed.calls.len(), 1);
        assert_eq!(parsed.calls[0].name, "search_memory");
        assert_eq!(parsed.calls[0].arguments, "{\"query\": \"meeting\"}");
    }

    #[test]
    fn test_format_one_multiline_json() {
        let text = "tool_call_name: remember\ntool_call_arguments: {\n  \"content\": \"a longer value\",\n  \"tags\": [\"x\"]\n}";
        let parsed = parse_text_tool_calls(text, &known(&[])).unwrap();
        assert_eq!(parsed.calls.len(), 1);
        let args: serde_json::Value = serde_json::from_str(&parsed.calls[0].arguments).unwrap();
        assert_eq!(args["content"], "a longer value");
        assert_eq!(args["tags"][0], "x");
    }

    #[test]
    fn test_format_one_arguments_on_next_line() {
        let text = "tool_call_name: list_skills\ntool_call_arguments:\n{}";
        let parsed = parse_text_tool_calls(text, &known(&[])).unwrap();
        assert_eq!(parsed.calls[0].arguments, "{}");
    }

    #[test]
    fn test_format_one_missing_arguments_marker() {
        let text = "tool_call_name: list_skills\nthat is all";
        let parsed = parse_text_tool_calls(text, &known(&[])).unwrap();
        assert_eq!(parsed.calls[0].arguments, "{}");
    }

    #[test]
    fn test_format_two_bare_name_with_json() {
        let text = "I will look that up.\nsearch_memory\n{\"query\": \"standup\"}";
        let parsed = parse_text_tool_calls(text, &known(&["search_memory"])).unwrap();
        assert_eq!(parsed.preamble, "I will look that up.");
        assert_eq!(parsed.calls[0].name, "search_memory");
        assert_eq!(parsed.calls[0].arguments, "{\"query\": \"standup\"}");
    }

    #[test]
    fn test_format_two_bare_name_without_json() {
        let text = "list_skills";
        let parsed = parse_text_tool_calls(text, &known(&["list_skills"])).unwrap();
        assert_eq!(parsed.calls[0].arguments, "{}");
    }

    #[test]
    fn test_unknown_bare_name_not_a_call() {
        let text = "make_coffee\n{\"sugar\": 2}";
        assert!(parse_text_tool_calls(text, &known(&["search_memory"])).is_none());
    }

    #[test]
    fn test_markdown_fences_stripped() {
        let text = "```json\ntool_call_name: search_memory\ntool_call_arguments: {\"query\": \"x\"}\n```";
        let parsed = parse_text_tool_calls(text, &known(&[])).unwrap();
        assert_eq!(parsed.calls[0].name, "search_memory");
    }

    #[test]
    fn test_multiple_calls() {
        let text = "tool_call_name: a_tool\ntool_call_arguments: {\"n\": 1}\ntool_call_name: b_tool\ntool_call_arguments: {\"n\": 2}";
        let parsed = parse_text_tool_calls(text, &known(&[])).unwrap();
        assert_eq!(parsed.calls.len(), 2);
        assert_eq!(parsed.calls[0].name, "a_tool");
        assert_eq!(parsed.calls[1].name, "b_tool");
    }

    #[test]
    fn test_plain_text_is_not_a_call() {
        assert!(parse_text_tool_calls("The meeting is at noon.", &known(&["search_memory"]))
            .is_none());
        assert!(parse_text_tool_calls("", &known(&[])).is_none());
    }

    // Brace-balance pathologies.

    #[test]
    fn test_balance_braces_inside_strings() {
        let input = r#"{"text": "a { b } c }{"}"#;
        assert_eq!(balanced_brace_length(input), Some(input.len()));
    }

    #[test]
    fn test_balance_escaped_quotes() {
        let input = r#"{"text": "she said \"hi\" {"}"#;
        assert_eq!(balanced_brace_length(input), Some(input.len()));
    }

    #[test]
    fn test_balance_nested_objects() {
        let input = r#"{"a": {"b": {"c": 1}}} trailing"#;
        let len = balanced_brace_length(input).unwrap();
        assert_eq!(&input[..len], r#"{"a": {"b": {"c": 1}}}"#);
    }

    #[test]
    fn test_balance_never_closes() {
        assert_eq!(balanced_brace_length(r#"{"a": 1"#), None);
        assert_eq!(balanced_brace_length(r#"{"a": "unterminated }"#), None);
    }

    #[test]
    fn test_balance_escaped_backslash_before_quote() {
        // The backslash is itself escaped, so the quote closes the string.
        let input = r#"{"path": "C:\\"}"#;
        assert_eq!(balanced_brace_length(input), Some(input.len()));
    }

    #[test]
    fn test_unbalanced_arguments_fall_back_to_empty() {
        let text = "tool_call_name: search_memory\ntool_call_arguments: {\"query\": \"never closed";
        let parsed = parse_text_tool_calls(text, &known(&[])).unwrap();
        assert_eq!(parsed.calls[0].arguments, "{}");
    }
}
