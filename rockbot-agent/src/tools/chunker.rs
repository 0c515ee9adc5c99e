//! Chunking wrapper for oversized tool results.
//!
//! Large tool output would blow the model context, so the wrapper stores
//! it in working memory in pieces and hands the model an index table
//! instead. The model then pulls individual chunks through the
//! working-memory read tool (which is exempt from chunking, so retrieval
//! can never recurse).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rockbot_proto::{ToolInvokeRequest, ToolInvokeResponse};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{builtin, ToolExecutor};
use crate::memory::WorkingMemory;

#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    /// Results longer than this are chunked (or truncated without a
    /// session).
    pub threshold: usize,
    /// Hard upper bound on a single chunk.
    pub max_chunk: usize,
    /// How long chunks stay retrievable.
    pub ttl: Duration,
    /// Tools whose output is never chunked.
    pub exempt_tools: HashSet<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        let mut exempt_tools = HashSet::new();
        exempt_tools.insert(builtin::WORKING_MEMORY_READ.to_string());
        Self {
            threshold: 16_000,
            max_chunk: 20_000,
            ttl: Duration::from_secs(20 * 60),
            exempt_tools,
        }
    }
}

impl ChunkingConfig {
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// Config with the threshold the active model behavior asks for.
    pub fn for_behavior(behavior: &crate::behavior::ModelBehavior) -> Self {
        Self::default().with_threshold(behavior.tool_result_chunking_threshold)
    }
}

/// Decorates any executor with result chunking.
pub struct ChunkingExecutor {
    inner: Arc<dyn ToolExecutor>,
    working: Arc<dyn WorkingMemory>,
    config: ChunkingConfig,
}

impl ChunkingExecutor {
    pub fn new(
        inner: Arc<dyn ToolExecutor>,
        working: Arc<dyn WorkingMemory>,
        config: ChunkingConfig,
    ) -> Self {
        Self {
            inner,
            working,
            config,
        }
    }

    fn sanitize_tool_name(name: &str) -> String {
        name.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    /// Cut an oversized result down to the threshold with an explicit
    /// omission marker. Used whenever the chunks cannot be parked in
    /// working memory; the caller never sees the full result.
    fn truncate_response(&self, response: ToolInvokeResponse) -> ToolInvokeResponse {
        let omitted = response.content.len() - self.config.threshold;
        let cut = floor_char_boundary(&response.content, self.config.threshold);
        let content = format!(
            "{}\n… [{} chars omitted]",
            &response.content[..cut],
            omitted
        );
        ToolInvokeResponse { content, ..response }
    }
}

#[async_trait]
impl ToolExecutor for ChunkingExecutor {
    async fn execute(
        &self,
        request: ToolInvokeRequest,
        token: CancellationToken,
    ) -> ToolInvokeResponse {
        let response = self.inner.execute(request.clone(), token).await;
        if response.is_error
            || response.content.len() <= self.config.threshold
            || self.config.exempt_tools.contains(&request.tool_name)
        {
            return response;
        }

        let session_id = match &request.session_id {
            Some(session_id) => session_id.clone(),
            // No session, nowhere to park the chunks.
            None => return self.truncate_response(response),
        };

        let run_id = Uuid::new_v4().simple().to_string();
        let run_id = &run_id[..8];
        let tool = Self::sanitize_tool_name(&request.tool_name);
        let chunks = split_chunks(&response.content, self.config.max_chunk);

        let mut table = format!(
            "The {} result is {} characters, too large to inline. It was split into {} chunks \
             stored in working memory for {} minutes. Retrieve each chunk with the {} tool.\n\n\
             | Section | Key |\n|---|---|\n",
            request.tool_name,
            response.content.len(),
            chunks.len(),
            self.config.ttl.as_secs() / 60,
            builtin::WORKING_MEMORY_READ,
        );

        for (i, chunk) in chunks.iter().enumerate() {
            let key = format!("session/{}/tool:{}:{}:chunk{}", session_id, tool, run_id, i);
            if let Err(err) = self
                .working
                .set(&key, &chunk.content, Some(self.config.ttl), None, vec![])
                .await
            {
                // The oversized result must never reach the caller, even
                // when the store misbehaves.
                tracing::warn!(%key, error = %err, "failed to store tool-result chunk");
                return self.truncate_response(response);
            }
            table.push_str(&format!("| {} | {} |\n", chunk.heading, key));
        }

        ToolInvokeResponse {
            tool_call_id: response.tool_call_id,
            tool_name: response.tool_name,
            content: table,
            is_error: false,
        }
    }
}

pub(crate) struct Chunk {
    pub heading: String,
    pub content: String,
}

/// Split text into chunks of at most `max_chunk` characters, preferring
/// markdown-heading boundaries, then blank lines, hard-splitting only when
/// a single block exceeds the limit.
pub(crate) fn split_chunks(text: &str, max_chunk: usize) -> Vec<Chunk> {
    let blocks = split_at_headings(text);
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut current = String::new();

    let mut flush = |current: &mut String, chunks: &mut Vec<Chunk>| {
        if !current.trim().is_empty() {
            chunks.push(Chunk {
                heading: heading_of(current, chunks.len()),
                content: std::mem::take(current),
            });
        } else {
            current.clear();
        }
    };

    for block in blocks {
        if block.len() > max_chunk {
            flush(&mut current, &mut chunks);
            for piece in split_block(&block, max_chunk) {
                chunks.push(Chunk {
                    heading: heading_of(&piece, chunks.len()),
                    content: piece,
                });
            }
            continue;
        }
        if current.len() + block.len() > max_chunk {
            flush(&mut current, &mut chunks);
        }
        current.push_str(&block);
    }
    flush(&mut current, &mut chunks);
    chunks
}

/// Blocks beginning at markdown heading lines; the first block may have no
/// heading.
fn split_at_headings(text: &str) -> Vec<String> {
    let mut blocks: Vec<String> = Vec::new();
    let mut current = String::new();
    for line in text.split_inclusive('\n') {
        if line.trim_start().starts_with('#') && !current.is_empty() {
            blocks.push(std::mem::take(&mut current));
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

/// Split one oversized block at blank lines, hard-splitting what remains.
fn split_block(block: &str, max_chunk: usize) -> Vec<String> {
    let mut pieces: Vec<String> = Vec::new();
    let mut current = String::new();
    for paragraph in block.split_inclusive("\n\n") {
        if paragraph.len() > max_chunk {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
            let mut rest = paragraph;
            while rest.len() > max_chunk {
                let cut = floor_char_boundary(rest, max_chunk);
                pieces.push(rest[..cut].to_string());
                rest = &rest[cut..];
            }
            current.push_str(rest);
            continue;
        }
        if current.len() + paragraph.len() > max_chunk {
            pieces.push(std::mem::take(&mut current));
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

fn heading_of(content: &str, index: usize) -> String {
    content
        .lines()
        .find(|l| l.trim_start().starts_with('#'))
        .map(|l| l.trim_start_matches(['#', ' ']).trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| format!("Part {}", index + 1))
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::memory::{InMemoryWorkingMemory, WorkingMemoryEntry};
    use crate::tools::ok_response;

    struct BigResultTool(String);

    #[async_trait]
    impl ToolExecutor for BigResultTool {
        async fn execute(
            &self,
            request: ToolInvokeRequest,
            _token: CancellationToken,
        ) -> ToolInvokeResponse {
            ok_response(&request, self.0.clone())
        }
    }

    fn request(tool: &str, session: Option<&str>) -> ToolInvokeRequest {
        ToolInvokeRequest {
            tool_call_id: "c1".to_string(),
            tool_name: tool.to_string(),
            arguments: "{}".to_string(),
            session_id: session.map(str::to_string),
        }
    }

    fn wrapper(
        content: String,
        config: ChunkingConfig,
    ) -> (ChunkingExecutor, Arc<InMemoryWorkingMemory>) {
        let working = Arc::new(InMemoryWorkingMemory::new());
        let executor = ChunkingExecutor::new(
            Arc::new(BigResultTool(content)),
            working.clone(),
            config,
        );
        (executor, working)
    }

    #[tokio::test]
    async fn test_small_results_pass_through() {
        let (executor, working) = wrapper("short".to_string(), ChunkingConfig::default());
        let response = executor
            .execute(request("web_browse", Some("s1")), CancellationToken::new())
            .await;
        assert_eq!(response.content, "short");
        assert!(working.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_result_is_chunked_and_retrievable() {
        let section = |n: usize| format!("# Section {n}\n{}\n\n", "x".repeat(9_000));
        let content: String = (0..5).map(section).collect();
        let config = ChunkingConfig {
            threshold: 16_000,
            max_chunk: 20_000,
            ..Default::default()
        };
        let (executor, working) = wrapper(content.clone(), config);

        let response = executor
            .execute(request("web_browse", Some("s4")), CancellationToken::new())
            .await;

        // The caller never sees more than the threshold.
        assert!(response.content.len() <= 16_000);
        assert!(!response.is_error);
        assert!(response.content.contains("| Section |"));

        let stored = working.list(Some("session/s4/tool:web_browse:")).await.unwrap();
        assert!(stored.len() >= 2);
        // Every advertised key is in the table and retrievable, and the
        // chunks reassemble to the original content.
        let mut reassembled = String::new();
        for entry in &stored {
            assert!(response.content.contains(&entry.key));
            let fetched = working.get(&entry.key).await.unwrap().unwrap();
            reassembled.push_str(&fetched.value);
        }
        assert_eq!(reassembled, content);
        // TTL is the configured 20 minutes.
        let ttl = stored[0].expires_at - stored[0].stored_at;
        assert_eq!(ttl.num_minutes(), 20);
    }

    struct BrokenWorkingMemory;

    #[async_trait]
    impl WorkingMemory for BrokenWorkingMemory {
        async fn set(
            &self,
            _key: &str,
            _value: &str,
            _ttl: Option<Duration>,
            _category: Option<String>,
            _tags: Vec<String>,
        ) -> Result<(), StoreError> {
            Err(StoreError::new("disk full"))
        }

        async fn get(&self, _key: &str) -> Result<Option<WorkingMemoryEntry>, StoreError> {
            Ok(None)
        }

        async fn list(&self, _prefix: Option<&str>) -> Result<Vec<WorkingMemoryEntry>, StoreError> {
            Ok(Vec::new())
        }

        async fn search(
            &self,
            _query: &str,
            _prefix: Option<&str>,
        ) -> Result<Vec<WorkingMemoryEntry>, StoreError> {
            Ok(Vec::new())
        }

        async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_store_failure_truncates_instead_of_leaking() {
        let executor = ChunkingExecutor::new(
            Arc::new(BigResultTool("y".repeat(40_000))),
            Arc::new(BrokenWorkingMemory),
            ChunkingConfig::default().with_threshold(16_000),
        );

        let response = executor
            .execute(request("web_browse", Some("s9")), CancellationToken::new())
            .await;

        // A failed chunk write still never leaks the oversized result.
        assert!(response.content.contains("chars omitted"));
        assert!(response.content.len() < 17_000);
        assert!(!response.is_error);
    }

    #[tokio::test]
    async fn test_no_session_truncates_with_marker() {
        let (executor, working) = wrapper(
            "y".repeat(20_000),
            ChunkingConfig::default().with_threshold(16_000),
        );
        let response = executor
            .execute(request("web_browse", None), CancellationToken::new())
            .await;
        assert!(response.content.contains("chars omitted"));
        assert!(response.content.len() < 20_000);
        assert!(working.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exempt_tool_never_chunked() {
        let (executor, working) = wrapper(
            "z".repeat(50_000),
            ChunkingConfig::default().with_threshold(16_000),
        );
        let response = executor
            .execute(
                request(builtin::WORKING_MEMORY_READ, Some("s1")),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(response.content.len(), 50_000);
        assert!(working.list(None).await.unwrap().is_empty());
    }

    #[test]
    fn test_split_prefers_heading_boundaries() {
        let text = format!(
            "# A\n{}\n# B\n{}\n# C\n{}\n",
            "a".repeat(50),
            "b".repeat(50),
            "c".repeat(50)
        );
        let chunks = split_chunks(&text, 120);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].content.starts_with("# A"));
        assert!(chunks[1].content.starts_with("# C"));
        assert_eq!(chunks[0].heading, "A");
        assert_eq!(chunks[1].heading, "C");
    }

    #[test]
    fn test_hard_split_on_unbroken_text() {
        let text = "q".repeat(45);
        let chunks = split_chunks(&text, 20);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.content.len() <= 20));
        let total: usize = chunks.iter().map(|c| c.content.len()).sum();
        assert_eq!(total, 45);
    }

    #[test]
    fn test_chunks_never_exceed_max() {
        let text = format!(
            "# H\n{}\n\n{}\n\n{}",
            "a".repeat(30),
            "b".repeat(30),
            "c".repeat(70)
        );
        for chunk in split_chunks(&text, 64) {
            assert!(chunk.content.len() <= 64, "{}", chunk.content.len());
        }
    }
}
