//! Environment-driven agent configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Settings for one agent process.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_name: String,
    /// User-proxy topic prefix (`<proxy>.userMessage` etc.).
    pub user_proxy: String,
    /// Reply topic used when an envelope carries no `ReplyTo`.
    pub default_reply_topic: String,
    /// Persistent configuration directory (soul.md, mcp.json, ...).
    pub data_volume: PathBuf,
    pub max_tool_iterations: usize,
    pub tool_timeout: Duration,
    pub progress_interval: Duration,
    pub working_memory_ttl: Duration,
    pub working_memory_namespace_cap: usize,
    pub max_concurrent_subagents: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_name: "rockbot".to_string(),
            user_proxy: "user.proxy".to_string(),
            default_reply_topic: "user.proxy.userResponse".to_string(),
            data_volume: PathBuf::from("/data"),
            max_tool_iterations: 5,
            tool_timeout: Duration::from_secs(60),
            progress_interval: Duration::from_secs(5),
            working_memory_ttl: Duration::from_secs(60 * 60),
            working_memory_namespace_cap: 100,
            max_concurrent_subagents: 3,
        }
    }
}

impl AgentConfig {
    /// Read settings from `ROCKBOT_*` environment variables, falling back
    /// to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |name: &str, fallback: String| std::env::var(name).unwrap_or(fallback);
        let parse = |name: &str, fallback: u64| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(fallback)
        };

        let agent_name = var("ROCKBOT_AGENT_NAME", defaults.agent_name);
        let user_proxy = var("ROCKBOT_USER_PROXY", defaults.user_proxy);
        let default_reply_topic = var(
            "ROCKBOT_REPLY_TOPIC",
            format!("{user_proxy}.userResponse"),
        );
        Self {
            agent_name,
            user_proxy,
            default_reply_topic,
            data_volume: PathBuf::from(var(
                "ROCKBOT_DATA_VOLUME",
                defaults.data_volume.display().to_string(),
            )),
            max_tool_iterations: parse(
                "ROCKBOT_MAX_TOOL_ITERATIONS",
                defaults.max_tool_iterations as u64,
            ) as usize,
            tool_timeout: Duration::from_secs(parse(
                "ROCKBOT_TOOL_TIMEOUT_SECS",
                defaults.tool_timeout.as_secs(),
            )),
            progress_interval: Duration::from_secs(parse(
                "ROCKBOT_PROGRESS_INTERVAL_SECS",
                defaults.progress_interval.as_secs(),
            )),
            working_memory_ttl: Duration::from_secs(parse(
                "ROCKBOT_WORKING_MEMORY_TTL_SECS",
                defaults.working_memory_ttl.as_secs(),
            )),
            working_memory_namespace_cap: parse(
                "ROCKBOT_WORKING_MEMORY_NAMESPACE_CAP",
                defaults.working_memory_namespace_cap as u64,
            ) as usize,
            max_concurrent_subagents: parse(
                "ROCKBOT_MAX_CONCURRENT_SUBAGENTS",
                defaults.max_concurrent_subagents as u64,
            ) as usize,
        }
    }
}
