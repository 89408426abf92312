use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Per-step-loop knobs consumed by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Iterations of the step loop before a node visit escalates.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Tool calls executed per LLM turn; extras get error results.
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls_per_turn: usize,
    /// Token budget that triggers opportunistic history compaction at
    /// node boundaries of continuous conversations.
    #[serde(default = "default_max_history_tokens")]
    pub max_history_tokens: usize,
    /// Per-turn attempts for transient LLM failures.
    #[serde(default = "default_llm_retry_attempts")]
    pub llm_retry_attempts: u32,
    /// Base backoff between transient retries, in milliseconds.
    #[serde(default = "default_llm_retry_base_ms")]
    pub llm_retry_base_ms: u64,
}

fn default_max_iterations() -> u32 {
    30
}

fn default_max_tool_calls() -> usize {
    8
}

fn default_max_history_tokens() -> usize {
    80_000
}

fn default_llm_retry_attempts() -> u32 {
    3
}

fn default_llm_retry_base_ms() -> u64 {
    500
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_tool_calls_per_turn: default_max_tool_calls(),
            max_history_tokens: default_max_history_tokens(),
            llm_retry_attempts: default_llm_retry_attempts(),
            llm_retry_base_ms: default_llm_retry_base_ms(),
        }
    }
}

/// One webhook route on the embedded listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRoute {
    /// Identifier stamped into WEBHOOK_RECEIVED events.
    pub source_id: String,
    /// HTTP path, e.g. "/hooks/github".
    pub path: String,
    /// Shared secret for HMAC-SHA256 verification. None = unverified.
    #[serde(default)]
    pub secret: Option<String>,
}

/// Embedded webhook listener configuration. The listener only starts when
/// at least one route is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_bind")]
    pub bind: String,
    #[serde(default)]
    pub routes: Vec<WebhookRoute>,
}

fn default_webhook_bind() -> String {
    "127.0.0.1:8732".to_string()
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            bind: default_webhook_bind(),
            routes: vec![],
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Root of all session storage for this runtime.
    pub storage_root: PathBuf,
    #[serde(default)]
    pub loop_config: LoopConfig,
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
    /// Event-bus buffer size per subscription.
    #[serde(default = "default_bus_buffer")]
    pub bus_buffer: usize,
}

fn default_bus_buffer() -> usize {
    1024
}

impl RuntimeConfig {
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
            loop_config: LoopConfig::default(),
            webhook: None,
            bus_buffer: default_bus_buffer(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_defaults_fill_in() {
        let config: LoopConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_iterations, 30);
        assert_eq!(config.max_tool_calls_per_turn, 8);
        assert_eq!(config.llm_retry_attempts, 3);
    }

    #[test]
    fn webhook_route_secret_is_optional() {
        let route: WebhookRoute =
            serde_json::from_str(r#"{"source_id": "gh", "path": "/hooks/gh"}"#).unwrap();
        assert!(route.secret.is_none());
    }
}
