use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrellisError {
    // Registry lookups — caller mistakes, non-retryable
    #[error("Graph not found: {0}")]
    GraphNotFound(String),

    #[error("Entry point not found: {0}")]
    EntryPointNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Node not found in graph: {0}")]
    NodeNotFound(String),

    #[error("Stream busy: {0}")]
    StreamBusy(String),

    // Graph loading
    #[error("Graph validation failed: {0}")]
    GraphValidation(String),

    #[error("Edge expression parse error: {0}")]
    Expression(String),

    // LLM errors
    #[error("LLM transient failure: {0}")]
    LlmTransient(String),

    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    // Credentials
    #[error("Credential unavailable: {0}")]
    CredentialUnavailable(String),

    // Execution
    #[error("Node {node} escalated: {rationale}")]
    JudgeEscalated { node: String, rationale: String },

    #[error("Node {node} exceeded max iterations ({max})")]
    MaxIterationsExceeded { node: String, max: u32 },

    #[error("Execution reached a dead end at node {0}")]
    DeadEnd(String),

    #[error("Execution cancelled")]
    Cancelled,

    // Storage
    #[error("State lock timeout: {0}")]
    StateLockTimeout(String),

    #[error("Corrupt cursor: {0}")]
    CorruptCursor(String),

    #[error("Corrupt state: {0}")]
    CorruptState(String),

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrellisError {
    /// Whether the error is worth retrying locally.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LlmTransient(_) | Self::StateLockTimeout(_))
    }
}

pub type Result<T> = std::result::Result<T, TrellisError>;
