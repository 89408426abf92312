use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::types::{ChatMessage, StreamDelta, ToolContext, ToolDefinition, ToolResult};

/// LLM client — the runtime's only window onto the model provider.
///
/// One call per turn: the full message history plus the tool definitions the
/// current node may use, answered with a stream of deltas.
pub trait LlmClient: Send + Sync + 'static {
    fn generate(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<StreamDelta>>>>;
}

/// Tool — extensible tool execution.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in LLM tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with given input and context.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }

    /// Whether calls to this tool may run concurrently with other tool
    /// calls from the same turn.
    fn parallel_safe(&self) -> bool {
        false
    }
}

/// Credential resolution — external collaborator reached through one seam.
///
/// Reads are serialized per provider by the runtime; implementations do not
/// need their own locking for that.
pub trait CredentialProvider: Send + Sync + 'static {
    fn get(&self, name: &str, account: Option<&str>) -> BoxFuture<'_, Result<String>>;

    /// Called once at stream start. An error here fails the execution
    /// before any LLM turn is issued.
    fn preflight(&self, graph_id: &str) -> BoxFuture<'_, Result<()>> {
        let _ = graph_id;
        Box::pin(async { Ok(()) })
    }
}
