use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique session identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique execution identifier, minted per trigger.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation sent to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single content block in an LLM message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

/// A chat message in the wire format the LLM collaborator consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    /// Extract all text content from this message.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Stop reason from the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// A streaming delta from the LLM.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    /// A chunk of text content.
    TextDelta(String),

    /// Start of a tool use block.
    ToolUseStart {
        index: usize,
        id: String,
        name: String,
    },

    /// A chunk of tool use input JSON.
    ToolInputDelta { index: usize, delta: String },

    /// The response is complete.
    Stop(StopReason),
}

/// Result of a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Tool definition for sending to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Sink that the `set_output` tool writes through. Owned by the current
/// node visit's accumulator and shared into the tool context.
pub type OutputSink = Arc<Mutex<serde_json::Map<String, Value>>>;

/// Context passed to tools during execution.
#[derive(Clone, Default)]
pub struct ToolContext {
    pub session_id: Option<SessionId>,
    pub graph_id: Option<String>,
    pub node_id: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub outputs: Option<OutputSink>,
    pub credentials: Option<Arc<dyn crate::traits::CredentialProvider>>,
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("session_id", &self.session_id)
            .field("graph_id", &self.graph_id)
            .field("node_id", &self.node_id)
            .field("data_dir", &self.data_dir)
            .field("outputs", &self.outputs.is_some())
            .field("credentials", &self.credentials.is_some())
            .finish()
    }
}

/// A message persisted in a conversation log. Immutable once written;
/// the ordinal lives in the part file name, not the record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversationMessage {
    User {
        content: String,
        timestamp: DateTime<Utc>,
    },
    Assistant {
        content: String,
        timestamp: DateTime<Utc>,
    },
    ToolCall {
        call_id: String,
        name: String,
        args: Value,
        timestamp: DateTime<Utc>,
    },
    ToolResult {
        call_id: String,
        name: String,
        content: String,
        is_error: bool,
        timestamp: DateTime<Utc>,
    },
    SystemMarker {
        reason: String,
        #[serde(default)]
        detail: Value,
        timestamp: DateTime<Utc>,
    },
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn tool_call(call_id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self::ToolCall {
            call_id: call_id.into(),
            name: name.into(),
            args,
            timestamp: Utc::now(),
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::ToolResult {
            call_id: call_id.into(),
            name: name.into(),
            content: content.into(),
            is_error,
            timestamp: Utc::now(),
        }
    }

    pub fn marker(reason: impl Into<String>, detail: Value) -> Self {
        Self::SystemMarker {
            reason: reason.into(),
            detail,
            timestamp: Utc::now(),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::User { timestamp, .. }
            | Self::Assistant { timestamp, .. }
            | Self::ToolCall { timestamp, .. }
            | Self::ToolResult { timestamp, .. }
            | Self::SystemMarker { timestamp, .. } => *timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn chat_message_text_joins_blocks() {
        let msg = ChatMessage {
            role: Role::Assistant,
            content: vec![
                ContentBlock::Text {
                    text: "hello ".into(),
                },
                ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "set_output".into(),
                    input: serde_json::json!({}),
                },
                ContentBlock::Text {
                    text: "world".into(),
                },
            ],
        };
        assert_eq!(msg.text(), "hello world");
    }

    #[test]
    fn conversation_message_roundtrip() {
        let msg = ConversationMessage::tool_call("c1", "set_output", serde_json::json!({"key": "q"}));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"kind\":\"tool_call\""));
        let parsed: ConversationMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn marker_defaults_detail() {
        let json = r#"{"kind":"system_marker","reason":"timer_tick","timestamp":"2026-01-01T00:00:00Z"}"#;
        let parsed: ConversationMessage = serde_json::from_str(json).unwrap();
        match parsed {
            ConversationMessage::SystemMarker { reason, detail, .. } => {
                assert_eq!(reason, "timer_tick");
                assert!(detail.is_null());
            }
            other => panic!("expected marker, got {other:?}"),
        }
    }
}
