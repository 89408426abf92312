//! Conversation history assembly and opportunistic compaction.
//!
//! The on-disk log is append-only, so compaction never rewrites parts:
//! it appends a `system_marker` carrying the summary and the ordinal it
//! covers, and history assembly skips everything at or below that ordinal.

use std::sync::OnceLock;

use futures::StreamExt;
use tiktoken_rs::CoreBPE;
use tracing::{debug, info};

use trellis_core::error::Result;
use trellis_core::traits::LlmClient;
use trellis_core::types::{ChatMessage, ContentBlock, ConversationMessage, StreamDelta};
use trellis_store::ConversationStore;

/// Messages kept verbatim at the tail when compacting.
const KEEP_TAIL: usize = 6;

fn tokenizer() -> &'static CoreBPE {
    static TOKENIZER: OnceLock<CoreBPE> = OnceLock::new();
    TOKENIZER.get_or_init(|| tiktoken_rs::cl100k_base().expect("failed to load cl100k_base"))
}

pub fn estimate_tokens(text: &str) -> usize {
    tokenizer().encode_ordinary(text).len()
}

/// Token estimate for a full chat message: serialized content plus a small
/// per-message overhead.
pub fn estimate_message_tokens(msg: &ChatMessage) -> usize {
    let content = serde_json::to_string(&msg.content).unwrap_or_default();
    estimate_tokens(&content) + 4
}

/// The compaction boundary encoded in a marker, if any.
fn compaction_boundary(parts: &[(u64, ConversationMessage)]) -> Option<(u64, String)> {
    parts.iter().rev().find_map(|(_, msg)| match msg {
        ConversationMessage::SystemMarker { reason, detail, .. } if reason == "compaction" => {
            let through = detail.get("through_ordinal")?.as_u64()?;
            let summary = detail
                .get("summary")
                .and_then(|s| s.as_str())
                .unwrap_or_default()
                .to_string();
            Some((through, summary))
        }
        _ => None,
    })
}

/// Assemble the LLM message list from persisted parts: system prompt,
/// then the compaction summary (if one applies), then every live part.
/// Tool calls fold into their assistant message; tool results group into
/// user messages, matching the wire format the LLM collaborator expects.
pub fn assemble_history(
    system_prompt: &str,
    parts: &[(u64, ConversationMessage)],
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(system_prompt)];

    let boundary = compaction_boundary(parts);
    if let Some((_, summary)) = &boundary {
        if !summary.is_empty() {
            messages.push(ChatMessage::user(format!(
                "[Conversation summary]\n{summary}"
            )));
        }
    }
    let skip_through = boundary.map(|(through, _)| through).unwrap_or(0);

    for (ordinal, part) in parts {
        if *ordinal <= skip_through {
            continue;
        }
        match part {
            ConversationMessage::User { content, .. } => {
                messages.push(ChatMessage::user(content.clone()));
            }
            ConversationMessage::Assistant { content, .. } => {
                let mut blocks = Vec::new();
                if !content.is_empty() {
                    blocks.push(ContentBlock::Text {
                        text: content.clone(),
                    });
                }
                messages.push(ChatMessage::assistant(blocks));
            }
            ConversationMessage::ToolCall {
                call_id,
                name,
                args,
                ..
            } => {
                let block = ContentBlock::ToolUse {
                    id: call_id.clone(),
                    name: name.clone(),
                    input: args.clone(),
                };
                match messages.last_mut() {
                    Some(last) if last.role == trellis_core::types::Role::Assistant => {
                        last.content.push(block);
                    }
                    _ => messages.push(ChatMessage::assistant(vec![block])),
                }
            }
            ConversationMessage::ToolResult {
                call_id,
                content,
                is_error,
                ..
            } => {
                let block = ContentBlock::ToolResult {
                    tool_use_id: call_id.clone(),
                    content: content.clone(),
                    is_error: *is_error,
                };
                let appended = match messages.last_mut() {
                    Some(last)
                        if last.role == trellis_core::types::Role::User
                            && last
                                .content
                                .iter()
                                .all(|b| matches!(b, ContentBlock::ToolResult { .. })) =>
                    {
                        last.content.push(block.clone());
                        true
                    }
                    _ => false,
                };
                if !appended {
                    messages.push(ChatMessage {
                        role: trellis_core::types::Role::User,
                        content: vec![block],
                    });
                }
            }
            ConversationMessage::SystemMarker { reason, detail, .. } => {
                if reason == "compaction" {
                    continue;
                }
                let rendered = if detail.is_null() {
                    format!("[{reason}]")
                } else {
                    format!("[{reason}] {detail}")
                };
                messages.push(ChatMessage::user(rendered));
            }
        }
    }
    messages
}

/// Opportunistic compaction at a node boundary of a continuous
/// conversation. When the assembled history exceeds the token budget, the
/// older turns are summarized by the LLM into one marker; failures leave
/// the history untouched. Returns whether a marker was appended.
pub async fn maybe_compact(
    llm: &dyn LlmClient,
    conversation: &ConversationStore,
    max_history_tokens: usize,
) -> Result<bool> {
    let parts = conversation.read_all().await?;
    let history = assemble_history("", &parts);
    let total: usize = history.iter().map(estimate_message_tokens).sum();
    if total <= max_history_tokens {
        return Ok(false);
    }

    let skip_through = compaction_boundary(&parts).map(|(t, _)| t).unwrap_or(0);
    let live: Vec<&(u64, ConversationMessage)> =
        parts.iter().filter(|(o, _)| *o > skip_through).collect();
    if live.len() <= KEEP_TAIL {
        return Ok(false);
    }

    let split = live.len() - KEEP_TAIL;
    let through_ordinal = live[split - 1].0;
    let older_text = live[..split]
        .iter()
        .map(|(_, m)| render_for_summary(m))
        .collect::<Vec<_>>()
        .join("\n");

    debug!(
        total_tokens = total,
        budget = max_history_tokens,
        through_ordinal,
        "history over budget, summarizing older turns"
    );

    let prompt = format!(
        "Summarize the following conversation concisely, preserving key \
         facts, decisions, outputs, and identifiers. Output only the \
         summary.\n\n{older_text}"
    );
    let mut stream = match llm.generate(vec![ChatMessage::user(prompt)], &[]).await {
        Ok(s) => s,
        Err(_) => return Ok(false),
    };
    let mut summary = String::new();
    while let Some(delta) = stream.next().await {
        if let Ok(StreamDelta::TextDelta(text)) = delta {
            summary.push_str(&text);
        }
    }
    if summary.trim().is_empty() {
        return Ok(false);
    }

    conversation
        .append(&ConversationMessage::marker(
            "compaction",
            serde_json::json!({
                "summary": summary,
                "through_ordinal": through_ordinal,
            }),
        ))
        .await?;
    info!(through_ordinal, "conversation compacted");
    Ok(true)
}

fn render_for_summary(msg: &ConversationMessage) -> String {
    match msg {
        ConversationMessage::User { content, .. } => format!("user: {content}"),
        ConversationMessage::Assistant { content, .. } => format!("assistant: {content}"),
        ConversationMessage::ToolCall { name, args, .. } => {
            format!("tool_call {name}: {args}")
        }
        ConversationMessage::ToolResult { name, content, .. } => {
            format!("tool_result {name}: {content}")
        }
        ConversationMessage::SystemMarker { reason, .. } => format!("[{reason}]"),
    }
}
