#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;

use trellis_core::error::Result;
use trellis_core::event::{AgentEvent, EventReceiver, EventType};
use trellis_core::traits::LlmClient;
use trellis_core::types::{ChatMessage, StopReason, StreamDelta, ToolDefinition};

static CALL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A turn ending in plain text.
pub fn text_turn(text: &str) -> Vec<StreamDelta> {
    vec![
        StreamDelta::TextDelta(text.to_string()),
        StreamDelta::Stop(StopReason::EndTurn),
    ]
}

/// A turn issuing one tool call (with optional leading text).
pub fn tool_turn(text: Option<&str>, name: &str, args: serde_json::Value) -> Vec<StreamDelta> {
    let call_id = format!("call-{}", CALL_COUNTER.fetch_add(1, Ordering::Relaxed));
    let mut deltas = Vec::new();
    if let Some(text) = text {
        deltas.push(StreamDelta::TextDelta(text.to_string()));
    }
    deltas.push(StreamDelta::ToolUseStart {
        index: 0,
        id: call_id,
        name: name.to_string(),
    });
    deltas.push(StreamDelta::ToolInputDelta {
        index: 0,
        delta: args.to_string(),
    });
    deltas.push(StreamDelta::Stop(StopReason::ToolUse));
    deltas
}

/// Scripted LLM that routes turns by the node named in the system prompt,
/// so concurrent node visits stay deterministic. Unscripted turns fall
/// back to a plain "done" response.
pub struct NodeScriptedLlm {
    scripts: Mutex<HashMap<String, VecDeque<Vec<StreamDelta>>>>,
}

impl NodeScriptedLlm {
    pub fn new(scripts: Vec<(&str, Vec<Vec<StreamDelta>>)>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(
                scripts
                    .into_iter()
                    .map(|(node, turns)| (node.to_string(), turns.into_iter().collect()))
                    .collect(),
            ),
        })
    }

    fn node_of(messages: &[ChatMessage]) -> Option<String> {
        let system = messages.first()?.text();
        let start = system.find("Current step: ")? + "Current step: ".len();
        let rest = &system[start..];
        let end = rest
            .find(|c: char| c.is_whitespace())
            .unwrap_or(rest.len());
        Some(rest[..end].to_string())
    }
}

impl LlmClient for NodeScriptedLlm {
    fn generate(
        &self,
        messages: Vec<ChatMessage>,
        _tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<StreamDelta>>>> {
        let turn = Self::node_of(&messages)
            .and_then(|node| {
                self.scripts
                    .lock()
                    .unwrap()
                    .get_mut(&node)
                    .and_then(|turns| turns.pop_front())
            })
            .unwrap_or_else(|| text_turn("done"));
        Box::pin(async move {
            Ok(futures::stream::iter(turn.into_iter().map(Ok)).boxed())
        })
    }
}

/// Drain events until the predicate matches or the timeout expires.
pub async fn wait_for_event(
    rx: &mut EventReceiver,
    predicate: impl Fn(&AgentEvent) -> bool,
) -> AgentEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.expect("bus closed while waiting");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Collect every already-published event without blocking.
pub fn drain_events(rx: &mut EventReceiver) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Assert that `expected` event types appear in order (as a subsequence)
/// in `events`.
pub fn assert_event_order(events: &[AgentEvent], expected: &[EventType]) {
    let mut want = expected.iter();
    let mut current = want.next();
    for event in events {
        if Some(&event.event_type) == current {
            current = want.next();
        }
    }
    assert!(
        current.is_none(),
        "missing event {current:?}; saw {:?}",
        events.iter().map(|e| e.event_type).collect::<Vec<_>>()
    );
}
