use futures::future::BoxFuture;

use trellis_core::error::Result;
use trellis_core::traits::Tool;
use trellis_core::types::{ToolContext, ToolResult};

/// Writes a key/value pair into the current node visit's accumulator.
///
/// A real registry entry, not a special case in the executor: the handler
/// reaches the accumulator through the output sink the executor places in
/// the tool context.
pub struct SetOutputTool;

impl Tool for SetOutputTool {
    fn name(&self) -> &str {
        "set_output"
    }

    fn description(&self) -> &str {
        "Record one of this node's declared output values. \
         Call once per output key. Values become visible to downstream \
         nodes after this node's work is accepted."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "key": {
                    "type": "string",
                    "description": "One of the node's declared output keys"
                },
                "value": {
                    "description": "The value to record; any JSON type"
                }
            },
            "required": ["key", "value"]
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let Some(key) = input.get("key").and_then(|k| k.as_str()) else {
                return Ok(ToolResult::error("set_output requires a string 'key'"));
            };
            let Some(value) = input.get("value") else {
                return Ok(ToolResult::error("set_output requires a 'value'"));
            };
            let Some(sink) = ctx.outputs else {
                return Ok(ToolResult::error(
                    "set_output is unavailable outside a node visit",
                ));
            };
            sink.lock()
                .unwrap()
                .insert(key.to_string(), value.clone());
            Ok(ToolResult::success(format!("recorded output '{key}'")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn ctx_with_sink() -> (ToolContext, trellis_core::types::OutputSink) {
        let sink: trellis_core::types::OutputSink =
            Arc::new(Mutex::new(serde_json::Map::new()));
        let ctx = ToolContext {
            outputs: Some(sink.clone()),
            ..ToolContext::default()
        };
        (ctx, sink)
    }

    #[tokio::test]
    async fn writes_through_the_sink() {
        let (ctx, sink) = ctx_with_sink();
        let result = SetOutputTool
            .execute(
                serde_json::json!({"key": "answer", "value": "Alice"}),
                ctx,
            )
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(
            sink.lock().unwrap().get("answer"),
            Some(&serde_json::json!("Alice"))
        );
    }

    #[tokio::test]
    async fn rejects_missing_key() {
        let (ctx, _) = ctx_with_sink();
        let result = SetOutputTool
            .execute(serde_json::json!({"value": 1}), ctx)
            .await
            .unwrap();
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn errors_without_sink() {
        let result = SetOutputTool
            .execute(
                serde_json::json!({"key": "k", "value": 1}),
                ToolContext::default(),
            )
            .await
            .unwrap();
        assert!(result.is_error);
    }
}
