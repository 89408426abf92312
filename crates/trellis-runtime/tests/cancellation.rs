mod common;

use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use trellis_core::config::RuntimeConfig;
use trellis_core::event::{EventFilter, EventType};
use trellis_core::spec::{EntryPointSpec, GraphSpec, NodeSpec};
use trellis_runtime::runtime::{AgentRuntime, GraphDefinition};
use trellis_store::SessionStatus;

use common::{text_turn, tool_turn, wait_for_event, NodeScriptedLlm};

fn draft_definition() -> GraphDefinition {
    GraphDefinition {
        graph: GraphSpec::new("drafter", "draft")
            .with_nodes(vec![NodeSpec::new("draft")
                .with_outputs(vec!["draft".into(), "answer".into()])
                .with_tools(vec!["set_output".into()])
                .client_facing(true)])
            .with_terminals(vec!["draft".into()]),
        goal: None,
        entry_points: vec![EntryPointSpec::manual("run", "draft")],
    }
}

#[tokio::test]
async fn cancel_while_paused_flushes_outputs_and_pauses_session() {
    let dir = TempDir::new().unwrap();
    let llm = NodeScriptedLlm::new(vec![(
        "draft",
        vec![
            tool_turn(
                Some("Working on a draft."),
                "set_output",
                json!({"key": "draft", "value": "v1 of the plan"}),
            ),
            text_turn("Does the draft look right to you?"),
        ],
    )]);

    let runtime = AgentRuntime::new(
        RuntimeConfig::new(dir.path()),
        llm,
        trellis_tools::with_builtins(),
        None,
        draft_definition(),
    )
    .await
    .unwrap();

    let (_, mut rx) = runtime.subscribe(EventFilter::all());

    let task = {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            runtime
                .trigger(None, "run", serde_json::Map::new(), None)
                .await
        })
    };

    let started = wait_for_event(&mut rx, |e| {
        e.event_type == EventType::ExecutionStarted
    })
    .await;
    let execution_id = started.execution_id.clone().unwrap();

    // Park on the question, then cancel instead of answering.
    wait_for_event(&mut rx, |e| e.event_type == EventType::ClientInputRequested).await;
    assert!(runtime.stop(&execution_id).await);

    wait_for_event(&mut rx, |e| e.event_type == EventType::ExecutionPaused).await;

    let report = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.status, SessionStatus::Paused);

    // The write-through output survived cancellation: flushed to shared
    // memory before state.json was rewritten.
    assert_eq!(report.memory.get("draft"), Some(&json!("v1 of the plan")));

    let state: serde_json::Value = serde_json::from_slice(
        &std::fs::read(
            dir.path()
                .join(report.session_id.as_str())
                .join("state.json"),
        )
        .unwrap(),
    )
    .unwrap();
    assert_eq!(state["status"], "paused");
    assert_eq!(state["memory"]["draft"], "v1 of the plan");
}

#[tokio::test]
async fn stop_with_unknown_execution_id_is_false() {
    let dir = TempDir::new().unwrap();
    let llm = NodeScriptedLlm::new(vec![]);
    let runtime = AgentRuntime::new(
        RuntimeConfig::new(dir.path()),
        llm,
        trellis_tools::with_builtins(),
        None,
        draft_definition(),
    )
    .await
    .unwrap();

    assert!(!runtime.stop("not-a-real-execution").await);
}
