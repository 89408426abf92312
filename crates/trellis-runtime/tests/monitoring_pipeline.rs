mod common;

use serde_json::json;
use tempfile::TempDir;

use trellis_core::config::RuntimeConfig;
use trellis_core::event::{EventFilter, EventPayload, EventType};
use trellis_core::spec::{EntryPointSpec, GraphSpec, NodeSpec};
use trellis_runtime::monitoring::{
    attach_monitoring, MonitoringConfig, HEALTH_JUDGE_GRAPH_ID, QUEEN_GRAPH_ID,
};
use trellis_runtime::runtime::{AgentRuntime, GraphDefinition};

use common::{text_turn, tool_turn, wait_for_event, NodeScriptedLlm};

fn worker_definition() -> GraphDefinition {
    GraphDefinition {
        graph: GraphSpec::new("worker_graph", "work")
            .with_nodes(vec![NodeSpec::new("work")])
            .with_terminals(vec!["work".into()]),
        goal: None,
        entry_points: vec![EntryPointSpec::manual("run", "work")],
    }
}

/// Write a worker session whose step log shows a long retry stall.
fn seed_worker_logs(root: &std::path::Path, session_id: &str) {
    let logs = root.join(session_id).join("logs");
    std::fs::create_dir_all(&logs).unwrap();
    std::fs::write(
        root.join(session_id).join("state.json"),
        br#"{"session_id": "wsess", "status": "active"}"#,
    )
    .unwrap();
    let mut lines = String::from(
        "{\"step\": 1, \"node_id\": \"work\", \"iteration\": 1, \"verdict\": \"ACCEPT\", \"llm_text\": \"ok\", \"ts\": \"2026-01-01T00:00:00Z\"}\n",
    );
    for i in 2..=19 {
        lines.push_str(&format!(
            "{{\"step\": {i}, \"node_id\": \"work\", \"iteration\": {i}, \"verdict\": \"RETRY\", \"llm_text\": \"attempt {i}\", \"ts\": \"2026-01-01T00:00:00Z\"}}\n"
        ));
    }
    std::fs::write(logs.join("tool_logs.jsonl"), lines).unwrap();
}

#[tokio::test]
async fn escalation_ticket_flows_from_judge_to_queen() {
    let dir = TempDir::new().unwrap();

    let ticket_json = json!({
        "ticket_id": "t-health-1",
        "worker_agent_id": "coder",
        "worker_session_id": "wsess",
        "worker_node_id": "worker_graph",
        "worker_graph_id": "worker_graph",
        "severity": "high",
        "cause": "18 consecutive RETRY verdicts with no progress",
        "judge_reasoning": "steps_since_last_accept=18 across two checks",
        "suggested_action": "Review the node's system prompt",
        "recent_verdicts": ["RETRY", "RETRY", "RETRY"],
        "total_steps_checked": 19,
        "steps_since_last_accept": 18,
        "stall_minutes": null,
        "evidence_snippet": "attempt 19"
    })
    .to_string();

    let llm = NodeScriptedLlm::new(vec![
        (
            "judge",
            vec![
                tool_turn(None, "get_worker_health_summary", json!({"session_id": "wsess"})),
                tool_turn(None, "emit_escalation_ticket", json!({"ticket_json": ticket_json})),
                text_turn("escalated to queen"),
            ],
        ),
        (
            "ticket_triage",
            vec![
                tool_turn(
                    None,
                    "notify_operator",
                    json!({
                        "ticket_id": "t-health-1",
                        "analysis": "The worker has retried 18 times without progress; \
                                     the prompt or credentials likely need attention.",
                        "urgency": "high"
                    }),
                ),
                text_turn("operator notified"),
            ],
        ),
    ]);

    let runtime = AgentRuntime::new(
        RuntimeConfig::new(dir.path()),
        llm,
        trellis_tools::with_builtins(),
        None,
        worker_definition(),
    )
    .await
    .unwrap();

    seed_worker_logs(dir.path(), "wsess");
    attach_monitoring(
        &runtime,
        MonitoringConfig::new("coder", "worker_graph", dir.path(), "wsess"),
    )
    .await
    .unwrap();

    let (_, mut rx) = runtime.subscribe(EventFilter::all());

    // Drive one health check by hand instead of waiting out the timer.
    let report = runtime
        .trigger(
            Some(HEALTH_JUDGE_GRAPH_ID),
            "health_check",
            serde_json::Map::new(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(report.status, trellis_store::SessionStatus::Completed);

    // The ticket crossed the bus...
    let ticket_event = wait_for_event(&mut rx, |e| {
        e.event_type == EventType::WorkerEscalationTicket
    })
    .await;
    match &ticket_event.payload {
        EventPayload::WorkerEscalationTicket { ticket } => {
            assert_eq!(ticket.ticket_id, "t-health-1");
            assert_eq!(ticket.steps_since_last_accept, 18);
            assert_eq!(ticket.worker_node_id, "worker_graph");
        }
        other => panic!("unexpected payload {other:?}"),
    }
    assert_eq!(
        ticket_event.graph_id.as_deref(),
        Some(HEALTH_JUDGE_GRAPH_ID)
    );

    // ...woke the queen, which notified the operator without touching the
    // worker.
    let intervention = wait_for_event(&mut rx, |e| {
        e.event_type == EventType::QueenInterventionRequested
    })
    .await;
    match &intervention.payload {
        EventPayload::QueenInterventionRequested {
            ticket_id,
            severity,
            queen_graph_id,
            ..
        } => {
            assert_eq!(ticket_id, "t-health-1");
            assert_eq!(severity, "high");
            assert_eq!(queen_graph_id, QUEEN_GRAPH_ID);
        }
        other => panic!("unexpected payload {other:?}"),
    }

    // Secondary graphs kept their state under the primary session's
    // graphs/ sub-roots.
    let primary_root = dir.path().join(runtime.primary_session().as_str());
    assert!(primary_root.join("graphs").join(HEALTH_JUDGE_GRAPH_ID).is_dir());

    runtime.shutdown().await;
}

#[tokio::test]
async fn removing_a_secondary_graph_leaves_the_primary_running() {
    let dir = TempDir::new().unwrap();
    let llm = NodeScriptedLlm::new(vec![("work", vec![text_turn("still fine")])]);

    let runtime = AgentRuntime::new(
        RuntimeConfig::new(dir.path()),
        llm,
        trellis_tools::with_builtins(),
        None,
        worker_definition(),
    )
    .await
    .unwrap();

    attach_monitoring(
        &runtime,
        MonitoringConfig::new("coder", "worker_graph", dir.path(), "wsess"),
    )
    .await
    .unwrap();
    assert_eq!(runtime.graph_ids().await.len(), 3);

    runtime.remove_graph(QUEEN_GRAPH_ID).await.unwrap();
    runtime.remove_graph(HEALTH_JUDGE_GRAPH_ID).await.unwrap();
    assert_eq!(runtime.graph_ids().await, vec!["worker_graph"]);

    // Primary still executes.
    let report = runtime
        .trigger(None, "run", serde_json::Map::new(), None)
        .await
        .unwrap();
    assert_eq!(report.status, trellis_store::SessionStatus::Completed);

    // The primary cannot be removed.
    assert!(runtime.remove_graph("worker_graph").await.is_err());
}
