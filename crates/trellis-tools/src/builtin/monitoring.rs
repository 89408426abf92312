//! Worker monitoring tools for the Health Judge and Queen triage graphs.
//!
//! - `get_worker_health_summary` reads the worker's session log files and
//!   returns a compact health snapshot, used on every timer tick.
//! - `emit_escalation_ticket` validates and publishes an EscalationTicket
//!   as a WORKER_ESCALATION_TICKET event.
//! - `notify_operator` emits QUEEN_INTERVENTION_REQUESTED so a UI can
//!   surface a non-disruptive operator notification. The worker is never
//!   paused by either tool.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::info;

use trellis_core::error::Result;
use trellis_core::event::{AgentEvent, EventBus, EventPayload};
use trellis_core::ticket::EscalationTicket;
use trellis_core::traits::Tool;
use trellis_core::types::{ToolContext, ToolResult};

/// How many log steps the health summary includes by default.
const DEFAULT_LAST_N_STEPS: usize = 40;

/// Reads a worker session's `state.json` and `logs/tool_logs.jsonl` and
/// produces a compact health snapshot for the judge.
pub struct WorkerHealthSummaryTool {
    /// Root of the monitored worker's session store.
    worker_root: PathBuf,
}

impl WorkerHealthSummaryTool {
    pub fn new(worker_root: impl Into<PathBuf>) -> Self {
        Self {
            worker_root: worker_root.into(),
        }
    }
}

impl Tool for WorkerHealthSummaryTool {
    fn name(&self) -> &str {
        "get_worker_health_summary"
    }

    fn description(&self) -> &str {
        "Read the worker agent's execution logs and return a compact health \
         snapshot: recent judge verdicts, step count, time since the last \
         step, and a snippet of the most recent LLM output. Use this on \
         every health check to observe trends."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": {
                    "type": "string",
                    "description": "The worker's active session ID"
                },
                "last_n_steps": {
                    "type": "integer",
                    "description": "How many recent log steps to include (default 40)"
                }
            },
            "required": ["session_id"]
        })
    }

    fn parallel_safe(&self) -> bool {
        true
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let Some(session_id) = input.get("session_id").and_then(|v| v.as_str()) else {
                return Ok(ToolResult::error("session_id is required"));
            };
            let last_n = input
                .get("last_n_steps")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize)
                .unwrap_or(DEFAULT_LAST_N_STEPS);

            let session_dir = self.worker_root.join(session_id);
            let state_path = session_dir.join("state.json");
            let log_path = session_dir.join("logs").join("tool_logs.jsonl");

            let session_status = match tokio::fs::read_to_string(&state_path).await {
                Ok(raw) => serde_json::from_str::<serde_json::Value>(&raw)
                    .ok()
                    .and_then(|v| v.get("status").and_then(|s| s.as_str()).map(String::from))
                    .unwrap_or_else(|| "unknown".into()),
                Err(_) => "unknown".into(),
            };

            let mut steps: Vec<serde_json::Value> = Vec::new();
            match tokio::fs::read_to_string(&log_path).await {
                Ok(content) => {
                    for line in content.lines() {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        if let Ok(step) = serde_json::from_str(line) {
                            steps.push(step);
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Ok(ToolResult::error(format!(
                        "Could not read tool logs: {e}"
                    )))
                }
            }

            let total_steps = steps.len();
            let recent: &[serde_json::Value] = if steps.len() > last_n {
                &steps[steps.len() - last_n..]
            } else {
                &steps
            };

            let recent_verdicts: Vec<&str> = recent
                .iter()
                .filter_map(|s| s.get("verdict").and_then(|v| v.as_str()))
                .filter(|v| !v.is_empty())
                .collect();

            let steps_since_last_accept = recent_verdicts
                .iter()
                .rev()
                .take_while(|v| **v != "ACCEPT")
                .count();

            // The log records carry timestamps; the file mtime is the
            // cheap proxy for "when did the worker last make progress".
            let mut last_step_time_iso: Option<String> = None;
            let mut stall_minutes: Option<f64> = None;
            if !steps.is_empty() {
                if let Ok(meta) = tokio::fs::metadata(&log_path).await {
                    if let Ok(mtime) = meta.modified() {
                        let mtime: DateTime<Utc> = mtime.into();
                        last_step_time_iso = Some(mtime.to_rfc3339());
                        let elapsed = (Utc::now() - mtime).num_seconds() as f64 / 60.0;
                        if elapsed >= 1.0 {
                            stall_minutes = Some((elapsed * 10.0).round() / 10.0);
                        }
                    }
                }
            }

            let evidence_snippet = recent
                .iter()
                .rev()
                .filter_map(|s| s.get("llm_text").and_then(|t| t.as_str()))
                .find(|t| !t.is_empty())
                .map(|t| t.chars().take(500).collect::<String>())
                .unwrap_or_default();

            let summary = serde_json::json!({
                "session_id": session_id,
                "session_status": session_status,
                "total_steps": total_steps,
                "recent_verdicts": recent_verdicts,
                "steps_since_last_accept": steps_since_last_accept,
                "last_step_time_iso": last_step_time_iso,
                "stall_minutes": stall_minutes,
                "evidence_snippet": evidence_snippet,
            });
            Ok(ToolResult::success(summary.to_string()))
        })
    }
}

/// Validates a ticket and publishes it on the shared bus. Validation
/// before publishing ensures the judge genuinely filled out all required
/// evidence fields rather than escalating impulsively.
pub struct EmitEscalationTicketTool {
    bus: EventBus,
    graph_id: String,
    stream_id: String,
}

impl EmitEscalationTicketTool {
    pub fn new(bus: EventBus, graph_id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            bus,
            graph_id: graph_id.into(),
            stream_id: stream_id.into(),
        }
    }
}

impl Tool for EmitEscalationTicketTool {
    fn name(&self) -> &str {
        "emit_escalation_ticket"
    }

    fn description(&self) -> &str {
        "Validate and publish a structured escalation ticket to the shared \
         event bus. ticket_json must be a JSON string with all required \
         fields: worker_agent_id, worker_session_id, worker_node_id, \
         worker_graph_id, severity (low/medium/high/critical), cause, \
         judge_reasoning, suggested_action, recent_verdicts, \
         total_steps_checked, steps_since_last_accept, stall_minutes, \
         evidence_snippet."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "ticket_json": {
                    "type": "string",
                    "description": "JSON string of the complete escalation ticket"
                }
            },
            "required": ["ticket_json"]
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let Some(raw) = input.get("ticket_json").and_then(|v| v.as_str()) else {
                return Ok(ToolResult::error("ticket_json is required"));
            };
            let ticket = match EscalationTicket::from_json(raw) {
                Ok(t) => t,
                Err(e) => return Ok(ToolResult::error(e)),
            };

            let ticket_id = ticket.ticket_id.clone();
            let severity = ticket.severity;
            info!(
                ticket_id = %ticket_id,
                severity = %severity,
                cause = %ticket.cause,
                "escalation ticket emitted"
            );
            self.bus.publish(
                AgentEvent::new(EventPayload::WorkerEscalationTicket { ticket })
                    .with_graph(&self.graph_id)
                    .with_stream(&self.stream_id)
                    .with_node("judge"),
            );

            Ok(ToolResult::success(
                serde_json::json!({
                    "status": "emitted",
                    "ticket_id": ticket_id,
                    "severity": severity.as_str(),
                })
                .to_string(),
            ))
        })
    }
}

/// Emits QUEEN_INTERVENTION_REQUESTED so the operator can be notified
/// without pausing the worker.
pub struct NotifyOperatorTool {
    bus: EventBus,
    queen_graph_id: String,
    queen_stream_id: String,
}

impl NotifyOperatorTool {
    pub fn new(
        bus: EventBus,
        queen_graph_id: impl Into<String>,
        queen_stream_id: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            queen_graph_id: queen_graph_id.into(),
            queen_stream_id: queen_stream_id.into(),
        }
    }
}

impl Tool for NotifyOperatorTool {
    fn name(&self) -> &str {
        "notify_operator"
    }

    fn description(&self) -> &str {
        "Notify the human operator that a worker agent needs attention. \
         The worker keeps running. Only call this after reading the \
         escalation ticket and deciding the issue warrants human attention."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "ticket_id": {
                    "type": "string",
                    "description": "The ticket_id from the escalation ticket being triaged"
                },
                "analysis": {
                    "type": "string",
                    "description": "2-3 sentence analysis: what is wrong, why it matters, and the suggested action"
                },
                "urgency": {
                    "type": "string",
                    "enum": ["low", "medium", "high", "critical"],
                    "description": "Severity level for the operator notification"
                }
            },
            "required": ["ticket_id", "analysis", "urgency"]
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let ticket_id = input.get("ticket_id").and_then(|v| v.as_str());
            let analysis = input.get("analysis").and_then(|v| v.as_str());
            let urgency = input.get("urgency").and_then(|v| v.as_str());
            let (Some(ticket_id), Some(analysis), Some(urgency)) =
                (ticket_id, analysis, urgency)
            else {
                return Ok(ToolResult::error(
                    "ticket_id, analysis, and urgency are all required",
                ));
            };
            if !matches!(urgency, "low" | "medium" | "high" | "critical") {
                return Ok(ToolResult::error(format!(
                    "urgency must be one of low/medium/high/critical, got '{urgency}'"
                )));
            }

            info!(ticket_id, urgency, "queen intervention requested");
            self.bus.publish(
                AgentEvent::new(EventPayload::QueenInterventionRequested {
                    ticket_id: ticket_id.to_string(),
                    analysis: analysis.to_string(),
                    severity: urgency.to_string(),
                    queen_graph_id: self.queen_graph_id.clone(),
                    queen_stream_id: self.queen_stream_id.clone(),
                })
                .with_graph(&self.queen_graph_id)
                .with_stream(&self.queen_stream_id)
                .with_node("ticket_triage"),
            );

            Ok(ToolResult::success(
                serde_json::json!({
                    "status": "operator_notified",
                    "ticket_id": ticket_id,
                    "urgency": urgency,
                })
                .to_string(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::event::{EventFilter, EventType};

    async fn write_worker_logs(root: &std::path::Path, verdicts: &[&str]) {
        let logs = root.join("worker-session/logs");
        tokio::fs::create_dir_all(&logs).await.unwrap();
        tokio::fs::write(
            root.join("worker-session/state.json"),
            br#"{"session_id": "worker-session", "status": "active"}"#,
        )
        .await
        .unwrap();
        let mut lines = String::new();
        for (i, v) in verdicts.iter().enumerate() {
            lines.push_str(&format!(
                "{{\"step\": {i}, \"node_id\": \"work\", \"iteration\": {i}, \"verdict\": \"{v}\", \"llm_text\": \"attempt {i}\", \"ts\": \"2026-01-01T00:00:00Z\"}}\n"
            ));
        }
        tokio::fs::write(logs.join("tool_logs.jsonl"), lines)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn health_summary_counts_steps_since_accept() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut verdicts = vec!["ACCEPT"];
        verdicts.extend(std::iter::repeat("RETRY").take(18));
        write_worker_logs(dir.path(), &verdicts).await;

        let tool = WorkerHealthSummaryTool::new(dir.path());
        let result = tool
            .execute(
                serde_json::json!({"session_id": "worker-session"}),
                ToolContext::default(),
            )
            .await
            .unwrap();
        assert!(!result.is_error);

        let summary: serde_json::Value = serde_json::from_str(&result.content).unwrap();
        assert_eq!(summary["session_status"], "active");
        assert_eq!(summary["total_steps"], 19);
        assert_eq!(summary["steps_since_last_accept"], 18);
        assert_eq!(summary["evidence_snippet"], "attempt 18");
    }

    #[tokio::test]
    async fn health_summary_handles_missing_session() {
        let dir = tempfile::TempDir::new().unwrap();
        let tool = WorkerHealthSummaryTool::new(dir.path());
        let result = tool
            .execute(
                serde_json::json!({"session_id": "ghost"}),
                ToolContext::default(),
            )
            .await
            .unwrap();
        let summary: serde_json::Value = serde_json::from_str(&result.content).unwrap();
        assert_eq!(summary["session_status"], "unknown");
        assert_eq!(summary["total_steps"], 0);
    }

    #[tokio::test]
    async fn emit_ticket_publishes_on_bus() {
        let bus = EventBus::default();
        let (_, mut rx) =
            bus.subscribe(EventFilter::for_type(EventType::WorkerEscalationTicket));

        let tool = EmitEscalationTicketTool::new(bus, "health_judge", "health_judge::timer");
        let ticket_json = serde_json::json!({
            "worker_agent_id": "coder",
            "worker_session_id": "s1",
            "worker_node_id": "worker_graph",
            "worker_graph_id": "worker_graph",
            "severity": "high",
            "cause": "18 consecutive RETRY verdicts with identical evidence",
            "judge_reasoning": "no forward progress in the observed window",
            "suggested_action": "review the node's system prompt",
            "recent_verdicts": ["RETRY", "RETRY"],
            "total_steps_checked": 19,
            "steps_since_last_accept": 18
        })
        .to_string();

        let result = tool
            .execute(
                serde_json::json!({"ticket_json": ticket_json}),
                ToolContext::default(),
            )
            .await
            .unwrap();
        assert!(!result.is_error, "{}", result.content);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::WorkerEscalationTicket);
        assert_eq!(event.graph_id.as_deref(), Some("health_judge"));
        match event.payload {
            EventPayload::WorkerEscalationTicket { ticket } => {
                assert_eq!(ticket.steps_since_last_accept, 18);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn emit_ticket_rejects_invalid_json() {
        let bus = EventBus::default();
        let tool = EmitEscalationTicketTool::new(bus, "g", "s");
        let result = tool
            .execute(
                serde_json::json!({"ticket_json": "{\"severity\": \"high\"}"}),
                ToolContext::default(),
            )
            .await
            .unwrap();
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn notify_operator_validates_urgency() {
        let bus = EventBus::default();
        let (_, mut rx) =
            bus.subscribe(EventFilter::for_type(EventType::QueenInterventionRequested));

        let tool = NotifyOperatorTool::new(bus, "queen", "queen::ticket_receiver");
        let bad = tool
            .execute(
                serde_json::json!({"ticket_id": "t1", "analysis": "x", "urgency": "urgent"}),
                ToolContext::default(),
            )
            .await
            .unwrap();
        assert!(bad.is_error);

        let ok = tool
            .execute(
                serde_json::json!({
                    "ticket_id": "t1",
                    "analysis": "Worker is stuck retrying; suggest reviewing credentials.",
                    "urgency": "high"
                }),
                ToolContext::default(),
            )
            .await
            .unwrap();
        assert!(!ok.is_error);

        let event = rx.recv().await.unwrap();
        match event.payload {
            EventPayload::QueenInterventionRequested {
                ticket_id,
                severity,
                queen_graph_id,
                ..
            } => {
                assert_eq!(ticket_id, "t1");
                assert_eq!(severity, "high");
                assert_eq!(queen_graph_id, "queen");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
