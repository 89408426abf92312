//! The monitoring pattern: a pair of secondary graphs observing a worker
//! through the shared bus and its on-disk step logs.
//!
//! The Health Judge wakes on a timer, reads the worker's
//! `logs/tool_logs.jsonl` through `get_worker_health_summary`, and emits a
//! structured escalation ticket when it sees a degradation pattern. The
//! Queen wakes on WORKER_ESCALATION_TICKET events and decides whether to
//! notify the operator. Neither graph ever pauses the worker.

use std::path::PathBuf;
use std::sync::Arc;

use trellis_core::error::Result;
use trellis_core::event::EventType;
use trellis_core::goal::Goal;
use trellis_core::spec::{EntryPointSpec, GraphSpec, NodeSpec};
use trellis_tools::builtin::{
    EmitEscalationTicketTool, NotifyOperatorTool, WorkerHealthSummaryTool,
};

use crate::runtime::{AgentRuntime, GraphDefinition};

pub const HEALTH_JUDGE_GRAPH_ID: &str = "worker_health_judge";
pub const QUEEN_GRAPH_ID: &str = "queen";

/// What the monitoring pair watches.
#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    /// Agent id recorded in tickets.
    pub worker_agent_id: String,
    /// Graph id of the monitored worker.
    pub worker_graph_id: String,
    /// Root of the worker's session store (where its session directories
    /// live).
    pub worker_store_root: PathBuf,
    /// Session the judge should watch.
    pub worker_session_id: String,
    /// Minutes between health checks.
    pub check_interval_minutes: u64,
}

impl MonitoringConfig {
    pub fn new(
        worker_agent_id: impl Into<String>,
        worker_graph_id: impl Into<String>,
        worker_store_root: impl Into<PathBuf>,
        worker_session_id: impl Into<String>,
    ) -> Self {
        Self {
            worker_agent_id: worker_agent_id.into(),
            worker_graph_id: worker_graph_id.into(),
            worker_store_root: worker_store_root.into(),
            worker_session_id: worker_session_id.into(),
            check_interval_minutes: 2,
        }
    }
}

/// The Health Judge: one continuous-conversation node fired by an
/// interval timer, so each tick sees the verdict history of prior ticks.
pub fn health_judge_definition(config: &MonitoringConfig) -> GraphDefinition {
    let prompt = format!(
        "You are a worker health judge monitoring agent '{agent}' \
         (graph '{graph}', session '{session}').\n\
         On every check:\n\
         1. Call get_worker_health_summary with session_id '{session}'.\n\
         2. Compare against what you saw on previous checks.\n\
         3. If the worker is making progress (recent ACCEPT verdicts, \
         fresh steps), do nothing and summarize your observation.\n\
         4. If you observe a degradation pattern (long runs of RETRY with \
         no progress, a stalled log, repeated identical output), fill out \
         a complete escalation ticket and call emit_escalation_ticket. \
         Use worker_node_id '{graph}'; severity low for brief stalls, \
         medium for sustained retries, high for 15+ steps without an \
         accept, critical when the worker looks wedged entirely.\n\
         Never escalate without quantitative evidence from the summary.",
        agent = config.worker_agent_id,
        graph = config.worker_graph_id,
        session = config.worker_session_id,
    );

    let node = NodeSpec::new("judge")
        .with_prompt(prompt)
        .with_tools(vec![
            "get_worker_health_summary".into(),
            "emit_escalation_ticket".into(),
        ])
        .continuous()
        .with_criteria(
            "The check is complete once the health summary was read and either \
             an escalation ticket was emitted or the worker was judged healthy.",
        );

    GraphDefinition {
        graph: GraphSpec::new(HEALTH_JUDGE_GRAPH_ID, "judge")
            .with_nodes(vec![node])
            .with_terminals(vec!["judge".into()]),
        goal: Some(
            Goal::new(
                "worker-health",
                "Worker health monitoring",
                "Detect degradation in the monitored worker early, with evidence, \
                 without interrupting it.",
            )
            .with_criterion("observed", "every check reads the live health summary", 0.5)
            .with_criterion("evidence", "escalations carry complete quantitative evidence", 0.5),
        ),
        entry_points: vec![EntryPointSpec::timer_interval(
            "health_check",
            "judge",
            config.check_interval_minutes,
        )],
    }
}

/// The Queen: fired by escalation tickets on the bus, never by its own
/// graph's events.
pub fn queen_definition() -> GraphDefinition {
    let node = NodeSpec::new("ticket_triage")
        .with_prompt(
            "You are the queen triage agent. You receive structured \
             escalation tickets about worker agents. Read the ticket in \
             your context data. Decide whether the issue warrants human \
             attention: dismiss low-value or duplicate reports, and for \
             real issues call notify_operator with the ticket_id, a 2-3 \
             sentence analysis, and an urgency level. The worker keeps \
             running either way.",
        )
        .with_inputs(vec!["ticket".into()])
        .with_tools(vec!["notify_operator".into()])
        .with_criteria(
            "The ticket was triaged: either dismissed with a stated reason or \
             the operator was notified.",
        );

    GraphDefinition {
        graph: GraphSpec::new(QUEEN_GRAPH_ID, "ticket_triage")
            .with_nodes(vec![node])
            .with_terminals(vec!["ticket_triage".into()]),
        goal: None,
        entry_points: vec![EntryPointSpec::on_events(
            "ticket_receiver",
            "ticket_triage",
            vec![EventType::WorkerEscalationTicket],
            true,
        )],
    }
}

/// Register the monitoring tools and both graphs on a running runtime.
pub async fn attach_monitoring(runtime: &AgentRuntime, config: MonitoringConfig) -> Result<()> {
    let queen_stream_id = format!("{QUEEN_GRAPH_ID}::ticket_receiver");
    let judge_stream_id = format!("{HEALTH_JUDGE_GRAPH_ID}::health_check");

    runtime.add_tools(vec![
        Arc::new(WorkerHealthSummaryTool::new(&config.worker_store_root)),
        Arc::new(EmitEscalationTicketTool::new(
            runtime.bus().clone(),
            HEALTH_JUDGE_GRAPH_ID,
            judge_stream_id,
        )),
        Arc::new(NotifyOperatorTool::new(
            runtime.bus().clone(),
            QUEEN_GRAPH_ID,
            queen_stream_id,
        )),
    ]);

    runtime
        .add_graph(
            health_judge_definition(&config),
            Some(HEALTH_JUDGE_GRAPH_ID.to_string()),
        )
        .await?;
    runtime
        .add_graph(queen_definition(), Some(QUEEN_GRAPH_ID.to_string()))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::spec::{ConversationMode, IsolationLevel, TriggerSpec};

    fn config() -> MonitoringConfig {
        MonitoringConfig::new("coder", "worker_graph", "/tmp/worker", "session-1")
    }

    #[test]
    fn health_judge_graph_validates() {
        let definition = health_judge_definition(&config());
        definition.graph.validate().unwrap();

        let node = definition.graph.node("judge").unwrap();
        assert_eq!(node.conversation_mode, ConversationMode::Continuous);
        assert!(node.tools.contains(&"emit_escalation_ticket".to_string()));

        let entry = &definition.entry_points[0];
        assert_eq!(entry.isolation_level, IsolationLevel::Isolated);
        assert!(matches!(
            entry.trigger,
            TriggerSpec::Timer {
                interval_minutes: Some(2),
                ..
            }
        ));
    }

    #[test]
    fn queen_graph_excludes_own_events() {
        let definition = queen_definition();
        definition.graph.validate().unwrap();

        match &definition.entry_points[0].trigger {
            TriggerSpec::Event {
                event_types,
                exclude_own_graph,
                ..
            } => {
                assert_eq!(event_types, &vec![EventType::WorkerEscalationTicket]);
                assert!(exclude_own_graph);
            }
            other => panic!("unexpected trigger {other:?}"),
        }
    }

    #[test]
    fn judge_prompt_names_worker_identity() {
        let definition = health_judge_definition(&config());
        let prompt = &definition.graph.node("judge").unwrap().system_prompt;
        assert!(prompt.contains("worker_graph"));
        assert!(prompt.contains("session-1"));
    }
}
