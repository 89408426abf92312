use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity of a detected worker issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured escalation report from a worker health judge.
///
/// The judge fills this out when it observes a degradation pattern in a
/// monitored worker's execution. Requiring the structured form prevents
/// impulsive escalations: cause, evidence, severity, and a suggested action
/// must all be articulated before anything is emitted on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationTicket {
    // Identity
    #[serde(default = "default_ticket_id")]
    pub ticket_id: String,
    #[serde(default = "default_created_at")]
    pub created_at: String,

    // Worker identification
    pub worker_agent_id: String,
    pub worker_session_id: String,
    pub worker_node_id: String,
    pub worker_graph_id: String,

    // Problem characterization
    pub severity: Severity,
    pub cause: String,
    pub judge_reasoning: String,
    pub suggested_action: String,

    // Quantitative evidence
    #[serde(default)]
    pub recent_verdicts: Vec<String>,
    #[serde(default)]
    pub total_steps_checked: u64,
    #[serde(default)]
    pub steps_since_last_accept: u64,
    #[serde(default)]
    pub stall_minutes: Option<f64>,
    #[serde(default)]
    pub evidence_snippet: String,
}

fn default_ticket_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_created_at() -> String {
    Utc::now().to_rfc3339()
}

impl EscalationTicket {
    /// Parse a ticket from a JSON string, enforcing the evidence-snippet cap.
    pub fn from_json(raw: &str) -> Result<Self, String> {
        let mut ticket: EscalationTicket =
            serde_json::from_str(raw).map_err(|e| format!("Invalid ticket: {e}"))?;
        if ticket.evidence_snippet.chars().count() > 500 {
            ticket.evidence_snippet = ticket.evidence_snippet.chars().take(500).collect();
        }
        Ok(ticket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fills_identity_defaults() {
        let raw = r#"{
            "worker_agent_id": "coder",
            "worker_session_id": "s1",
            "worker_node_id": "g1",
            "worker_graph_id": "g1",
            "severity": "high",
            "cause": "18 consecutive RETRY verdicts",
            "judge_reasoning": "no progress across the observed window",
            "suggested_action": "review system prompt"
        }"#;
        let ticket = EscalationTicket::from_json(raw).unwrap();
        assert!(!ticket.ticket_id.is_empty());
        assert!(!ticket.created_at.is_empty());
        assert_eq!(ticket.severity, Severity::High);
        assert_eq!(ticket.steps_since_last_accept, 0);
    }

    #[test]
    fn parse_rejects_missing_required_fields() {
        assert!(EscalationTicket::from_json(r#"{"severity": "low"}"#).is_err());
    }

    #[test]
    fn evidence_snippet_is_capped() {
        let raw = format!(
            r#"{{
                "worker_agent_id": "w", "worker_session_id": "s",
                "worker_node_id": "g", "worker_graph_id": "g",
                "severity": "low", "cause": "c", "judge_reasoning": "r",
                "suggested_action": "a", "evidence_snippet": "{}"
            }}"#,
            "x".repeat(900)
        );
        let ticket = EscalationTicket::from_json(&raw).unwrap();
        assert_eq!(ticket.evidence_snippet.len(), 500);
    }

    #[test]
    fn severity_rejects_unknown() {
        assert!(serde_json::from_str::<Severity>("\"urgent\"").is_err());
    }
}
