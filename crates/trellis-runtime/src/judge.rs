use std::sync::Arc;

use futures::future::BoxFuture;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use trellis_core::error::Result;
use trellis_core::spec::NodeSpec;
use trellis_core::traits::LlmClient;
use trellis_core::types::{ChatMessage, StreamDelta};

/// Per-iteration verdict over one step of a node visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Retry,
    Continue,
    Escalate,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "ACCEPT",
            Self::Retry => "RETRY",
            Self::Continue => "CONTINUE",
            Self::Escalate => "ESCALATE",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A verdict plus the judge's free-text reasoning.
#[derive(Debug, Clone)]
pub struct JudgeDecision {
    pub verdict: Verdict,
    pub rationale: String,
}

impl JudgeDecision {
    pub fn new(verdict: Verdict, rationale: impl Into<String>) -> Self {
        Self {
            verdict,
            rationale: rationale.into(),
        }
    }
}

/// Everything the judge may consider for one step.
pub struct JudgeInput<'a> {
    pub node: &'a NodeSpec,
    /// The latest assistant message's user-visible text.
    pub assistant_text: &'a str,
    pub had_tool_calls: bool,
    /// Accumulator snapshot: outputs set so far this visit.
    pub outputs: &'a serde_json::Map<String, Value>,
    pub user_interaction_count: u32,
}

/// Policy deciding whether a node visit is done. The executor treats every
/// implementation identically.
pub trait NodeJudge: Send + Sync + 'static {
    fn evaluate<'a>(&'a self, input: JudgeInput<'a>) -> BoxFuture<'a, Result<JudgeDecision>>;
}

/// The default judge: deterministic rules, applied in order.
///
/// 1. Tool calls this turn mean more work is pending.
/// 2. A client-facing node that has never interacted with the user must
///    present something before silently filling outputs.
/// 3. Any unset required output key sends the model back.
/// 4. Otherwise the step is accepted.
pub struct ImplicitJudge;

impl ImplicitJudge {
    fn decide(input: &JudgeInput<'_>) -> JudgeDecision {
        if input.had_tool_calls {
            return JudgeDecision::new(Verdict::Continue, "tool calls pending");
        }

        if input.node.client_facing
            && input.user_interaction_count == 0
            && input.assistant_text.trim().is_empty()
        {
            return JudgeDecision::new(Verdict::Retry, "must present to user first");
        }

        let missing: Vec<&str> = input
            .node
            .required_output_keys()
            .into_iter()
            .filter(|k| !input.outputs.contains_key(*k))
            .collect();

        if !missing.is_empty() {
            if input.node.client_facing && !input.assistant_text.trim().is_empty() {
                return JudgeDecision::new(
                    Verdict::Continue,
                    format!("awaiting user input; outputs still unset: {}", missing.join(", ")),
                );
            }
            return JudgeDecision::new(
                Verdict::Retry,
                format!("required outputs unset: {}", missing.join(", ")),
            );
        }

        JudgeDecision::new(Verdict::Accept, "all required outputs set")
    }
}

impl NodeJudge for ImplicitJudge {
    fn evaluate<'a>(&'a self, input: JudgeInput<'a>) -> BoxFuture<'a, Result<JudgeDecision>> {
        Box::pin(async move { Ok(Self::decide(&input)) })
    }
}

/// An LLM-backed critic judging the step against the node's success
/// criteria. Plugged in through the same trait as the implicit judge.
pub struct LlmCriticJudge {
    llm: Arc<dyn LlmClient>,
}

impl LlmCriticJudge {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

impl NodeJudge for LlmCriticJudge {
    fn evaluate<'a>(&'a self, input: JudgeInput<'a>) -> BoxFuture<'a, Result<JudgeDecision>> {
        Box::pin(async move {
            // The deterministic rules still apply; the critic only refines
            // the accept path.
            let implicit = ImplicitJudge::decide(&input);
            if implicit.verdict != Verdict::Accept || input.node.success_criteria.is_empty() {
                return Ok(implicit);
            }

            let prompt = format!(
                "You are a judge evaluating one step of an agent's work.\n\n\
                 Success criteria:\n{}\n\n\
                 Outputs set so far: {}\n\n\
                 Latest assistant message:\n{}\n\n\
                 Respond with ONLY valid JSON:\n\
                 {{\"verdict\": \"accept\" | \"retry\" | \"continue\" | \"escalate\", \
                 \"reason\": \"brief explanation\"}}",
                input.node.success_criteria,
                serde_json::to_string(input.outputs).unwrap_or_default(),
                input.assistant_text,
            );

            let mut stream = self
                .llm
                .generate(vec![ChatMessage::user(prompt)], &[])
                .await?;

            let mut response = String::new();
            while let Some(delta) = stream.next().await {
                if let Ok(StreamDelta::TextDelta(text)) = delta {
                    response.push_str(&text);
                }
            }

            Ok(parse_decision(&response))
        })
    }
}

#[derive(Deserialize)]
struct CriticResponse {
    verdict: String,
    #[serde(default)]
    reason: String,
}

/// Parse a critic verdict. An unparseable response never blocks the
/// agent: it degrades to Continue.
fn parse_decision(response: &str) -> JudgeDecision {
    let json_str = extract_json(response);
    match serde_json::from_str::<CriticResponse>(json_str) {
        Ok(parsed) => {
            let verdict = match parsed.verdict.to_lowercase().as_str() {
                "accept" => Verdict::Accept,
                "retry" => Verdict::Retry,
                "escalate" => Verdict::Escalate,
                "continue" => Verdict::Continue,
                other => {
                    warn!(verdict = %other, "unknown critic verdict, treating as continue");
                    Verdict::Continue
                }
            };
            JudgeDecision::new(verdict, parsed.reason)
        }
        Err(e) => {
            warn!(error = %e, response = %response, "failed to parse critic response");
            JudgeDecision::new(Verdict::Continue, "critic response unparseable")
        }
    }
}

/// Extract JSON from a response that may contain markdown code fences.
fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            return &trimmed[start..=end];
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::spec::NodeSpec;

    fn outputs(keys: &[&str]) -> serde_json::Map<String, Value> {
        keys.iter()
            .map(|k| (k.to_string(), serde_json::json!("v")))
            .collect()
    }

    fn input<'a>(
        node: &'a NodeSpec,
        text: &'a str,
        had_tool_calls: bool,
        outs: &'a serde_json::Map<String, Value>,
        uic: u32,
    ) -> JudgeInput<'a> {
        JudgeInput {
            node,
            assistant_text: text,
            had_tool_calls,
            outputs: outs,
            user_interaction_count: uic,
        }
    }

    #[test]
    fn tool_calls_mean_continue() {
        let node = NodeSpec::new("n").with_outputs(vec!["a".into()]);
        let outs = outputs(&[]);
        let decision = ImplicitJudge::decide(&input(&node, "", true, &outs, 0));
        assert_eq!(decision.verdict, Verdict::Continue);
    }

    #[test]
    fn client_facing_must_present_first() {
        let node = NodeSpec::new("n")
            .with_outputs(vec!["answer".into()])
            .client_facing(true);
        let outs = outputs(&["answer"]);
        // Outputs filled silently, nothing shown to the user yet.
        let decision = ImplicitJudge::decide(&input(&node, "", false, &outs, 0));
        assert_eq!(decision.verdict, Verdict::Retry);
        assert!(decision.rationale.contains("present"));
    }

    #[test]
    fn client_facing_with_text_awaits_input() {
        let node = NodeSpec::new("n")
            .with_outputs(vec!["answer".into()])
            .client_facing(true);
        let outs = outputs(&[]);
        let decision =
            ImplicitJudge::decide(&input(&node, "What's your name?", false, &outs, 0));
        assert_eq!(decision.verdict, Verdict::Continue);
        assert!(decision.rationale.contains("awaiting user input"));
    }

    #[test]
    fn missing_required_output_retries() {
        let node = NodeSpec::new("n").with_outputs(vec!["a".into(), "b".into()]);
        let outs = outputs(&["a"]);
        let decision = ImplicitJudge::decide(&input(&node, "working on it", false, &outs, 0));
        assert_eq!(decision.verdict, Verdict::Retry);
        assert!(decision.rationale.contains('b'));
    }

    #[test]
    fn nullable_outputs_do_not_block_accept() {
        let node = NodeSpec::new("n")
            .with_outputs(vec!["a".into(), "b".into()])
            .with_nullable_outputs(vec!["b".into()]);
        // Only "a" set: accept.
        let outs = outputs(&["a"]);
        let decision = ImplicitJudge::decide(&input(&node, "done", false, &outs, 0));
        assert_eq!(decision.verdict, Verdict::Accept);

        // Only "b" set: retry.
        let outs = outputs(&["b"]);
        let decision = ImplicitJudge::decide(&input(&node, "done", false, &outs, 0));
        assert_eq!(decision.verdict, Verdict::Retry);
    }

    #[test]
    fn no_required_outputs_accepts_plain_text() {
        let node = NodeSpec::new("n");
        let outs = outputs(&[]);
        let decision = ImplicitJudge::decide(&input(&node, "done", false, &outs, 0));
        assert_eq!(decision.verdict, Verdict::Accept);
    }

    #[test]
    fn parse_decision_variants() {
        assert_eq!(
            parse_decision(r#"{"verdict": "accept", "reason": "good"}"#).verdict,
            Verdict::Accept
        );
        assert_eq!(
            parse_decision(r#"{"verdict": "escalate", "reason": "stuck"}"#).verdict,
            Verdict::Escalate
        );
        assert_eq!(
            parse_decision("```json\n{\"verdict\": \"retry\"}\n```").verdict,
            Verdict::Retry
        );
        assert_eq!(parse_decision("no json here").verdict, Verdict::Continue);
        assert_eq!(
            parse_decision(r#"{"verdict": "maybe"}"#).verdict,
            Verdict::Continue
        );
    }
}
