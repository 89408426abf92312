use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trellis_core::config::LoopConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::event::{AgentEvent, EventBus, EventPayload};
use trellis_core::goal::Goal;
use trellis_core::spec::{ConversationMode, EdgeCondition, EdgeSpec, GraphSpec, NodeSpec};
use trellis_core::expr;
use trellis_core::traits::{CredentialProvider, LlmClient};
use trellis_core::types::{
    ConversationMessage, ExecutionId, SessionId, StreamDelta, ToolContext, ToolResult,
};
use trellis_store::{
    checkpoint, CheckpointStore, ConversationStore, NodeCursor, OutputAccumulator, SessionStore,
    SharedMemory, StepLog, StepRecord,
};
use trellis_tools::ToolRegistry;

use crate::compaction;
use crate::judge::{JudgeInput, NodeJudge, Verdict};

/// Shared collaborators for every execution of one stream.
pub struct ExecutorDeps {
    pub llm: Arc<dyn LlmClient>,
    pub tools: Arc<ToolRegistry>,
    pub judge: Arc<dyn NodeJudge>,
    pub bus: EventBus,
    pub store: SessionStore,
    pub credentials: Option<Arc<dyn CredentialProvider>>,
    pub loop_config: LoopConfig,
}

/// Routes injected client input to whichever node visit is waiting on it.
#[derive(Clone, Default)]
pub struct InputRouter {
    waiters: Arc<Mutex<HashMap<String, oneshot::Sender<String>>>>,
}

impl InputRouter {
    pub fn register(&self, node_id: &str) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(node_id.to_string(), tx);
        rx
    }

    /// Deliver content to a waiting node. Returns false when nothing is
    /// waiting under that node id.
    pub fn deliver(&self, node_id: &str, content: String) -> bool {
        let Some(tx) = self.waiters.lock().unwrap().remove(node_id) else {
            return false;
        };
        tx.send(content).is_ok()
    }

    pub fn has_waiter(&self, node_id: &str) -> bool {
        self.waiters.lock().unwrap().contains_key(node_id)
    }

    /// Nodes currently parked on client input.
    pub fn waiting_nodes(&self) -> Vec<String> {
        self.waiters.lock().unwrap().keys().cloned().collect()
    }
}

/// Progress record for crash recovery: which nodes the execution is
/// currently visiting. Rewritten at every frontier transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub frontier: Vec<String>,
    pub status: String,
    pub updated_at: chrono::DateTime<Utc>,
}

/// Per-execution mutable context threaded through the step loop.
pub struct ExecContext {
    pub session_id: SessionId,
    pub execution_id: ExecutionId,
    pub memory: SharedMemory,
    pub cancel: CancellationToken,
    pub input_router: InputRouter,
    pub step_log: StepLog,
    /// Marker to prepend to the first visit's conversation (timer ticks,
    /// webhook arrivals).
    pub boundary_marker: Mutex<Option<ConversationMessage>>,
    /// Distinguishes conversation paths when an entry point runs several
    /// executions of one session concurrently.
    pub thread_suffix: Option<String>,
    /// Re-opening an interrupted execution: persisted cursors are honored
    /// instead of starting visits fresh.
    pub resuming: bool,
    visit_counts: Mutex<HashMap<String, u32>>,
    step_counter: AtomicU64,
    accepted_nodes: AtomicU32,
    conversations: tokio::sync::Mutex<HashMap<String, ConversationStore>>,
}

impl ExecContext {
    pub fn new(
        session_id: SessionId,
        execution_id: ExecutionId,
        memory: SharedMemory,
        cancel: CancellationToken,
        input_router: InputRouter,
        step_log: StepLog,
    ) -> Self {
        Self {
            session_id,
            execution_id,
            memory,
            cancel,
            input_router,
            step_log,
            boundary_marker: Mutex::new(None),
            thread_suffix: None,
            resuming: false,
            visit_counts: Mutex::new(HashMap::new()),
            step_counter: AtomicU64::new(0),
            accepted_nodes: AtomicU32::new(0),
            conversations: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn next_visit(&self, node_id: &str) -> u32 {
        let mut counts = self.visit_counts.lock().unwrap();
        let count = counts.entry(node_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn next_step(&self) -> u64 {
        self.step_counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Where edge evaluation sends the execution after a node visit.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    /// Forward edges matched; one target is a plain transition, several
    /// fan out into concurrent visits.
    Forward(Vec<String>),
    /// No forward match; the highest-priority feedback edge loops back.
    Feedback(String),
    /// Nothing matched and the node is terminal.
    Complete,
    /// Nothing matched and the node is not terminal.
    DeadEnd,
}

/// Pure edge selection: for a fixed memory snapshot and graph this is a
/// function of (node, accepted).
pub fn select_route(
    graph: &GraphSpec,
    node_id: &str,
    accepted: bool,
    memory: &serde_json::Map<String, Value>,
) -> Result<RouteDecision> {
    let matches = |edge: &EdgeSpec| -> bool {
        match &edge.condition {
            EdgeCondition::OnSuccess => accepted,
            EdgeCondition::OnFailure => !accepted,
            EdgeCondition::Always => true,
            EdgeCondition::Conditional { expr: source } => expr::parse(source)
                .map(|parsed| parsed.eval(memory))
                .unwrap_or(false),
        }
    };

    let mut forward: Vec<&EdgeSpec> = Vec::new();
    let mut feedback: Vec<&EdgeSpec> = Vec::new();
    for edge in graph.outgoing(node_id) {
        if edge.is_feedback() {
            feedback.push(edge);
        } else {
            forward.push(edge);
        }
    }
    forward.sort_by_key(|e| std::cmp::Reverse(e.priority));
    feedback.sort_by_key(|e| std::cmp::Reverse(e.priority));

    let forward_matched: Vec<&EdgeSpec> = forward.into_iter().filter(|e| matches(e)).collect();
    if !forward_matched.is_empty() {
        if forward_matched.len() >= 2 {
            for (i, a) in forward_matched.iter().enumerate() {
                for b in &forward_matched[i + 1..] {
                    let (Some(ta), Some(tb)) = (graph.node(&a.target), graph.node(&b.target))
                    else {
                        continue;
                    };
                    if let Some(shared) =
                        ta.output_keys.iter().find(|k| tb.output_keys.contains(k))
                    {
                        return Err(TrellisError::JudgeEscalated {
                            node: node_id.to_string(),
                            rationale: format!(
                                "fan-out targets '{}' and '{}' share output key '{}'",
                                a.target, b.target, shared
                            ),
                        });
                    }
                }
            }
        }
        return Ok(RouteDecision::Forward(
            forward_matched.iter().map(|e| e.target.clone()).collect(),
        ));
    }

    if let Some(edge) = feedback.into_iter().find(|e| matches(e)) {
        return Ok(RouteDecision::Feedback(edge.target.clone()));
    }

    if accepted && graph.is_terminal(node_id) {
        return Ok(RouteDecision::Complete);
    }
    Ok(RouteDecision::DeadEnd)
}

struct VisitOutcome {
    accepted: bool,
    rationale: String,
}

/// Mutable state of one node visit, persisted as the cursor after every
/// step.
struct VisitState {
    iteration: u32,
    user_interaction_count: u32,
    retry_count: u32,
    identical_retry_count: u32,
    recent_responses: Vec<String>,
    recent_tool_fingerprints: Vec<String>,
    awaiting_input: bool,
}

impl VisitState {
    fn from_cursor(cursor: &NodeCursor) -> Self {
        Self {
            iteration: cursor.iteration,
            user_interaction_count: cursor.user_interaction_count,
            retry_count: cursor.retry_count,
            identical_retry_count: cursor.identical_retry_count,
            recent_responses: cursor.recent_responses.clone(),
            recent_tool_fingerprints: cursor.recent_tool_fingerprints.clone(),
            awaiting_input: cursor.awaiting_input,
        }
    }

    fn to_cursor(
        &self,
        node_id: &str,
        outputs: serde_json::Map<String, Value>,
        last_message_ordinal: u64,
    ) -> NodeCursor {
        NodeCursor {
            node_id: node_id.to_string(),
            iteration: self.iteration,
            outputs,
            user_interaction_count: self.user_interaction_count,
            recent_responses: self.recent_responses.clone(),
            recent_tool_fingerprints: self.recent_tool_fingerprints.clone(),
            last_message_ordinal,
            retry_count: self.retry_count,
            identical_retry_count: self.identical_retry_count,
            awaiting_input: self.awaiting_input,
        }
    }
}

#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    input_json: String,
}

/// Drives one execution of a graph: node visits, judge verdicts, edge
/// transitions, fan-out, and feedback loops.
pub struct GraphExecutor {
    graph: Arc<GraphSpec>,
    goal: Option<Arc<Goal>>,
    graph_id: String,
    stream_id: String,
    entry_node: String,
    deps: Arc<ExecutorDeps>,
}

impl GraphExecutor {
    pub fn new(
        graph: Arc<GraphSpec>,
        goal: Option<Arc<Goal>>,
        stream_id: impl Into<String>,
        entry_node: impl Into<String>,
        deps: Arc<ExecutorDeps>,
    ) -> Self {
        let graph_id = graph.id.clone();
        Self {
            graph,
            goal,
            graph_id,
            stream_id: stream_id.into(),
            entry_node: entry_node.into(),
            deps,
        }
    }

    pub fn graph(&self) -> &GraphSpec {
        &self.graph
    }

    fn publish(&self, ctx: &ExecContext, node: Option<&str>, payload: EventPayload) {
        let mut event = AgentEvent::new(payload)
            .with_graph(&self.graph_id)
            .with_stream(&self.stream_id)
            .with_execution(ctx.execution_id.as_str());
        if let Some(node) = node {
            event = event.with_node(node);
        }
        self.deps.bus.publish(event);
    }

    /// Run from the entry node (or a resumed frontier) to completion.
    pub async fn run(&self, ctx: &ExecContext, start: Option<Vec<String>>) -> Result<()> {
        let mut frontier = start.unwrap_or_else(|| vec![self.entry_node.clone()]);

        while !frontier.is_empty() {
            self.write_execution_record(ctx, &frontier, "running").await?;

            if frontier.len() == 1 {
                let node_id = frontier.pop().unwrap();
                frontier = self.visit_and_route(ctx, &node_id).await?;
            } else {
                // Fan-out: each target runs concurrently; the next level
                // starts only when all of them settle, so a join target
                // sees every sibling's flushed outputs.
                let results = futures::future::join_all(
                    frontier.iter().map(|n| self.visit_and_route(ctx, n)),
                )
                .await;
                let mut next = BTreeSet::new();
                for result in results {
                    for target in result? {
                        next.insert(target);
                    }
                }
                frontier = next.into_iter().collect();
            }
        }
        Ok(())
    }

    async fn write_execution_record(
        &self,
        ctx: &ExecContext,
        frontier: &[String],
        status: &str,
    ) -> Result<()> {
        let record = ExecutionRecord {
            execution_id: ctx.execution_id.0.clone(),
            frontier: frontier.to_vec(),
            status: status.to_string(),
            updated_at: Utc::now(),
        };
        let path = self
            .deps
            .store
            .session_root(&ctx.session_id)
            .join("execution.json");
        let bytes = serde_json::to_vec_pretty(&record)?;
        tokio::fs::create_dir_all(path.parent().unwrap()).await?;
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn visit_and_route(&self, ctx: &ExecContext, node_id: &str) -> Result<Vec<String>> {
        let node = self
            .graph
            .node(node_id)
            .ok_or_else(|| TrellisError::NodeNotFound(node_id.to_string()))?;

        let visit = ctx.next_visit(node_id);
        if node.max_node_visits > 0 && visit > node.max_node_visits {
            return Err(TrellisError::JudgeEscalated {
                node: node_id.to_string(),
                rationale: format!(
                    "visit {visit} exceeds max_node_visits {}",
                    node.max_node_visits
                ),
            });
        }

        let outcome = self.run_visit(ctx, node, visit).await?;

        let snapshot = ctx.memory.snapshot();
        match select_route(&self.graph, node_id, outcome.accepted, &snapshot)? {
            RouteDecision::Forward(targets) => {
                for target in &targets {
                    self.publish(
                        ctx,
                        Some(node_id),
                        EventPayload::EdgeTraversed {
                            source: node_id.to_string(),
                            target: target.clone(),
                        },
                    );
                }
                Ok(targets)
            }
            RouteDecision::Feedback(target) => {
                self.publish(
                    ctx,
                    Some(node_id),
                    EventPayload::EdgeTraversed {
                        source: node_id.to_string(),
                        target: target.clone(),
                    },
                );
                Ok(vec![target])
            }
            RouteDecision::Complete => Ok(vec![]),
            RouteDecision::DeadEnd => {
                if outcome.accepted {
                    Err(TrellisError::DeadEnd(node_id.to_string()))
                } else {
                    Err(TrellisError::JudgeEscalated {
                        node: node_id.to_string(),
                        rationale: outcome.rationale,
                    })
                }
            }
        }
    }

    fn thread_name(&self, ctx: &ExecContext, node: &NodeSpec, visit: u32) -> String {
        let base = match node.conversation_mode {
            ConversationMode::Continuous => self.entry_node.clone(),
            ConversationMode::Isolated => {
                if visit <= 1 {
                    node.id.clone()
                } else {
                    format!("{}__v{visit}", node.id)
                }
            }
        };
        match &ctx.thread_suffix {
            Some(suffix) => format!("{base}__{suffix}"),
            None => base,
        }
    }

    async fn conversation(&self, ctx: &ExecContext, thread: &str) -> Result<ConversationStore> {
        let mut cache = ctx.conversations.lock().await;
        if let Some(store) = cache.get(thread) {
            return Ok(store.clone());
        }
        let dir = self.deps.store.conversation_dir(&ctx.session_id, thread);
        let store = ConversationStore::open(dir).await?;
        cache.insert(thread.to_string(), store.clone());
        Ok(store)
    }

    /// Read the cursor, falling back to the latest checkpoint when it is
    /// corrupt. A second corrupt read fails the session.
    async fn cursor_with_fallback(
        &self,
        ctx: &ExecContext,
        conv: &ConversationStore,
    ) -> Result<NodeCursor> {
        match conv.read_cursor().await {
            Ok(cursor) => Ok(cursor.unwrap_or_default()),
            Err(TrellisError::CorruptCursor(msg)) => {
                warn!(error = %msg, "corrupt cursor, attempting checkpoint fallback");
                let session_root = self.deps.store.session_root(&ctx.session_id);
                if checkpoint::restore_latest(&session_root).await? {
                    Ok(conv.read_cursor().await?.unwrap_or_default())
                } else {
                    Err(TrellisError::CorruptCursor(msg))
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn run_visit(
        &self,
        ctx: &ExecContext,
        node: &NodeSpec,
        visit: u32,
    ) -> Result<VisitOutcome> {
        let thread = self.thread_name(ctx, node, visit);
        let conv = self.conversation(ctx, &thread).await?;

        // A cursor only carries over into this visit when we are resuming
        // an interrupted execution of the same node; otherwise the visit
        // starts fresh (the log itself always persists).
        let prior = self.cursor_with_fallback(ctx, &conv).await?;
        let resume_visit = ctx.resuming && prior.node_id == node.id;
        let mut state = if resume_visit {
            VisitState::from_cursor(&prior)
        } else {
            VisitState::from_cursor(&NodeCursor::default())
        };
        let accumulator = if resume_visit {
            OutputAccumulator::restore(prior.outputs.clone())
        } else {
            OutputAccumulator::new()
        };

        // Close out tool calls interrupted by a crash so the model can
        // retry them; idempotent on clean logs.
        let repaired = conv.repair_orphan_tool_calls().await?;
        if repaired > 0 {
            info!(repaired, node_id = %node.id, "repaired orphan tool calls on resume");
            self.persist_cursor(&conv, node, &state, &accumulator).await?;
        }

        // Boundary bookkeeping for continuous conversations: the trigger's
        // marker (timer tick etc.), then the node-transition marker, both
        // only on the first turn of the visit.
        if state.iteration == 0 && !state.awaiting_input {
            if node.conversation_mode == ConversationMode::Continuous {
                let boundary_marker = ctx.boundary_marker.lock().unwrap().take();
                if let Some(marker) = boundary_marker {
                    conv.append(&marker).await?;
                }
                conv.append(&ConversationMessage::marker(
                    "node_transition",
                    serde_json::json!({"next_node": node.id}),
                ))
                .await?;
                compaction::maybe_compact(
                    self.deps.llm.as_ref(),
                    &conv,
                    self.deps.loop_config.max_history_tokens,
                )
                .await?;
            }
            self.persist_cursor(&conv, node, &state, &accumulator).await?;
        }

        self.publish(
            ctx,
            Some(&node.id),
            EventPayload::NodeLoopStarted {
                visit,
                iteration: state.iteration,
            },
        );

        // A process restart while parked on client input re-enters the
        // wait without re-issuing the LLM turn.
        if state.awaiting_input {
            let prompt = last_assistant_text(&conv).await?;
            self.await_client_input(ctx, &conv, node, &prompt, &mut state, &accumulator)
                .await?;
        }

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(self
                    .cancel_cleanup(ctx, &conv, node, &mut state, &accumulator)
                    .await);
            }
            if state.iteration >= self.deps.loop_config.max_iterations {
                let rationale = format!(
                    "iteration limit {} reached",
                    self.deps.loop_config.max_iterations
                );
                self.publish(
                    ctx,
                    Some(&node.id),
                    EventPayload::NodeLoopCompleted {
                        verdict: Verdict::Escalate.as_str().to_string(),
                        rationale: rationale.clone(),
                    },
                );
                return Ok(VisitOutcome {
                    accepted: false,
                    rationale,
                });
            }

            let system_prompt = self.compose_system_prompt(node, ctx);
            let parts = conv.read_all().await?;
            let messages = compaction::assemble_history(&system_prompt, &parts);
            let tool_defs = self.deps.tools.definitions_for(&node.tools);

            let mut stream = self
                .generate_with_retry(ctx, &conv, messages, &tool_defs)
                .await?;

            let mut text = String::new();
            let mut calls: Vec<ToolCallAccumulator> = Vec::new();
            while let Some(delta) = stream.next().await {
                if ctx.cancel.is_cancelled() {
                    return Err(self
                        .cancel_cleanup(ctx, &conv, node, &mut state, &accumulator)
                        .await);
                }
                match delta? {
                    StreamDelta::TextDelta(chunk) => {
                        self.publish(
                            ctx,
                            Some(&node.id),
                            EventPayload::LlmTextDelta {
                                text: chunk.clone(),
                            },
                        );
                        if node.client_facing {
                            self.publish(
                                ctx,
                                Some(&node.id),
                                EventPayload::ClientOutputDelta {
                                    text: chunk.clone(),
                                },
                            );
                        }
                        text.push_str(&chunk);
                    }
                    StreamDelta::ToolUseStart { index, id, name } => {
                        while calls.len() <= index {
                            calls.push(ToolCallAccumulator::default());
                        }
                        calls[index].id = id;
                        calls[index].name = name;
                    }
                    StreamDelta::ToolInputDelta { index, delta } => {
                        if let Some(call) = calls.get_mut(index) {
                            call.input_json.push_str(&delta);
                        }
                    }
                    StreamDelta::Stop(_) => {}
                }
            }

            // The assistant message and its tool calls are on disk before
            // any of their effects become visible to subscribers.
            conv.append(&ConversationMessage::assistant(text.clone())).await?;
            let had_tool_calls = !calls.is_empty();
            let mut call_names = Vec::new();

            if had_tool_calls {
                let parsed: Vec<Value> = calls
                    .iter()
                    .map(|c| serde_json::from_str(&c.input_json).unwrap_or(Value::Null))
                    .collect();
                for (call, input) in calls.iter().zip(parsed.iter()) {
                    conv.append(&ConversationMessage::tool_call(
                        &call.id,
                        &call.name,
                        input.clone(),
                    ))
                    .await?;
                    call_names.push(call.name.clone());
                }

                if ctx.cancel.is_cancelled() {
                    return Err(self
                        .cancel_cleanup(ctx, &conv, node, &mut state, &accumulator)
                        .await);
                }

                self.dispatch_tool_calls(ctx, node, &conv, &calls, parsed, &accumulator, &mut state)
                    .await?;
            }

            state.iteration += 1;

            let outputs = accumulator.snapshot();
            let decision = self
                .deps
                .judge
                .evaluate(JudgeInput {
                    node,
                    assistant_text: &text,
                    had_tool_calls,
                    outputs: &outputs,
                    user_interaction_count: state.user_interaction_count,
                })
                .await?;

            ctx.step_log
                .append(&StepRecord {
                    step: ctx.next_step(),
                    node_id: node.id.clone(),
                    iteration: state.iteration,
                    verdict: decision.verdict.as_str().to_string(),
                    llm_text: text.clone(),
                    tool_calls: call_names.clone(),
                    ts: Utc::now().to_rfc3339(),
                })
                .await;

            debug!(
                node_id = %node.id,
                iteration = state.iteration,
                verdict = %decision.verdict,
                "step judged"
            );

            let fingerprint = turn_fingerprint(&text, &calls);
            match decision.verdict {
                Verdict::Continue => {
                    self.persist_cursor(&conv, node, &state, &accumulator).await?;
                    if !had_tool_calls && node.client_facing && !text.trim().is_empty() {
                        self.await_client_input(ctx, &conv, node, &text, &mut state, &accumulator)
                            .await?;
                    }
                }
                Verdict::Retry => {
                    state.retry_count += 1;
                    if state.recent_responses.last() == Some(&fingerprint) {
                        state.identical_retry_count += 1;
                    } else {
                        state.identical_retry_count = 1;
                    }
                    push_recent(&mut state.recent_responses, fingerprint.clone());
                    push_recent(
                        &mut state.recent_tool_fingerprints,
                        calls_fingerprint(&calls),
                    );

                    if state.retry_count > node.max_retries {
                        let rationale = format!(
                            "retry threshold exceeded after {} attempts: {}",
                            state.retry_count, decision.rationale
                        );
                        self.persist_cursor(&conv, node, &state, &accumulator).await?;
                        self.publish(
                            ctx,
                            Some(&node.id),
                            EventPayload::NodeLoopCompleted {
                                verdict: Verdict::Escalate.as_str().to_string(),
                                rationale: rationale.clone(),
                            },
                        );
                        return Ok(VisitOutcome {
                            accepted: false,
                            rationale,
                        });
                    }

                    conv.append(&ConversationMessage::marker(
                        "judge_retry",
                        serde_json::json!({"rationale": decision.rationale}),
                    ))
                    .await?;
                    self.persist_cursor(&conv, node, &state, &accumulator).await?;
                }
                Verdict::Accept => {
                    push_recent(&mut state.recent_responses, fingerprint);
                    accumulator.flush(&ctx.memory);
                    self.persist_cursor(&conv, node, &state, &accumulator).await?;
                    self.publish(
                        ctx,
                        Some(&node.id),
                        EventPayload::NodeLoopCompleted {
                            verdict: Verdict::Accept.as_str().to_string(),
                            rationale: decision.rationale.clone(),
                        },
                    );
                    self.publish_goal_progress(ctx, &node.id);
                    self.auto_checkpoint(ctx).await;
                    return Ok(VisitOutcome {
                        accepted: true,
                        rationale: decision.rationale,
                    });
                }
                Verdict::Escalate => {
                    self.persist_cursor(&conv, node, &state, &accumulator).await?;
                    self.publish(
                        ctx,
                        Some(&node.id),
                        EventPayload::NodeLoopCompleted {
                            verdict: Verdict::Escalate.as_str().to_string(),
                            rationale: decision.rationale.clone(),
                        },
                    );
                    return Ok(VisitOutcome {
                        accepted: false,
                        rationale: decision.rationale,
                    });
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_tool_calls(
        &self,
        ctx: &ExecContext,
        node: &NodeSpec,
        conv: &ConversationStore,
        calls: &[ToolCallAccumulator],
        parsed: Vec<Value>,
        accumulator: &OutputAccumulator,
        state: &VisitState,
    ) -> Result<()> {
        let cap = self.deps.loop_config.max_tool_calls_per_turn;
        let tool_ctx = ToolContext {
            session_id: Some(ctx.session_id.clone()),
            graph_id: Some(self.graph_id.clone()),
            node_id: Some(node.id.clone()),
            data_dir: Some(self.deps.store.data_dir(&ctx.session_id)),
            outputs: Some(accumulator.sink()),
            credentials: self.deps.credentials.clone(),
        };

        let executable = calls.len().min(cap);
        let all_parallel_safe = executable > 1
            && calls[..executable]
                .iter()
                .all(|c| self.deps.tools.is_parallel_safe(&c.name));

        if all_parallel_safe {
            for (call, input) in calls[..executable].iter().zip(parsed.iter()) {
                self.publish(
                    ctx,
                    Some(&node.id),
                    EventPayload::ToolCallStarted {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        args: input.clone(),
                    },
                );
            }
            let tasks: Vec<_> = calls[..executable]
                .iter()
                .zip(parsed.iter())
                .map(|(call, input)| {
                    let tools = self.deps.tools.clone();
                    let tool_ctx = tool_ctx.clone();
                    let name = call.name.clone();
                    let input = input.clone();
                    async move {
                        tools
                            .execute(&name, input, tool_ctx)
                            .await
                            .unwrap_or_else(|e| ToolResult::error(e.to_string()))
                    }
                })
                .collect();
            let results = futures::future::join_all(tasks).await;
            for (call, result) in calls[..executable].iter().zip(results) {
                self.record_tool_result(ctx, node, conv, call, result, accumulator, state)
                    .await?;
            }
        } else {
            for (call, input) in calls[..executable].iter().zip(parsed.into_iter()) {
                if ctx.cancel.is_cancelled() {
                    return Err(self.cancel_cleanup(ctx, conv, node, state, accumulator).await);
                }
                self.publish(
                    ctx,
                    Some(&node.id),
                    EventPayload::ToolCallStarted {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        args: input.clone(),
                    },
                );
                let result = self
                    .deps
                    .tools
                    .execute(&call.name, input, tool_ctx.clone())
                    .await
                    .unwrap_or_else(|e| ToolResult::error(e.to_string()));
                self.record_tool_result(ctx, node, conv, call, result, accumulator, state)
                    .await?;
            }
        }

        // Calls beyond the per-turn cap are not executed; the model sees
        // an error result for each.
        for call in &calls[executable..] {
            let result = ToolResult::error(format!(
                "tool call limit of {cap} per turn exceeded; call skipped"
            ));
            self.record_tool_result(ctx, node, conv, call, result, accumulator, state)
                .await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_tool_result(
        &self,
        ctx: &ExecContext,
        node: &NodeSpec,
        conv: &ConversationStore,
        call: &ToolCallAccumulator,
        result: ToolResult,
        accumulator: &OutputAccumulator,
        state: &VisitState,
    ) -> Result<()> {
        conv.append(&ConversationMessage::tool_result(
            &call.id,
            &call.name,
            &result.content,
            result.is_error,
        ))
        .await?;
        // Write-through durability: outputs the call produced are in the
        // cursor before anything else observes them.
        self.persist_cursor(conv, node, state, accumulator).await?;
        self.publish(
            ctx,
            Some(&node.id),
            EventPayload::ToolCallCompleted {
                call_id: call.id.clone(),
                name: call.name.clone(),
                result: serde_json::json!({
                    "content": result.content,
                    "is_error": result.is_error,
                }),
            },
        );
        Ok(())
    }

    async fn await_client_input(
        &self,
        ctx: &ExecContext,
        conv: &ConversationStore,
        node: &NodeSpec,
        prompt: &str,
        state: &mut VisitState,
        accumulator: &OutputAccumulator,
    ) -> Result<()> {
        state.awaiting_input = true;
        self.persist_cursor(conv, node, state, accumulator).await?;
        self.publish(
            ctx,
            Some(&node.id),
            EventPayload::ClientInputRequested {
                node_id: node.id.clone(),
                prompt: prompt.to_string(),
            },
        );

        let receiver = ctx.input_router.register(&node.id);
        let content = tokio::select! {
            received = receiver => match received {
                Ok(content) => content,
                Err(_) => {
                    return Err(self.cancel_cleanup(ctx, conv, node, state, accumulator).await);
                }
            },
            _ = ctx.cancel.cancelled() => {
                return Err(self.cancel_cleanup(ctx, conv, node, state, accumulator).await);
            }
        };

        conv.append(&ConversationMessage::user(content.clone())).await?;
        state.user_interaction_count += 1;
        state.awaiting_input = false;
        self.persist_cursor(conv, node, state, accumulator).await?;
        self.publish(
            ctx,
            Some(&node.id),
            EventPayload::ClientInputReceived {
                node_id: node.id.clone(),
                content,
            },
        );
        Ok(())
    }

    /// The cancellation cleanup sequence. Idempotent: flush, repair,
    /// persist. The stream finishes the sequence by writing state.json
    /// and emitting EXECUTION_PAUSED.
    async fn cancel_cleanup(
        &self,
        ctx: &ExecContext,
        conv: &ConversationStore,
        node: &NodeSpec,
        state: &VisitState,
        accumulator: &OutputAccumulator,
    ) -> TrellisError {
        accumulator.flush(&ctx.memory);
        if let Err(e) = conv.repair_orphan_tool_calls().await {
            warn!(error = %e, "orphan repair during cancellation failed");
        }
        if let Err(e) = self.persist_cursor(conv, node, state, accumulator).await {
            warn!(error = %e, "cursor persist during cancellation failed");
        }
        TrellisError::Cancelled
    }

    async fn persist_cursor(
        &self,
        conv: &ConversationStore,
        node: &NodeSpec,
        state: &VisitState,
        accumulator: &OutputAccumulator,
    ) -> Result<()> {
        let cursor = state.to_cursor(&node.id, accumulator.snapshot(), conv.last_ordinal().await);
        conv.write_cursor(&cursor).await
    }

    async fn generate_with_retry(
        &self,
        ctx: &ExecContext,
        conv: &ConversationStore,
        messages: Vec<trellis_core::types::ChatMessage>,
        tool_defs: &[trellis_core::types::ToolDefinition],
    ) -> Result<futures::stream::BoxStream<'static, Result<StreamDelta>>> {
        let mut attempt: u32 = 0;
        loop {
            let result = tokio::select! {
                r = self.deps.llm.generate(messages.clone(), tool_defs) => r,
                _ = ctx.cancel.cancelled() => return Err(TrellisError::Cancelled),
            };
            match result {
                Ok(stream) => return Ok(stream),
                Err(TrellisError::LlmTransient(message)) => {
                    attempt += 1;
                    if attempt >= self.deps.loop_config.llm_retry_attempts {
                        return Err(TrellisError::LlmTransient(message));
                    }
                    warn!(attempt, error = %message, "transient LLM failure, retrying");
                    conv.append(&ConversationMessage::marker(
                        "llm_retry",
                        serde_json::json!({"attempt": attempt, "error": message}),
                    ))
                    .await?;
                    let delay = self.deps.loop_config.llm_retry_base_ms * (1 << attempt.min(6));
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn compose_system_prompt(&self, node: &NodeSpec, ctx: &ExecContext) -> String {
        let mut prompt = String::new();
        if let Some(goal) = &self.goal {
            prompt.push_str(&goal.render_for_prompt());
            prompt.push('\n');
        }
        if !node.system_prompt.is_empty() {
            prompt.push_str(&node.system_prompt);
            prompt.push('\n');
        }
        prompt.push_str(&format!("\nCurrent step: {}", node.id));
        if !node.description.is_empty() {
            prompt.push_str(&format!(" ({})", node.description));
        }
        prompt.push('\n');
        if !node.success_criteria.is_empty() {
            prompt.push_str(&format!("Step succeeds when: {}\n", node.success_criteria));
        }

        let snapshot = ctx.memory.snapshot();
        if !node.input_keys.is_empty() {
            prompt.push_str("\nContext data:\n");
            for key in &node.input_keys {
                if let Some(value) = snapshot.get(key) {
                    let rendered = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    prompt.push_str(&format!("- {key}: {rendered}\n"));
                }
            }
        }
        if !node.output_keys.is_empty() {
            prompt.push_str(&format!(
                "\nRecord each output with the set_output tool. Outputs: {}.",
                node.output_keys.join(", ")
            ));
            if !node.nullable_output_keys.is_empty() {
                prompt.push_str(&format!(
                    " Optional: {}.",
                    node.nullable_output_keys.join(", ")
                ));
            }
            prompt.push('\n');
        }
        prompt
    }

    fn publish_goal_progress(&self, ctx: &ExecContext, node_id: &str) {
        let Some(goal) = &self.goal else {
            return;
        };
        let accepted = ctx.accepted_nodes.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self.graph.nodes.len() as u32;
        let progress = if total == 0 {
            0.0
        } else {
            f64::from(accepted.min(total)) / f64::from(total)
        };
        self.publish(
            ctx,
            Some(node_id),
            EventPayload::GoalProgress {
                goal_id: goal.id.clone(),
                progress,
                detail: format!("{accepted} node visit(s) accepted"),
            },
        );
    }

    async fn auto_checkpoint(&self, ctx: &ExecContext) {
        let root = self.deps.store.session_root(&ctx.session_id);
        if let Err(e) = CheckpointStore::new(root).save("auto").await {
            warn!(error = %e, "auto checkpoint failed");
        }
    }
}

async fn last_assistant_text(conv: &ConversationStore) -> Result<String> {
    let parts = conv.read_all().await?;
    Ok(parts
        .iter()
        .rev()
        .find_map(|(_, m)| match m {
            ConversationMessage::Assistant { content, .. } if !content.is_empty() => {
                Some(content.clone())
            }
            _ => None,
        })
        .unwrap_or_default())
}

fn push_recent(list: &mut Vec<String>, item: String) {
    list.push(item);
    if list.len() > 5 {
        list.remove(0);
    }
}

fn turn_fingerprint(text: &str, calls: &[ToolCallAccumulator]) -> String {
    let mut fingerprint = text.chars().take(200).collect::<String>();
    fingerprint.push('|');
    fingerprint.push_str(&calls_fingerprint(calls));
    fingerprint
}

fn calls_fingerprint(calls: &[ToolCallAccumulator]) -> String {
    calls
        .iter()
        .map(|c| {
            let args: String = c.input_json.chars().take(200).collect();
            format!("{}({args})", c.name)
        })
        .collect::<Vec<_>>()
        .join(";")
}
