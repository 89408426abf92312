use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use trellis_core::error::{Result, TrellisError};
use trellis_core::event::{AgentEvent, EventPayload};
use trellis_core::goal::Goal;
use trellis_core::spec::{EntryPointSpec, GraphSpec, IsolationLevel};
use trellis_core::types::{ConversationMessage, ExecutionId, SessionId};
use trellis_store::{CheckpointStore, SessionStatus, SessionStore, StepLog};

use crate::executor::{ExecContext, ExecutionRecord, ExecutorDeps, GraphExecutor, InputRouter};

/// Hands a secondary stream the primary session's memory, filtered to its
/// entry node's input keys, whenever it fires.
pub struct PrimaryBridge {
    pub store: SessionStore,
    pub session_id: SessionId,
    pub input_keys: Vec<String>,
}

/// Result of one finished (or paused) execution.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub execution_id: ExecutionId,
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub memory: serde_json::Map<String, Value>,
}

/// The lifecycle wrapper for one (graph, entry point) binding: resolves
/// sessions, serializes executions, routes injected input, and owns the
/// cancellation tokens of in-flight executions.
pub struct ExecutionStream {
    graph: Arc<GraphSpec>,
    entry_point: EntryPointSpec,
    stream_id: String,
    executor: GraphExecutor,
    deps: Arc<ExecutorDeps>,
    permits: Arc<tokio::sync::Semaphore>,
    input_router: InputRouter,
    exec_tokens: Mutex<HashMap<String, CancellationToken>>,
    stream_cancel: CancellationToken,
    /// Serializes the finalize/cleanup sequence across executions.
    cleanup_lock: tokio::sync::Mutex<()>,
    last_session: Mutex<Option<SessionId>>,
    bridge: Option<PrimaryBridge>,
}

impl ExecutionStream {
    pub fn new(
        graph: Arc<GraphSpec>,
        goal: Option<Arc<Goal>>,
        entry_point: EntryPointSpec,
        deps: Arc<ExecutorDeps>,
        stream_cancel: CancellationToken,
    ) -> Self {
        let stream_id = format!("{}::{}", graph.id, entry_point.id);
        let executor = GraphExecutor::new(
            graph.clone(),
            goal,
            stream_id.clone(),
            entry_point.entry_node.clone(),
            deps.clone(),
        );
        Self {
            graph,
            permits: Arc::new(tokio::sync::Semaphore::new(
                entry_point.max_concurrent.max(1) as usize,
            )),
            entry_point,
            stream_id,
            executor,
            deps,
            input_router: InputRouter::default(),
            exec_tokens: Mutex::new(HashMap::new()),
            stream_cancel,
            cleanup_lock: tokio::sync::Mutex::new(()),
            last_session: Mutex::new(None),
            bridge: None,
        }
    }

    /// Attach primary-session bridging (secondary graphs only).
    pub fn with_bridge(mut self, bridge: PrimaryBridge) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn entry_point(&self) -> &EntryPointSpec {
        &self.entry_point
    }

    pub fn graph_id(&self) -> &str {
        &self.graph.id
    }

    /// Whether a new execution would currently be rejected.
    pub fn is_busy(&self) -> bool {
        self.permits.available_permits() == 0
    }

    pub fn last_session(&self) -> Option<SessionId> {
        self.last_session.lock().unwrap().clone()
    }

    /// The session a non-manual, isolated entry point always reuses.
    fn persistent_session_id(&self) -> SessionId {
        SessionId::from_string(format!("ep-{}-{}", self.graph.id, self.entry_point.id))
    }

    pub async fn execute(
        &self,
        input: serde_json::Map<String, Value>,
        resume_session: Option<SessionId>,
    ) -> Result<ExecutionReport> {
        self.execute_with_marker(input, resume_session, None).await
    }

    /// Run one execution. Triggers that carry a conversation boundary
    /// marker (timer ticks, webhook arrivals) pass it here.
    pub async fn execute_with_marker(
        &self,
        input: serde_json::Map<String, Value>,
        resume_session: Option<SessionId>,
        marker: Option<ConversationMessage>,
    ) -> Result<ExecutionReport> {
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            return Err(TrellisError::StreamBusy(self.stream_id.clone()));
        };

        let mut input = input;
        if let Some(bridge) = &self.bridge {
            if let Ok(primary) = bridge.store.read_state(&bridge.session_id).await {
                for key in &bridge.input_keys {
                    if !input.contains_key(key) {
                        if let Some(value) = primary.memory.get(key) {
                            input.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
        }

        let resuming = resume_session.is_some();
        let session_id = match resume_session {
            Some(sid) => {
                if !self.deps.store.exists(&sid).await {
                    return Err(TrellisError::SessionNotFound(sid.0));
                }
                sid
            }
            None => match self.entry_point.isolation_level {
                IsolationLevel::Isolated => self.persistent_session_id(),
                _ => SessionId::new(),
            },
        };

        let mut state = if self.deps.store.exists(&session_id).await {
            self.deps.store.read_state(&session_id).await?
        } else {
            self.deps
                .store
                .create_session(&session_id, &self.graph.id)
                .await?
        };
        *self.last_session.lock().unwrap() = Some(session_id.clone());

        let execution_id = ExecutionId(Uuid::new_v4().to_string());

        // Credential preflight: a missing credential fails the execution
        // before any LLM turn is issued.
        if let Some(creds) = &self.deps.credentials {
            if let Err(e) = creds.preflight(&self.graph.id).await {
                self.publish_exec_event(
                    &execution_id,
                    EventPayload::ExecutionFailed {
                        error: e.to_string(),
                    },
                );
                state.status = SessionStatus::Failed;
                state.updated_at = Utc::now();
                self.deps.store.write_state(&state).await?;
                return Err(e);
            }
        }

        let memory = trellis_store::SharedMemory::from_snapshot(state.memory.clone());
        for (key, value) in input.clone() {
            memory.set(key, value);
        }

        let exec_cancel = self.stream_cancel.child_token();
        self.exec_tokens
            .lock()
            .unwrap()
            .insert(execution_id.0.clone(), exec_cancel.clone());

        let mut ctx = ExecContext::new(
            session_id.clone(),
            execution_id.clone(),
            memory.clone(),
            exec_cancel,
            self.input_router.clone(),
            StepLog::new(self.deps.store.logs_dir(&session_id)),
        );
        *ctx.boundary_marker.lock().unwrap() = marker;
        ctx.resuming = resuming;
        if self.entry_point.max_concurrent > 1 {
            ctx.thread_suffix = Some(execution_id.0.chars().take(8).collect());
        }

        self.publish_exec_event(
            &execution_id,
            EventPayload::ExecutionStarted {
                input: Value::Object(input),
            },
        );
        info!(
            stream_id = %self.stream_id,
            session_id = %session_id,
            execution_id = %execution_id,
            resuming,
            "execution started"
        );

        let start = if resuming {
            self.resume_frontier(&session_id).await
        } else {
            None
        };

        let result = self.executor.run(&ctx, start).await;

        // Finalization runs under the stream lock and is idempotent.
        let _guard = self.cleanup_lock.lock().await;
        self.exec_tokens.lock().unwrap().remove(&execution_id.0);

        state.memory = memory.snapshot();
        state.updated_at = Utc::now();
        match result {
            Ok(()) => {
                state.status = SessionStatus::Completed;
                self.deps.store.write_state(&state).await?;
                self.publish_exec_event(
                    &execution_id,
                    EventPayload::ExecutionCompleted {
                        outputs: Value::Object(state.memory.clone()),
                    },
                );
                info!(execution_id = %execution_id, "execution completed");
                drop(permit);
                Ok(ExecutionReport {
                    execution_id,
                    session_id,
                    status: SessionStatus::Completed,
                    memory: state.memory,
                })
            }
            Err(TrellisError::Cancelled) => {
                state.status = SessionStatus::Paused;
                self.deps.store.write_state(&state).await?;
                self.publish_exec_event(
                    &execution_id,
                    EventPayload::ExecutionPaused {
                        reason: "cancelled".into(),
                    },
                );
                info!(execution_id = %execution_id, "execution paused by cancellation");
                drop(permit);
                Ok(ExecutionReport {
                    execution_id,
                    session_id,
                    status: SessionStatus::Paused,
                    memory: state.memory,
                })
            }
            Err(e) => {
                state.status = SessionStatus::Failed;
                if let Err(write_err) = self.deps.store.write_state(&state).await {
                    warn!(error = %write_err, "state write after failure also failed");
                }
                self.publish_exec_event(
                    &execution_id,
                    EventPayload::ExecutionFailed {
                        error: e.to_string(),
                    },
                );
                warn!(execution_id = %execution_id, error = %e, "execution failed");
                drop(permit);
                Err(e)
            }
        }
    }

    /// Where an interrupted execution should pick back up.
    async fn resume_frontier(&self, session_id: &SessionId) -> Option<Vec<String>> {
        let path = self.deps.store.session_root(session_id).join("execution.json");
        let bytes = tokio::fs::read(&path).await.ok()?;
        let record: ExecutionRecord = serde_json::from_slice(&bytes).ok()?;
        if record.status == "running" && !record.frontier.is_empty() {
            Some(record.frontier)
        } else {
            None
        }
    }

    /// Deliver client input to a paused node. Returns false when that node
    /// is not waiting.
    pub fn inject_input(&self, node_id: &str, content: impl Into<String>) -> bool {
        self.input_router.deliver(node_id, content.into())
    }

    pub fn has_waiter(&self, node_id: &str) -> bool {
        self.input_router.has_waiter(node_id)
    }

    pub fn waiting_nodes(&self) -> Vec<String> {
        self.input_router.waiting_nodes()
    }

    /// Cancel one in-flight execution. Returns false for unknown ids.
    pub fn cancel(&self, execution_id: &str) -> bool {
        let tokens = self.exec_tokens.lock().unwrap();
        match tokens.get(execution_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel everything in flight on this stream.
    pub fn cancel_all(&self) {
        for token in self.exec_tokens.lock().unwrap().values() {
            token.cancel();
        }
    }

    pub async fn checkpoint(&self, name: &str) -> Result<()> {
        let session_id = self
            .last_session()
            .ok_or_else(|| TrellisError::SessionNotFound("no session on stream".into()))?;
        CheckpointStore::new(self.deps.store.session_root(&session_id))
            .save(name)
            .await
    }

    pub async fn restore_checkpoint(&self, name: &str) -> Result<()> {
        let session_id = self
            .last_session()
            .ok_or_else(|| TrellisError::SessionNotFound("no session on stream".into()))?;
        CheckpointStore::new(self.deps.store.session_root(&session_id))
            .restore(name)
            .await
    }

    fn publish_exec_event(&self, execution_id: &ExecutionId, payload: EventPayload) {
        self.deps.bus.publish(
            AgentEvent::new(payload)
                .with_graph(&self.graph.id)
                .with_stream(&self.stream_id)
                .with_execution(execution_id.as_str()),
        );
    }
}
