use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use trellis_core::config::RuntimeConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::event::{EventBus, EventFilter, EventReceiver, SubscriptionId};
use trellis_core::goal::Goal;
use trellis_core::spec::{EntryPointSpec, GraphSpec};
use trellis_core::traits::{CredentialProvider, LlmClient, Tool};
use trellis_core::types::SessionId;
use trellis_store::SessionStore;
use trellis_tools::ToolRegistry;

use crate::creds::SerializedCredentials;
use crate::executor::ExecutorDeps;
use crate::judge::{ImplicitJudge, NodeJudge};
use crate::stream::{ExecutionReport, ExecutionStream, PrimaryBridge};
use crate::triggers::spawn_trigger;
use crate::webhook::WebhookListener;

/// A graph plus everything needed to register it.
pub struct GraphDefinition {
    pub graph: GraphSpec,
    pub goal: Option<Goal>,
    pub entry_points: Vec<EntryPointSpec>,
}

/// How a chat message was routed.
#[derive(Debug)]
pub enum ChatOutcome {
    /// Delivered to a node that was waiting for client input.
    Injected { node_id: String },
    /// Started a new execution.
    Triggered { report: ExecutionReport },
}

struct Registration {
    graph: Arc<GraphSpec>,
    streams: HashMap<String, Arc<ExecutionStream>>,
    trigger_handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    store: SessionStore,
}

struct RuntimeInner {
    config: RuntimeConfig,
    llm: Arc<dyn LlmClient>,
    judge: Arc<dyn NodeJudge>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    tools: RwLock<Arc<ToolRegistry>>,
    bus: EventBus,
    store: SessionStore,
    primary_graph_id: String,
    primary_session: SessionId,
    graphs: tokio::sync::RwLock<HashMap<String, Registration>>,
    active_graph: RwLock<String>,
    user_last_input: Mutex<Option<Instant>>,
    cancel: CancellationToken,
    webhook_handle: Mutex<Option<JoinHandle<()>>>,
}

/// The multi-graph registry: one primary graph fixed at construction,
/// secondary graphs joined and removed while running, all sharing one
/// event bus and one session store.
#[derive(Clone)]
pub struct AgentRuntime {
    inner: Arc<RuntimeInner>,
}

impl AgentRuntime {
    /// Build a runtime around its primary graph. Creates the primary
    /// session and wires the primary graph's streams and triggers.
    pub async fn new(
        config: RuntimeConfig,
        llm: Arc<dyn LlmClient>,
        tools: ToolRegistry,
        credentials: Option<Arc<dyn CredentialProvider>>,
        primary: GraphDefinition,
    ) -> Result<Self> {
        Self::with_judge(config, llm, tools, credentials, Arc::new(ImplicitJudge), primary).await
    }

    pub async fn with_judge(
        config: RuntimeConfig,
        llm: Arc<dyn LlmClient>,
        tools: ToolRegistry,
        credentials: Option<Arc<dyn CredentialProvider>>,
        judge: Arc<dyn NodeJudge>,
        primary: GraphDefinition,
    ) -> Result<Self> {
        primary.graph.validate()?;

        let bus = EventBus::new(config.bus_buffer);
        let store = SessionStore::new(&config.storage_root);
        let primary_session = SessionId::new();
        store
            .create_session(&primary_session, &primary.graph.id)
            .await?;

        let credentials: Option<Arc<dyn CredentialProvider>> = credentials
            .map(|c| Arc::new(SerializedCredentials::new(c)) as Arc<dyn CredentialProvider>);

        let cancel = CancellationToken::new();
        let runtime = Self {
            inner: Arc::new(RuntimeInner {
                primary_graph_id: primary.graph.id.clone(),
                active_graph: RwLock::new(primary.graph.id.clone()),
                llm,
                judge,
                credentials,
                tools: RwLock::new(Arc::new(tools)),
                bus,
                store,
                primary_session,
                graphs: tokio::sync::RwLock::new(HashMap::new()),
                user_last_input: Mutex::new(None),
                webhook_handle: Mutex::new(None),
                cancel,
                config,
            }),
        };

        runtime.register_graph(primary, None).await?;
        runtime.start_webhook_listener();
        Ok(runtime)
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn store(&self) -> &SessionStore {
        &self.inner.store
    }

    pub fn primary_graph_id(&self) -> &str {
        &self.inner.primary_graph_id
    }

    pub fn primary_session(&self) -> &SessionId {
        &self.inner.primary_session
    }

    /// Register a secondary graph while the runtime is live. Its streams
    /// and triggers start immediately; with `storage_subpath` set, its
    /// sessions live under the primary session's `graphs/{subpath}/`.
    pub async fn add_graph(
        &self,
        definition: GraphDefinition,
        storage_subpath: Option<String>,
    ) -> Result<()> {
        definition.graph.validate()?;
        self.register_graph(definition, storage_subpath).await
    }

    async fn register_graph(
        &self,
        definition: GraphDefinition,
        storage_subpath: Option<String>,
    ) -> Result<()> {
        let graph_id = definition.graph.id.clone();
        let mut graphs = self.inner.graphs.write().await;
        if graphs.contains_key(&graph_id) {
            return Err(TrellisError::GraphValidation(format!(
                "graph '{graph_id}' already registered"
            )));
        }

        let store = match &storage_subpath {
            Some(subpath) => self
                .inner
                .store
                .child_store_for(&self.inner.primary_session, subpath),
            None => self.inner.store.clone(),
        };

        let graph = Arc::new(definition.graph);
        let goal = definition.goal.map(Arc::new);
        let is_secondary = graph_id != self.inner.primary_graph_id;
        let reg_cancel = self.inner.cancel.child_token();

        let deps = Arc::new(ExecutorDeps {
            llm: self.inner.llm.clone(),
            tools: self.inner.tools.read().unwrap().clone(),
            judge: self.inner.judge.clone(),
            bus: self.inner.bus.clone(),
            store: store.clone(),
            credentials: self.inner.credentials.clone(),
            loop_config: self.inner.config.loop_config.clone(),
        });

        for entry_point in &definition.entry_points {
            if graph.node(&entry_point.entry_node).is_none() {
                return Err(TrellisError::GraphValidation(format!(
                    "entry point '{}': unknown entry node '{}'",
                    entry_point.id, entry_point.entry_node
                )));
            }
        }

        let mut streams = HashMap::new();
        let mut trigger_handles = Vec::new();
        for entry_point in definition.entry_points {
            let mut stream = ExecutionStream::new(
                graph.clone(),
                goal.clone(),
                entry_point.clone(),
                deps.clone(),
                reg_cancel.child_token(),
            );
            if is_secondary {
                let entry_node = graph
                    .node(&entry_point.entry_node)
                    .expect("entry node checked above");
                stream = stream.with_bridge(PrimaryBridge {
                    store: self.inner.store.clone(),
                    session_id: self.inner.primary_session.clone(),
                    input_keys: entry_node.input_keys.clone(),
                });
            }
            let stream = Arc::new(stream);

            if let Some(handle) = spawn_trigger(
                stream.clone(),
                self.inner.bus.clone(),
                reg_cancel.child_token(),
            ) {
                trigger_handles.push(handle);
            }
            streams.insert(entry_point.id.clone(), stream);
        }

        info!(graph_id = %graph_id, streams = streams.len(), "graph registered");
        graphs.insert(
            graph_id,
            Registration {
                graph,
                streams,
                trigger_handles,
                cancel: reg_cancel,
                store,
            },
        );
        Ok(())
    }

    /// Stop and unregister a secondary graph. The primary cannot be
    /// removed. Session data on disk is left untouched.
    pub async fn remove_graph(&self, graph_id: &str) -> Result<()> {
        if graph_id == self.inner.primary_graph_id {
            return Err(TrellisError::GraphValidation(
                "cannot remove the primary graph".into(),
            ));
        }
        let mut graphs = self.inner.graphs.write().await;
        let registration = graphs
            .remove(graph_id)
            .ok_or_else(|| TrellisError::GraphNotFound(graph_id.to_string()))?;

        registration.cancel.cancel();
        for stream in registration.streams.values() {
            stream.cancel_all();
        }
        for handle in registration.trigger_handles {
            handle.abort();
        }
        info!(graph_id, "graph removed");
        Ok(())
    }

    pub async fn graph_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.graphs.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Trigger an entry point. `graph_id` defaults to the active graph.
    pub async fn trigger(
        &self,
        graph_id: Option<&str>,
        entry_point_id: &str,
        input: serde_json::Map<String, Value>,
        session_id: Option<SessionId>,
    ) -> Result<ExecutionReport> {
        let stream = self.find_stream(graph_id, entry_point_id).await?;
        stream.execute(input, session_id).await
    }

    async fn find_stream(
        &self,
        graph_id: Option<&str>,
        entry_point_id: &str,
    ) -> Result<Arc<ExecutionStream>> {
        let graph_id = match graph_id {
            Some(id) => id.to_string(),
            None => self.active_graph_id(),
        };
        let graphs = self.inner.graphs.read().await;
        let registration = graphs
            .get(&graph_id)
            .ok_or_else(|| TrellisError::GraphNotFound(graph_id.clone()))?;
        registration
            .streams
            .get(entry_point_id)
            .cloned()
            .ok_or_else(|| TrellisError::EntryPointNotFound(entry_point_id.to_string()))
    }

    /// Deliver client input to a paused node. The active graph's streams
    /// are searched first, then every other graph's.
    pub async fn inject_input(
        &self,
        node_id: &str,
        content: &str,
        graph_id: Option<&str>,
    ) -> bool {
        self.note_user_input();
        let preferred = match graph_id {
            Some(id) => id.to_string(),
            None => self.active_graph_id(),
        };
        let graphs = self.inner.graphs.read().await;

        if let Some(registration) = graphs.get(&preferred) {
            for stream in registration.streams.values() {
                if stream.inject_input(node_id, content) {
                    return true;
                }
            }
        }
        for (id, registration) in graphs.iter() {
            if *id == preferred {
                continue;
            }
            for stream in registration.streams.values() {
                if stream.inject_input(node_id, content) {
                    return true;
                }
            }
        }
        warn!(node_id, "inject_input found no waiting node");
        false
    }

    /// Cancel one execution anywhere in the runtime.
    pub async fn stop(&self, execution_id: &str) -> bool {
        let graphs = self.inner.graphs.read().await;
        for registration in graphs.values() {
            for stream in registration.streams.values() {
                if stream.cancel(execution_id) {
                    return true;
                }
            }
        }
        false
    }

    /// Re-open the most recent incomplete execution of a session.
    pub async fn resume(&self, session_id: &SessionId) -> Result<ExecutionReport> {
        let graphs = self.inner.graphs.read().await;
        for registration in graphs.values() {
            if !registration.store.exists(session_id).await {
                continue;
            }
            let state = registration.store.read_state(session_id).await?;
            if state.graph_id != registration.graph.id {
                continue;
            }
            // Prefer the stream whose persistent session this is; fall
            // back to any stream of the graph.
            let stream = registration
                .streams
                .values()
                .find(|s| {
                    session_id.0 == format!("ep-{}-{}", registration.graph.id, s.entry_point().id)
                })
                .or_else(|| registration.streams.values().next())
                .cloned()
                .ok_or_else(|| TrellisError::SessionNotFound(session_id.0.clone()))?;
            drop(graphs);
            return stream
                .execute(serde_json::Map::new(), Some(session_id.clone()))
                .await;
        }
        Err(TrellisError::SessionNotFound(session_id.0.clone()))
    }

    /// Chat autoroute: deliver the message to a node waiting for client
    /// input if one exists, otherwise start a fresh execution of the
    /// active graph's first manual entry point against the session.
    pub async fn chat(&self, session_id: &SessionId, message: &str) -> Result<ChatOutcome> {
        self.note_user_input();
        let active = self.active_graph_id();
        let graphs = self.inner.graphs.read().await;

        if let Some(registration) = graphs.get(&active) {
            for stream in registration.streams.values() {
                if let Some(node_id) = stream.waiting_nodes().into_iter().next() {
                    stream.inject_input(&node_id, message);
                    return Ok(ChatOutcome::Injected { node_id });
                }
            }
            let stream = registration
                .streams
                .values()
                .find(|s| matches!(s.entry_point().trigger, trellis_core::spec::TriggerSpec::Manual))
                .or_else(|| registration.streams.values().next())
                .cloned()
                .ok_or_else(|| TrellisError::EntryPointNotFound(active.clone()))?;
            drop(graphs);

            let mut input = serde_json::Map::new();
            input.insert("message".into(), Value::String(message.to_string()));
            let resume = if self.inner.store.exists(session_id).await {
                Some(session_id.clone())
            } else {
                None
            };
            let report = stream.execute(input, resume).await?;
            return Ok(ChatOutcome::Triggered { report });
        }
        Err(TrellisError::GraphNotFound(active))
    }

    /// Snapshot a session's durable state under a name.
    pub async fn checkpoint(&self, session_id: &SessionId, name: &str) -> Result<()> {
        trellis_store::CheckpointStore::new(self.inner.store.session_root(session_id))
            .save(name)
            .await
    }

    /// Restore a named snapshot of a session.
    pub async fn restore_checkpoint(&self, session_id: &SessionId, name: &str) -> Result<()> {
        trellis_store::CheckpointStore::new(self.inner.store.session_root(session_id))
            .restore(name)
            .await
    }

    /// Subscribe to the shared bus.
    pub fn subscribe(&self, filter: EventFilter) -> (SubscriptionId, EventReceiver) {
        self.inner.bus.subscribe(filter)
    }

    /// Register additional tools. Existing executions keep the registry
    /// they started with; graphs registered afterwards see the additions.
    pub fn add_tools(&self, tools: Vec<Arc<dyn Tool>>) {
        let mut guard = self.inner.tools.write().unwrap();
        let mut next = (**guard).clone();
        for tool in tools {
            next.register_arc(tool);
        }
        *guard = Arc::new(next);
    }

    pub fn active_graph_id(&self) -> String {
        self.inner.active_graph.read().unwrap().clone()
    }

    /// UI focus only; non-active graphs keep running.
    pub fn set_active_graph(&self, graph_id: &str) {
        *self.inner.active_graph.write().unwrap() = graph_id.to_string();
    }

    fn note_user_input(&self) {
        *self.inner.user_last_input.lock().unwrap() = Some(Instant::now());
    }

    /// Seconds since the user last injected input; infinite if never.
    pub fn user_idle_seconds(&self) -> f64 {
        match *self.inner.user_last_input.lock().unwrap() {
            Some(at) => at.elapsed().as_secs_f64(),
            None => f64::INFINITY,
        }
    }

    fn start_webhook_listener(&self) {
        let Some(webhook_config) = self.inner.config.webhook.clone() else {
            return;
        };
        if webhook_config.routes.is_empty() {
            return;
        }
        let listener = WebhookListener::new(webhook_config, self.inner.bus.clone());
        let cancel = self.inner.cancel.child_token();
        let handle = tokio::spawn(async move {
            if let Err(e) = listener.run(cancel).await {
                warn!(error = %e, "webhook listener exited with error");
            }
        });
        *self.inner.webhook_handle.lock().unwrap() = Some(handle);
    }

    /// Stop everything: triggers, streams, webhook listener.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let graphs = self.inner.graphs.read().await;
        for registration in graphs.values() {
            for stream in registration.streams.values() {
                stream.cancel_all();
            }
        }
        if let Some(handle) = self.inner.webhook_handle.lock().unwrap().take() {
            handle.abort();
        }
        info!("runtime shut down");
    }
}
