use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrellisError};
use crate::event::EventType;
use crate::expr;

/// How a node's session state interacts with concurrent streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    Isolated,
    Shared,
    Synchronized,
}

/// Whether each node visit gets its own conversation thread or appends to
/// the session's continuing thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationMode {
    #[default]
    Isolated,
    Continuous,
}

/// Node kind. Only event-loop nodes are supported; anything else is
/// rejected when the graph is deserialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    #[default]
    EventLoop,
}

/// A node in an agent graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub node_type: NodeType,
    #[serde(default)]
    pub input_keys: Vec<String>,
    #[serde(default)]
    pub output_keys: Vec<String>,
    #[serde(default)]
    pub nullable_output_keys: Vec<String>,
    /// Tool names available to this node.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub client_facing: bool,
    #[serde(default)]
    pub isolation_level: IsolationLevel,
    #[serde(default)]
    pub conversation_mode: ConversationMode,
    /// 0 = unbounded.
    #[serde(default)]
    pub max_node_visits: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Free text handed to the judge.
    #[serde(default)]
    pub success_criteria: String,
}

fn default_max_retries() -> u32 {
    3
}

impl NodeSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            system_prompt: String::new(),
            node_type: NodeType::EventLoop,
            input_keys: vec![],
            output_keys: vec![],
            nullable_output_keys: vec![],
            tools: vec![],
            client_facing: false,
            isolation_level: IsolationLevel::default(),
            conversation_mode: ConversationMode::default(),
            max_node_visits: 0,
            max_retries: default_max_retries(),
            success_criteria: String::new(),
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_inputs(mut self, keys: Vec<String>) -> Self {
        self.input_keys = keys;
        self
    }

    pub fn with_outputs(mut self, keys: Vec<String>) -> Self {
        self.output_keys = keys;
        self
    }

    pub fn with_nullable_outputs(mut self, keys: Vec<String>) -> Self {
        self.nullable_output_keys = keys;
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn client_facing(mut self, yes: bool) -> Self {
        self.client_facing = yes;
        self
    }

    pub fn continuous(mut self) -> Self {
        self.conversation_mode = ConversationMode::Continuous;
        self
    }

    pub fn with_max_visits(mut self, max: u32) -> Self {
        self.max_node_visits = max;
        self
    }

    pub fn with_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.success_criteria = criteria.into();
        self
    }

    /// Output keys that must be set before the node can be accepted.
    pub fn required_output_keys(&self) -> Vec<&str> {
        self.output_keys
            .iter()
            .filter(|k| !self.nullable_output_keys.contains(k))
            .map(|k| k.as_str())
            .collect()
    }
}

/// Condition gating an edge traversal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Traverse if the source node was accepted.
    #[default]
    OnSuccess,
    /// Traverse if the source node escalated or failed.
    OnFailure,
    /// Always traverse.
    Always,
    /// Traverse if the expression evaluates true over shared memory.
    Conditional { expr: String },
}

/// An edge connecting two nodes. Negative priority marks a feedback loop;
/// forward edges are followed first, highest priority wins within each
/// partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub condition: EdgeCondition,
    #[serde(default)]
    pub priority: i32,
}

impl EdgeSpec {
    pub fn on_success(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("{source}->{target}"),
            source,
            target,
            condition: EdgeCondition::OnSuccess,
            priority: 0,
        }
    }

    pub fn on_failure(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            condition: EdgeCondition::OnFailure,
            ..Self::on_success(source, target)
        }
    }

    pub fn always(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            condition: EdgeCondition::Always,
            ..Self::on_success(source, target)
        }
    }

    pub fn conditional(
        source: impl Into<String>,
        target: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        Self {
            condition: EdgeCondition::Conditional { expr: expr.into() },
            ..Self::on_success(source, target)
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn is_feedback(&self) -> bool {
        self.priority < 0
    }
}

/// A directed graph of nodes declaring one agent's control flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSpec {
    pub id: String,
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
    pub entry_node: String,
    /// Empty = forever-alive graph.
    #[serde(default)]
    pub terminal_nodes: Vec<String>,
    #[serde(default)]
    pub pause_nodes: Vec<String>,
}

impl GraphSpec {
    pub fn new(id: impl Into<String>, entry_node: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nodes: vec![],
            edges: vec![],
            entry_node: entry_node.into(),
            terminal_nodes: vec![],
            pause_nodes: vec![],
        }
    }

    pub fn with_nodes(mut self, nodes: Vec<NodeSpec>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_edges(mut self, edges: Vec<EdgeSpec>) -> Self {
        self.edges = edges;
        self
    }

    pub fn with_terminals(mut self, terminals: Vec<String>) -> Self {
        self.terminal_nodes = terminals;
        self
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn outgoing(&self, node_id: &str) -> Vec<&EdgeSpec> {
        self.edges.iter().filter(|e| e.source == node_id).collect()
    }

    pub fn is_terminal(&self, node_id: &str) -> bool {
        self.terminal_nodes.iter().any(|t| t == node_id)
    }

    pub fn is_forever_alive(&self) -> bool {
        self.terminal_nodes.is_empty()
    }

    /// Validate the graph at load time. A failure here is fatal: the graph
    /// is never registered.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(TrellisError::GraphValidation(format!(
                    "duplicate node id '{}' in graph '{}'",
                    node.id, self.id
                )));
            }
            for key in &node.nullable_output_keys {
                if !node.output_keys.contains(key) {
                    return Err(TrellisError::GraphValidation(format!(
                        "node '{}': nullable output key '{}' is not an output key",
                        node.id, key
                    )));
                }
            }
        }

        if self.node(&self.entry_node).is_none() {
            return Err(TrellisError::GraphValidation(format!(
                "entry node '{}' not found in graph '{}'",
                self.entry_node, self.id
            )));
        }
        for terminal in &self.terminal_nodes {
            if self.node(terminal).is_none() {
                return Err(TrellisError::GraphValidation(format!(
                    "terminal node '{}' not found in graph '{}'",
                    terminal, self.id
                )));
            }
        }

        for edge in &self.edges {
            if self.node(&edge.source).is_none() {
                return Err(TrellisError::GraphValidation(format!(
                    "edge '{}': unknown source node '{}'",
                    edge.id, edge.source
                )));
            }
            if self.node(&edge.target).is_none() {
                return Err(TrellisError::GraphValidation(format!(
                    "edge '{}': unknown target node '{}'",
                    edge.id, edge.target
                )));
            }
            if let EdgeCondition::Conditional { expr } = &edge.condition {
                expr::parse(expr).map_err(|e| {
                    TrellisError::GraphValidation(format!("edge '{}': {e}", edge.id))
                })?;
            }
        }

        if self.is_forever_alive() {
            for node in &self.nodes {
                if self.outgoing(&node.id).is_empty() {
                    return Err(TrellisError::GraphValidation(format!(
                        "forever-alive graph '{}': node '{}' has no outgoing edge",
                        self.id, node.id
                    )));
                }
            }
        }

        self.validate_fanout_disjointness()?;
        Ok(())
    }

    /// Forward edges that can fire together must lead to nodes with
    /// pairwise-disjoint output keys, or a fan-out would race on shared
    /// memory writes.
    fn validate_fanout_disjointness(&self) -> Result<()> {
        let nodes: HashMap<&str, &NodeSpec> =
            self.nodes.iter().map(|n| (n.id.as_str(), n)).collect();

        for node in &self.nodes {
            let forward: Vec<&EdgeSpec> = self
                .outgoing(&node.id)
                .into_iter()
                .filter(|e| !e.is_feedback())
                .collect();

            // ON_SUCCESS and ON_FAILURE cannot co-fire; check each group.
            for on_failure in [false, true] {
                let co_firing: Vec<&EdgeSpec> = forward
                    .iter()
                    .filter(|e| match &e.condition {
                        EdgeCondition::OnSuccess => !on_failure,
                        EdgeCondition::OnFailure => on_failure,
                        EdgeCondition::Always | EdgeCondition::Conditional { .. } => true,
                    })
                    .copied()
                    .collect();

                for (i, a) in co_firing.iter().enumerate() {
                    for b in &co_firing[i + 1..] {
                        if a.target == b.target {
                            continue;
                        }
                        let (Some(ta), Some(tb)) =
                            (nodes.get(a.target.as_str()), nodes.get(b.target.as_str()))
                        else {
                            continue;
                        };
                        if let Some(shared) = ta
                            .output_keys
                            .iter()
                            .find(|k| tb.output_keys.contains(k))
                        {
                            return Err(TrellisError::GraphValidation(format!(
                                "fan-out from '{}': targets '{}' and '{}' share output key '{}'",
                                node.id, a.target, b.target, shared
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// What fires an entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "trigger_type", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Direct API call.
    Manual,
    /// Cron schedule or fixed interval.
    Timer {
        #[serde(default)]
        cron: Option<String>,
        #[serde(default)]
        interval_minutes: Option<u64>,
    },
    /// Fired by matching bus events.
    Event {
        event_types: Vec<EventType>,
        #[serde(default)]
        stream_id: Option<String>,
        #[serde(default)]
        node_id: Option<String>,
        #[serde(default)]
        exclude_own_graph: bool,
    },
    /// Fired by an HTTP webhook received on the embedded listener.
    Webhook { source_id: String },
}

/// An entry point binds a trigger to a node of the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryPointSpec {
    pub id: String,
    pub entry_node: String,
    pub trigger: TriggerSpec,
    #[serde(default)]
    pub isolation_level: IsolationLevel,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
}

fn default_max_concurrent() -> u32 {
    1
}

impl EntryPointSpec {
    pub fn manual(id: impl Into<String>, entry_node: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entry_node: entry_node.into(),
            trigger: TriggerSpec::Manual,
            isolation_level: IsolationLevel::Shared,
            max_concurrent: 1,
        }
    }

    pub fn timer_interval(
        id: impl Into<String>,
        entry_node: impl Into<String>,
        interval_minutes: u64,
    ) -> Self {
        Self {
            id: id.into(),
            entry_node: entry_node.into(),
            trigger: TriggerSpec::Timer {
                cron: None,
                interval_minutes: Some(interval_minutes),
            },
            isolation_level: IsolationLevel::Isolated,
            max_concurrent: 1,
        }
    }

    pub fn timer_cron(
        id: impl Into<String>,
        entry_node: impl Into<String>,
        cron: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            entry_node: entry_node.into(),
            trigger: TriggerSpec::Timer {
                cron: Some(cron.into()),
                interval_minutes: None,
            },
            isolation_level: IsolationLevel::Isolated,
            max_concurrent: 1,
        }
    }

    pub fn on_events(
        id: impl Into<String>,
        entry_node: impl Into<String>,
        event_types: Vec<EventType>,
        exclude_own_graph: bool,
    ) -> Self {
        Self {
            id: id.into(),
            entry_node: entry_node.into(),
            trigger: TriggerSpec::Event {
                event_types,
                stream_id: None,
                node_id: None,
                exclude_own_graph,
            },
            isolation_level: IsolationLevel::Isolated,
            max_concurrent: 1,
        }
    }

    pub fn webhook(
        id: impl Into<String>,
        entry_node: impl Into<String>,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            entry_node: entry_node.into(),
            trigger: TriggerSpec::Webhook {
                source_id: source_id.into(),
            },
            isolation_level: IsolationLevel::Isolated,
            max_concurrent: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node_graph() -> GraphSpec {
        GraphSpec::new("g", "a")
            .with_nodes(vec![NodeSpec::new("a"), NodeSpec::new("b")])
            .with_edges(vec![EdgeSpec::on_success("a", "b")])
            .with_terminals(vec!["b".into()])
    }

    #[test]
    fn valid_graph_passes() {
        two_node_graph().validate().unwrap();
    }

    #[test]
    fn unknown_edge_target_rejected() {
        let mut graph = two_node_graph();
        graph.edges.push(EdgeSpec::on_success("b", "ghost"));
        assert!(matches!(
            graph.validate(),
            Err(TrellisError::GraphValidation(_))
        ));
    }

    #[test]
    fn nullable_must_be_subset() {
        let mut graph = two_node_graph();
        graph.nodes[0].output_keys = vec!["a".into()];
        graph.nodes[0].nullable_output_keys = vec!["b".into()];
        assert!(graph.validate().is_err());
    }

    #[test]
    fn forever_alive_requires_outgoing_edges() {
        let graph = GraphSpec::new("g", "a")
            .with_nodes(vec![NodeSpec::new("a"), NodeSpec::new("b")])
            .with_edges(vec![EdgeSpec::on_success("a", "b")]);
        // terminal_nodes empty, "b" has no outgoing edge
        assert!(graph.validate().is_err());
    }

    #[test]
    fn fanout_with_overlapping_outputs_rejected() {
        let graph = GraphSpec::new("g", "start")
            .with_nodes(vec![
                NodeSpec::new("start"),
                NodeSpec::new("a").with_outputs(vec!["x".into(), "shared".into()]),
                NodeSpec::new("b").with_outputs(vec!["y".into(), "shared".into()]),
            ])
            .with_edges(vec![
                EdgeSpec::on_success("start", "a"),
                EdgeSpec::on_success("start", "b"),
            ])
            .with_terminals(vec!["a".into(), "b".into()]);
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("shared"));
    }

    #[test]
    fn fanout_with_disjoint_outputs_passes() {
        let graph = GraphSpec::new("g", "start")
            .with_nodes(vec![
                NodeSpec::new("start"),
                NodeSpec::new("a").with_outputs(vec!["x".into()]),
                NodeSpec::new("b").with_outputs(vec!["y".into()]),
            ])
            .with_edges(vec![
                EdgeSpec::on_success("start", "a"),
                EdgeSpec::on_success("start", "b"),
            ])
            .with_terminals(vec!["a".into(), "b".into()]);
        graph.validate().unwrap();
    }

    #[test]
    fn success_and_failure_branches_may_share_outputs() {
        let graph = GraphSpec::new("g", "start")
            .with_nodes(vec![
                NodeSpec::new("start"),
                NodeSpec::new("ok").with_outputs(vec!["report".into()]),
                NodeSpec::new("recover").with_outputs(vec!["report".into()]),
            ])
            .with_edges(vec![
                EdgeSpec::on_success("start", "ok"),
                EdgeSpec::on_failure("start", "recover"),
            ])
            .with_terminals(vec!["ok".into(), "recover".into()]);
        graph.validate().unwrap();
    }

    #[test]
    fn bad_conditional_expr_is_fatal_at_load() {
        let mut graph = two_node_graph();
        graph.edges[0] = EdgeSpec::conditional("a", "b", "== == ==");
        assert!(graph.validate().is_err());
    }

    #[test]
    fn legacy_node_type_rejected_at_parse() {
        let json = r#"{"id": "n", "node_type": "callback"}"#;
        assert!(serde_json::from_str::<NodeSpec>(json).is_err());
    }

    #[test]
    fn required_output_keys_excludes_nullable() {
        let node = NodeSpec::new("n")
            .with_outputs(vec!["a".into(), "b".into()])
            .with_nullable_outputs(vec!["b".into()]);
        assert_eq!(node.required_output_keys(), vec!["a"]);
    }
}
