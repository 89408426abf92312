use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::ticket::EscalationTicket;

/// Default per-subscription buffer capacity.
const DEFAULT_BUFFER: usize = 1024;

/// Discriminant for every event the runtime can publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionPaused,
    NodeLoopStarted,
    NodeLoopCompleted,
    EdgeTraversed,
    LlmTextDelta,
    ToolCallStarted,
    ToolCallCompleted,
    ClientOutputDelta,
    ClientInputRequested,
    ClientInputReceived,
    GoalProgress,
    WebhookReceived,
    WorkerEscalationTicket,
    QueenInterventionRequested,
    SubscriberLagged,
}

/// Type-specific payload carried inside an [`AgentEvent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPayload {
    ExecutionStarted {
        input: Value,
    },
    ExecutionCompleted {
        outputs: Value,
    },
    ExecutionFailed {
        error: String,
    },
    ExecutionPaused {
        reason: String,
    },
    NodeLoopStarted {
        visit: u32,
        iteration: u32,
    },
    NodeLoopCompleted {
        verdict: String,
        rationale: String,
    },
    EdgeTraversed {
        source: String,
        target: String,
    },
    LlmTextDelta {
        text: String,
    },
    ToolCallStarted {
        call_id: String,
        name: String,
        args: Value,
    },
    ToolCallCompleted {
        call_id: String,
        name: String,
        result: Value,
    },
    ClientOutputDelta {
        text: String,
    },
    ClientInputRequested {
        node_id: String,
        prompt: String,
    },
    ClientInputReceived {
        node_id: String,
        content: String,
    },
    GoalProgress {
        goal_id: String,
        progress: f64,
        detail: String,
    },
    WebhookReceived {
        source_id: String,
        headers: Value,
        body: Value,
    },
    WorkerEscalationTicket {
        ticket: EscalationTicket,
    },
    QueenInterventionRequested {
        ticket_id: String,
        analysis: String,
        severity: String,
        queen_graph_id: String,
        queen_stream_id: String,
    },
    SubscriberLagged {
        subscription_id: u64,
        dropped: u64,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::ExecutionStarted { .. } => EventType::ExecutionStarted,
            Self::ExecutionCompleted { .. } => EventType::ExecutionCompleted,
            Self::ExecutionFailed { .. } => EventType::ExecutionFailed,
            Self::ExecutionPaused { .. } => EventType::ExecutionPaused,
            Self::NodeLoopStarted { .. } => EventType::NodeLoopStarted,
            Self::NodeLoopCompleted { .. } => EventType::NodeLoopCompleted,
            Self::EdgeTraversed { .. } => EventType::EdgeTraversed,
            Self::LlmTextDelta { .. } => EventType::LlmTextDelta,
            Self::ToolCallStarted { .. } => EventType::ToolCallStarted,
            Self::ToolCallCompleted { .. } => EventType::ToolCallCompleted,
            Self::ClientOutputDelta { .. } => EventType::ClientOutputDelta,
            Self::ClientInputRequested { .. } => EventType::ClientInputRequested,
            Self::ClientInputReceived { .. } => EventType::ClientInputReceived,
            Self::GoalProgress { .. } => EventType::GoalProgress,
            Self::WebhookReceived { .. } => EventType::WebhookReceived,
            Self::WorkerEscalationTicket { .. } => EventType::WorkerEscalationTicket,
            Self::QueenInterventionRequested { .. } => EventType::QueenInterventionRequested,
            Self::SubscriberLagged { .. } => EventType::SubscriberLagged,
        }
    }
}

/// An event published on the shared bus. The envelope identifies where in
/// the runtime the event originated; the payload carries type-specific data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    pub payload: EventPayload,
}

impl AgentEvent {
    /// Build an event with an empty envelope. `id` and `timestamp` are
    /// stamped by [`EventBus::publish`].
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: String::new(),
            event_type: payload.event_type(),
            timestamp: Utc::now(),
            graph_id: None,
            stream_id: None,
            node_id: None,
            execution_id: None,
            payload,
        }
    }

    pub fn with_graph(mut self, graph_id: impl Into<String>) -> Self {
        self.graph_id = Some(graph_id.into());
        self
    }

    pub fn with_stream(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_execution(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }
}

/// Structural filter for a subscription. `None` fields match everything.
/// `exclude_graph` is set by a secondary graph's subscriber so its own
/// events do not feed back into it.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_type: Option<EventType>,
    pub event_types: Vec<EventType>,
    pub graph_id: Option<String>,
    pub stream_id: Option<String>,
    pub node_id: Option<String>,
    pub exclude_graph: Option<String>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_type(event_type: EventType) -> Self {
        Self {
            event_type: Some(event_type),
            ..Self::default()
        }
    }

    pub fn matches(&self, event: &AgentEvent) -> bool {
        if let Some(t) = self.event_type {
            if event.event_type != t {
                return false;
            }
        }
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if let Some(ref g) = self.graph_id {
            if event.graph_id.as_deref() != Some(g.as_str()) {
                return false;
            }
        }
        if let Some(ref s) = self.stream_id {
            if event.stream_id.as_deref() != Some(s.as_str()) {
                return false;
            }
        }
        if let Some(ref n) = self.node_id {
            if event.node_id.as_deref() != Some(n.as_str()) {
                return false;
            }
        }
        if let Some(ref x) = self.exclude_graph {
            if event.graph_id.as_deref() == Some(x.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Handle to a subscription, used for [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

struct SubQueue {
    buf: Mutex<VecDeque<AgentEvent>>,
    notify: Notify,
    capacity: usize,
    lagged: AtomicBool,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl SubQueue {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity,
            lagged: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Push an event, dropping the oldest on overflow. Returns the dropped
    /// count when this push started a new overflow burst.
    fn push(&self, event: AgentEvent) -> Option<u64> {
        let mut buf = self.buf.lock().unwrap();
        let mut burst = None;
        if buf.len() >= self.capacity {
            buf.pop_front();
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if !self.lagged.swap(true, Ordering::Relaxed) {
                burst = Some(dropped);
            }
        }
        buf.push_back(event);
        drop(buf);
        self.notify.notify_one();
        burst
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Receiving half of a subscription. Dropping the receiver closes the
/// subscription; the bus prunes it on the next publish.
pub struct EventReceiver {
    queue: Arc<SubQueue>,
}

impl EventReceiver {
    /// Receive the next event, waiting if the buffer is empty. Returns
    /// `None` once the subscription has been removed and drained.
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        loop {
            {
                let mut buf = self.queue.buf.lock().unwrap();
                if let Some(event) = buf.pop_front() {
                    if buf.is_empty() {
                        // Drained: the next overflow is a new burst.
                        self.queue.lagged.store(false, Ordering::Relaxed);
                    }
                    return Some(event);
                }
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            self.queue.notified().await;
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<AgentEvent> {
        let mut buf = self.queue.buf.lock().unwrap();
        let event = buf.pop_front();
        if buf.is_empty() {
            self.queue.lagged.store(false, Ordering::Relaxed);
        }
        event
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        self.queue.closed.store(true, Ordering::Release);
    }
}

struct BusInner {
    subs: HashMap<u64, (EventFilter, Arc<SubQueue>)>,
    next_id: u64,
}

/// Typed publish/subscribe bus shared by every graph in the runtime.
///
/// Delivery is ordered per stream: events published in program order reach
/// each matching subscriber in that order. Slow subscribers never block a
/// publisher; their oldest buffered events are dropped and a
/// `SUBSCRIBER_LAGGED` event is raised once per overflow burst.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
    buffer: usize,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                subs: HashMap::new(),
                next_id: 0,
            })),
            buffer,
        }
    }

    /// Publish an event to all matching subscriptions. Never fails for the
    /// caller; stamps `id` and `timestamp`.
    pub fn publish(&self, mut event: AgentEvent) {
        event.id = Uuid::new_v4().to_string();
        event.timestamp = Utc::now();
        event.event_type = event.payload.event_type();

        let mut lag_events = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            inner
                .subs
                .retain(|_, (_, queue)| !queue.closed.load(Ordering::Acquire));
            for (sub_id, (filter, queue)) in inner.subs.iter() {
                if !filter.matches(&event) {
                    continue;
                }
                if let Some(dropped) = queue.push(event.clone()) {
                    debug!(subscription_id = *sub_id, dropped, "subscriber lagged");
                    lag_events.push(AgentEvent::new(EventPayload::SubscriberLagged {
                        subscription_id: *sub_id,
                        dropped,
                    }));
                }
            }
        }
        for lag in lag_events {
            self.publish(lag);
        }
    }

    /// Register a subscription and return its id plus the receiving channel.
    pub fn subscribe(&self, filter: EventFilter) -> (SubscriptionId, EventReceiver) {
        let queue = Arc::new(SubQueue::new(self.buffer));
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subs.insert(id, (filter, queue.clone()));
        (SubscriptionId(id), EventReceiver { queue })
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some((_, queue)) = inner.subs.remove(&id.0) {
            queue.closed.store(true, Ordering::Release);
            queue.notify.notify_one();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subs.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_event(stream: &str, text: &str) -> AgentEvent {
        AgentEvent::new(EventPayload::LlmTextDelta { text: text.into() }).with_stream(stream)
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = EventBus::default();
        let (_, mut rx) = bus.subscribe(EventFilter::all());

        bus.publish(text_event("s1", "a"));
        bus.publish(text_event("s1", "b"));
        bus.publish(text_event("s1", "c"));

        for expected in ["a", "b", "c"] {
            let event = rx.recv().await.unwrap();
            match event.payload {
                EventPayload::LlmTextDelta { text } => assert_eq!(text, expected),
                other => panic!("unexpected payload {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn filter_by_type_and_graph() {
        let bus = EventBus::default();
        let filter = EventFilter {
            event_type: Some(EventType::LlmTextDelta),
            graph_id: Some("g1".into()),
            ..EventFilter::default()
        };
        let (_, mut rx) = bus.subscribe(filter);

        bus.publish(text_event("s", "wrong-graph").with_graph("g2"));
        bus.publish(
            AgentEvent::new(EventPayload::ExecutionFailed {
                error: "x".into(),
            })
            .with_graph("g1"),
        );
        bus.publish(text_event("s", "match").with_graph("g1"));

        let event = rx.recv().await.unwrap();
        match event.payload {
            EventPayload::LlmTextDelta { text } => assert_eq!(text, "match"),
            other => panic!("unexpected payload {other:?}"),
        }
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn exclude_graph_prevents_feedback() {
        let bus = EventBus::default();
        let filter = EventFilter {
            exclude_graph: Some("queen".into()),
            ..EventFilter::default()
        };
        let (_, mut rx) = bus.subscribe(filter);

        bus.publish(text_event("s", "own").with_graph("queen"));
        bus.publish(text_event("s", "other").with_graph("worker"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.graph_id.as_deref(), Some("worker"));
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_raises_lag_once() {
        let bus = EventBus::new(4);
        let (_, mut slow) = bus.subscribe(EventFilter::all());
        let (_, mut lag_watch) = bus.subscribe(EventFilter::for_type(EventType::SubscriberLagged));

        for i in 0..10 {
            bus.publish(text_event("s1", &format!("e{i}")));
        }

        // The slow subscriber lost the oldest events but kept the newest.
        let first = slow.recv().await.unwrap();
        match first.payload {
            EventPayload::LlmTextDelta { ref text } => assert_ne!(text, "e0"),
            ref other => panic!("unexpected payload {other:?}"),
        }

        // Exactly one lag event for the burst.
        let lag = lag_watch.recv().await.unwrap();
        assert_eq!(lag.event_type, EventType::SubscriberLagged);
        assert!(lag_watch.try_recv().is_none());
    }

    #[tokio::test]
    async fn subscriber_registered_before_publish_receives() {
        let bus = EventBus::default();
        let (_, mut rx) = bus.subscribe(EventFilter::all());
        bus.publish(text_event("s", "hello"));
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::default();
        let (id, mut rx) = bus.subscribe(EventFilter::all());
        bus.unsubscribe(id);
        bus.publish(text_event("s", "after"));
        assert!(rx.recv().await.is_none());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn event_type_serializes_screaming() {
        let json = serde_json::to_string(&EventType::WorkerEscalationTicket).unwrap();
        assert_eq!(json, "\"WORKER_ESCALATION_TICKET\"");
    }
}
