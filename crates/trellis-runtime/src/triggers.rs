use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use trellis_core::error::TrellisError;
use trellis_core::event::{AgentEvent, EventBus, EventFilter, EventType};
use trellis_core::spec::TriggerSpec;
use trellis_core::types::ConversationMessage;

use crate::stream::ExecutionStream;

/// Wire a stream's trigger source, returning the background task driving
/// it. Manual entry points have no background source.
pub fn spawn_trigger(
    stream: Arc<ExecutionStream>,
    bus: EventBus,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    match stream.entry_point().trigger.clone() {
        TriggerSpec::Manual => None,
        TriggerSpec::Timer {
            cron,
            interval_minutes,
        } => Some(tokio::spawn(run_timer(
            stream,
            cron,
            interval_minutes,
            cancel,
        ))),
        TriggerSpec::Event {
            event_types,
            stream_id,
            node_id,
            exclude_own_graph,
        } => {
            let filter = EventFilter {
                event_type: None,
                event_types,
                graph_id: None,
                stream_id,
                node_id,
                exclude_graph: exclude_own_graph.then(|| stream.graph_id().to_string()),
            };
            // Subscribe before spawning so no event published after
            // registration can be missed.
            let (sub_id, rx) = bus.subscribe(filter);
            Some(tokio::spawn(run_event_trigger(
                stream, bus, sub_id, rx, None, cancel,
            )))
        }
        TriggerSpec::Webhook { source_id } => {
            // Webhook entry points ride the bus: the embedded listener
            // publishes WEBHOOK_RECEIVED and this trigger picks out its
            // route's events.
            let (sub_id, rx) = bus.subscribe(EventFilter::for_type(EventType::WebhookReceived));
            Some(tokio::spawn(run_event_trigger(
                stream,
                bus,
                sub_id,
                rx,
                Some(source_id),
                cancel,
            )))
        }
    }
}

async fn run_timer(
    stream: Arc<ExecutionStream>,
    cron: Option<String>,
    interval_minutes: Option<u64>,
    cancel: CancellationToken,
) {
    let schedule = match cron.as_deref().map(Schedule::from_str) {
        Some(Ok(schedule)) => Some(schedule),
        Some(Err(e)) => {
            warn!(
                stream_id = %stream.stream_id(),
                error = %e,
                "invalid cron expression, timer disabled"
            );
            return;
        }
        None => None,
    };
    let interval = interval_minutes.map(|m| Duration::from_secs(m * 60));
    if schedule.is_none() && interval.is_none() {
        warn!(stream_id = %stream.stream_id(), "timer entry point with no schedule");
        return;
    }

    info!(stream_id = %stream.stream_id(), "timer trigger started");
    loop {
        let delay = match (&schedule, interval) {
            (Some(schedule), _) => match schedule.upcoming(Utc).next() {
                Some(fire_at) => (fire_at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::from_secs(1)),
                None => {
                    cancel.cancelled().await;
                    break;
                }
            },
            (None, Some(interval)) => interval,
            (None, None) => unreachable!(),
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                info!(stream_id = %stream.stream_id(), "timer trigger shutting down");
                break;
            }
        }

        // A fire while the previous one is still running is skipped, not
        // queued.
        let marker = ConversationMessage::marker(
            "timer_tick",
            serde_json::json!({"at": Utc::now().to_rfc3339()}),
        );
        match stream
            .execute_with_marker(serde_json::Map::new(), None, Some(marker))
            .await
        {
            Ok(report) => {
                info!(stream_id = %stream.stream_id(), status = ?report.status, "timer fire finished")
            }
            Err(TrellisError::StreamBusy(_)) => {
                info!(stream_id = %stream.stream_id(), "timer fire skipped, stream busy")
            }
            Err(e) => error!(stream_id = %stream.stream_id(), error = %e, "timer fire failed"),
        }
    }
}

async fn run_event_trigger(
    stream: Arc<ExecutionStream>,
    bus: EventBus,
    sub_id: trellis_core::event::SubscriptionId,
    mut rx: trellis_core::event::EventReceiver,
    source_id: Option<String>,
    cancel: CancellationToken,
) {
    info!(stream_id = %stream.stream_id(), "event trigger subscribed");

    loop {
        let event = tokio::select! {
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        if let Some(expected) = &source_id {
            let matches = matches!(
                &event.payload,
                trellis_core::event::EventPayload::WebhookReceived { source_id, .. }
                    if source_id == expected
            );
            if !matches {
                continue;
            }
        }

        let input = payload_as_input(&event);
        match stream.execute(input, None).await {
            Ok(report) => {
                info!(stream_id = %stream.stream_id(), status = ?report.status, "event fire finished")
            }
            Err(TrellisError::StreamBusy(_)) => {
                info!(stream_id = %stream.stream_id(), "event fire skipped, stream busy")
            }
            Err(e) => error!(stream_id = %stream.stream_id(), error = %e, "event fire failed"),
        }
    }
    bus.unsubscribe(sub_id);
    info!(stream_id = %stream.stream_id(), "event trigger stopped");
}

/// Flatten an event's payload into the input map handed to the entry
/// node: the payload's own fields plus the event type and origin.
pub fn payload_as_input(event: &AgentEvent) -> serde_json::Map<String, Value> {
    let mut input = serde_json::Map::new();
    if let Ok(Value::Object(tagged)) = serde_json::to_value(&event.payload) {
        // Externally tagged: one variant key wrapping the fields.
        for (_, inner) in tagged {
            if let Value::Object(fields) = inner {
                for (key, value) in fields {
                    input.insert(key, value);
                }
            }
        }
    }
    input.insert(
        "event_type".into(),
        serde_json::to_value(event.event_type).unwrap_or(Value::Null),
    );
    if let Some(graph_id) = &event.graph_id {
        input.insert("source_graph_id".into(), Value::String(graph_id.clone()));
    }
    if let Some(stream_id) = &event.stream_id {
        input.insert("source_stream_id".into(), Value::String(stream_id.clone()));
    }
    input
}
