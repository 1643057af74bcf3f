// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Realtime fan-out for dashboard subscribers (spec component 4.H): wraps
//! an event-bus subscription in a WebSocket connection, coalescing
//! same-key events within a short window and sending periodic heartbeats
//! so clients can detect dead connections.

#![forbid(unsafe_code)]

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    response::Response,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use flowctl_bus::{EventBus, EventType, SubscriptionFilter};
use flowctl_store::{DeploymentFilter, ExperimentFilter, Store};
use flowctl_types::{Event, EventKey, ExperimentId, HostId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Window within which same-key events are merged into one (spec §4.H).
pub const DEFAULT_COALESCE_WINDOW: StdDuration = StdDuration::from_millis(250);
/// Synthetic heartbeat cadence (spec §4.H).
pub const DEFAULT_HEARTBEAT_INTERVAL: StdDuration = StdDuration::from_secs(15);
/// Outgoing queue depth at which a subscriber is considered backpressured
/// (spec §4.H).
pub const DEFAULT_HIGH_WATER_MARK: usize = 1024;
/// How long a backpressured connection is tolerated before it is dropped
/// (spec §4.H).
pub const DEFAULT_BACKPRESSURE_GRACE: StdDuration = StdDuration::from_secs(30);

/// Shared state for the realtime router.
#[derive(Clone)]
pub struct HubState {
    store: Arc<dyn Store>,
    bus: EventBus,
    coalesce_window: StdDuration,
    heartbeat_interval: StdDuration,
    high_water_mark: usize,
    backpressure_grace: StdDuration,
}

impl HubState {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            coalesce_window: DEFAULT_COALESCE_WINDOW,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            backpressure_grace: DEFAULT_BACKPRESSURE_GRACE,
        }
    }
}

/// Build the realtime-stream router, mounted at the root by the caller
/// (spec §6: `GET /v1/stream`).
pub fn router(state: HubState) -> Router {
    Router::new()
        .route("/v1/stream", get(stream_handler))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    #[serde(default)]
    experiment_id: Option<String>,
    #[serde(default)]
    host_id: Option<String>,
    #[serde(default)]
    types: Option<String>,
}

fn parse_event_types(raw: &str) -> Vec<EventType> {
    raw.split(',')
        .filter_map(|name| match name.trim() {
            "agent_status" => Some(EventType::AgentStatus),
            "task_progress" => Some(EventType::TaskProgress),
            "metric_flow" => Some(EventType::MetricFlow),
            "experiment_update" => Some(EventType::ExperimentUpdate),
            _ => None,
        })
        .collect()
}

fn build_filter(query: &StreamQuery) -> SubscriptionFilter {
    SubscriptionFilter {
        event_types: query.types.as_deref().map(parse_event_types),
        experiment_id: query
            .experiment_id
            .as_deref()
            .and_then(|s| ExperimentId::parse(s).ok()),
        host_id: query.host_id.clone().map(HostId::new),
    }
}

async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<HubState>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let filter = build_filter(&query);
    ws.on_upgrade(move |socket| handle_socket(socket, state, filter))
}

/// The envelope shape delivered over the wire (spec §6: `{type, timestamp,
/// seq, payload}`).
#[derive(Debug, Serialize)]
struct StreamEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    timestamp: DateTime<Utc>,
    seq: u64,
    payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct InitialState {
    agents: serde_json::Value,
    experiments: serde_json::Value,
    deployments: serde_json::Value,
}

async fn initial_state_snapshot(store: &dyn Store) -> serde_json::Value {
    let agents = store.list_agents().await.unwrap_or_default();
    let experiments = store
        .list_experiments(ExperimentFilter::default(), 200, 0)
        .await
        .unwrap_or_default();
    let deployments = store
        .list_deployments(DeploymentFilter::default())
        .await
        .unwrap_or_default();
    serde_json::to_value(InitialState {
        agents: serde_json::to_value(agents).unwrap_or(serde_json::Value::Null),
        experiments: serde_json::to_value(experiments).unwrap_or(serde_json::Value::Null),
        deployments: serde_json::to_value(deployments).unwrap_or(serde_json::Value::Null),
    })
    .unwrap_or(serde_json::Value::Null)
}

/// Drives one connection for its whole lifetime: initial snapshot, then
/// coalesced forwarding from the bus, interleaved with heartbeats
/// (spec §4.H).
async fn handle_socket(mut socket: WebSocket, state: HubState, filter: SubscriptionFilter) {
    let subscription = state.bus.subscribe(filter);
    let mut seq: u64 = 0;

    let initial = initial_state_snapshot(state.store.as_ref()).await;
    seq += 1;
    if send_envelope(&mut socket, "initial_state", seq, initial).await.is_err() {
        return;
    }

    let (tx, mut rx) = mpsc::channel::<Event>(state.high_water_mark);
    let forwarder = tokio::spawn(coalesce_forward(subscription, state.coalesce_window, tx));

    let mut heartbeat = tokio::time::interval(state.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut backpressured_since: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "stream socket error");
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                seq += 1;
                if send_envelope(&mut socket, "heartbeat", seq, serde_json::Value::Null).await.is_err() {
                    break;
                }
            }
            event = rx.recv() => {
                let Some(event) = event else { break };
                if rx.len() >= state.high_water_mark {
                    let since = backpressured_since.get_or_insert_with(tokio::time::Instant::now);
                    if since.elapsed() >= state.backpressure_grace {
                        warn!("subscriber exceeded backpressure grace, disconnecting");
                        break;
                    }
                } else {
                    backpressured_since = None;
                }
                seq += 1;
                let payload = serde_json::to_value(&event.payload).unwrap_or(serde_json::Value::Null);
                let kind = event_type_name(&event);
                if send_envelope(&mut socket, kind, seq, payload).await.is_err() {
                    break;
                }
            }
        }
    }

    forwarder.abort();
    info!("stream connection closed");
}

fn event_type_name(event: &Event) -> &'static str {
    match &event.payload {
        flowctl_types::EventPayload::AgentStatus { .. } => "agent_status",
        flowctl_types::EventPayload::TaskProgress { .. } => "task_progress",
        flowctl_types::EventPayload::MetricFlow { .. } => "metric_flow",
        flowctl_types::EventPayload::ExperimentUpdate { .. } => "experiment_update",
    }
}

async fn send_envelope(socket: &mut WebSocket, kind: &str, seq: u64, payload: serde_json::Value) -> Result<(), axum::Error> {
    let envelope = StreamEnvelope {
        kind,
        timestamp: Utc::now(),
        seq,
        payload,
    };
    let text = serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_string());
    socket.send(Message::Text(text)).await
}

/// Reads from the bus subscription, merging same-key events observed
/// within `window` into the most recent one per key, and forwards the
/// merged set to `tx` (spec §4.H: "coalescing same-key events ... into
/// one").
async fn coalesce_forward(subscription: flowctl_bus::Subscription, window: StdDuration, tx: mpsc::Sender<Event>) {
    let mut pending: HashMap<EventKey, Event> = HashMap::new();
    loop {
        let first = subscription.recv().await;
        pending.insert(first.event.key(), first.event);

        let deadline = tokio::time::Instant::now() + window;
        while let Ok(envelope) = tokio::time::timeout_at(deadline, subscription.recv()).await {
            pending.insert(envelope.event.key(), envelope.event);
        }

        for (_, event) in pending.drain() {
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowctl_store::InMemoryStore;
    use flowctl_types::{AgentStatus, EventPayload, ResourceSnapshot};

    #[tokio::test]
    async fn initial_snapshot_includes_empty_collections() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let snapshot = initial_state_snapshot(store.as_ref()).await;
        assert!(snapshot.get("agents").is_some());
        assert!(snapshot.get("experiments").is_some());
        assert!(snapshot.get("deployments").is_some());
    }

    #[tokio::test]
    async fn coalesce_forward_merges_same_key_bursts() {
        let bus = EventBus::new();
        let subscription = bus.subscribe(SubscriptionFilter::default());
        let (tx, mut rx) = mpsc::channel(16);
        let handle = tokio::spawn(coalesce_forward(subscription, StdDuration::from_millis(50), tx));

        for i in 0..5 {
            bus.publish(Event::new(
                EventPayload::AgentStatus {
                    host_id: HostId::new("h1"),
                    status: AgentStatus::Healthy,
                    resources: ResourceSnapshot {
                        cpu: i as f64,
                        ..Default::default()
                    },
                },
                Utc::now(),
            ));
        }

        let merged = tokio::time::timeout(StdDuration::from_secs(1), rx.recv())
            .await
            .expect("a coalesced event should arrive")
            .expect("channel open");
        if let EventPayload::AgentStatus { resources, .. } = merged.payload {
            assert_eq!(resources.cpu, 4.0, "only the latest in the burst survives coalescing");
        } else {
            panic!("unexpected payload");
        }
        handle.abort();
    }
}
