// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! In-process event bus (spec component 4.B).
//!
//! Each subscriber owns a bounded queue. When a publish would overflow a
//! subscriber's queue, the oldest queued event is dropped to make room
//! and the subscriber's dropped-event counter is incremented — publish
//! never blocks and never fails because a slow subscriber fell behind.
//! Events sharing a routing key are delivered to a given subscriber in
//! publish order; delivery across subscribers is at-most-once.

#![forbid(unsafe_code)]

use flowctl_types::{Event, EventEnvelope, EventKey, EventPayload, ExperimentId, HostId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::trace;
use uuid::Uuid;

/// The default per-subscriber queue capacity (spec §4.B).
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// The coarse event-type discriminant a subscription can filter on,
/// matching `EventPayload`'s variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// `EventPayload::AgentStatus`.
    AgentStatus,
    /// `EventPayload::TaskProgress`.
    TaskProgress,
    /// `EventPayload::MetricFlow`.
    MetricFlow,
    /// `EventPayload::ExperimentUpdate`.
    ExperimentUpdate,
}

impl EventType {
    fn of(payload: &EventPayload) -> Self {
        match payload {
            EventPayload::AgentStatus { .. } => EventType::AgentStatus,
            EventPayload::TaskProgress { .. } => EventType::TaskProgress,
            EventPayload::MetricFlow { .. } => EventType::MetricFlow,
            EventPayload::ExperimentUpdate { .. } => EventType::ExperimentUpdate,
        }
    }
}

/// Narrows which events a subscription receives (spec §4.B, §6 realtime
/// subscription request).
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    /// If set, only these event types are delivered.
    pub event_types: Option<Vec<EventType>>,
    /// If set, only events about this experiment are delivered (either
    /// keyed to it, or whose payload names it).
    pub experiment_id: Option<ExperimentId>,
    /// If set, only events keyed to this host are delivered.
    pub host_id: Option<HostId>,
}

impl SubscriptionFilter {
    fn matches(&self, event: &Event) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(&EventType::of(&event.payload)) {
                return false;
            }
        }
        if let Some(experiment_id) = self.experiment_id {
            if event.payload.experiment_id() != Some(experiment_id) {
                return false;
            }
        }
        if let Some(host_id) = &self.host_id {
            if event.key() != EventKey::Host(host_id.clone()) {
                return false;
            }
        }
        true
    }
}

struct SubscriberState {
    filter: SubscriptionFilter,
    capacity: usize,
    queue: Mutex<VecDeque<EventEnvelope>>,
    notify: Notify,
    seq: AtomicU64,
    dropped: AtomicU64,
}

impl SubscriberState {
    fn push(&self, event: Event) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        let dropped = self.dropped.load(Ordering::Relaxed);
        queue.push_back(EventEnvelope { seq, event, dropped });
        drop(queue);
        self.notify.notify_one();
    }
}

/// A live subscription handle returned by [`EventBus::subscribe`].
pub struct Subscription {
    id: Uuid,
    state: Arc<SubscriberState>,
    bus: Arc<Inner>,
}

impl Subscription {
    /// This subscription's id, for `unsubscribe` or logging.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Await the next event for this subscription. Never returns `None`
    /// while the bus itself is alive; the subscription must be explicitly
    /// cancelled via `drop` or [`EventBus::unsubscribe`].
    pub async fn recv(&self) -> EventEnvelope {
        loop {
            if let Some(envelope) = self.state.queue.lock().pop_front() {
                return envelope;
            }
            self.state.notify.notified().await;
        }
    }

    /// Total events dropped for this subscription so far due to overflow.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.subscribers.lock().remove(&self.id);
    }
}

struct Inner {
    subscribers: Mutex<HashMap<Uuid, Arc<SubscriberState>>>,
}

/// The event bus (spec §4.B): `Publish`/`Subscribe`/`Cancel`.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Construct an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a new subscription with `filter`, using the default queue
    /// capacity.
    #[must_use]
    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        self.subscribe_with_capacity(filter, DEFAULT_QUEUE_CAPACITY)
    }

    /// Register a new subscription with `filter` and a custom queue
    /// capacity.
    #[must_use]
    pub fn subscribe_with_capacity(&self, filter: SubscriptionFilter, capacity: usize) -> Subscription {
        let id = Uuid::new_v4();
        let state = Arc::new(SubscriberState {
            filter,
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });
        self.inner.subscribers.lock().insert(id, state.clone());
        Subscription {
            id,
            state,
            bus: self.inner.clone(),
        }
    }

    /// Drop a subscription by id (idempotent).
    pub fn unsubscribe(&self, id: Uuid) {
        self.inner.subscribers.lock().remove(&id);
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Publish `event` to every subscription whose filter matches.
    /// Non-blocking: a full subscriber queue drops its oldest entry
    /// rather than stalling the publisher.
    pub fn publish(&self, event: Event) {
        let subscribers = self.inner.subscribers.lock();
        let mut delivered = 0usize;
        for state in subscribers.values() {
            if state.filter.matches(&event) {
                state.push(event.clone());
                delivered += 1;
            }
        }
        trace!(key = ?event.key(), delivered, "published event");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowctl_types::{AgentStatus, ResourceSnapshot};
    use std::time::Duration as StdDuration;

    fn agent_event(host: &str) -> Event {
        Event::new(
            EventPayload::AgentStatus {
                host_id: HostId::new(host),
                status: AgentStatus::Healthy,
                resources: ResourceSnapshot::default(),
            },
            chrono::Utc::now(),
        )
    }

    #[tokio::test]
    async fn subscriber_receives_matching_events() {
        let bus = EventBus::new();
        let sub = bus.subscribe(SubscriptionFilter::default());
        bus.publish(agent_event("h1"));
        let envelope = sub.recv().await;
        assert_eq!(envelope.seq, 1);
        assert_eq!(envelope.dropped, 0);
    }

    #[tokio::test]
    async fn host_filter_excludes_other_hosts() {
        let bus = EventBus::new();
        let sub = bus.subscribe(SubscriptionFilter {
            host_id: Some(HostId::new("h1")),
            ..Default::default()
        });
        bus.publish(agent_event("h2"));
        bus.publish(agent_event("h1"));
        let envelope = sub.recv().await;
        assert_eq!(envelope.event.key(), EventKey::Host(HostId::new("h1")));
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let bus = EventBus::new();
        let sub = bus.subscribe_with_capacity(SubscriptionFilter::default(), 2);
        for _ in 0..5 {
            bus.publish(agent_event("h1"));
        }
        assert_eq!(sub.dropped_count(), 3);
        let first = sub.recv().await;
        // The two oldest of five were evicted in order, leaving seq 4 and 5.
        assert_eq!(first.seq, 4);
        assert_eq!(first.dropped, 3);
    }

    #[tokio::test]
    async fn per_key_order_is_preserved() {
        let bus = EventBus::new();
        let sub = bus.subscribe(SubscriptionFilter::default());
        for i in 0..10 {
            bus.publish(Event::new(
                EventPayload::AgentStatus {
                    host_id: HostId::new("h1"),
                    status: AgentStatus::Healthy,
                    resources: ResourceSnapshot {
                        cpu: i as f64,
                        ..Default::default()
                    },
                },
                chrono::Utc::now(),
            ));
        }
        let mut last_cpu = -1.0;
        for _ in 0..10 {
            let envelope = sub.recv().await;
            if let EventPayload::AgentStatus { resources, .. } = envelope.event.payload {
                assert!(resources.cpu > last_cpu);
                last_cpu = resources.cpu;
            }
        }
    }

    #[tokio::test]
    async fn unsubscribe_removes_from_bus() {
        let bus = EventBus::new();
        let sub = bus.subscribe(SubscriptionFilter::default());
        let id = sub.id();
        assert_eq!(bus.subscriber_count(), 1);
        bus.unsubscribe(id);
        assert_eq!(bus.subscriber_count(), 0);
        // dropping an already-removed handle must not panic
        drop(sub);
    }

    #[tokio::test]
    async fn recv_waits_for_publish() {
        let bus = EventBus::new();
        let sub = bus.subscribe(SubscriptionFilter::default());
        let bus2 = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            bus2.publish(agent_event("h1"));
        });
        let envelope = tokio::time::timeout(StdDuration::from_secs(1), sub.recv())
            .await
            .expect("recv should complete once published");
        assert_eq!(envelope.seq, 1);
    }
}
