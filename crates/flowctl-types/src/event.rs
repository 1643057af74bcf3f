//! The `Event` entity (spec §3, §4.B): a message published on the event
//! bus and, via the realtime hub, fanned out to dashboard subscribers.

use crate::ids::{DeploymentId, ExperimentId, HostId, TaskId};
use crate::task::TaskKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The routing key an event is published under. Per-key order is
/// preserved for subscribers (spec §4.B, §5); cross-key order is not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKey {
    /// Keyed to one experiment.
    Experiment(ExperimentId),
    /// Keyed to one host.
    Host(HostId),
    /// Not keyed to any single entity (e.g. a heartbeat event).
    Global,
}

/// Outcome of a `ReportTaskResult` call (spec §6), echoed into
/// `EventPayload::TaskProgress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    /// The task completed successfully.
    Success,
    /// The task failed.
    Failure,
    /// An interim progress report; does not change lease state.
    Progress,
}

/// The event payload (spec §3: "one of: agent-status delta, task-progress
/// tuple, metric-flow sample, experiment-update").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// An agent's status or resource counters changed.
    AgentStatus {
        /// The host.
        host_id: HostId,
        /// Its status at publish time.
        status: crate::agent::AgentStatus,
        /// Its resource counters at publish time.
        resources: crate::agent::ResourceSnapshot,
    },
    /// A task made progress (leased, acked, nacked, or a progress report).
    TaskProgress {
        /// The task.
        task_id: TaskId,
        /// Its kind.
        kind: TaskKind,
        /// Host it's bound to, if any.
        host_id: Option<HostId>,
        /// What happened.
        outcome: TaskOutcome,
        /// Free-form detail (e.g. an error message, or reported metrics).
        detail: serde_json::Value,
    },
    /// A sample of metric-flow data observed for a deployment.
    MetricFlow {
        /// Owning deployment.
        deployment_id: DeploymentId,
        /// Reporting host.
        host_id: HostId,
        /// Observed cardinality.
        cardinality: Option<f64>,
        /// Observed throughput (samples/sec).
        throughput: Option<f64>,
    },
    /// An experiment's phase or results changed.
    ExperimentUpdate {
        /// The experiment.
        experiment_id: ExperimentId,
        /// Its phase at publish time.
        phase: crate::experiment::ExperimentPhase,
        /// Its status message at publish time.
        status_message: String,
    },
}

impl EventPayload {
    /// The routing key this payload should be published under.
    #[must_use]
    pub fn key(&self) -> EventKey {
        match self {
            EventPayload::AgentStatus { host_id, .. } => EventKey::Host(host_id.clone()),
            EventPayload::TaskProgress { host_id, .. } => host_id
                .clone()
                .map(EventKey::Host)
                .unwrap_or(EventKey::Global),
            EventPayload::MetricFlow { host_id, .. } => EventKey::Host(host_id.clone()),
            EventPayload::ExperimentUpdate { experiment_id, .. } => {
                EventKey::Experiment(*experiment_id)
            }
        }
    }

    /// The experiment this event relates to, if any — used by subscription
    /// filters that narrow by experiment id regardless of routing key.
    #[must_use]
    pub fn experiment_id(&self) -> Option<ExperimentId> {
        match self {
            EventPayload::ExperimentUpdate { experiment_id, .. } => Some(*experiment_id),
            EventPayload::TaskProgress { .. }
            | EventPayload::AgentStatus { .. }
            | EventPayload::MetricFlow { .. } => None,
        }
    }
}

/// A message on the bus (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
    /// The payload (also determines the routing key and type tag).
    pub payload: EventPayload,
}

impl Event {
    /// Construct an event stamped with the current instant.
    pub fn new(payload: EventPayload, now: DateTime<Utc>) -> Self {
        Self {
            timestamp: now,
            payload,
        }
    }

    /// The routing key for this event.
    #[must_use]
    pub fn key(&self) -> EventKey {
        self.payload.key()
    }
}

/// Per-subscriber delivery envelope: the event plus the subscriber's own
/// monotonic sequence number and a running dropped-event counter (spec
/// §4.B, §4.H backpressure contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Monotonic sequence number, per subscriber.
    pub seq: u64,
    /// The event.
    pub event: Event,
    /// Total events dropped for this subscriber so far due to overflow.
    pub dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_status_keys_by_host() {
        let payload = EventPayload::AgentStatus {
            host_id: HostId::new("h1"),
            status: crate::agent::AgentStatus::Healthy,
            resources: crate::agent::ResourceSnapshot::default(),
        };
        assert_eq!(payload.key(), EventKey::Host(HostId::new("h1")));
        assert_eq!(payload.experiment_id(), None);
    }

    #[test]
    fn experiment_update_keys_by_experiment() {
        let id = ExperimentId::new();
        let payload = EventPayload::ExperimentUpdate {
            experiment_id: id,
            phase: crate::experiment::ExperimentPhase::Running,
            status_message: "running".into(),
        };
        assert_eq!(payload.key(), EventKey::Experiment(id));
        assert_eq!(payload.experiment_id(), Some(id));
    }
}
