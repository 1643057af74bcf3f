//! The `Agent` entity (spec §3): a host running the collector, polling the
//! control plane for work.

use crate::ids::{HostId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health status of an agent (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Heartbeating within the offline threshold.
    Healthy,
    /// Reported it is mid-update (e.g. restarting its collector process).
    Updating,
    /// `now - last_heartbeat > offline_threshold` (spec §3 invariant).
    Offline,
}

/// The most recent resource/metric counters an agent reported (spec §6
/// heartbeat payload: `{cpu, memory, metricsPerSec, activePipelines[]}`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// CPU utilization, percent.
    pub cpu: f64,
    /// Resident memory, megabytes.
    pub memory: f64,
    /// Metrics produced per second.
    pub metrics_per_sec: f64,
    /// Names/hashes of pipelines currently active on this host.
    pub active_pipelines: Vec<String>,
}

/// The `Agent` entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Host identity (one agent per host).
    pub host_id: HostId,
    /// Operator-facing display name.
    pub display_name: String,
    /// Grouping tag (e.g. region or fleet name).
    pub group_tag: String,
    /// Free-form location metadata (datacenter, rack, etc).
    pub location: std::collections::HashMap<String, String>,
    /// Declared capabilities from registration.
    pub capabilities: Vec<String>,
    /// Current health status.
    pub status: AgentStatus,
    /// Last heartbeat time.
    pub last_heartbeat: DateTime<Utc>,
    /// Tasks currently leased to this host.
    pub assigned_task_ids: Vec<TaskId>,
    /// Most recently reported resource counters.
    pub resources: ResourceSnapshot,
}

impl Agent {
    /// Register (or re-register) an agent, always healthy on registration.
    pub fn register(
        host_id: HostId,
        display_name: impl Into<String>,
        group_tag: impl Into<String>,
        capabilities: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            host_id,
            display_name: display_name.into(),
            group_tag: group_tag.into(),
            location: std::collections::HashMap::new(),
            capabilities,
            status: AgentStatus::Healthy,
            last_heartbeat: now,
            assigned_task_ids: Vec::new(),
            resources: ResourceSnapshot::default(),
        }
    }

    /// Record a heartbeat: updates the timestamp, merges resource
    /// counters, and restores `Healthy` status if it had drifted to
    /// `Offline` (an agent that starts heartbeating again is healthy).
    pub fn heartbeat(&mut self, resources: ResourceSnapshot, now: DateTime<Utc>) {
        self.last_heartbeat = now;
        self.resources = resources;
        if self.status == AgentStatus::Offline {
            self.status = AgentStatus::Healthy;
        }
    }

    /// Apply the offline-detection sweep (spec §4.D): `now - last_heartbeat
    /// > 3 * poll_interval` marks the agent offline.
    pub fn sweep_offline(&mut self, now: DateTime<Utc>, poll_interval: chrono::Duration) {
        let threshold = poll_interval * 3;
        if self.status != AgentStatus::Offline && now - self.last_heartbeat > threshold {
            self.status = AgentStatus::Offline;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_healthy() {
        let now = Utc::now();
        let agent = Agent::register(HostId::new("h1"), "Host One", "fleet-a", vec![], now);
        assert_eq!(agent.status, AgentStatus::Healthy);
    }

    #[test]
    fn sweep_marks_offline_past_threshold() {
        let now = Utc::now();
        let mut agent = Agent::register(HostId::new("h1"), "Host One", "fleet-a", vec![], now);
        let poll_interval = chrono::Duration::seconds(10);
        let later = now + chrono::Duration::seconds(29);
        agent.sweep_offline(later, poll_interval);
        assert_eq!(agent.status, AgentStatus::Healthy, "29s < 3x10s threshold");

        let much_later = now + chrono::Duration::seconds(31);
        agent.sweep_offline(much_later, poll_interval);
        assert_eq!(agent.status, AgentStatus::Offline);
    }

    #[test]
    fn heartbeat_recovers_from_offline() {
        let now = Utc::now();
        let mut agent = Agent::register(HostId::new("h1"), "Host One", "fleet-a", vec![], now);
        agent.status = AgentStatus::Offline;
        agent.heartbeat(ResourceSnapshot::default(), now + chrono::Duration::seconds(1));
        assert_eq!(agent.status, AgentStatus::Healthy);
    }
}
