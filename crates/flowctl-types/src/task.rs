//! The `Task` entity (spec §3, §4.C): a durable work item dispatched to an
//! agent or to an internal state-machine handler.
//!
//! Per the Design Notes (spec §9), task parameters are a closed sum type
//! keyed by task kind rather than a loosely-typed map. `TaskPayload`'s
//! variants are exactly the `task_type` closed set from spec §3.

use crate::experiment::ExperimentPhase;
use crate::ids::{DeploymentId, ExperimentId, HostId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The task kind, derived from `TaskPayload::kind()`. Kept as its own type
/// because the queue leases by `(kind, host)` without needing to inspect
/// the full payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Validate a pipeline template against the registry collaborator.
    ValidateTemplate,
    /// Deploy a pipeline instance to a host.
    DeployPipeline,
    /// Remove a pipeline instance from a host.
    CleanupPipeline,
    /// Collect a metrics sample from a host (periodic progress report).
    CollectMetrics,
    /// Transition an experiment to a new phase (consumed internally, not
    /// by an agent).
    TransitionPhase,
    /// Run the analyzer against a completed experiment run (consumed
    /// internally).
    AnalyzeExperiment,
}

impl TaskKind {
    /// True if this kind is dispatched to an agent over HTTP (spec §4.D)
    /// as opposed to consumed by an internal worker pool (spec §4.F, §4.G).
    #[must_use]
    pub fn is_agent_bound(self) -> bool {
        matches!(
            self,
            TaskKind::ValidateTemplate
                | TaskKind::DeployPipeline
                | TaskKind::CleanupPipeline
                | TaskKind::CollectMetrics
        )
    }
}

/// Typed payload for each task kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Validate `template_name` with `variables` against the registry.
    ValidateTemplate {
        /// Template to validate.
        template_name: String,
        /// Variable substitutions to validate against the template.
        variables: HashMap<String, String>,
    },
    /// Deploy `template_name`+`variables` (content-addressed by
    /// `content_hash`) to `host_id` on behalf of `deployment_id`.
    DeployPipeline {
        /// Owning deployment.
        deployment_id: DeploymentId,
        /// Target host.
        host_id: HostId,
        /// Template to deploy.
        template_name: String,
        /// Variable substitutions.
        variables: HashMap<String, String>,
        /// Content hash the agent should compare against its running
        /// instance for idempotence (spec §4.E).
        content_hash: String,
    },
    /// Remove any pipeline instance for `deployment_id` on `host_id`.
    CleanupPipeline {
        /// Owning deployment.
        deployment_id: DeploymentId,
        /// Target host.
        host_id: HostId,
    },
    /// Ask `host_id` to report a fresh metrics sample for `deployment_id`.
    CollectMetrics {
        /// Owning deployment.
        deployment_id: DeploymentId,
        /// Target host.
        host_id: HostId,
    },
    /// Move `experiment_id` to `to_phase` once this task is dequeued
    /// (spec §4.F: this is the mechanism for deferred phase transitions).
    TransitionPhase {
        /// Experiment to transition.
        experiment_id: ExperimentId,
        /// Destination phase.
        to_phase: ExperimentPhase,
    },
    /// Run the analyzer for `experiment_id` (spec §4.G).
    AnalyzeExperiment {
        /// Experiment to analyze.
        experiment_id: ExperimentId,
    },
}

impl TaskPayload {
    /// The kind discriminant for this payload.
    #[must_use]
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::ValidateTemplate { .. } => TaskKind::ValidateTemplate,
            TaskPayload::DeployPipeline { .. } => TaskKind::DeployPipeline,
            TaskPayload::CleanupPipeline { .. } => TaskKind::CleanupPipeline,
            TaskPayload::CollectMetrics { .. } => TaskKind::CollectMetrics,
            TaskPayload::TransitionPhase { .. } => TaskKind::TransitionPhase,
            TaskPayload::AnalyzeExperiment { .. } => TaskKind::AnalyzeExperiment,
        }
    }

    /// The target host this payload is bound to, if any (spec §3: "target
    /// host id (optional; required for host-bound tasks)").
    #[must_use]
    pub fn target_host(&self) -> Option<&HostId> {
        match self {
            TaskPayload::DeployPipeline { host_id, .. }
            | TaskPayload::CleanupPipeline { host_id, .. }
            | TaskPayload::CollectMetrics { host_id, .. } => Some(host_id),
            _ => None,
        }
    }
}

/// Queue-visible status of a task (spec §4.C state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Visible for leasing once `schedule_at <= now`.
    Pending,
    /// Leased by an agent/worker; invisible until `visibility_deadline`.
    Leased,
    /// Terminal success.
    Acked,
    /// Exceeded `max_attempts`; retained for inspection, never re-leased.
    DeadLettered,
}

/// A durable work item (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Opaque id, stable across retries.
    pub id: TaskId,
    /// Typed payload (also carries the kind).
    pub payload: TaskPayload,
    /// Owning experiment, if any.
    pub experiment_id: Option<ExperimentId>,
    /// When the task becomes visible to leasers.
    pub schedule_at: DateTime<Utc>,
    /// Current queue status.
    pub status: TaskStatus,
    /// Set while `status == Leased`; the task becomes re-leasable once
    /// `now > visibility_deadline`.
    pub visibility_deadline: Option<DateTime<Utc>>,
    /// Agent or worker id currently holding the lease, if any.
    pub leaseholder: Option<String>,
    /// Attempts so far (incremented on each lease).
    pub attempts: u32,
    /// Configured retry budget for this task.
    pub max_attempts: u32,
    /// Most recent nack error text.
    pub last_error: Option<String>,
    /// Insertion order, used to break `schedule_at` ties (spec §4.C).
    pub sequence: u64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Construct a new, immediately-visible task.
    pub fn new(payload: TaskPayload, experiment_id: Option<ExperimentId>, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self::deferred(payload, experiment_id, max_attempts, now, now)
    }

    /// Construct a new task that only becomes visible at `schedule_at`.
    pub fn deferred(
        payload: TaskPayload,
        experiment_id: Option<ExperimentId>,
        max_attempts: u32,
        schedule_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            payload,
            experiment_id,
            schedule_at,
            status: TaskStatus::Pending,
            visibility_deadline: None,
            leaseholder: None,
            attempts: 0,
            max_attempts,
            last_error: None,
            sequence: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// The task's kind.
    #[must_use]
    pub fn kind(&self) -> TaskKind {
        self.payload.kind()
    }

    /// True iff `self` is currently visible to a leaser at time `now`:
    /// pending, and its schedule has arrived.
    #[must_use]
    pub fn is_visible_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, TaskStatus::Pending) && self.schedule_at <= now
    }

    /// True iff `self` is leased but its visibility deadline has passed
    /// (spec §4.C reaper).
    #[must_use]
    pub fn lease_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, TaskStatus::Leased)
            && self.visibility_deadline.map(|d| now > d).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_kind_matches_discriminant() {
        let p = TaskPayload::AnalyzeExperiment {
            experiment_id: ExperimentId::new(),
        };
        assert_eq!(p.kind(), TaskKind::AnalyzeExperiment);
        assert!(p.target_host().is_none());
    }

    #[test]
    fn deploy_pipeline_carries_target_host() {
        let host = HostId::new("h1");
        let p = TaskPayload::DeployPipeline {
            deployment_id: DeploymentId::new(),
            host_id: host.clone(),
            template_name: "base".into(),
            variables: HashMap::new(),
            content_hash: "abc".into(),
        };
        assert_eq!(p.target_host(), Some(&host));
        assert!(p.kind().is_agent_bound());
    }

    #[test]
    fn transition_phase_is_not_agent_bound() {
        let p = TaskPayload::TransitionPhase {
            experiment_id: ExperimentId::new(),
            to_phase: ExperimentPhase::Running,
        };
        assert!(!p.kind().is_agent_bound());
    }

    #[test]
    fn deferred_task_invisible_until_schedule() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(30);
        let t = Task::deferred(
            TaskPayload::AnalyzeExperiment {
                experiment_id: ExperimentId::new(),
            },
            None,
            5,
            later,
            now,
        );
        assert!(!t.is_visible_at(now));
        assert!(!t.is_visible_at(later - chrono::Duration::seconds(1)));
        assert!(t.is_visible_at(later));
    }
}
