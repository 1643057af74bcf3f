//! The `Deployment` entity (spec §3): an intent to run a pipeline on a set
//! of hosts, plus its append-only history.

use crate::ids::{DeploymentId, ExperimentId, HostId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Coarse lifecycle status of a deployment (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Created, no hosts reconciled yet.
    Pending,
    /// At least one deploy task outstanding.
    Deploying,
    /// `ready == desired` across all target hosts, confirmed at least once.
    Active,
    /// A rollback or template/variable update is in flight.
    Updating,
    /// A host failed after exhausting retries.
    Failed,
    /// Cleanup tasks outstanding prior to soft-delete.
    Deleting,
}

impl DeploymentStatus {
    /// True once a deployment is no longer actively reconciling toward a
    /// new target (used by the reconcile loop to skip it).
    #[must_use]
    pub fn is_terminal_for_reconcile(self) -> bool {
        matches!(self, DeploymentStatus::Failed)
    }
}

/// Fine-grained rollout phase, independent of the coarse `status` (spec
/// §3 lists both `status` and `phase` as distinct Deployment attributes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentPhase {
    /// Record just created; no tasks issued yet.
    Creating,
    /// Deploy tasks issued, waiting on agent confirmation.
    RollingOut,
    /// `ready == desired`, nothing outstanding.
    Stable,
    /// A `Rollback` intent is being applied.
    RollingBack,
    /// Cleanup tasks issued, waiting on agent confirmation.
    CleaningUp,
}

/// Instance counters tracked per deployment (spec §3 invariant:
/// `ready <= desired` always).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceCounts {
    /// Number of hosts the deployment targets.
    pub desired: u32,
    /// Number of hosts currently running the deployment's content hash.
    pub ready: u32,
    /// Number of hosts updated in the most recent rollout/rollback.
    pub updated: u32,
}

/// A snapshot of the config actually applied, captured at apply/rollback
/// time so history rows are self-contained (spec S5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSnapshot {
    /// Pipeline template name at this snapshot.
    pub template_name: String,
    /// Template variables at this snapshot.
    pub variables: HashMap<String, String>,
    /// Content hash of `(template_name, variables)` at this snapshot.
    pub content_hash: String,
}

/// The `Deployment` entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    /// Opaque stable identifier.
    pub id: DeploymentId,
    /// Deployment name, unique within `namespace`.
    pub name: String,
    /// Namespace tag scoping name uniqueness.
    pub namespace: String,
    /// Target host set.
    pub target_hosts: Vec<HostId>,
    /// Currently-applied snapshot.
    pub current: DeploymentSnapshot,
    /// Opaque resource request strings (e.g. `"500m"`, `"256Mi"`).
    pub resource_requests: HashMap<String, String>,
    /// Opaque resource limit strings.
    pub resource_limits: HashMap<String, String>,
    /// Coarse status.
    pub status: DeploymentStatus,
    /// Fine-grained rollout phase.
    pub phase: DeploymentPhase,
    /// Instance counters.
    pub instances: InstanceCounts,
    /// Backreference to the owning experiment, if created by one.
    pub experiment_id: Option<ExperimentId>,
    /// Current human-readable status message.
    pub error_message: Option<String>,
    /// Creator (operator id or `"state-machine"`).
    pub created_by: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-update timestamp.
    pub updated_at: DateTime<Utc>,
    /// Soft-delete timestamp. Non-null deployments are excluded from
    /// default listings (spec §3 invariant).
    pub deleted_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency token.
    pub version: u64,
}

impl Deployment {
    /// Construct a new pending deployment.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        target_hosts: Vec<HostId>,
        template_name: impl Into<String>,
        variables: HashMap<String, String>,
        content_hash: impl Into<String>,
        created_by: impl Into<String>,
        experiment_id: Option<ExperimentId>,
        now: DateTime<Utc>,
    ) -> Self {
        let desired = target_hosts.len() as u32;
        Self {
            id: DeploymentId::new(),
            name: name.into(),
            namespace: namespace.into(),
            target_hosts,
            current: DeploymentSnapshot {
                template_name: template_name.into(),
                variables,
                content_hash: content_hash.into(),
            },
            resource_requests: HashMap::new(),
            resource_limits: HashMap::new(),
            status: DeploymentStatus::Pending,
            phase: DeploymentPhase::Creating,
            instances: InstanceCounts {
                desired,
                ready: 0,
                updated: 0,
            },
            experiment_id,
            error_message: None,
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            version: 0,
        }
    }

    /// True if this `(deployment, host)` currently has an active, matching
    /// instance — used by the reconciliation invariant in spec §4.E.
    #[must_use]
    pub fn is_fully_active(&self) -> bool {
        self.status == DeploymentStatus::Active && self.instances.ready == self.instances.desired
    }
}

/// The action recorded in a `DeploymentHistoryEntry` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    /// The deployment was created.
    Created,
    /// The deployment's target/config was updated (e.g. a rollback).
    Updated,
    /// `status` changed.
    StatusChanged,
    /// `phase` changed.
    PhaseChanged,
    /// The deployment was soft-deleted.
    Deleted,
}

/// An append-only audit row (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentHistoryEntry {
    /// Owning deployment.
    pub deployment_id: DeploymentId,
    /// What changed.
    pub action: HistoryAction,
    /// Full snapshot of the deployment before the change, if any.
    pub previous_state: Option<serde_json::Value>,
    /// Full snapshot of the deployment after the change.
    pub new_state: serde_json::Value,
    /// Who/what made the change (`"operator:<id>"`, `"reconciler"`, ...).
    pub actor: String,
    /// When the change happened.
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_deployment_has_matching_desired_count() {
        let now = Utc::now();
        let dep = Deployment::new(
            "d1",
            "ns",
            vec![HostId::new("h1"), HostId::new("h2")],
            "base-v1",
            HashMap::new(),
            "hash1",
            "operator:alice",
            None,
            now,
        );
        assert_eq!(dep.instances.desired, 2);
        assert_eq!(dep.instances.ready, 0);
        assert!(!dep.is_fully_active());
    }

    #[test]
    fn fully_active_requires_status_and_count_match() {
        let now = Utc::now();
        let mut dep = Deployment::new(
            "d1",
            "ns",
            vec![HostId::new("h1")],
            "base-v1",
            HashMap::new(),
            "hash1",
            "operator:alice",
            None,
            now,
        );
        dep.instances.ready = 1;
        assert!(!dep.is_fully_active(), "status still Pending");
        dep.status = DeploymentStatus::Active;
        assert!(dep.is_fully_active());
    }
}
