//! The `Store` trait: the sole mutator of persisted state (spec §4.A).
//! Every operation either fully succeeds or leaves no partial state
//! visible.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowctl_types::{
    Agent, Deployment, DeploymentHistoryEntry, DeploymentId, DeploymentPhase, DeploymentStatus,
    Experiment, ExperimentId, ExperimentPhase, HistoryAction, HostId, InstanceCounts,
    ResourceSnapshot, Result, Task, TaskId, TaskKind,
};
use std::collections::HashMap;

/// Narrows `ListExperiments` (spec §4.A).
#[derive(Debug, Clone, Default)]
pub struct ExperimentFilter {
    /// Restrict to one tenant tag.
    pub tenant: Option<String>,
    /// Restrict to one lifecycle phase.
    pub phase: Option<ExperimentPhase>,
}

/// Narrows `ListDeployments` (spec §4.A, §6).
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    /// Restrict to one namespace tag.
    pub namespace: Option<String>,
    /// Restrict to one coarse status.
    pub status: Option<DeploymentStatus>,
    /// Restrict to deployments owned by one experiment.
    pub experiment_id: Option<ExperimentId>,
    /// Include soft-deleted rows. Defaults to `false` (spec §3 invariant:
    /// "a deployment with a non-null deleted timestamp is not returned by
    /// default lists").
    pub include_deleted: bool,
}

/// A partial update to a deployment, applied by `UpdateDeployment` along
/// with a `DeploymentHistoryEntry` in the same transaction (spec §4.A).
#[derive(Debug, Clone, Default)]
pub struct DeploymentPatch {
    /// New coarse status, if changing.
    pub status: Option<DeploymentStatus>,
    /// New rollout phase, if changing.
    pub phase: Option<DeploymentPhase>,
    /// New instance counters, if changing.
    pub instances: Option<InstanceCounts>,
    /// New applied snapshot (template/vars/hash), if changing (e.g. a
    /// rollback or template update).
    pub current: Option<flowctl_types::DeploymentSnapshot>,
    /// New target host set, if changing.
    pub target_hosts: Option<Vec<HostId>>,
    /// New error message. `Some(None)` clears it; `None` leaves it
    /// untouched.
    pub error_message: Option<Option<String>>,
}

/// The durable store adapter (spec §4.A).
#[async_trait]
pub trait Store: Send + Sync {
    // -- Experiments --------------------------------------------------

    /// Persist a brand-new experiment.
    async fn create_experiment(&self, experiment: Experiment) -> Result<Experiment>;

    /// Fetch one experiment by id.
    async fn get_experiment(&self, id: ExperimentId) -> Result<Experiment>;

    /// List experiments matching `filter`, newest-created first.
    async fn list_experiments(
        &self,
        filter: ExperimentFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Experiment>>;

    /// Atomically validate and apply `id`'s transition to `phase`,
    /// appending one condition and bumping `updated_at`/`version`. Returns
    /// `Error::Validation` if `(current, phase)` is not in the transition
    /// table (spec §4.F); the stored phase is unchanged in that case.
    /// Returns `Error::Conflict` if `expected_version` is supplied and does
    /// not match.
    async fn update_experiment_phase(
        &self,
        id: ExperimentId,
        expected_version: Option<u64>,
        phase: ExperimentPhase,
        message: String,
    ) -> Result<Experiment>;

    /// Attach `results` to `id`, bumping `updated_at`/`version` but leaving
    /// `phase` untouched. Called once per analysis pass (spec §4.G),
    /// independently of whether that pass's phase transition succeeds.
    async fn set_experiment_results(
        &self,
        id: ExperimentId,
        results: flowctl_types::ExperimentResults,
    ) -> Result<Experiment>;

    // -- Deployments ----------------------------------------------------

    /// Persist a brand-new deployment, recording a `Created` history row.
    async fn create_deployment(&self, deployment: Deployment, actor: String) -> Result<Deployment>;

    /// Fetch one deployment by id (including soft-deleted ones).
    async fn get_deployment(&self, id: DeploymentId) -> Result<Deployment>;

    /// List deployments matching `filter`.
    async fn list_deployments(&self, filter: DeploymentFilter) -> Result<Vec<Deployment>>;

    /// Apply `patch` to `id` and insert a matching history row in the same
    /// transaction.
    async fn update_deployment(
        &self,
        id: DeploymentId,
        patch: DeploymentPatch,
        action: HistoryAction,
        actor: String,
    ) -> Result<Deployment>;

    /// Soft-delete a deployment (sets `deleted_at`; excluded from default
    /// lists thereafter).
    async fn soft_delete_deployment(&self, id: DeploymentId, actor: String) -> Result<Deployment>;

    /// List history rows for a deployment, newest first.
    async fn list_deployment_history(&self, id: DeploymentId) -> Result<Vec<DeploymentHistoryEntry>>;

    // -- Tasks ------------------------------------------------------------

    /// Insert `task` if `task.id` is new; otherwise a no-op returning the
    /// existing task (spec §4.C: this is what makes state-machine handler
    /// retries safe).
    async fn enqueue_task(&self, task: Task) -> Result<Task>;

    /// Atomically select up to `n` visible tasks whose kind is in
    /// `accepted_types` and whose target host is unset or equals
    /// `host_id`, order by `(schedule_at, sequence)`, increment their
    /// attempt counters, set their visibility deadline, and mark them
    /// leased by `agent_id`.
    async fn lease_tasks(
        &self,
        agent_id: &str,
        host_id: &HostId,
        accepted_types: &[TaskKind],
        n: usize,
        lease_ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>>;

    /// Mark a task as terminal-success. A no-op (logged by the caller at
    /// warn) if the task is not currently leased.
    async fn ack_task(&self, id: TaskId) -> Result<Option<Task>>;

    /// Record a failure: increments attempts (already incremented at
    /// lease time, so this only records the error), and either
    /// reschedules with backoff or dead-letters if `max_attempts` is
    /// reached.
    async fn nack_task(&self, id: TaskId, err: String, next_schedule_at: DateTime<Utc>) -> Result<Task>;

    /// Atomically return every task whose visibility deadline has passed
    /// to the visible (`Pending`) state, returning them.
    async fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Task>>;

    /// Fetch one task by id (for inspection, e.g. dead-letter review).
    async fn get_task(&self, id: TaskId) -> Result<Task>;

    /// List dead-lettered tasks (spec §4.C: "retained for inspection").
    async fn list_dead_letters(&self) -> Result<Vec<Task>>;

    // -- Agents -----------------------------------------------------------

    /// Upsert an agent record on registration.
    async fn upsert_agent(&self, agent: Agent) -> Result<Agent>;

    /// Fetch one agent by host id.
    async fn get_agent(&self, host_id: &HostId) -> Result<Agent>;

    /// List all known agents.
    async fn list_agents(&self) -> Result<Vec<Agent>>;

    /// Record a heartbeat for `host_id`.
    async fn heartbeat_agent(
        &self,
        host_id: &HostId,
        resources: ResourceSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Agent>;

    /// Sweep all agents for the offline threshold (spec §4.D), returning
    /// those whose status changed.
    async fn sweep_offline_agents(&self, now: DateTime<Utc>, poll_interval: chrono::Duration) -> Result<Vec<Agent>>;
}

/// Computes the exponential backoff schedule (spec §4.C): base 2s,
/// doubling per attempt, capped, with multiplicative jitter.
#[must_use]
pub fn backoff_duration(attempt: u32, base: chrono::Duration, cap: chrono::Duration, jitter_fraction: f64, rand_unit: f64) -> chrono::Duration {
    let base_ms = base.num_milliseconds().max(1) as f64;
    let cap_ms = cap.num_milliseconds().max(base.num_milliseconds()) as f64;
    let exp_ms = base_ms * 2f64.powi(attempt.saturating_sub(1) as i32);
    let capped_ms = exp_ms.min(cap_ms);
    let jitter = capped_ms * jitter_fraction * (rand_unit * 2.0 - 1.0);
    let total_ms = (capped_ms + jitter).max(0.0);
    chrono::Duration::milliseconds(total_ms as i64)
}

/// Content hash of `(template_name, variables)` used for deploy-task
/// idempotence (spec §4.E). Deterministic and order-independent over the
/// variable map.
#[must_use]
pub fn content_hash(template_name: &str, variables: &HashMap<String, String>) -> String {
    use std::collections::BTreeMap;
    use std::fmt::Write as _;

    let sorted: BTreeMap<&String, &String> = variables.iter().collect();
    let mut buf = String::new();
    let _ = write!(buf, "{template_name}\0");
    for (k, v) in sorted {
        let _ = write!(buf, "{k}={v}\0");
    }
    format!("{:016x}", fnv1a(buf.as_bytes()))
}

/// A small, dependency-free FNV-1a hash, adequate for content-addressing
/// deploy payloads (not a security boundary).
fn fnv1a(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in data {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_order_independent() {
        let mut a = HashMap::new();
        a.insert("x".to_string(), "1".to_string());
        a.insert("y".to_string(), "2".to_string());
        let mut b = HashMap::new();
        b.insert("y".to_string(), "2".to_string());
        b.insert("x".to_string(), "1".to_string());
        assert_eq!(content_hash("tmpl", &a), content_hash("tmpl", &b));
    }

    #[test]
    fn content_hash_changes_with_value() {
        let mut a = HashMap::new();
        a.insert("x".to_string(), "1".to_string());
        let mut b = HashMap::new();
        b.insert("x".to_string(), "2".to_string());
        assert_ne!(content_hash("tmpl", &a), content_hash("tmpl", &b));
    }

    #[test]
    fn backoff_is_capped() {
        let base = chrono::Duration::seconds(2);
        let cap = chrono::Duration::seconds(300);
        let d = backoff_duration(20, base, cap, 0.0, 0.5);
        assert!(d <= cap);
    }

    #[test]
    fn backoff_grows_with_attempt() {
        let base = chrono::Duration::seconds(2);
        let cap = chrono::Duration::seconds(300);
        let d1 = backoff_duration(1, base, cap, 0.0, 0.5);
        let d2 = backoff_duration(2, base, cap, 0.0, 0.5);
        assert!(d2 > d1);
    }
}
