// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! An in-process `Store` implementation backed by `parking_lot::Mutex`.
//!
//! Used for tests across the workspace and for single-node deployments
//! that don't need the Postgres backend's durability.

use crate::traits::{backoff_duration, DeploymentFilter, DeploymentPatch, ExperimentFilter, Store};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use flowctl_types::{
    Agent, Deployment, DeploymentHistoryEntry, DeploymentId, Error, Experiment, ExperimentId,
    HistoryAction, HostId, Result, Task, TaskId, TaskKind, TaskStatus,
};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
struct Tables {
    experiments: HashMap<ExperimentId, Experiment>,
    deployments: HashMap<DeploymentId, Deployment>,
    deployment_history: HashMap<DeploymentId, Vec<DeploymentHistoryEntry>>,
    tasks: HashMap<TaskId, Task>,
    agents: HashMap<HostId, Agent>,
    task_sequence: u64,
}

/// An in-memory `Store`. All operations hold the table lock only for the
/// duration of the operation; nothing is held across an `.await`.
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    nack_base: Duration,
    nack_cap: Duration,
}

impl InMemoryStore {
    /// Construct an empty store using the default backoff schedule (spec
    /// §4.C: base 2s, cap 5min).
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            nack_base: Duration::seconds(2),
            nack_cap: Duration::minutes(5),
        }
    }

    /// Construct an empty store with a custom backoff schedule, for tests
    /// that need to observe dead-lettering without waiting out real
    /// backoff windows.
    #[must_use]
    pub fn with_backoff(base: Duration, cap: Duration) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            nack_base: base,
            nack_cap: cap,
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(kind: &str, id: impl std::fmt::Display) -> Error {
    Error::NotFound(format!("{kind} {id} not found"))
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_experiment(&self, experiment: Experiment) -> Result<Experiment> {
        let mut tables = self.tables.lock();
        if tables.experiments.contains_key(&experiment.id) {
            return Err(Error::Conflict(format!("experiment {} already exists", experiment.id)));
        }
        tables.experiments.insert(experiment.id, experiment.clone());
        Ok(experiment)
    }

    async fn get_experiment(&self, id: ExperimentId) -> Result<Experiment> {
        let tables = self.tables.lock();
        tables
            .experiments
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("experiment", id))
    }

    async fn list_experiments(
        &self,
        filter: ExperimentFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Experiment>> {
        let tables = self.tables.lock();
        let mut matched: Vec<Experiment> = tables
            .experiments
            .values()
            .filter(|e| filter.tenant.as_deref().is_none_or(|t| t == e.tenant))
            .filter(|e| filter.phase.is_none_or(|p| p == e.phase))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matched.into_iter().skip(offset).take(limit.max(1)).collect())
    }

    async fn update_experiment_phase(
        &self,
        id: ExperimentId,
        expected_version: Option<u64>,
        phase: flowctl_types::ExperimentPhase,
        message: String,
    ) -> Result<Experiment> {
        let mut tables = self.tables.lock();
        let experiment = tables
            .experiments
            .get_mut(&id)
            .ok_or_else(|| not_found("experiment", id))?;
        if let Some(expected) = expected_version {
            if experiment.version != expected {
                return Err(Error::Conflict(format!(
                    "experiment {id} version mismatch: expected {expected}, found {}",
                    experiment.version
                )));
            }
        }
        if !experiment.phase.can_transition_to(phase) {
            return Err(Error::Validation(format!(
                "invalid transition for experiment {id}: {:?} -> {phase:?}",
                experiment.phase
            )));
        }
        experiment.apply_transition(phase, message, Utc::now());
        Ok(experiment.clone())
    }

    async fn set_experiment_results(
        &self,
        id: ExperimentId,
        results: flowctl_types::ExperimentResults,
    ) -> Result<Experiment> {
        let mut tables = self.tables.lock();
        let experiment = tables
            .experiments
            .get_mut(&id)
            .ok_or_else(|| not_found("experiment", id))?;
        experiment.results = Some(results);
        experiment.updated_at = Utc::now();
        experiment.version += 1;
        Ok(experiment.clone())
    }

    async fn create_deployment(&self, deployment: Deployment, actor: String) -> Result<Deployment> {
        let mut tables = self.tables.lock();
        if tables.deployments.contains_key(&deployment.id) {
            return Err(Error::Conflict(format!("deployment {} already exists", deployment.id)));
        }
        let new_state = serde_json::to_value(&deployment)?;
        tables.deployment_history.entry(deployment.id).or_default().push(DeploymentHistoryEntry {
            deployment_id: deployment.id,
            action: HistoryAction::Created,
            previous_state: None,
            new_state,
            actor,
            timestamp: deployment.created_at,
        });
        tables.deployments.insert(deployment.id, deployment.clone());
        Ok(deployment)
    }

    async fn get_deployment(&self, id: DeploymentId) -> Result<Deployment> {
        let tables = self.tables.lock();
        tables
            .deployments
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("deployment", id))
    }

    async fn list_deployments(&self, filter: DeploymentFilter) -> Result<Vec<Deployment>> {
        let tables = self.tables.lock();
        let mut matched: Vec<Deployment> = tables
            .deployments
            .values()
            .filter(|d| filter.include_deleted || d.deleted_at.is_none())
            .filter(|d| filter.namespace.as_deref().is_none_or(|n| n == d.namespace))
            .filter(|d| filter.status.is_none_or(|s| s == d.status))
            .filter(|d| filter.experiment_id.is_none_or(|e| Some(e) == d.experiment_id))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matched)
    }

    async fn update_deployment(
        &self,
        id: DeploymentId,
        patch: DeploymentPatch,
        action: HistoryAction,
        actor: String,
    ) -> Result<Deployment> {
        let mut tables = self.tables.lock();
        let previous = tables
            .deployments
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("deployment", id))?;
        let previous_state = serde_json::to_value(&previous)?;

        let deployment = tables.deployments.get_mut(&id).expect("checked above");
        if let Some(status) = patch.status {
            deployment.status = status;
        }
        if let Some(phase) = patch.phase {
            deployment.phase = phase;
        }
        if let Some(instances) = patch.instances {
            deployment.instances = instances;
        }
        if let Some(current) = patch.current {
            deployment.current = current;
        }
        if let Some(target_hosts) = patch.target_hosts {
            deployment.target_hosts = target_hosts;
        }
        if let Some(error_message) = patch.error_message {
            deployment.error_message = error_message;
        }
        deployment.updated_at = Utc::now();
        deployment.version += 1;
        let after = deployment.clone();
        let new_state = serde_json::to_value(&after)?;

        tables.deployment_history.entry(id).or_default().push(DeploymentHistoryEntry {
            deployment_id: id,
            action,
            previous_state: Some(previous_state),
            new_state,
            actor,
            timestamp: after.updated_at,
        });
        Ok(after)
    }

    async fn soft_delete_deployment(&self, id: DeploymentId, actor: String) -> Result<Deployment> {
        self.update_deployment(
            id,
            DeploymentPatch {
                status: Some(flowctl_types::DeploymentStatus::Deleting),
                ..Default::default()
            },
            HistoryAction::Deleted,
            actor,
        )
        .await
        .map(|mut d| {
            d.deleted_at = Some(d.updated_at);
            self.tables.lock().deployments.insert(id, d.clone());
            d
        })
    }

    async fn list_deployment_history(&self, id: DeploymentId) -> Result<Vec<DeploymentHistoryEntry>> {
        let tables = self.tables.lock();
        let mut history = tables.deployment_history.get(&id).cloned().unwrap_or_default();
        history.reverse();
        Ok(history)
    }

    async fn enqueue_task(&self, task: Task) -> Result<Task> {
        let mut tables = self.tables.lock();
        if let Some(existing) = tables.tasks.get(&task.id) {
            return Ok(existing.clone());
        }
        let mut task = task;
        tables.task_sequence += 1;
        task.sequence = tables.task_sequence;
        tables.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn lease_tasks(
        &self,
        agent_id: &str,
        host_id: &HostId,
        accepted_types: &[TaskKind],
        n: usize,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>> {
        let mut tables = self.tables.lock();
        let mut candidates: Vec<TaskId> = tables
            .tasks
            .values()
            .filter(|t| t.is_visible_at(now))
            .filter(|t| accepted_types.contains(&t.kind()))
            .filter(|t| t.payload.target_host().is_none_or(|h| h == host_id))
            .map(|t| t.id)
            .collect();
        candidates.sort_by_key(|id| {
            let t = &tables.tasks[id];
            (t.schedule_at, t.sequence)
        });
        candidates.truncate(n);

        let deadline = now + lease_ttl;
        let mut leased = Vec::with_capacity(candidates.len());
        for id in candidates {
            let task = tables.tasks.get_mut(&id).expect("candidate exists");
            task.status = TaskStatus::Leased;
            task.visibility_deadline = Some(deadline);
            task.leaseholder = Some(agent_id.to_string());
            task.attempts += 1;
            task.updated_at = now;
            leased.push(task.clone());
        }
        Ok(leased)
    }

    async fn ack_task(&self, id: TaskId) -> Result<Option<Task>> {
        let mut tables = self.tables.lock();
        let Some(task) = tables.tasks.get_mut(&id) else {
            return Err(not_found("task", id));
        };
        if task.status != TaskStatus::Leased {
            return Ok(None);
        }
        task.status = TaskStatus::Acked;
        task.visibility_deadline = None;
        task.leaseholder = None;
        task.updated_at = Utc::now();
        Ok(Some(task.clone()))
    }

    async fn nack_task(&self, id: TaskId, err: String, next_schedule_at: DateTime<Utc>) -> Result<Task> {
        let mut tables = self.tables.lock();
        let nack_base = self.nack_base;
        let nack_cap = self.nack_cap;
        let task = tables.tasks.get_mut(&id).ok_or_else(|| not_found("task", id))?;
        task.last_error = Some(err);
        task.leaseholder = None;
        task.visibility_deadline = None;
        task.updated_at = Utc::now();
        if task.attempts >= task.max_attempts {
            task.status = TaskStatus::DeadLettered;
        } else {
            task.status = TaskStatus::Pending;
            let backoff = backoff_duration(task.attempts, nack_base, nack_cap, 0.1, 0.5);
            task.schedule_at = next_schedule_at.max(task.updated_at + backoff);
        }
        Ok(task.clone())
    }

    async fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let mut tables = self.tables.lock();
        let expired: Vec<TaskId> = tables
            .tasks
            .values()
            .filter(|t| t.lease_expired_at(now))
            .map(|t| t.id)
            .collect();
        let mut reaped = Vec::with_capacity(expired.len());
        for id in expired {
            let task = tables.tasks.get_mut(&id).expect("candidate exists");
            task.status = TaskStatus::Pending;
            task.visibility_deadline = None;
            task.leaseholder = None;
            task.updated_at = now;
            reaped.push(task.clone());
        }
        Ok(reaped)
    }

    async fn get_task(&self, id: TaskId) -> Result<Task> {
        let tables = self.tables.lock();
        tables.tasks.get(&id).cloned().ok_or_else(|| not_found("task", id))
    }

    async fn list_dead_letters(&self) -> Result<Vec<Task>> {
        let tables = self.tables.lock();
        Ok(tables
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::DeadLettered)
            .cloned()
            .collect())
    }

    async fn upsert_agent(&self, agent: Agent) -> Result<Agent> {
        let mut tables = self.tables.lock();
        tables.agents.insert(agent.host_id.clone(), agent.clone());
        Ok(agent)
    }

    async fn get_agent(&self, host_id: &HostId) -> Result<Agent> {
        let tables = self.tables.lock();
        tables
            .agents
            .get(host_id)
            .cloned()
            .ok_or_else(|| not_found("agent", host_id))
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        let tables = self.tables.lock();
        Ok(tables.agents.values().cloned().collect())
    }

    async fn heartbeat_agent(
        &self,
        host_id: &HostId,
        resources: flowctl_types::ResourceSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Agent> {
        let mut tables = self.tables.lock();
        let agent = tables.agents.get_mut(host_id).ok_or_else(|| not_found("agent", host_id))?;
        agent.heartbeat(resources, now);
        Ok(agent.clone())
    }

    async fn sweep_offline_agents(&self, now: DateTime<Utc>, poll_interval: Duration) -> Result<Vec<Agent>> {
        let mut tables = self.tables.lock();
        let mut changed = Vec::new();
        for agent in tables.agents.values_mut() {
            let before = agent.status;
            agent.sweep_offline(now, poll_interval);
            if agent.status != before {
                changed.push(agent.clone());
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowctl_types::{ExperimentConfig, ExperimentPhase, SuccessCriteria, TaskPayload, TemplateRef};
    use std::collections::HashMap as Map;

    fn criteria() -> SuccessCriteria {
        SuccessCriteria {
            min_cardinality_reduction_pct: 50.0,
            max_cpu_overhead_pct: 5.0,
            max_memory_overhead_pct: 10.0,
            min_critical_process_coverage_pct: 95.0,
        }
    }

    fn experiment_config() -> ExperimentConfig {
        ExperimentConfig {
            baseline_template: TemplateRef::new("base-v1"),
            candidate_template: TemplateRef::new("topk-20"),
            target_hosts: vec![HostId::new("h1")],
            duration: Duration::seconds(60),
            variables: Map::new(),
            success_criteria: criteria(),
        }
    }

    #[tokio::test]
    async fn experiment_create_and_get_roundtrips() {
        let store = InMemoryStore::new();
        let exp = Experiment::new("e1", "alice", "t1", experiment_config(), Utc::now());
        let id = exp.id;
        store.create_experiment(exp).await.unwrap();
        let fetched = store.get_experiment(id).await.unwrap();
        assert_eq!(fetched.id, id);
        assert_eq!(fetched.phase, ExperimentPhase::Pending);
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected_and_state_unchanged() {
        let store = InMemoryStore::new();
        let exp = Experiment::new("e1", "alice", "t1", experiment_config(), Utc::now());
        let id = exp.id;
        store.create_experiment(exp).await.unwrap();

        let err = store
            .update_experiment_phase(id, None, ExperimentPhase::Running, "skip".into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let fetched = store.get_experiment(id).await.unwrap();
        assert_eq!(fetched.phase, ExperimentPhase::Pending);
        assert_eq!(fetched.version, 0);
    }

    #[tokio::test]
    async fn version_mismatch_is_conflict() {
        let store = InMemoryStore::new();
        let exp = Experiment::new("e1", "alice", "t1", experiment_config(), Utc::now());
        let id = exp.id;
        store.create_experiment(exp).await.unwrap();

        let err = store
            .update_experiment_phase(id, Some(99), ExperimentPhase::Initializing, "init".into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn terminal_phase_cannot_transition_further() {
        let store = InMemoryStore::new();
        let exp = Experiment::new("e1", "alice", "t1", experiment_config(), Utc::now());
        let id = exp.id;
        store.create_experiment(exp).await.unwrap();
        store.update_experiment_phase(id, None, ExperimentPhase::Initializing, "init".into()).await.unwrap();
        store.update_experiment_phase(id, None, ExperimentPhase::Cancelled, "cancel".into()).await.unwrap();

        let err = store
            .update_experiment_phase(id, None, ExperimentPhase::Initializing, "resurrect".into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn enqueue_task_is_idempotent_by_id() {
        let store = InMemoryStore::new();
        let task = Task::new(
            TaskPayload::AnalyzeExperiment { experiment_id: ExperimentId::new() },
            None,
            5,
            Utc::now(),
        );
        let id = task.id;
        let first = store.enqueue_task(task.clone()).await.unwrap();
        let second = store.enqueue_task(task).await.unwrap();
        assert_eq!(first.id, id);
        assert_eq!(first.sequence, second.sequence);
    }

    #[tokio::test]
    async fn lease_then_nack_reschedules_with_backoff() {
        let store = InMemoryStore::with_backoff(Duration::seconds(1), Duration::seconds(60));
        let now = Utc::now();
        let host = HostId::new("h1");
        let task = Task::new(
            TaskPayload::CollectMetrics { deployment_id: DeploymentId::new(), host_id: host.clone() },
            None,
            3,
            now,
        );
        let id = task.id;
        store.enqueue_task(task).await.unwrap();

        let leased = store
            .lease_tasks("agent-1", &host, &[TaskKind::CollectMetrics], 10, Duration::seconds(30), now)
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);

        let nacked = store.nack_task(id, "boom".into(), now).await.unwrap();
        assert_eq!(nacked.status, TaskStatus::Pending);
        assert!(nacked.schedule_at > now);
    }

    #[tokio::test]
    async fn nack_dead_letters_after_max_attempts() {
        let store = InMemoryStore::with_backoff(Duration::milliseconds(1), Duration::seconds(60));
        let now = Utc::now();
        let host = HostId::new("h1");
        let task = Task::new(
            TaskPayload::CollectMetrics { deployment_id: DeploymentId::new(), host_id: host.clone() },
            None,
            1,
            now,
        );
        let id = task.id;
        store.enqueue_task(task).await.unwrap();
        store
            .lease_tasks("agent-1", &host, &[TaskKind::CollectMetrics], 10, Duration::seconds(30), now)
            .await
            .unwrap();

        let nacked = store.nack_task(id, "boom".into(), now).await.unwrap();
        assert_eq!(nacked.status, TaskStatus::DeadLettered);
        let dead = store.list_dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
    }

    #[tokio::test]
    async fn reap_returns_expired_leases_to_pending() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let host = HostId::new("h1");
        let task = Task::new(
            TaskPayload::CollectMetrics { deployment_id: DeploymentId::new(), host_id: host.clone() },
            None,
            5,
            now,
        );
        store.enqueue_task(task).await.unwrap();
        store
            .lease_tasks("agent-1", &host, &[TaskKind::CollectMetrics], 10, Duration::seconds(10), now)
            .await
            .unwrap();

        let past_deadline = now + Duration::seconds(11);
        let reaped = store.reap_expired_leases(past_deadline).await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn deployment_update_records_history_with_previous_state() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let dep = Deployment::new(
            "d1",
            "ns",
            vec![HostId::new("h1")],
            "base-v1",
            Map::new(),
            "hash1",
            "operator:alice",
            None,
            now,
        );
        let id = dep.id;
        store.create_deployment(dep, "operator:alice".into()).await.unwrap();

        store
            .update_deployment(
                id,
                DeploymentPatch {
                    instances: Some(flowctl_types::InstanceCounts { desired: 1, ready: 1, updated: 1 }),
                    status: Some(flowctl_types::DeploymentStatus::Active),
                    ..Default::default()
                },
                HistoryAction::StatusChanged,
                "reconciler".into(),
            )
            .await
            .unwrap();

        let history = store.list_deployment_history(id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].action, HistoryAction::StatusChanged);
        assert!(history[0].previous_state.is_some());
        assert!(history[1].previous_state.is_none());
    }

    #[tokio::test]
    async fn soft_deleted_deployment_excluded_from_default_list() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let dep = Deployment::new("d1", "ns", vec![HostId::new("h1")], "base-v1", Map::new(), "hash1", "operator:alice", None, now);
        let id = dep.id;
        store.create_deployment(dep, "operator:alice".into()).await.unwrap();
        store.soft_delete_deployment(id, "operator:alice".into()).await.unwrap();

        let listed = store.list_deployments(DeploymentFilter::default()).await.unwrap();
        assert!(listed.is_empty());
        let with_deleted = store
            .list_deployments(DeploymentFilter { include_deleted: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(with_deleted.len(), 1);
    }

    #[tokio::test]
    async fn agent_sweep_marks_offline_agents() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let host = HostId::new("h1");
        store.upsert_agent(Agent::register(host.clone(), "Host One", "fleet-a", vec![], now)).await.unwrap();

        let changed = store.sweep_offline_agents(now + Duration::seconds(1), Duration::seconds(10)).await.unwrap();
        assert!(changed.is_empty());

        let changed = store.sweep_offline_agents(now + Duration::seconds(31), Duration::seconds(10)).await.unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].status, flowctl_types::AgentStatus::Offline);
    }
}
