// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Deployment lifecycle and fleet reconciliation (spec component 4.E).
//!
//! `DeployManager` turns operator intents (`apply`, `rollback`, `delete`)
//! into durable deployments plus the agent-bound tasks that realize them,
//! and reconciles the desired-vs-observed instance counts on an interval.

#![forbid(unsafe_code)]

use chrono::Utc;
use flowctl_queue::TaskQueue;
use flowctl_store::{DeploymentFilter, DeploymentPatch, Store};
use flowctl_types::{
    Deployment, DeploymentHistoryEntry, DeploymentId, DeploymentPhase, DeploymentSnapshot,
    DeploymentStatus, Error, ExperimentId, HistoryAction, HostId, InstanceCounts, Result, Task,
    TaskKind, TaskOutcome, TaskPayload,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Default reconciliation interval (spec §4.E).
pub const DEFAULT_RECONCILE_INTERVAL: StdDuration = StdDuration::from_secs(30);

/// A fixed namespace for content-addressed task ids, so the same
/// `(deployment, host, content_hash)` tuple always yields the same task
/// id and re-issuing a deploy intent is a no-op against an in-flight task
/// (spec §4.E idempotence).
const TASK_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x3a, 0x9c, 0x9a, 0x20, 0x6c, 0x4e, 0x4a, 0x0e, 0x9e, 0x31, 0x2f, 0x74, 0x5d, 0x86, 0x9b, 0x01,
]);

fn content_addressed_task_id(parts: &[&str]) -> flowctl_types::TaskId {
    let joined = parts.join("\0");
    flowctl_types::TaskId::from(Uuid::new_v5(&TASK_ID_NAMESPACE, joined.as_bytes()))
}

/// The deployment manager (spec §4.E).
#[derive(Clone)]
pub struct DeployManager {
    store: Arc<dyn Store>,
    queue: TaskQueue,
}

impl DeployManager {
    /// Construct a manager over `store`, sharing `queue`'s lease/backoff
    /// configuration.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, queue: TaskQueue) -> Self {
        Self { store, queue }
    }

    /// `ApplyDeployment`: create a deployment and enqueue a `DeployPipeline`
    /// task per target host.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply(
        &self,
        name: impl Into<String>,
        namespace: impl Into<String>,
        target_hosts: Vec<HostId>,
        template_name: impl Into<String>,
        variables: HashMap<String, String>,
        content_hash: impl Into<String>,
        actor: impl Into<String>,
        experiment_id: Option<ExperimentId>,
    ) -> Result<Deployment> {
        let actor = actor.into();
        let template_name = template_name.into();
        let content_hash = content_hash.into();
        let now = Utc::now();
        let deployment = Deployment::new(
            name,
            namespace,
            target_hosts,
            template_name.clone(),
            variables.clone(),
            content_hash.clone(),
            actor.clone(),
            experiment_id,
            now,
        );
        let deployment = self.store.create_deployment(deployment, actor).await?;

        self.issue_deploy_tasks(&deployment, &template_name, &variables, &content_hash).await?;

        let deployment = self
            .store
            .update_deployment(
                deployment.id,
                DeploymentPatch {
                    status: Some(DeploymentStatus::Deploying),
                    phase: Some(DeploymentPhase::RollingOut),
                    ..Default::default()
                },
                HistoryAction::StatusChanged,
                "reconciler".to_string(),
            )
            .await?;
        Ok(deployment)
    }

    /// `Rollback`: apply a different template/variable snapshot to the
    /// same target hosts, recording history.
    pub async fn rollback(
        &self,
        id: DeploymentId,
        template_name: impl Into<String>,
        variables: HashMap<String, String>,
        content_hash: impl Into<String>,
        actor: impl Into<String>,
    ) -> Result<Deployment> {
        let template_name = template_name.into();
        let content_hash = content_hash.into();
        let actor = actor.into();

        let deployment = self.store.get_deployment(id).await?;
        if deployment.deleted_at.is_some() {
            return Err(Error::Conflict(format!("deployment {id} is deleted")));
        }

        let snapshot = DeploymentSnapshot {
            template_name: template_name.clone(),
            variables: variables.clone(),
            content_hash: content_hash.clone(),
        };
        let deployment = self
            .store
            .update_deployment(
                id,
                DeploymentPatch {
                    status: Some(DeploymentStatus::Updating),
                    phase: Some(DeploymentPhase::RollingBack),
                    current: Some(snapshot),
                    instances: Some(InstanceCounts {
                        desired: deployment.instances.desired,
                        ready: 0,
                        updated: 0,
                    }),
                    ..Default::default()
                },
                HistoryAction::Updated,
                actor,
            )
            .await?;

        self.issue_deploy_tasks(&deployment, &template_name, &variables, &content_hash).await?;
        Ok(deployment)
    }

    /// `DeleteDeployment`: enqueue cleanup on every target host and move
    /// the deployment into `Deleting`/`CleaningUp`. The record is
    /// soft-deleted once every host confirms cleanup (`report_task_result`).
    pub async fn delete(&self, id: DeploymentId, actor: impl Into<String>) -> Result<Deployment> {
        let actor = actor.into();
        let deployment = self.store.get_deployment(id).await?;
        for host in &deployment.target_hosts {
            let task_id = content_addressed_task_id(&[&id.to_string(), &host.0, "cleanup"]);
            let task = Task {
                id: task_id,
                payload: TaskPayload::CleanupPipeline {
                    deployment_id: id,
                    host_id: host.clone(),
                },
                experiment_id: deployment.experiment_id,
                schedule_at: Utc::now(),
                status: flowctl_types::TaskStatus::Pending,
                visibility_deadline: None,
                leaseholder: None,
                attempts: 0,
                max_attempts: flowctl_queue::DEFAULT_MAX_ATTEMPTS,
                last_error: None,
                sequence: 0,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            self.queue.enqueue(task).await?;
        }
        self.store
            .update_deployment(
                id,
                DeploymentPatch {
                    status: Some(DeploymentStatus::Deleting),
                    phase: Some(DeploymentPhase::CleaningUp),
                    ..Default::default()
                },
                HistoryAction::StatusChanged,
                actor,
            )
            .await
    }

    /// Apply an agent's `ReportTaskResult` to deployment instance counts
    /// (spec §4.E, §6). `outcome` is `TaskOutcome::Success` or `Failure`
    /// for a `DeployPipeline`/`CleanupPipeline` task; other outcomes are
    /// ignored here.
    pub async fn report_task_result(
        &self,
        id: DeploymentId,
        host: &HostId,
        kind: TaskKind,
        outcome: TaskOutcome,
    ) -> Result<Deployment> {
        let deployment = self.store.get_deployment(id).await?;
        match (kind, outcome) {
            (TaskKind::DeployPipeline, TaskOutcome::Success) => {
                let mut instances = deployment.instances;
                instances.ready = (instances.ready + 1).min(instances.desired);
                instances.updated = (instances.updated + 1).min(instances.desired);
                let now_active = instances.ready == instances.desired;
                self.store
                    .update_deployment(
                        id,
                        DeploymentPatch {
                            instances: Some(instances),
                            status: now_active.then_some(DeploymentStatus::Active),
                            phase: now_active.then_some(DeploymentPhase::Stable),
                            ..Default::default()
                        },
                        HistoryAction::StatusChanged,
                        format!("agent:{host}"),
                    )
                    .await
            }
            (TaskKind::DeployPipeline, TaskOutcome::Failure) => {
                warn!(deployment_id = %id, host = %host, "deploy task failed");
                self.store
                    .update_deployment(
                        id,
                        DeploymentPatch {
                            status: Some(DeploymentStatus::Failed),
                            error_message: Some(Some(format!("deploy failed on host {host}"))),
                            ..Default::default()
                        },
                        HistoryAction::StatusChanged,
                        format!("agent:{host}"),
                    )
                    .await
            }
            (TaskKind::CleanupPipeline, TaskOutcome::Success) => {
                let remaining: Vec<HostId> =
                    deployment.target_hosts.iter().filter(|h| *h != host).cloned().collect();
                let all_clean = remaining.is_empty();
                let updated = self
                    .store
                    .update_deployment(
                        id,
                        DeploymentPatch {
                            target_hosts: Some(remaining),
                            ..Default::default()
                        },
                        HistoryAction::Updated,
                        format!("agent:{host}"),
                    )
                    .await?;
                if all_clean {
                    info!(deployment_id = %id, "all hosts cleaned up, soft-deleting");
                    self.store.soft_delete_deployment(id, "reconciler".to_string()).await
                } else {
                    Ok(updated)
                }
            }
            _ => Ok(deployment),
        }
    }

    /// Re-issue deploy tasks for every non-terminal, non-deleted
    /// deployment that has not yet reached `ready == desired` (spec
    /// §4.E reconcile loop). Re-issuing is safe: task ids are
    /// content-addressed, so an in-flight task is simply returned
    /// unchanged by `enqueue_task`.
    pub async fn reconcile_once(&self) -> Result<usize> {
        let deployments = self
            .store
            .list_deployments(DeploymentFilter {
                status: None,
                ..Default::default()
            })
            .await?;
        let mut touched = 0;
        for deployment in deployments {
            if deployment.status.is_terminal_for_reconcile() || deployment.status == DeploymentStatus::Deleting {
                continue;
            }
            if deployment.instances.ready == deployment.instances.desired {
                continue;
            }
            self.issue_deploy_tasks(
                &deployment,
                &deployment.current.template_name,
                &deployment.current.variables,
                &deployment.current.content_hash,
            )
            .await?;
            touched += 1;
        }
        Ok(touched)
    }

    async fn issue_deploy_tasks(
        &self,
        deployment: &Deployment,
        template_name: &str,
        variables: &HashMap<String, String>,
        content_hash: &str,
    ) -> Result<()> {
        for host in &deployment.target_hosts {
            let task_id = content_addressed_task_id(&[&deployment.id.to_string(), &host.0, content_hash]);
            let task = Task {
                id: task_id,
                payload: TaskPayload::DeployPipeline {
                    deployment_id: deployment.id,
                    host_id: host.clone(),
                    template_name: template_name.to_string(),
                    variables: variables.clone(),
                    content_hash: content_hash.to_string(),
                },
                experiment_id: deployment.experiment_id,
                schedule_at: Utc::now(),
                status: flowctl_types::TaskStatus::Pending,
                visibility_deadline: None,
                leaseholder: None,
                attempts: 0,
                max_attempts: flowctl_queue::DEFAULT_MAX_ATTEMPTS,
                last_error: None,
                sequence: 0,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            self.queue.enqueue(task).await?;
        }
        Ok(())
    }

    /// History rows for a deployment, newest first.
    pub async fn history(&self, id: DeploymentId) -> Result<Vec<DeploymentHistoryEntry>> {
        self.store.list_deployment_history(id).await
    }

    /// Spawn a background reconcile loop until `cancel` is triggered.
    pub fn spawn_reconciler(&self, interval: StdDuration, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("deployment reconciler shutting down");
                        return;
                    }
                    _ = ticker.tick() => {
                        match manager.reconcile_once().await {
                            Ok(touched) if touched > 0 => info!(touched, "reconcile pass touched deployments"),
                            Ok(_) => {}
                            Err(err) => warn!(error = %err, "reconcile pass failed"),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowctl_store::InMemoryStore;

    fn manager() -> DeployManager {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let queue = TaskQueue::new(store.clone());
        DeployManager::new(store, queue)
    }

    #[tokio::test]
    async fn apply_creates_deploy_task_per_host() {
        let mgr = manager();
        let hosts = vec![HostId::new("h1"), HostId::new("h2")];
        let dep = mgr
            .apply("d1", "ns", hosts.clone(), "base-v1", HashMap::new(), "hash1", "operator:alice", None)
            .await
            .unwrap();
        assert_eq!(dep.status, DeploymentStatus::Deploying);
        assert_eq!(dep.instances.desired, 2);

        let leased = mgr
            .queue
            .lease("agent-1", &hosts[0], &[TaskKind::DeployPipeline], 10)
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
    }

    #[tokio::test]
    async fn deploy_success_on_every_host_marks_active() {
        let mgr = manager();
        let hosts = vec![HostId::new("h1"), HostId::new("h2")];
        let dep = mgr
            .apply("d1", "ns", hosts.clone(), "base-v1", HashMap::new(), "hash1", "operator:alice", None)
            .await
            .unwrap();

        mgr.report_task_result(dep.id, &hosts[0], TaskKind::DeployPipeline, TaskOutcome::Success).await.unwrap();
        let mid = mgr.store.get_deployment(dep.id).await.unwrap();
        assert_eq!(mid.status, DeploymentStatus::Deploying);

        let after = mgr
            .report_task_result(dep.id, &hosts[1], TaskKind::DeployPipeline, TaskOutcome::Success)
            .await
            .unwrap();
        assert!(after.is_fully_active());
    }

    #[tokio::test]
    async fn reissuing_deploy_is_idempotent_by_content_hash() {
        let mgr = manager();
        let hosts = vec![HostId::new("h1")];
        let dep = mgr
            .apply("d1", "ns", hosts.clone(), "base-v1", HashMap::new(), "hash1", "operator:alice", None)
            .await
            .unwrap();

        mgr.reconcile_once().await.unwrap();
        let leased = mgr
            .queue
            .lease("agent-1", &hosts[0], &[TaskKind::DeployPipeline], 10)
            .await
            .unwrap();
        // The reconcile-issued task collapsed into the one issued by apply().
        assert_eq!(leased.len(), 1);
        let _ = dep;
    }

    #[tokio::test]
    async fn delete_cleans_up_then_soft_deletes() {
        let mgr = manager();
        let hosts = vec![HostId::new("h1")];
        let dep = mgr
            .apply("d1", "ns", hosts.clone(), "base-v1", HashMap::new(), "hash1", "operator:alice", None)
            .await
            .unwrap();
        mgr.delete(dep.id, "operator:alice").await.unwrap();

        let after = mgr
            .report_task_result(dep.id, &hosts[0], TaskKind::CleanupPipeline, TaskOutcome::Success)
            .await
            .unwrap();
        assert!(after.deleted_at.is_some());
    }

    #[tokio::test]
    async fn rollback_issues_tasks_with_the_prior_content_hash_and_returns_to_active() {
        let mgr = manager();
        let hosts = vec![HostId::new("h1")];
        let dep = mgr
            .apply("d1", "ns", hosts.clone(), "base-v1", HashMap::new(), "hash-v1", "operator:alice", None)
            .await
            .unwrap();
        mgr.report_task_result(dep.id, &hosts[0], TaskKind::DeployPipeline, TaskOutcome::Success)
            .await
            .unwrap();

        mgr.rollback(dep.id, "base-v1", HashMap::new(), "hash-v1", "operator:alice")
            .await
            .unwrap();
        let updating = mgr.store.get_deployment(dep.id).await.unwrap();
        assert_eq!(updating.status, DeploymentStatus::Updating);
        assert_eq!(updating.current.content_hash, "hash-v1");

        let leased = mgr
            .queue
            .lease("agent-1", &hosts[0], &[TaskKind::DeployPipeline], 10)
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
        let TaskPayload::DeployPipeline { content_hash, .. } = &leased[0].payload else {
            panic!("expected a DeployPipeline task");
        };
        assert_eq!(content_hash, "hash-v1");

        let active = mgr
            .report_task_result(dep.id, &hosts[0], TaskKind::DeployPipeline, TaskOutcome::Success)
            .await
            .unwrap();
        assert_eq!(active.status, DeploymentStatus::Active);

        let history = mgr.history(dep.id).await.unwrap();
        assert!(history.len() >= 3, "apply + rollback + reactivation should each append a row");
    }
}
