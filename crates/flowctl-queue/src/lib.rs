// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Task queue semantics atop `flowctl-store` (spec component 4.C):
//! enqueue, lease, ack, nack, and a background lease reaper.

#![forbid(unsafe_code)]

use chrono::Duration;
use flowctl_store::Store;
use flowctl_types::{HostId, Result, Task, TaskId, TaskKind};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default lease visibility window (spec §4.C).
pub const DEFAULT_LEASE_TTL: Duration = Duration::seconds(30);
/// Default reaper poll interval (spec §4.C).
pub const DEFAULT_REAP_INTERVAL: StdDuration = StdDuration::from_secs(5);
/// Default retry budget for a newly enqueued task (spec §4.C).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// A thin façade over `Store`'s task operations, giving callers a single
/// place to get consistent lease/backoff defaults without threading a
/// `Store` reference plus constants through every call site.
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn Store>,
    lease_ttl: Duration,
}

impl TaskQueue {
    /// Wrap `store` with the default lease TTL.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }

    /// Wrap `store` with a custom lease TTL (used by tests that need
    /// leases to expire quickly).
    #[must_use]
    pub fn with_lease_ttl(store: Arc<dyn Store>, lease_ttl: Duration) -> Self {
        Self { store, lease_ttl }
    }

    /// Enqueue `task`. A no-op if a task with the same id already exists
    /// (spec §4.C: this is what makes handler retries safe).
    pub async fn enqueue(&self, task: Task) -> Result<Task> {
        self.store.enqueue_task(task).await
    }

    /// Lease up to `n` visible tasks of `accepted_types` bound to
    /// `host_id` (or unbound), for `agent_id`.
    pub async fn lease(
        &self,
        agent_id: &str,
        host_id: &HostId,
        accepted_types: &[TaskKind],
        n: usize,
    ) -> Result<Vec<Task>> {
        let now = chrono::Utc::now();
        let leased = self
            .store
            .lease_tasks(agent_id, host_id, accepted_types, n, self.lease_ttl, now)
            .await?;
        if !leased.is_empty() {
            debug!(agent_id, host = %host_id, count = leased.len(), "leased tasks");
        }
        Ok(leased)
    }

    /// Acknowledge successful completion of `id`.
    pub async fn ack(&self, id: TaskId) -> Result<Option<Task>> {
        let result = self.store.ack_task(id).await?;
        if result.is_none() {
            warn!(task_id = %id, "ack on a task that was not leased");
        }
        Ok(result)
    }

    /// Record a failure for `id`, scheduling a retry with backoff or
    /// dead-lettering if the retry budget is exhausted.
    pub async fn nack(&self, id: TaskId, err: String) -> Result<Task> {
        let now = chrono::Utc::now();
        let task = self.store.nack_task(id, err, now).await?;
        if task.status == flowctl_types::TaskStatus::DeadLettered {
            warn!(task_id = %id, attempts = task.attempts, "task dead-lettered");
        }
        Ok(task)
    }

    /// Fetch dead-lettered tasks for operator inspection.
    pub async fn dead_letters(&self) -> Result<Vec<Task>> {
        self.store.list_dead_letters().await
    }

    /// Run `reap_expired_leases` once, returning the tasks that were
    /// returned to `Pending`.
    pub async fn reap_once(&self) -> Result<Vec<Task>> {
        let now = chrono::Utc::now();
        let reaped = self.store.reap_expired_leases(now).await?;
        if !reaped.is_empty() {
            info!(count = reaped.len(), "reaped expired leases");
        }
        Ok(reaped)
    }

    /// Spawn a background task that calls `reap_once` on `interval` until
    /// `cancel` is triggered. The handle's result should be awaited during
    /// shutdown to confirm the loop exited cleanly.
    pub fn spawn_reaper(&self, interval: StdDuration, cancel: CancellationToken) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("lease reaper shutting down");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = queue.reap_once().await {
                            warn!(error = %err, "lease reaper tick failed");
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
    use flowctl_types::{DeploymentId, TaskPayload};

    fn queue() -> TaskQueue {
        TaskQueue::with_lease_ttl(Arc::new(InMemoryStore::new()), Duration::milliseconds(50))
    }

    fn collect_metrics_task(host: &HostId) -> Task {
        Task::new(
            TaskPayload::CollectMetrics {
                deployment_id: DeploymentId::new(),
                host_id: host.clone(),
            },
            None,
            3,
            chrono::Utc::now(),
        )
    }

    #[tokio::test]
    async fn lease_ack_round_trip() {
        let q = queue();
        let host = HostId::new("h1");
        let task = collect_metrics_task(&host);
        let id = task.id;
        q.enqueue(task).await.unwrap();

        let leased = q.lease("agent-1", &host, &[TaskKind::CollectMetrics], 10).await.unwrap();
        assert_eq!(leased.len(), 1);

        let acked = q.ack(id).await.unwrap();
        assert!(acked.is_some());
    }

    #[tokio::test]
    async fn reap_recovers_unacked_lease() {
        let q = queue();
        let host = HostId::new("h1");
        let task = collect_metrics_task(&host);
        q.enqueue(task).await.unwrap();
        q.lease("agent-1", &host, &[TaskKind::CollectMetrics], 10).await.unwrap();

        tokio::time::sleep(StdDuration::from_millis(60)).await;
        let reaped = q.reap_once().await.unwrap();
        assert_eq!(reaped.len(), 1);

        // Now re-leasable.
        let leased = q.lease("agent-2", &host, &[TaskKind::CollectMetrics], 10).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].attempts, 2);
    }

    #[tokio::test]
    async fn spawn_reaper_runs_until_cancelled() {
        let q = queue();
        let host = HostId::new("h1");
        q.enqueue(collect_metrics_task(&host)).await.unwrap();
        q.lease("agent-1", &host, &[TaskKind::CollectMetrics], 10).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = q.spawn_reaper(StdDuration::from_millis(20), cancel.clone());
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        let dead = q.dead_letters().await.unwrap();
        assert!(dead.is_empty(), "task was reaped, not dead-lettered");
    }
}
