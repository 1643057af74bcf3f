// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! A `Store` implementation backed by Postgres.
//!
//! Each entity is kept in its own table as an indexed JSONB document: a
//! handful of columns used for filtering/ordering, plus a `body` column
//! holding the full serialized entity. The wire format in `body` is owned
//! entirely by this crate's `flowctl-types` structs; the schema migration
//! here only needs to add columns when a new filter is required, not when
//! the entity shape changes.

use crate::traits::{backoff_duration, DeploymentFilter, DeploymentPatch, ExperimentFilter, Store};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use deadpool_postgres::Pool;
use flowctl_types::{
    Agent, Deployment, DeploymentHistoryEntry, DeploymentId, DeploymentStatus, Error, Experiment,
    ExperimentId, ExperimentPhase, HistoryAction, HostId, Result, Task, TaskId, TaskKind,
    TaskStatus,
};
use tokio_postgres::Row;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS experiments (
    id          UUID PRIMARY KEY,
    tenant      TEXT NOT NULL,
    phase       TEXT NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL,
    body        JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS experiments_tenant_phase_idx ON experiments (tenant, phase);

CREATE TABLE IF NOT EXISTS deployments (
    id            UUID PRIMARY KEY,
    namespace     TEXT NOT NULL,
    status        TEXT NOT NULL,
    experiment_id UUID,
    created_at    TIMESTAMPTZ NOT NULL,
    deleted_at    TIMESTAMPTZ,
    body          JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS deployments_namespace_status_idx ON deployments (namespace, status);

CREATE TABLE IF NOT EXISTS deployment_history (
    deployment_id UUID NOT NULL,
    seq           BIGSERIAL PRIMARY KEY,
    body          JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS deployment_history_deployment_idx ON deployment_history (deployment_id, seq);

CREATE TABLE IF NOT EXISTS tasks (
    id                   UUID PRIMARY KEY,
    kind                 TEXT NOT NULL,
    target_host          TEXT,
    status               TEXT NOT NULL,
    schedule_at          TIMESTAMPTZ NOT NULL,
    visibility_deadline  TIMESTAMPTZ,
    sequence             BIGSERIAL,
    body                 JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS tasks_lease_idx ON tasks (status, schedule_at, sequence);

CREATE TABLE IF NOT EXISTS agents (
    host_id        TEXT PRIMARY KEY,
    status         TEXT NOT NULL,
    last_heartbeat TIMESTAMPTZ NOT NULL,
    body           JSONB NOT NULL
);
"#;

/// A `Store` backed by a Postgres connection pool.
pub struct PostgresStore {
    pool: Pool,
    nack_base: Duration,
    nack_cap: Duration,
}

impl PostgresStore {
    /// Wrap `pool`, bootstrapping the schema with idempotent DDL. Safe to
    /// call against an already-migrated database.
    pub async fn connect(pool: Pool) -> Result<Self> {
        let client = pool.get().await.map_err(|e| Error::Transient(e.to_string()))?;
        client
            .batch_execute(SCHEMA)
            .await
            .map_err(|e| Error::Transient(format!("schema bootstrap failed: {e}")))?;
        Ok(Self {
            pool,
            nack_base: Duration::seconds(2),
            nack_cap: Duration::minutes(5),
        })
    }

    async fn client(&self) -> Result<deadpool_postgres::Client> {
        self.pool.get().await.map_err(|e| Error::Transient(e.to_string()))
    }
}

fn row_experiment(row: &Row) -> Result<Experiment> {
    let body: serde_json::Value = row.get("body");
    Ok(serde_json::from_value(body)?)
}

fn row_deployment(row: &Row) -> Result<Deployment> {
    let body: serde_json::Value = row.get("body");
    Ok(serde_json::from_value(body)?)
}

fn row_task(row: &Row) -> Result<Task> {
    let body: serde_json::Value = row.get("body");
    Ok(serde_json::from_value(body)?)
}

fn row_agent(row: &Row) -> Result<Agent> {
    let body: serde_json::Value = row.get("body");
    Ok(serde_json::from_value(body)?)
}

fn not_found(kind: &str, id: impl std::fmt::Display) -> Error {
    Error::NotFound(format!("{kind} {id} not found"))
}

#[async_trait]
impl Store for PostgresStore {
    async fn create_experiment(&self, experiment: Experiment) -> Result<Experiment> {
        let client = self.client().await?;
        let body = serde_json::to_value(&experiment)?;
        let phase = format!("{:?}", experiment.phase).to_lowercase();
        client
            .execute(
                "INSERT INTO experiments (id, tenant, phase, created_at, body) VALUES ($1, $2, $3, $4, $5)",
                &[&experiment.id.0, &experiment.tenant, &phase, &experiment.created_at, &body],
            )
            .await?;
        Ok(experiment)
    }

    async fn get_experiment(&self, id: ExperimentId) -> Result<Experiment> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT body FROM experiments WHERE id = $1", &[&id.0])
            .await?
            .ok_or_else(|| not_found("experiment", id))?;
        row_experiment(&row)
    }

    async fn list_experiments(
        &self,
        filter: ExperimentFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Experiment>> {
        let client = self.client().await?;
        let phase = filter.phase.map(|p| format!("{p:?}").to_lowercase());
        let rows = client
            .query(
                "SELECT body FROM experiments
                 WHERE ($1::text IS NULL OR tenant = $1)
                   AND ($2::text IS NULL OR phase = $2)
                 ORDER BY created_at DESC
                 LIMIT $3 OFFSET $4",
                &[&filter.tenant, &phase, &(limit.max(1) as i64), &(offset as i64)],
            )
            .await?;
        rows.iter().map(row_experiment).collect()
    }

    async fn update_experiment_phase(
        &self,
        id: ExperimentId,
        expected_version: Option<u64>,
        phase: ExperimentPhase,
        message: String,
    ) -> Result<Experiment> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        let row = tx
            .query_opt("SELECT body FROM experiments WHERE id = $1 FOR UPDATE", &[&id.0])
            .await?
            .ok_or_else(|| not_found("experiment", id))?;
        let mut experiment = row_experiment(&row)?;

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

        let body = serde_json::to_value(&experiment)?;
        let phase_str = format!("{:?}", experiment.phase).to_lowercase();
        tx.execute(
            "UPDATE experiments SET phase = $1, body = $2 WHERE id = $3",
            &[&phase_str, &body, &id.0],
        )
        .await?;
        tx.commit().await?;
        Ok(experiment)
    }

    async fn set_experiment_results(
        &self,
        id: ExperimentId,
        results: flowctl_types::ExperimentResults,
    ) -> Result<Experiment> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        let row = tx
            .query_opt("SELECT body FROM experiments WHERE id = $1 FOR UPDATE", &[&id.0])
            .await?
            .ok_or_else(|| not_found("experiment", id))?;
        let mut experiment = row_experiment(&row)?;
        experiment.results = Some(results);
        experiment.updated_at = Utc::now();
        experiment.version += 1;

        let body = serde_json::to_value(&experiment)?;
        tx.execute(
            "UPDATE experiments SET body = $1 WHERE id = $2",
            &[&body, &id.0],
        )
        .await?;
        tx.commit().await?;
        Ok(experiment)
    }

    async fn create_deployment(&self, deployment: Deployment, actor: String) -> Result<Deployment> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        let body = serde_json::to_value(&deployment)?;
        let status = format!("{:?}", deployment.status).to_lowercase();
        tx.execute(
            "INSERT INTO deployments (id, namespace, status, experiment_id, created_at, deleted_at, body)
             VALUES ($1, $2, $3, $4, $5, NULL, $6)",
            &[
                &deployment.id.0,
                &deployment.namespace,
                &status,
                &deployment.experiment_id.map(|e| e.0),
                &deployment.created_at,
                &body,
            ],
        )
        .await?;
        let history = serde_json::to_value(DeploymentHistoryEntry {
            deployment_id: deployment.id,
            action: HistoryAction::Created,
            previous_state: None,
            new_state: body,
            actor,
            timestamp: deployment.created_at,
        })?;
        tx.execute(
            "INSERT INTO deployment_history (deployment_id, body) VALUES ($1, $2)",
            &[&deployment.id.0, &history],
        )
        .await?;
        tx.commit().await?;
        Ok(deployment)
    }

    async fn get_deployment(&self, id: DeploymentId) -> Result<Deployment> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT body FROM deployments WHERE id = $1", &[&id.0])
            .await?
            .ok_or_else(|| not_found("deployment", id))?;
        row_deployment(&row)
    }

    async fn list_deployments(&self, filter: DeploymentFilter) -> Result<Vec<Deployment>> {
        let client = self.client().await?;
        let status = filter.status.map(|s| format!("{s:?}").to_lowercase());
        let rows = client
            .query(
                "SELECT body FROM deployments
                 WHERE ($1 OR deleted_at IS NULL)
                   AND ($2::text IS NULL OR namespace = $2)
                   AND ($3::text IS NULL OR status = $3)
                   AND ($4::uuid IS NULL OR experiment_id = $4)
                 ORDER BY created_at DESC",
                &[
                    &filter.include_deleted,
                    &filter.namespace,
                    &status,
                    &filter.experiment_id.map(|e| e.0),
                ],
            )
            .await?;
        rows.iter().map(row_deployment).collect()
    }

    async fn update_deployment(
        &self,
        id: DeploymentId,
        patch: DeploymentPatch,
        action: HistoryAction,
        actor: String,
    ) -> Result<Deployment> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        let row = tx
            .query_opt("SELECT body FROM deployments WHERE id = $1 FOR UPDATE", &[&id.0])
            .await?
            .ok_or_else(|| not_found("deployment", id))?;
        let previous = row_deployment(&row)?;
        let previous_state = serde_json::to_value(&previous)?;

        let mut deployment = previous;
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

        let new_state = serde_json::to_value(&deployment)?;
        let status = format!("{:?}", deployment.status).to_lowercase();
        tx.execute(
            "UPDATE deployments SET status = $1, body = $2 WHERE id = $3",
            &[&status, &new_state, &id.0],
        )
        .await?;
        let history = serde_json::to_value(DeploymentHistoryEntry {
            deployment_id: id,
            action,
            previous_state: Some(previous_state),
            new_state,
            actor,
            timestamp: deployment.updated_at,
        })?;
        tx.execute(
            "INSERT INTO deployment_history (deployment_id, body) VALUES ($1, $2)",
            &[&id.0, &history],
        )
        .await?;
        tx.commit().await?;
        Ok(deployment)
    }

    async fn soft_delete_deployment(&self, id: DeploymentId, actor: String) -> Result<Deployment> {
        let deployment = self
            .update_deployment(
                id,
                DeploymentPatch {
                    status: Some(DeploymentStatus::Deleting),
                    ..Default::default()
                },
                HistoryAction::Deleted,
                actor,
            )
            .await?;
        let client = self.client().await?;
        client
            .execute(
                "UPDATE deployments SET deleted_at = $1 WHERE id = $2",
                &[&deployment.updated_at, &id.0],
            )
            .await?;
        Ok(deployment)
    }

    async fn list_deployment_history(&self, id: DeploymentId) -> Result<Vec<DeploymentHistoryEntry>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT body FROM deployment_history WHERE deployment_id = $1 ORDER BY seq DESC",
                &[&id.0],
            )
            .await?;
        rows.iter()
            .map(|r| {
                let body: serde_json::Value = r.get("body");
                serde_json::from_value(body).map_err(Error::from)
            })
            .collect()
    }

    async fn enqueue_task(&self, task: Task) -> Result<Task> {
        let client = self.client().await?;
        let body = serde_json::to_value(&task)?;
        let kind = format!("{:?}", task.kind()).to_lowercase();
        let status = format!("{:?}", task.status).to_lowercase();
        let target_host = task.payload.target_host().map(|h| h.0.clone());
        let inserted = client
            .query_opt(
                "INSERT INTO tasks (id, kind, target_host, status, schedule_at, visibility_deadline, body)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (id) DO NOTHING
                 RETURNING body",
                &[
                    &task.id.0,
                    &kind,
                    &target_host,
                    &status,
                    &task.schedule_at,
                    &task.visibility_deadline,
                    &body,
                ],
            )
            .await?;
        match inserted {
            Some(row) => row_task(&row),
            None => self.get_task(task.id).await,
        }
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
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        let kinds: Vec<String> = accepted_types.iter().map(|k| format!("{k:?}").to_lowercase()).collect();
        let deadline = now + lease_ttl;
        let rows = tx
            .query(
                "WITH candidates AS (
                    SELECT id FROM tasks
                    WHERE status = 'pending'
                      AND schedule_at <= $1
                      AND kind = ANY($2)
                      AND (target_host IS NULL OR target_host = $3)
                    ORDER BY schedule_at, sequence
                    LIMIT $4
                    FOR UPDATE SKIP LOCKED
                 )
                 UPDATE tasks SET
                    status = 'leased',
                    visibility_deadline = $5,
                    body = jsonb_set(jsonb_set(
                        jsonb_set(body, '{status}', '\"leased\"'),
                        '{leaseholder}', to_jsonb($6::text)),
                        '{attempts}', to_jsonb((COALESCE((body->>'attempts')::int, 0) + 1))
                    )
                 FROM candidates WHERE tasks.id = candidates.id
                 RETURNING tasks.body",
                &[&now, &kinds, &host_id.0, &(n as i64), &deadline, &agent_id],
            )
            .await?;
        tx.commit().await?;
        rows.iter().map(row_task).collect()
    }

    async fn ack_task(&self, id: TaskId) -> Result<Option<Task>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "UPDATE tasks SET status = 'acked', visibility_deadline = NULL,
                    body = jsonb_set(jsonb_set(body, '{status}', '\"acked\"'), '{leaseholder}', 'null')
                 WHERE id = $1 AND status = 'leased'
                 RETURNING body",
                &[&id.0],
            )
            .await?;
        row.as_ref().map(row_task).transpose()
    }

    async fn nack_task(&self, id: TaskId, err: String, next_schedule_at: DateTime<Utc>) -> Result<Task> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        let row = tx
            .query_opt("SELECT body FROM tasks WHERE id = $1 FOR UPDATE", &[&id.0])
            .await?
            .ok_or_else(|| not_found("task", id))?;
        let mut task = row_task(&row)?;
        task.last_error = Some(err);
        task.leaseholder = None;
        task.visibility_deadline = None;
        task.updated_at = Utc::now();
        if task.attempts >= task.max_attempts {
            task.status = TaskStatus::DeadLettered;
        } else {
            task.status = TaskStatus::Pending;
            let backoff = backoff_duration(task.attempts, self.nack_base, self.nack_cap, 0.1, 0.5);
            task.schedule_at = next_schedule_at.max(task.updated_at + backoff);
        }
        let body = serde_json::to_value(&task)?;
        let status = format!("{:?}", task.status).to_lowercase();
        tx.execute(
            "UPDATE tasks SET status = $1, schedule_at = $2, visibility_deadline = NULL, body = $3 WHERE id = $4",
            &[&status, &task.schedule_at, &body, &id.0],
        )
        .await?;
        tx.commit().await?;
        Ok(task)
    }

    async fn reap_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "UPDATE tasks SET status = 'pending', visibility_deadline = NULL,
                    body = jsonb_set(jsonb_set(body, '{status}', '\"pending\"'), '{leaseholder}', 'null')
                 WHERE status = 'leased' AND visibility_deadline < $1
                 RETURNING body",
                &[&now],
            )
            .await?;
        rows.iter().map(row_task).collect()
    }

    async fn get_task(&self, id: TaskId) -> Result<Task> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT body FROM tasks WHERE id = $1", &[&id.0])
            .await?
            .ok_or_else(|| not_found("task", id))?;
        row_task(&row)
    }

    async fn list_dead_letters(&self) -> Result<Vec<Task>> {
        let client = self.client().await?;
        let rows = client
            .query("SELECT body FROM tasks WHERE status = 'dead_lettered'", &[])
            .await?;
        rows.iter().map(row_task).collect()
    }

    async fn upsert_agent(&self, agent: Agent) -> Result<Agent> {
        let client = self.client().await?;
        let body = serde_json::to_value(&agent)?;
        let status = format!("{:?}", agent.status).to_lowercase();
        client
            .execute(
                "INSERT INTO agents (host_id, status, last_heartbeat, body) VALUES ($1, $2, $3, $4)
                 ON CONFLICT (host_id) DO UPDATE SET status = EXCLUDED.status,
                    last_heartbeat = EXCLUDED.last_heartbeat, body = EXCLUDED.body",
                &[&agent.host_id.0, &status, &agent.last_heartbeat, &body],
            )
            .await?;
        Ok(agent)
    }

    async fn get_agent(&self, host_id: &HostId) -> Result<Agent> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT body FROM agents WHERE host_id = $1", &[&host_id.0])
            .await?
            .ok_or_else(|| not_found("agent", host_id))?;
        row_agent(&row)
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        let client = self.client().await?;
        let rows = client.query("SELECT body FROM agents", &[]).await?;
        rows.iter().map(row_agent).collect()
    }

    async fn heartbeat_agent(
        &self,
        host_id: &HostId,
        resources: flowctl_types::ResourceSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Agent> {
        let mut agent = self.get_agent(host_id).await?;
        agent.heartbeat(resources, now);
        self.upsert_agent(agent).await
    }

    async fn sweep_offline_agents(&self, now: DateTime<Utc>, poll_interval: Duration) -> Result<Vec<Agent>> {
        let agents = self.list_agents().await?;
        let mut changed = Vec::new();
        for mut agent in agents {
            let before = agent.status;
            agent.sweep_offline(now, poll_interval);
            if agent.status != before {
                self.upsert_agent(agent.clone()).await?;
                changed.push(agent);
            }
        }
        Ok(changed)
    }
}
