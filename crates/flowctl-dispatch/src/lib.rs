// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Agent-facing HTTP boundary (spec component 4.D): registration,
//! heartbeat, long-poll task leasing, and result reporting. Agents poll;
//! the controller never pushes to an agent.

#![forbid(unsafe_code)]

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use flowctl_bus::EventBus;
use flowctl_deploy::DeployManager;
use flowctl_queue::TaskQueue;
use flowctl_store::Store;
use flowctl_types::{
    Agent, Error, Event, EventPayload, HostId, ResourceSnapshot, TaskKind, TaskOutcome,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default long-poll duration before an empty task list is returned
/// (spec §4.D).
pub const DEFAULT_LONG_POLL: StdDuration = StdDuration::from_secs(30);
/// How often `poll_tasks` re-checks the queue while long-polling.
const POLL_TICK: StdDuration = StdDuration::from_millis(250);

/// Shared state for the dispatch router.
#[derive(Clone)]
pub struct DispatchState {
    store: Arc<dyn Store>,
    queue: TaskQueue,
    deploy: DeployManager,
    bus: EventBus,
    long_poll: StdDuration,
}

impl DispatchState {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, queue: TaskQueue, deploy: DeployManager, bus: EventBus) -> Self {
        Self {
            store,
            queue,
            deploy,
            bus,
            long_poll: DEFAULT_LONG_POLL,
        }
    }

    #[must_use]
    pub fn with_long_poll(mut self, duration: StdDuration) -> Self {
        self.long_poll = duration;
        self
    }
}

/// Build the agent-facing router, mounted under `/v1/agents` by the
/// caller (spec §6).
pub fn router(state: DispatchState) -> Router {
    Router::new()
        .route("/v1/agents/:host_id/register", post(register_agent))
        .route("/v1/agents/:host_id/heartbeat", post(heartbeat))
        .route("/v1/agents/:host_id/tasks", get(poll_tasks))
        .route("/v1/agents/:host_id/tasks/:task_id/result", post(report_result))
        .with_state(state)
}

fn error_status(err: &Error) -> StatusCode {
    match err {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = error_status(&self.0);
        if matches!(status, StatusCode::INTERNAL_SERVER_ERROR) {
            warn!(error = %self.0, "internal error at agent boundary");
        }
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(rename = "displayName")]
    display_name: String,
    group: String,
    #[serde(default)]
    capabilities: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    #[serde(rename = "leaseTtlSeconds")]
    lease_ttl_seconds: u64,
    #[serde(rename = "pollIntervalSeconds")]
    poll_interval_seconds: u64,
}

/// `POST /v1/agents/{hostId}/register`.
async fn register_agent(
    State(state): State<DispatchState>,
    Path(host_id): Path<String>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let host = HostId::new(host_id);
    let now = Utc::now();
    let agent = Agent::register(host.clone(), body.display_name, body.group, body.capabilities, now);
    state.store.upsert_agent(agent).await?;
    info!(host = %host, "agent registered");
    Ok(Json(RegisterResponse {
        lease_ttl_seconds: flowctl_queue::DEFAULT_LEASE_TTL.num_seconds() as u64,
        poll_interval_seconds: state.long_poll.as_secs(),
    }))
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    cpu: f64,
    memory: f64,
    #[serde(rename = "metricsPerSec")]
    metrics_per_sec: f64,
    #[serde(default, rename = "activePipelines")]
    active_pipelines: Vec<String>,
}

/// `POST /v1/agents/{hostId}/heartbeat`.
async fn heartbeat(
    State(state): State<DispatchState>,
    Path(host_id): Path<String>,
    Json(body): Json<HeartbeatRequest>,
) -> Result<StatusCode, ApiError> {
    let host = HostId::new(host_id);
    let resources = ResourceSnapshot {
        cpu: body.cpu,
        memory: body.memory,
        metrics_per_sec: body.metrics_per_sec,
        active_pipelines: body.active_pipelines,
    };
    let agent = state.store.heartbeat_agent(&host, resources.clone(), Utc::now()).await?;
    state.bus.publish(Event::new(
        EventPayload::AgentStatus {
            host_id: host,
            status: agent.status,
            resources,
        },
        Utc::now(),
    ));
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct PollQuery {
    #[serde(default)]
    types: Option<String>,
    #[serde(default = "default_max")]
    max: usize,
}

fn default_max() -> usize {
    16
}

#[derive(Debug, Serialize)]
struct TaskView {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    params: serde_json::Value,
    #[serde(rename = "scheduledAt")]
    scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct PollResponse {
    tasks: Vec<TaskView>,
}

fn task_kind_name(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::ValidateTemplate => "validate_template",
        TaskKind::DeployPipeline => "deploy_pipeline",
        TaskKind::CleanupPipeline => "cleanup_pipeline",
        TaskKind::CollectMetrics => "collect_metrics",
        TaskKind::TransitionPhase => "transition_phase",
        TaskKind::AnalyzeExperiment => "analyze_experiment",
    }
}

fn parse_types(raw: Option<&str>) -> Vec<TaskKind> {
    match raw {
        None => vec![
            TaskKind::ValidateTemplate,
            TaskKind::DeployPipeline,
            TaskKind::CleanupPipeline,
            TaskKind::CollectMetrics,
        ],
        Some(s) => s
            .split(',')
            .filter_map(|name| match name.trim() {
                "validate_template" => Some(TaskKind::ValidateTemplate),
                "deploy_pipeline" => Some(TaskKind::DeployPipeline),
                "cleanup_pipeline" => Some(TaskKind::CleanupPipeline),
                "collect_metrics" => Some(TaskKind::CollectMetrics),
                _ => None,
            })
            .collect(),
    }
}

/// `GET /v1/agents/{hostId}/tasks`: long-polls up to `long_poll`, returning
/// as soon as at least one task is leasable, or an empty list on timeout
/// (spec §4.D).
async fn poll_tasks(
    State(state): State<DispatchState>,
    Path(host_id): Path<String>,
    Query(query): Query<PollQuery>,
) -> Result<Json<PollResponse>, ApiError> {
    let host = HostId::new(host_id.clone());
    let accepted = parse_types(query.types.as_deref());
    let deadline = Instant::now() + state.long_poll;

    loop {
        let leased = state.queue.lease(&host_id, &host, &accepted, query.max).await?;
        if !leased.is_empty() {
            let tasks = leased
                .into_iter()
                .map(|task| TaskView {
                    id: task.id.to_string(),
                    kind: task_kind_name(task.kind()),
                    params: serde_json::to_value(&task.payload).unwrap_or(serde_json::Value::Null),
                    scheduled_at: task.schedule_at,
                })
                .collect();
            return Ok(Json(PollResponse { tasks }));
        }
        if Instant::now() >= deadline {
            return Ok(Json(PollResponse { tasks: vec![] }));
        }
        tokio::time::sleep(POLL_TICK.min(deadline.saturating_duration_since(Instant::now()))).await;
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum OutcomeWire {
    Success,
    Failure,
    Progress,
}

#[derive(Debug, Deserialize)]
struct ResultRequest {
    outcome: OutcomeWire,
    #[serde(default)]
    details: serde_json::Value,
    #[serde(default)]
    error: Option<String>,
}

/// `POST /v1/agents/{hostId}/tasks/{taskId}/result`: success/failure
/// ack/nack the task via the queue and (for deploy/cleanup tasks) update
/// the owning deployment's observed state; `progress` does neither,
/// updating only observed metrics and emitting a task-progress event
/// (spec §4.D, §4.E).
async fn report_result(
    State(state): State<DispatchState>,
    Path((host_id, task_id)): Path<(String, String)>,
    Json(body): Json<ResultRequest>,
) -> Result<StatusCode, ApiError> {
    let host = HostId::new(host_id);
    let task_id = flowctl_types::TaskId::parse(&task_id)
        .map_err(|_| Error::Validation(format!("invalid task id {task_id}")))?;

    let outcome = match body.outcome {
        OutcomeWire::Success => TaskOutcome::Success,
        OutcomeWire::Failure => TaskOutcome::Failure,
        OutcomeWire::Progress => TaskOutcome::Progress,
    };

    let acked_or_nacked = match outcome {
        TaskOutcome::Success => state.queue.ack(task_id).await?,
        TaskOutcome::Failure => Some(
            state
                .queue
                .nack(task_id, body.error.clone().unwrap_or_else(|| "agent reported failure".to_string()))
                .await?,
        ),
        TaskOutcome::Progress => None,
    };

    if let Some(task) = &acked_or_nacked {
        if let (TaskKind::DeployPipeline, TaskOutcome::Success | TaskOutcome::Failure) = (task.kind(), outcome) {
            if let flowctl_types::TaskPayload::DeployPipeline { deployment_id, .. } = &task.payload {
                if let Err(err) = state
                    .deploy
                    .report_task_result(*deployment_id, &host, TaskKind::DeployPipeline, outcome)
                    .await
                {
                    warn!(task_id = %task_id, error = %err, "failed to apply deploy result");
                }
            }
        }
        if let (TaskKind::CleanupPipeline, TaskOutcome::Success) = (task.kind(), outcome) {
            if let flowctl_types::TaskPayload::CleanupPipeline { deployment_id, .. } = &task.payload {
                if let Err(err) = state
                    .deploy
                    .report_task_result(*deployment_id, &host, TaskKind::CleanupPipeline, outcome)
                    .await
                {
                    warn!(task_id = %task_id, error = %err, "failed to apply cleanup result");
                }
            }
        }
    }

    state.bus.publish(Event::new(
        EventPayload::TaskProgress {
            task_id,
            kind: acked_or_nacked.as_ref().map(|t| t.kind()).unwrap_or(TaskKind::CollectMetrics),
            host_id: Some(host),
            outcome,
            detail: body.details,
        },
        Utc::now(),
    ));

    Ok(StatusCode::NO_CONTENT)
}

/// Offline-detection sweep (spec §4.D): marks agents offline when
/// `now - last_heartbeat > 3 * poll_interval`. Run on an interval
/// alongside the task reaper and deployment reconciler.
pub async fn sweep_offline_once(store: &dyn Store, poll_interval: chrono::Duration) -> Result<usize, Error> {
    store
        .sweep_offline_agents(Utc::now(), poll_interval)
        .await
        .map(|changed| changed.len())
}

/// Run [`sweep_offline_once`] on `interval` until `cancel` fires.
pub fn spawn_offline_sweeper(
    store: Arc<dyn Store>,
    interval: StdDuration,
    poll_interval: chrono::Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("offline sweeper shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    match sweep_offline_once(store.as_ref(), poll_interval).await {
                        Ok(marked) if marked > 0 => info!(marked, "offline sweep marked agents offline"),
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "offline sweep failed"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use flowctl_store::InMemoryStore;
    use serde_json::json;
    use tower::ServiceExt;

    #[derive(Debug, Deserialize)]
    struct PollResponseDe {
        tasks: Vec<serde_json::Value>,
    }

    fn app() -> Router {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let queue = TaskQueue::new(store.clone());
        let deploy = DeployManager::new(store.clone(), queue.clone());
        router(DispatchState::new(store, queue, deploy, EventBus::new()).with_long_poll(StdDuration::from_millis(200)))
    }

    #[tokio::test]
    async fn register_then_heartbeat_round_trip() {
        let app = app();
        let register = Request::builder()
            .method("POST")
            .uri("/v1/agents/h1/register")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"displayName": "Host One", "group": "fleet-a", "capabilities": []}).to_string(),
            ))
            .unwrap();
        let response = app.clone().oneshot(register).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let heartbeat = Request::builder()
            .method("POST")
            .uri("/v1/agents/h1/heartbeat")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"cpu": 10.0, "memory": 512.0, "metricsPerSec": 100.0, "activePipelines": []}).to_string(),
            ))
            .unwrap();
        let response = app.oneshot(heartbeat).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn poll_tasks_times_out_with_empty_list_when_queue_is_empty() {
        let app = app();
        let request = Request::builder()
            .method("GET")
            .uri("/v1/agents/h1/tasks")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: PollResponseDe = serde_json::from_slice(&body).unwrap();
        assert!(parsed.tasks.is_empty());
    }

    #[tokio::test]
    async fn poll_tasks_returns_immediately_when_a_task_is_pending() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let queue = TaskQueue::new(store.clone());
        let deploy = DeployManager::new(store.clone(), queue.clone());
        queue
            .enqueue(flowctl_types::Task::new(
                flowctl_types::TaskPayload::CollectMetrics {
                    deployment_id: flowctl_types::DeploymentId::new(),
                    host_id: HostId::new("h1"),
                },
                None,
                3,
                Utc::now(),
            ))
            .await
            .unwrap();
        let app = router(DispatchState::new(store, queue, deploy, EventBus::new()));

        let request = Request::builder()
            .method("GET")
            .uri("/v1/agents/h1/tasks")
            .body(Body::empty())
            .unwrap();
        let started = std::time::Instant::now();
        let response = app.oneshot(request).await.unwrap();
        assert!(started.elapsed() < StdDuration::from_secs(1));
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: PollResponseDe = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.tasks.len(), 1);
    }

    #[tokio::test]
    async fn report_success_acks_task() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let queue = TaskQueue::new(store.clone());
        let deploy = DeployManager::new(store.clone(), queue.clone());
        let task = queue
            .enqueue(flowctl_types::Task::new(
                flowctl_types::TaskPayload::CollectMetrics {
                    deployment_id: flowctl_types::DeploymentId::new(),
                    host_id: HostId::new("h1"),
                },
                None,
                3,
                Utc::now(),
            ))
            .await
            .unwrap();
        queue.lease("h1", &HostId::new("h1"), &[TaskKind::CollectMetrics], 1).await.unwrap();
        let app = router(DispatchState::new(store.clone(), queue.clone(), deploy, EventBus::new()));

        let request = Request::builder()
            .method("POST")
            .uri(format!("/v1/agents/h1/tasks/{}/result", task.id))
            .header("content-type", "application/json")
            .body(Body::from(json!({"outcome": "success", "details": {}}).to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let dead_letters = queue.dead_letters().await.unwrap();
        assert!(dead_letters.is_empty());
    }
}
