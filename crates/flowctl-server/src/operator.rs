// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Operator/dashboard HTTP API (spec §6): experiment and deployment
//! lifecycle management, plus a read-through to the template registry.
//! Mirrors `flowctl-dispatch`'s `ApiError`/`error_status` pattern for the
//! agent boundary, applied here to the operator boundary.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use flowctl_deploy::DeployManager;
use flowctl_statemachine::{PromoteVariant, StateMachine};
use flowctl_store::{DeploymentFilter, ExperimentFilter, Store};
use flowctl_types::{
    Deployment, DeploymentId, DeploymentSnapshot, DeploymentStatus, Error, Experiment,
    ExperimentConfig, ExperimentId, ExperimentPhase, HostId, SuccessCriteria, TemplateRef,
    TemplateRegistry,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Shared state for the operator router.
#[derive(Clone)]
pub struct OperatorState {
    store: Arc<dyn Store>,
    deploy: DeployManager,
    machine: StateMachine,
    templates: Arc<dyn TemplateRegistry>,
    http: reqwest::Client,
    templates_url: String,
}

impl OperatorState {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        deploy: DeployManager,
        machine: StateMachine,
        templates: Arc<dyn TemplateRegistry>,
        templates_url: String,
    ) -> Self {
        Self {
            store,
            deploy,
            machine,
            templates,
            http: reqwest::Client::new(),
            templates_url,
        }
    }
}

/// Build the operator-facing router (spec §6, mounted at the root by the
/// caller alongside the agent and realtime routers).
pub fn router(state: OperatorState) -> Router {
    Router::new()
        .route("/v1/experiments", get(list_experiments).post(create_experiment))
        .route("/v1/experiments/:segment", get(get_experiment).post(experiment_action))
        .route("/v1/deployments", get(list_deployments).post(create_deployment))
        .route(
            "/v1/deployments/:segment",
            get(get_deployment).post(deployment_action).delete(delete_deployment),
        )
        .route("/v1/templates", get(list_templates))
        .route("/v1/templates/:name", get(get_template))
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

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = error_status(&self.0);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %self.0, "internal error at operator boundary");
        }
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

/// Splits a `{id}:{action}` path segment (spec §6: `POST
/// /v1/experiments/{id}:cancel`). Axum has no native syntax for a
/// colon-suffixed action within one path segment, so both the plain-id
/// and id:action routes share one `:segment` capture and branch here.
fn split_segment(segment: &str) -> (&str, Option<&str>) {
    match segment.split_once(':') {
        Some((id, action)) if !action.is_empty() => (id, Some(action)),
        _ => (segment, None),
    }
}

fn parse_experiment_phase(raw: &str) -> Option<ExperimentPhase> {
    match raw {
        "pending" => Some(ExperimentPhase::Pending),
        "initializing" => Some(ExperimentPhase::Initializing),
        "running" => Some(ExperimentPhase::Running),
        "analyzing" => Some(ExperimentPhase::Analyzing),
        "completed" => Some(ExperimentPhase::Completed),
        "failed" => Some(ExperimentPhase::Failed),
        "cancelled" => Some(ExperimentPhase::Cancelled),
        _ => None,
    }
}

fn parse_deployment_status(raw: &str) -> Option<DeploymentStatus> {
    match raw {
        "pending" => Some(DeploymentStatus::Pending),
        "deploying" => Some(DeploymentStatus::Deploying),
        "active" => Some(DeploymentStatus::Active),
        "updating" => Some(DeploymentStatus::Updating),
        "failed" => Some(DeploymentStatus::Failed),
        "deleting" => Some(DeploymentStatus::Deleting),
        _ => None,
    }
}

// -- Experiments ----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SuccessCriteriaBody {
    #[serde(rename = "minCardinalityReductionPct")]
    min_cardinality_reduction_pct: f64,
    #[serde(rename = "maxCpuOverheadPct")]
    max_cpu_overhead_pct: f64,
    #[serde(rename = "maxMemoryOverheadPct")]
    max_memory_overhead_pct: f64,
    #[serde(rename = "minCriticalProcessCoveragePct")]
    min_critical_process_coverage_pct: f64,
}

#[derive(Debug, Deserialize)]
struct CreateExperimentRequest {
    name: String,
    owner: String,
    tenant: String,
    #[serde(rename = "baselineTemplate")]
    baseline_template: String,
    #[serde(rename = "candidateTemplate")]
    candidate_template: String,
    #[serde(rename = "targetHosts")]
    target_hosts: Vec<String>,
    #[serde(rename = "durationSeconds")]
    duration_seconds: i64,
    #[serde(default)]
    variables: HashMap<String, String>,
    #[serde(rename = "successCriteria")]
    success_criteria: SuccessCriteriaBody,
}

async fn create_experiment(
    State(state): State<OperatorState>,
    Json(body): Json<CreateExperimentRequest>,
) -> Result<(StatusCode, Json<Experiment>), ApiError> {
    if body.duration_seconds <= 0 {
        return Err(Error::Validation("durationSeconds must be positive".to_string()).into());
    }
    let config = ExperimentConfig {
        baseline_template: TemplateRef::new(body.baseline_template),
        candidate_template: TemplateRef::new(body.candidate_template),
        target_hosts: body.target_hosts.into_iter().map(HostId::new).collect(),
        duration: chrono::Duration::seconds(body.duration_seconds),
        variables: body.variables,
        success_criteria: SuccessCriteria {
            min_cardinality_reduction_pct: body.success_criteria.min_cardinality_reduction_pct,
            max_cpu_overhead_pct: body.success_criteria.max_cpu_overhead_pct,
            max_memory_overhead_pct: body.success_criteria.max_memory_overhead_pct,
            min_critical_process_coverage_pct: body.success_criteria.min_critical_process_coverage_pct,
        },
    };
    let experiment = Experiment::new(body.name, body.owner, body.tenant, config, Utc::now());
    let experiment = state.store.create_experiment(experiment).await?;

    let machine = state.machine.clone();
    let id = experiment.id;
    tokio::spawn(async move {
        if let Err(err) = machine.start(id).await {
            warn!(experiment_id = %id, error = %err, "experiment failed to start");
            if let Err(fail_err) = machine.fail(id, err.to_string()).await {
                warn!(experiment_id = %id, error = %fail_err, "failed to record start failure");
            }
        }
    });

    Ok((StatusCode::CREATED, Json(experiment)))
}

#[derive(Debug, Deserialize)]
struct ListExperimentsQuery {
    status: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn list_experiments(
    State(state): State<OperatorState>,
    Query(query): Query<ListExperimentsQuery>,
) -> Result<Json<Vec<Experiment>>, ApiError> {
    let filter = ExperimentFilter {
        tenant: None,
        phase: query.status.as_deref().and_then(parse_experiment_phase),
    };
    let limit = query.limit.unwrap_or(50);
    let experiments = state.store.list_experiments(filter, limit, 0).await?;
    Ok(Json(experiments))
}

async fn get_experiment(
    State(state): State<OperatorState>,
    Path(segment): Path<String>,
) -> Result<Json<Experiment>, ApiError> {
    let (id, _) = split_segment(&segment);
    let id = ExperimentId::parse(id).map_err(|e| Error::Validation(e.to_string()))?;
    let experiment = state.store.get_experiment(id).await?;
    Ok(Json(experiment))
}

#[derive(Debug, Deserialize)]
struct PromoteQuery {
    variant: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ActionBody {
    reason: Option<String>,
}

async fn experiment_action(
    State(state): State<OperatorState>,
    Path(segment): Path<String>,
    Query(query): Query<PromoteQuery>,
    body: Option<Json<ActionBody>>,
) -> Result<Json<Experiment>, ApiError> {
    let (id, action) = split_segment(&segment);
    let id = ExperimentId::parse(id).map_err(|e| Error::Validation(e.to_string()))?;
    let reason = body.and_then(|Json(b)| b.reason);

    match action {
        Some("cancel") => {
            let experiment = state.machine.cancel(id, reason.unwrap_or_else(|| "operator cancelled".to_string())).await?;
            Ok(Json(experiment))
        }
        Some("promote") => {
            let variant = match query.variant.as_deref() {
                Some("baseline") => PromoteVariant::Baseline,
                Some("candidate") => PromoteVariant::Candidate,
                _ => return Err(Error::Validation("variant must be baseline or candidate".to_string()).into()),
            };
            let experiment = state
                .machine
                .promote(id, variant, reason.unwrap_or_else(|| "operator promote".to_string()))
                .await?;
            Ok(Json(experiment))
        }
        _ => Err(Error::Validation(format!("unknown experiment action in {segment:?}")).into()),
    }
}

// -- Deployments ------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateDeploymentRequest {
    name: String,
    namespace: String,
    #[serde(rename = "targetHosts")]
    target_hosts: Vec<String>,
    #[serde(rename = "templateName")]
    template_name: String,
    #[serde(default)]
    variables: HashMap<String, String>,
    #[serde(default = "default_actor")]
    actor: String,
}

fn default_actor() -> String {
    "operator".to_string()
}

async fn create_deployment(
    State(state): State<OperatorState>,
    Json(body): Json<CreateDeploymentRequest>,
) -> Result<(StatusCode, Json<Deployment>), ApiError> {
    let resolved = state.templates.resolve(&body.template_name, &body.variables).await?;
    let deployment = state
        .deploy
        .apply(
            body.name,
            body.namespace,
            body.target_hosts.into_iter().map(HostId::new).collect(),
            body.template_name,
            body.variables,
            resolved.content_hash,
            body.actor,
            None,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

#[derive(Debug, Deserialize)]
struct ListDeploymentsQuery {
    namespace: Option<String>,
    status: Option<String>,
}

async fn list_deployments(
    State(state): State<OperatorState>,
    Query(query): Query<ListDeploymentsQuery>,
) -> Result<Json<Vec<Deployment>>, ApiError> {
    let filter = DeploymentFilter {
        namespace: query.namespace,
        status: query.status.as_deref().and_then(parse_deployment_status),
        experiment_id: None,
        include_deleted: false,
    };
    let deployments = state.store.list_deployments(filter).await?;
    Ok(Json(deployments))
}

async fn get_deployment(
    State(state): State<OperatorState>,
    Path(segment): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
    let (id, _) = split_segment(&segment);
    let id = DeploymentId::parse(id).map_err(|e| Error::Validation(e.to_string()))?;
    let deployment = state.store.get_deployment(id).await?;
    Ok(Json(deployment))
}

#[derive(Debug, Deserialize)]
struct RollbackQuery {
    version: Option<u64>,
}

async fn deployment_action(
    State(state): State<OperatorState>,
    Path(segment): Path<String>,
    Query(query): Query<RollbackQuery>,
    body: Option<Json<ActionBody>>,
) -> Result<Json<Deployment>, ApiError> {
    let (id, action) = split_segment(&segment);
    let id = DeploymentId::parse(id).map_err(|e| Error::Validation(e.to_string()))?;
    let actor = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "operator".to_string());

    match action {
        Some("rollback") => {
            let version = query
                .version
                .ok_or_else(|| Error::Validation("version query parameter is required".to_string()))?;
            let history = state.store.list_deployment_history(id).await?;
            let entry = history
                .into_iter()
                .find(|h| h.new_state.get("version").and_then(serde_json::Value::as_u64) == Some(version))
                .ok_or_else(|| Error::NotFound(format!("deployment {id} has no history entry at version {version}")))?;
            let snapshot: DeploymentSnapshot = serde_json::from_value(
                entry.new_state.get("current").cloned().unwrap_or_default(),
            )
            .map_err(|e| Error::Internal(e.to_string()))?;
            let deployment = state
                .deploy
                .rollback(id, snapshot.template_name, snapshot.variables, snapshot.content_hash, actor)
                .await?;
            Ok(Json(deployment))
        }
        _ => Err(Error::Validation(format!("unknown deployment action in {segment:?}")).into()),
    }
}

async fn delete_deployment(
    State(state): State<OperatorState>,
    Path(segment): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
    let (id, _) = split_segment(&segment);
    let id = DeploymentId::parse(id).map_err(|e| Error::Validation(e.to_string()))?;
    let deployment = state.deploy.delete(id, "operator").await?;
    Ok(Json(deployment))
}

// -- Templates (direct read-through; `TemplateRegistry` only specifies
//    `resolve`/`validate`, so listing bypasses it and hits the collaborator
//    HTTP API directly) ------------------------------------------------------

async fn list_templates(State(state): State<OperatorState>) -> Result<Json<serde_json::Value>, ApiError> {
    let url = format!("{}/templates", state.templates_url.trim_end_matches('/'));
    let response = state.http.get(&url).send().await.map_err(|e| Error::Transient(e.to_string()))?;
    if !response.status().is_success() {
        return Err(Error::Transient(format!("template registry returned {}", response.status())).into());
    }
    let body: serde_json::Value = response.json().await.map_err(|e| Error::Internal(e.to_string()))?;
    Ok(Json(body))
}

async fn get_template(
    State(state): State<OperatorState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let url = format!("{}/templates/{name}", state.templates_url.trim_end_matches('/'));
    let response = state.http.get(&url).send().await.map_err(|e| Error::Transient(e.to_string()))?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(Error::NotFound(format!("template {name} not found")).into());
    }
    if !response.status().is_success() {
        return Err(Error::Transient(format!("template registry returned {}", response.status())).into());
    }
    let body: serde_json::Value = response.json().await.map_err(|e| Error::Internal(e.to_string()))?;
    Ok(Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_segment_separates_id_and_action() {
        assert_eq!(split_segment("abc:cancel"), ("abc", Some("cancel")));
        assert_eq!(split_segment("abc"), ("abc", None));
    }

    #[test]
    fn parse_experiment_phase_rejects_unknown_values() {
        assert_eq!(parse_experiment_phase("running"), Some(ExperimentPhase::Running));
        assert_eq!(parse_experiment_phase("bogus"), None);
    }
}
