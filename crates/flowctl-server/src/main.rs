// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! `flowctl`: the control-plane process. Wires the Store Adapter, Event
//! Bus, Task Queue, Agent Dispatch, Deployment Manager, State Machine,
//! Analyzer collaborators and Realtime Hub into one HTTP server (spec §4,
//! §6). Exit codes: 0 clean shutdown, 64 configuration error, 69 store
//! unavailable at startup, 70 an internal invariant was violated while
//! serving.

mod collaborators;
mod middleware;
mod operator;
mod shutdown;
mod startup;

use axum::{middleware::from_fn, routing::get, Router};
use collaborators::{HttpTemplateRegistry, PrometheusMetricsClient};
use flowctl_bus::EventBus;
use flowctl_deploy::DeployManager;
use flowctl_dispatch::DispatchState;
use flowctl_hub::HubState;
use flowctl_observability::{logging, metrics, Config};
use flowctl_queue::TaskQueue;
use flowctl_statemachine::StateMachine;
use flowctl_types::{MetricsClient, TemplateRegistry};
use operator::OperatorState;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const EXIT_OK: u8 = 0;
const EXIT_CONFIG: u8 = 64;
const EXIT_STORE_UNAVAILABLE: u8 = 69;
const EXIT_INTERNAL: u8 = 70;

fn main() -> ExitCode {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to start tokio runtime: {err}");
            return ExitCode::from(EXIT_INTERNAL);
        }
    };
    runtime.block_on(run())
}

async fn run() -> ExitCode {
    let _tracer_provider = match logging::init("flowctl") {
        Ok(provider) => provider,
        Err(err) => {
            eprintln!("failed to initialize logging: {err}");
            return ExitCode::from(EXIT_INTERNAL);
        }
    };

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration error");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let store = match startup::build_store(&config.store_url).await {
        Ok(store) => store,
        Err(err) => {
            error!(error = %err, "store unavailable at startup");
            return ExitCode::from(EXIT_STORE_UNAVAILABLE);
        }
    };

    let bus = EventBus::new();
    let queue = TaskQueue::new(Arc::clone(&store));
    let deploy = DeployManager::new(Arc::clone(&store), queue.clone());

    let metrics_client: Arc<dyn MetricsClient> = match &config.metrics_url {
        Some(url) => Arc::new(PrometheusMetricsClient::new(url.clone())),
        None => {
            info!("METRICS_URL unset, analyzer runs without a metrics backend");
            Arc::new(PrometheusMetricsClient::new("http://localhost:9090"))
        }
    };
    let templates: Arc<dyn TemplateRegistry> = Arc::new(HttpTemplateRegistry::new(config.templates_url.clone()));

    let machine = StateMachine::new(
        Arc::clone(&store),
        queue.clone(),
        deploy.clone(),
        Arc::clone(&templates),
        Arc::clone(&metrics_client),
        bus.clone(),
    );

    startup::recover(&store, &queue, &deploy).await;

    let cancel = CancellationToken::new();
    let mut background = Vec::new();
    background.push(queue.spawn_reaper(config.lease_ttl, cancel.clone()));
    background.push(deploy.spawn_reconciler(config.reconcile_interval, cancel.clone()));
    background.push(machine.spawn_poller(config.poll_interval, cancel.clone()));
    background.push(spawn_internal_worker(machine.clone(), config.poll_interval, cancel.clone()));
    background.push(flowctl_dispatch::spawn_offline_sweeper(
        Arc::clone(&store),
        config.poll_interval,
        chrono::Duration::from_std(config.poll_interval).unwrap_or(chrono::Duration::seconds(10)),
        cancel.clone(),
    ));

    let dispatch_state = DispatchState::new(Arc::clone(&store), queue.clone(), deploy.clone(), bus.clone());
    let hub_state = HubState::new(Arc::clone(&store), bus.clone());
    let operator_state = OperatorState::new(
        Arc::clone(&store),
        deploy.clone(),
        machine.clone(),
        Arc::clone(&templates),
        config.templates_url.clone(),
    );

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_endpoint))
        .with_state(Arc::clone(&store))
        .merge(flowctl_dispatch::router(dispatch_state))
        .merge(flowctl_hub::router(hub_state))
        .merge(operator::router(operator_state))
        .layer(from_fn(middleware::request_id))
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let listener = match TcpListener::bind(&config.listen_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, addr = %config.listen_addr, "failed to bind listen address");
            cancel.cancel();
            return ExitCode::from(EXIT_INTERNAL);
        }
    };
    info!(addr = %config.listen_addr, "flowctl listening");

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_and_cancel(cancel.clone()))
        .await;

    for handle in background {
        let _ = handle.await;
    }

    match serve_result {
        Ok(()) => {
            info!("shut down cleanly");
            ExitCode::from(EXIT_OK)
        }
        Err(err) => {
            error!(error = %err, "server exited with an error");
            ExitCode::from(EXIT_INTERNAL)
        }
    }
}

async fn shutdown_and_cancel(cancel: CancellationToken) {
    shutdown::signal().await;
    cancel.cancel();
}

/// Drains `TransitionPhase`/`AnalyzeExperiment` tasks the dispatcher's
/// `internal` worker lane accumulates between poller ticks. No convenience
/// wrapper exists upstream, so the loop lives here.
fn spawn_internal_worker(
    machine: StateMachine,
    interval: StdDuration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("internal worker shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    match flowctl_statemachine::run_internal_worker_once(&machine, "internal-worker").await {
                        Ok(handled) if handled > 0 => info!(handled, "internal worker processed tasks"),
                        Ok(_) => {}
                        Err(err) => tracing::warn!(error = %err, "internal worker pass failed"),
                    }
                }
            }
        }
    })
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(axum::extract::State(store): axum::extract::State<Arc<dyn flowctl_store::Store>>) -> axum::http::StatusCode {
    match store
        .list_experiments(flowctl_store::ExperimentFilter::default(), 1, 0)
        .await
    {
        Ok(_) => axum::http::StatusCode::OK,
        Err(err) => {
            tracing::warn!(error = %err, "readiness check failed");
            axum::http::StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn metrics_endpoint() -> String {
    metrics::encode()
}
