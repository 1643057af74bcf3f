// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Store construction and the startup recovery routine (spec §11
//! supplemented features: "in-memory state is rebuilt by reading
//! non-terminal experiments and active deployments").

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use flowctl_deploy::DeployManager;
use flowctl_queue::TaskQueue;
use flowctl_store::{ExperimentFilter, InMemoryStore, PostgresStore, Store};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Build the configured `Store` backend. `memory://` selects the
/// in-process store (used for local development and the scenario tests);
/// anything else is parsed as a Postgres connection string.
pub async fn build_store(store_url: &str) -> anyhow::Result<Arc<dyn Store>> {
    if store_url.starts_with("memory://") {
        info!("using in-memory store");
        return Ok(Arc::new(InMemoryStore::new()));
    }

    let pg_config = tokio_postgres::Config::from_str(store_url)?;
    let manager = Manager::from_config(
        pg_config,
        tokio_postgres::NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    let pool = Pool::builder(manager).max_size(16).build()?;
    let store = PostgresStore::connect(pool).await?;
    info!("connected to postgres store");
    Ok(Arc::new(store))
}

/// Reload non-terminal experiments and active deployments, and run one
/// reaper pass to requeue leases that expired while the controller was
/// down. Logged, never fatal: the periodic loops started right after
/// this will converge the same state anyway.
pub async fn recover(store: &Arc<dyn Store>, queue: &TaskQueue, deploy: &DeployManager) {
    match store
        .list_experiments(ExperimentFilter::default(), usize::MAX, 0)
        .await
    {
        Ok(experiments) => {
            let non_terminal = experiments.iter().filter(|e| !e.phase.is_terminal()).count();
            info!(non_terminal, total = experiments.len(), "recovered experiment state");
        }
        Err(err) => tracing::warn!(error = %err, "failed to list experiments during recovery"),
    }

    match deploy.reconcile_once().await {
        Ok(reconciled) => info!(reconciled, "ran initial deployment reconcile pass"),
        Err(err) => tracing::warn!(error = %err, "initial reconcile pass failed"),
    }

    match queue.reap_once().await {
        Ok(reaped) => info!(reaped = reaped.len(), "reaped expired leases from a prior run"),
        Err(err) => tracing::warn!(error = %err, "initial reaper pass failed"),
    }
}
