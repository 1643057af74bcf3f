// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Experiment lifecycle orchestration (spec component 4.F): validated
//! transitions, phase handlers, and the mapping from handler failure
//! kind to retry-vs-terminal behavior.

#![forbid(unsafe_code)]

use chrono::Utc;
use flowctl_bus::EventBus;
use flowctl_deploy::DeployManager;
use flowctl_queue::TaskQueue;
use flowctl_store::Store;
use flowctl_types::{
    DeploymentId, Error, Event, EventPayload, Experiment, ExperimentId, ExperimentPhase,
    MetricsClient, Result, TaskKind, TaskPayload, TemplateRegistry,
};
use std::sync::Arc;
use std::time::Duration as StdDuration;
#[cfg(test)]
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Prefix for deployments the state machine creates on behalf of an
/// experiment's baseline variant.
const BASELINE_SUFFIX: &str = "baseline";
/// Prefix for deployments the state machine creates on behalf of an
/// experiment's candidate variant.
const CANDIDATE_SUFFIX: &str = "candidate";

/// Which variant an operator override (spec §6 `:promote`) declares the
/// winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoteVariant {
    /// Keep the baseline; reject the candidate.
    Baseline,
    /// Adopt the candidate.
    Candidate,
}

/// Orchestrates one experiment's lifecycle (spec §4.F).
#[derive(Clone)]
pub struct StateMachine {
    store: Arc<dyn Store>,
    queue: TaskQueue,
    deploy: DeployManager,
    templates: Arc<dyn TemplateRegistry>,
    metrics: Arc<dyn MetricsClient>,
    bus: EventBus,
}

impl StateMachine {
    /// Wire the state machine to its collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        queue: TaskQueue,
        deploy: DeployManager,
        templates: Arc<dyn TemplateRegistry>,
        metrics: Arc<dyn MetricsClient>,
        bus: EventBus,
    ) -> Self {
        Self {
            store,
            queue,
            deploy,
            templates,
            metrics,
            bus,
        }
    }

    fn publish_update(&self, experiment: &Experiment) {
        self.bus.publish(Event::new(
            EventPayload::ExperimentUpdate {
                experiment_id: experiment.id,
                phase: experiment.phase,
                status_message: experiment.status_message.clone(),
            },
            Utc::now(),
        ));
    }

    async fn transition(&self, id: ExperimentId, to: ExperimentPhase, reason: impl Into<String>) -> Result<Experiment> {
        let experiment = self
            .store
            .update_experiment_phase(id, None, to, reason.into())
            .await?;
        self.publish_update(&experiment);
        Ok(experiment)
    }

    /// Name for the baseline/candidate deployment created on behalf of
    /// `experiment`.
    fn deployment_name(experiment: &Experiment, suffix: &str) -> String {
        format!("exp-{}-{suffix}", experiment.id)
    }

    /// `Pending -> Initializing`: validate both templates, then deploy
    /// baseline and candidate to the target hosts. Validation failure is
    /// not retryable (spec §4.F: validation errors map to `Failed`
    /// directly); deploy-issuance failure is transient and retried by
    /// the caller.
    pub async fn start(&self, id: ExperimentId) -> Result<Experiment> {
        let experiment = self.store.get_experiment(id).await?;
        self.transition(id, ExperimentPhase::Initializing, "initializing").await?;

        for (template, variant) in [
            (&experiment.config.baseline_template, "baseline"),
            (&experiment.config.candidate_template, "candidate"),
        ] {
            let errors = self
                .templates
                .validate(&template.name, &experiment.config.variables)
                .await?;
            if !errors.is_empty() {
                self.transition(
                    id,
                    ExperimentPhase::Failed,
                    format!("{variant} template invalid: {}", errors.join("; ")),
                )
                .await?;
                return self.store.get_experiment(id).await;
            }
        }

        if let Err(err) = self.deploy_variants(&experiment).await {
            warn!(experiment_id = %id, error = %err, "failed to deploy variants");
            return Err(err);
        }

        self.transition(id, ExperimentPhase::Running, "both variants deploying").await
    }

    async fn deploy_variants(&self, experiment: &Experiment) -> Result<(DeploymentId, DeploymentId)> {
        let hosts = experiment.config.target_hosts.clone();
        let variables = experiment.config.variables.clone();

        let baseline = self.templates.resolve(&experiment.config.baseline_template.name, &variables).await?;
        let baseline_dep = self
            .deploy
            .apply(
                Self::deployment_name(experiment, BASELINE_SUFFIX),
                "default",
                hosts.clone(),
                experiment.config.baseline_template.name.clone(),
                variables.clone(),
                baseline.content_hash,
                "state-machine",
                Some(experiment.id),
            )
            .await?;

        let candidate = self.templates.resolve(&experiment.config.candidate_template.name, &variables).await?;
        let candidate_dep = self
            .deploy
            .apply(
                Self::deployment_name(experiment, CANDIDATE_SUFFIX),
                "default",
                hosts,
                experiment.config.candidate_template.name.clone(),
                variables,
                candidate.content_hash,
                "state-machine",
                Some(experiment.id),
            )
            .await?;

        Ok((baseline_dep.id, candidate_dep.id))
    }

    /// `Running -> Analyzing`: called once `now >= start_time + duration`.
    /// Enqueues the analysis task rather than running it inline, so a
    /// crash between transition and analysis is recovered by the
    /// existing task retry mechanism.
    pub async fn begin_analysis(&self, id: ExperimentId) -> Result<Experiment> {
        let experiment = self.transition(id, ExperimentPhase::Analyzing, "analyzing").await?;
        self.queue
            .enqueue(flowctl_types::Task::new(
                TaskPayload::AnalyzeExperiment { experiment_id: id },
                Some(id),
                3,
                Utc::now(),
            ))
            .await?;
        Ok(experiment)
    }

    /// Run the analyzer for `id` and apply its recommendation. `Promote`
    /// and `Neutral` move the experiment to `Completed`; `Reject` moves it
    /// to `Failed` and tears down its deployments, same as an operator
    /// `cancel` (spec §4.G step 6). The recommendation itself, stored in
    /// `results`, is what the operator sees either way. `Continue` leaves
    /// the experiment in `Analyzing` for a later retry of this same task.
    pub async fn analyze(&self, id: ExperimentId) -> Result<Experiment> {
        let experiment = self.store.get_experiment(id).await?;
        if experiment.phase != ExperimentPhase::Analyzing {
            return Err(Error::Conflict(format!(
                "experiment {id} is not in Analyzing (found {:?})",
                experiment.phase
            )));
        }
        let results = flowctl_analyzer::analyze(self.metrics.as_ref(), &experiment, Utc::now()).await;
        let recommendation = results.recommendation;
        let experiment = self.store.set_experiment_results(id, results).await?;

        match recommendation {
            flowctl_types::Recommendation::Continue => {
                info!(experiment_id = %id, "analysis inconclusive, continuing to collect data");
                Err(Error::Transient("insufficient data, retry analysis later".to_string()))
            }
            flowctl_types::Recommendation::Reject => {
                let failed = self
                    .transition(id, ExperimentPhase::Failed, format!("{recommendation:?}"))
                    .await
                    .map(|mut failed| {
                        failed.results = experiment.results;
                        failed
                    })?;
                self.cleanup_deployments(id, "rejection").await?;
                Ok(failed)
            }
            _ => self
                .transition(id, ExperimentPhase::Completed, format!("{recommendation:?}"))
                .await
                .map(|mut completed| {
                    completed.results = experiment.results;
                    completed
                }),
        }
    }

    /// Cancel an experiment from any non-terminal phase, tearing down any
    /// deployments created on its behalf (spec §4.F: cancellation must
    /// clean up every touched host, not just the ones that reached
    /// `ready`).
    pub async fn cancel(&self, id: ExperimentId, reason: impl Into<String>) -> Result<Experiment> {
        let experiment = self.transition(id, ExperimentPhase::Cancelled, reason.into()).await?;
        self.cleanup_deployments(id, "cancellation").await?;
        Ok(experiment)
    }

    /// Mark an experiment `Failed` the first time any handler reports a
    /// terminal failure. Idempotent: a second caller racing on an
    /// already-`Failed` (or otherwise terminal) experiment gets back the
    /// unchanged record rather than an error, so "first failure wins"
    /// without the caller needing its own locking.
    pub async fn fail(&self, id: ExperimentId, reason: impl Into<String>) -> Result<Experiment> {
        let current = self.store.get_experiment(id).await?;
        if current.phase.is_terminal() {
            return Ok(current);
        }
        let experiment = self.transition(id, ExperimentPhase::Failed, reason.into()).await?;
        self.cleanup_deployments(id, "failure handling").await?;
        Ok(experiment)
    }

    /// Delete every deployment an experiment touched. Shared by `cancel`,
    /// `fail`, and `analyze`'s `Reject` path — any terminal phase other
    /// than `Completed` must leave no running deployment behind.
    async fn cleanup_deployments(&self, id: ExperimentId, context: &str) -> Result<()> {
        let deployments = self
            .store
            .list_deployments(flowctl_store::DeploymentFilter {
                experiment_id: Some(id),
                ..Default::default()
            })
            .await?;
        for deployment in deployments {
            if let Err(err) = self.deploy.delete(deployment.id, "state-machine").await {
                warn!(deployment_id = %deployment.id, error = %err, "cleanup delete failed during {context}");
            }
        }
        Ok(())
    }

    /// Poll loop body: advance every non-terminal experiment whose
    /// condition for its next transition has been met. Returns the
    /// number of experiments advanced.
    pub async fn tick(&self) -> Result<usize> {
        let running = self
            .store
            .list_experiments(
                flowctl_store::ExperimentFilter {
                    phase: Some(ExperimentPhase::Running),
                    ..Default::default()
                },
                usize::MAX,
                0,
            )
            .await?;
        let now = Utc::now();
        let mut advanced = 0;
        for experiment in running {
            let Some(start) = experiment.start_time else { continue };
            if now >= start + experiment.config.duration {
                self.begin_analysis(experiment.id).await?;
                advanced += 1;
            }
        }
        Ok(advanced)
    }

    /// Operator override (spec §6 `:promote`): force a recommendation
    /// onto a still-running or still-analyzing experiment and drive it
    /// straight to `Completed`, bypassing the analyzer. Reuses whatever
    /// metric snapshots the last analysis pass recorded, if any, so the
    /// forced result still carries real numbers when they're available.
    pub async fn promote(
        &self,
        id: ExperimentId,
        variant: PromoteVariant,
        reason: impl Into<String>,
    ) -> Result<Experiment> {
        let reason = reason.into();
        let experiment = self.store.get_experiment(id).await?;
        if experiment.phase.is_terminal() {
            return Err(Error::Conflict(format!(
                "experiment {id} is already terminal ({:?})",
                experiment.phase
            )));
        }

        let (baseline, candidate, deltas) = experiment
            .results
            .as_ref()
            .map(|r| (r.baseline, r.candidate, r.deltas))
            .unwrap_or_default();
        let recommendation = match variant {
            PromoteVariant::Baseline => flowctl_types::Recommendation::Reject,
            PromoteVariant::Candidate => flowctl_types::Recommendation::Promote,
        };
        let results = flowctl_types::ExperimentResults {
            baseline,
            candidate,
            deltas,
            recommendation,
            confidence: 1.0,
            report: format!("operator override: promoted {variant:?} ({reason})"),
        };
        self.store.set_experiment_results(id, results).await?;

        if experiment.phase == ExperimentPhase::Running {
            self.transition(id, ExperimentPhase::Analyzing, "operator override").await?;
        }
        self.transition(id, ExperimentPhase::Completed, reason).await
    }

    /// Spawn a background loop calling `tick` on `interval` until
    /// `cancel` fires.
    pub fn spawn_poller(&self, interval: StdDuration, cancel: CancellationToken) -> JoinHandle<()> {
        let machine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("state machine poller shutting down");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = machine.tick().await {
                            warn!(error = %err, "state machine tick failed");
                        }
                    }
                }
            }
        })
    }
}

/// Lease and dispatch internal (non-agent-bound) tasks — `TransitionPhase`
/// and `AnalyzeExperiment` — to the appropriate `StateMachine` method.
/// Run as a background worker alongside `spawn_poller`.
pub async fn run_internal_worker_once(machine: &StateMachine, worker_id: &str) -> Result<usize> {
    let host = flowctl_types::HostId::new("internal");
    let leased = machine
        .queue
        .lease(worker_id, &host, &[TaskKind::TransitionPhase, TaskKind::AnalyzeExperiment], 16)
        .await?;
    let mut handled = 0;
    for task in leased {
        let result = match &task.payload {
            TaskPayload::TransitionPhase { experiment_id, to_phase } => {
                machine.transition(*experiment_id, *to_phase, "scheduled transition").await.map(|_| ())
            }
            TaskPayload::AnalyzeExperiment { experiment_id } => machine.analyze(*experiment_id).await.map(|_| ()),
            _ => Ok(()),
        };
        match result {
            Ok(()) => {
                machine.queue.ack(task.id).await?;
                handled += 1;
            }
            Err(err) if err.is_retryable() => {
                machine.queue.nack(task.id, err.to_string()).await?;
            }
            Err(err) => {
                warn!(task_id = %task.id, error = %err, "internal task failed non-retryably");
                machine.queue.nack(task.id, err.to_string()).await?;
            }
        }
    }
    Ok(handled)
}
