//! The `Experiment` entity (spec §3): a time-bounded A/B comparison between
//! a baseline and a candidate pipeline configuration on a set of hosts.

use crate::ids::{ExperimentId, HostId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A reference to a pipeline template: an opaque catalog entry owned by the
/// external template-registry collaborator (spec §3, Pipeline Template).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRef {
    /// Template name, e.g. `"otel-collector-baseline"`.
    pub name: String,
}

impl TemplateRef {
    /// Construct a template reference from its name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// The experiment lifecycle phase (spec §3 invariants, §4.F transition
/// table). `Completed`, `Failed`, and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentPhase {
    /// Created by the operator, not yet acted on.
    Pending,
    /// Validating templates and deploying both variants.
    Initializing,
    /// Both variants deployed and collecting comparative metrics.
    Running,
    /// Duration elapsed; the analyzer is scoring the run.
    Analyzing,
    /// Terminal: analysis completed with a non-rejecting recommendation.
    Completed,
    /// Terminal: a handler or the analyzer determined the run failed.
    Failed,
    /// Terminal: cancelled by operator request.
    Cancelled,
}

impl ExperimentPhase {
    /// Terminal phases freeze the record (spec §3 invariant).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExperimentPhase::Completed | ExperimentPhase::Failed | ExperimentPhase::Cancelled
        )
    }

    /// The transition table from spec §4.F. Returns `true` iff `self -> to`
    /// is a valid transition.
    #[must_use]
    pub fn can_transition_to(self, to: ExperimentPhase) -> bool {
        use ExperimentPhase::{Analyzing, Cancelled, Completed, Failed, Initializing, Pending, Running};
        matches!(
            (self, to),
            (Pending, Initializing)
                | (Pending, Cancelled)
                | (Initializing, Running)
                | (Initializing, Failed)
                | (Initializing, Cancelled)
                | (Running, Analyzing)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Analyzing, Completed)
                | (Analyzing, Failed)
        )
    }
}

/// One entry in an experiment's ordered condition history: a transition
/// with a timestamp and an operator/system-supplied reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Phase the experiment moved into.
    pub phase: ExperimentPhase,
    /// When the transition was recorded.
    pub timestamp: DateTime<Utc>,
    /// Human-readable reason (error text, operator note, or a fixed
    /// message for routine transitions).
    pub reason: String,
}

/// The four numeric success thresholds an operator sets when creating an
/// experiment (spec §3, §4.G).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SuccessCriteria {
    /// Minimum acceptable fractional cardinality reduction, in percent
    /// (e.g. `50.0` means the candidate must cut cardinality by ≥ 50%).
    pub min_cardinality_reduction_pct: f64,
    /// Maximum acceptable CPU overhead, in percentage points.
    pub max_cpu_overhead_pct: f64,
    /// Maximum acceptable memory overhead, in percentage points.
    pub max_memory_overhead_pct: f64,
    /// Minimum acceptable critical-process coverage, in percent.
    pub min_critical_process_coverage_pct: f64,
}

/// Immutable-post-create configuration for an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Baseline pipeline template.
    pub baseline_template: TemplateRef,
    /// Candidate pipeline template.
    pub candidate_template: TemplateRef,
    /// Ordered set of target host ids. Order is preserved for deterministic
    /// task fan-out but target membership, not order, is what matters
    /// semantically.
    pub target_hosts: Vec<HostId>,
    /// Total run duration once `Running` begins.
    pub duration: chrono::Duration,
    /// Template variable substitutions shared by both variants.
    pub variables: HashMap<String, String>,
    /// Promote/reject/continue thresholds.
    pub success_criteria: SuccessCriteria,
}

/// A point-in-time snapshot of the five tracked metrics for one pipeline
/// variant, as returned by the metrics collaborator (spec §4.G step 1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    /// CPU utilization, in percent.
    pub cpu_usage_pct: Option<f64>,
    /// Resident memory, in megabytes.
    pub memory_usage_mb: Option<f64>,
    /// Count of critical processes observed reporting metrics.
    pub process_count: Option<f64>,
    /// Unique metric series cardinality.
    pub cardinality: Option<f64>,
    /// Samples/sec throughput.
    pub throughput: Option<f64>,
}

/// Per-metric deltas computed by the analyzer (spec §4.G step 2).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricDeltas {
    /// `(baseline_card - candidate_card) / baseline_card`. `None` if
    /// baseline cardinality is missing or `<= 0`.
    pub cardinality_reduction: Option<f64>,
    /// `candidate_cpu - baseline_cpu`, in percentage points.
    pub cpu_overhead: Option<f64>,
    /// `candidate_mem - baseline_mem`, in megabytes.
    pub memory_overhead: Option<f64>,
    /// `candidate_processes / baseline_critical_processes`, clamped to
    /// `[0, 1]`.
    pub process_coverage: Option<f64>,
}

/// The analyzer's final verdict (spec §4.G step 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    /// Adopt the candidate.
    Promote,
    /// Reject the candidate; keep the baseline.
    Reject,
    /// Not enough data yet; keep running (only valid pre-duration-expiry).
    Continue,
    /// Data is complete but inconclusive.
    Neutral,
}

/// Results written once, on analysis (spec §3, §4.G).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentResults {
    /// Baseline metric snapshot.
    pub baseline: MetricSnapshot,
    /// Candidate metric snapshot.
    pub candidate: MetricSnapshot,
    /// Computed deltas.
    pub deltas: MetricDeltas,
    /// The recommendation.
    pub recommendation: Recommendation,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Free-form report text for operators.
    pub report: String,
}

/// The `Experiment` entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    /// Opaque stable identifier.
    pub id: ExperimentId,
    /// Human-readable name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Owning operator.
    pub owner: String,
    /// Opaque tenant tag (spec §1 Non-goals: no multi-tenancy beyond this).
    pub tenant: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-update timestamp.
    pub updated_at: DateTime<Utc>,
    /// Set exactly when the phase first becomes `Running`.
    pub start_time: Option<DateTime<Utc>>,
    /// Set exactly when the phase becomes terminal.
    pub end_time: Option<DateTime<Utc>>,
    /// Current lifecycle phase.
    pub phase: ExperimentPhase,
    /// Current human-readable status message.
    pub status_message: String,
    /// Ordered transition history.
    pub conditions: Vec<Condition>,
    /// Immutable-post-create configuration.
    pub config: ExperimentConfig,
    /// Results, set once on analysis.
    pub results: Option<ExperimentResults>,
    /// Optimistic-concurrency token, bumped on every write.
    pub version: u64,
}

impl Experiment {
    /// Construct a new experiment in `Pending` phase.
    pub fn new(
        name: impl Into<String>,
        owner: impl Into<String>,
        tenant: impl Into<String>,
        config: ExperimentConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ExperimentId::new(),
            name: name.into(),
            description: String::new(),
            owner: owner.into(),
            tenant: tenant.into(),
            created_at: now,
            updated_at: now,
            start_time: None,
            end_time: None,
            phase: ExperimentPhase::Pending,
            status_message: "created".to_string(),
            conditions: Vec::new(),
            config,
            results: None,
            version: 0,
        }
    }

    /// Apply a validated phase transition, appending a condition and
    /// bumping bookkeeping fields. Callers (the store adapter) are
    /// responsible for checking `can_transition_to` first; this method
    /// trusts its caller, matching `UpdateExperimentPhase`'s documented
    /// compare-and-swap contract.
    pub fn apply_transition(&mut self, to: ExperimentPhase, reason: impl Into<String>, now: DateTime<Utc>) {
        if to == ExperimentPhase::Running && self.start_time.is_none() {
            self.start_time = Some(now);
        }
        if to.is_terminal() {
            self.end_time = Some(now);
        }
        self.phase = to;
        self.status_message = reason.into();
        self.conditions.push(Condition {
            phase: to,
            timestamp: now,
            reason: self.status_message.clone(),
        });
        self.updated_at = now;
        self.version += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn criteria() -> SuccessCriteria {
        SuccessCriteria {
            min_cardinality_reduction_pct: 50.0,
            max_cpu_overhead_pct: 5.0,
            max_memory_overhead_pct: 10.0,
            min_critical_process_coverage_pct: 95.0,
        }
    }

    fn config() -> ExperimentConfig {
        ExperimentConfig {
            baseline_template: TemplateRef::new("base-v1"),
            candidate_template: TemplateRef::new("topk-20"),
            target_hosts: vec![HostId::new("h1"), HostId::new("h2")],
            duration: chrono::Duration::seconds(60),
            variables: HashMap::new(),
            success_criteria: criteria(),
        }
    }

    #[test]
    fn transition_table_matches_spec() {
        use ExperimentPhase::*;
        assert!(Pending.can_transition_to(Initializing));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Running));
        assert!(Initializing.can_transition_to(Running));
        assert!(Running.can_transition_to(Analyzing));
        assert!(Analyzing.can_transition_to(Completed));
        assert!(!Analyzing.can_transition_to(Running));
        for terminal in [Completed, Failed, Cancelled] {
            for to in [Pending, Initializing, Running, Analyzing, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(to), "{terminal:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn apply_transition_sets_start_time_once() {
        let now = Utc::now();
        let mut exp = Experiment::new("e1", "op", "t1", config(), now);
        exp.apply_transition(ExperimentPhase::Initializing, "init", now);
        assert!(exp.start_time.is_none());
        let later = now + chrono::Duration::seconds(5);
        exp.apply_transition(ExperimentPhase::Running, "running", later);
        assert_eq!(exp.start_time, Some(later));
        let even_later = later + chrono::Duration::seconds(5);
        // Re-entering Running is invalid per the transition table, but
        // apply_transition trusts its caller; check idempotence of the
        // start_time guard in isolation by not re-calling with Running.
        exp.apply_transition(ExperimentPhase::Failed, "boom", even_later);
        assert_eq!(exp.start_time, Some(later));
        assert_eq!(exp.end_time, Some(even_later));
        assert_eq!(exp.conditions.len(), 3);
        assert_eq!(exp.version, 3);
    }
}
