// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Comparative metric analysis for experiments (spec component 4.G):
//! queries the metrics collaborator for both variants, computes deltas
//! against the operator's success criteria, and produces a scored
//! [`Recommendation`].

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use flowctl_types::{
    Experiment, ExperimentResults, MetricDeltas, MetricSnapshot, MetricsClient, Recommendation,
    SuccessCriteria,
};
use tracing::debug;

const TRACKED_METRICS: [&str; 5] =
    ["cpu_usage", "memory_usage", "process_count", "cardinality", "throughput"];

/// Penalty applied to confidence per missing delta (spec §4.G step 3: the
/// confidence score is reduced by missing-data flags).
const MISSING_DELTA_PENALTY: f64 = 0.15;

/// Minimum confidence required to promote a candidate that meets its
/// criteria (spec §4.G step 5). Below this, the verdict is `Neutral`
/// rather than `Promote` even though the thresholds were met.
const PROMOTE_CONFIDENCE_THRESHOLD: f64 = 0.7;

fn variant_query(metric: &str, experiment: &Experiment, variant: &str) -> String {
    format!(
        "{metric}{{experiment_id=\"{}\",variant=\"{variant}\"}}",
        experiment.id
    )
}

async fn snapshot(
    client: &dyn MetricsClient,
    experiment: &Experiment,
    variant: &str,
    at: DateTime<Utc>,
) -> MetricSnapshot {
    let mut values = [None; 5];
    for (i, metric) in TRACKED_METRICS.iter().enumerate() {
        let expr = variant_query(metric, experiment, variant);
        values[i] = match client.query(&expr, at).await {
            Ok(value) => value.as_scalar(),
            Err(err) => {
                debug!(metric, variant, error = %err, "metric query failed, treating as missing");
                None
            }
        };
    }
    MetricSnapshot {
        cpu_usage_pct: values[0],
        memory_usage_mb: values[1],
        process_count: values[2],
        cardinality: values[3],
        throughput: values[4],
    }
}

/// Compute deltas between `baseline` and `candidate` (spec §4.G step 2).
/// A delta is `None` exactly when its inputs are missing or the
/// denominator would be non-positive — NaN/Inf never escape as a value.
#[must_use]
pub fn compute_deltas(baseline: &MetricSnapshot, candidate: &MetricSnapshot) -> MetricDeltas {
    let cardinality_reduction = match (baseline.cardinality, candidate.cardinality) {
        (Some(b), Some(c)) if b > 0.0 => Some(((b - c) / b) * 100.0),
        _ => None,
    };
    let cpu_overhead = match (baseline.cpu_usage_pct, candidate.cpu_usage_pct) {
        (Some(b), Some(c)) => Some(c - b),
        _ => None,
    };
    let memory_overhead = match (baseline.memory_usage_mb, candidate.memory_usage_mb) {
        (Some(b), Some(c)) => Some(c - b),
        _ => None,
    };
    let process_coverage = match (baseline.process_count, candidate.process_count) {
        (Some(b), Some(c)) if b > 0.0 => Some((c / b).clamp(0.0, 1.0) * 100.0),
        _ => None,
    };
    MetricDeltas {
        cardinality_reduction,
        cpu_overhead,
        memory_overhead,
        process_coverage,
    }
}

/// Confidence in `[0, 1]`: starts at 1.0, loses `MISSING_DELTA_PENALTY`
/// per missing delta, and is scaled by how much of the configured
/// duration has actually elapsed (spec §4.G step 3). Strictly
/// non-decreasing as missing data decreases or elapsed time increases —
/// the monotonicity property exercised in this crate's tests.
#[must_use]
pub fn compute_confidence(deltas: &MetricDeltas, elapsed_fraction: f64) -> f64 {
    let missing = [
        deltas.cardinality_reduction.is_none(),
        deltas.cpu_overhead.is_none(),
        deltas.memory_overhead.is_none(),
        deltas.process_coverage.is_none(),
    ]
    .iter()
    .filter(|m| **m)
    .count();
    let completeness = 1.0 - (missing as f64 * MISSING_DELTA_PENALTY);
    (completeness.clamp(0.0, 1.0) * elapsed_fraction.clamp(0.0, 1.0)).clamp(0.0, 1.0)
}

/// Evaluate `deltas` against `criteria`. `None` if any required delta is
/// missing (undecidable); otherwise whether every threshold is met.
#[must_use]
pub fn meets_criteria(deltas: &MetricDeltas, criteria: &SuccessCriteria) -> Option<bool> {
    let cardinality_ok = deltas.cardinality_reduction? >= criteria.min_cardinality_reduction_pct;
    let cpu_ok = deltas.cpu_overhead? <= criteria.max_cpu_overhead_pct;
    let memory_ok = deltas.memory_overhead? <= criteria.max_memory_overhead_pct;
    let coverage_ok = deltas.process_coverage? >= criteria.min_critical_process_coverage_pct;
    Some(cardinality_ok && cpu_ok && memory_ok && coverage_ok)
}

fn render_report(
    baseline: &MetricSnapshot,
    candidate: &MetricSnapshot,
    deltas: &MetricDeltas,
    recommendation: Recommendation,
    confidence: f64,
) -> String {
    format!(
        "recommendation={recommendation:?} confidence={confidence:.2} \
         cardinality_reduction={:?}% cpu_overhead={:?}pp memory_overhead={:?}MB process_coverage={:?}% \
         (baseline_cardinality={:?}, candidate_cardinality={:?})",
        deltas.cardinality_reduction,
        deltas.cpu_overhead,
        deltas.memory_overhead,
        deltas.process_coverage,
        baseline.cardinality,
        candidate.cardinality,
    )
}

/// Run the analyzer for `experiment` at instant `now` (spec §4.G).
pub async fn analyze(
    client: &dyn MetricsClient,
    experiment: &Experiment,
    now: DateTime<Utc>,
) -> ExperimentResults {
    let baseline = snapshot(client, experiment, "baseline", now).await;
    let candidate = snapshot(client, experiment, "candidate", now).await;
    let deltas = compute_deltas(&baseline, &candidate);

    let elapsed_fraction = match experiment.start_time {
        Some(start) => {
            let elapsed = (now - start).num_milliseconds().max(0) as f64;
            let total = experiment.config.duration.num_milliseconds().max(1) as f64;
            (elapsed / total).min(1.0)
        }
        None => 0.0,
    };
    let confidence = compute_confidence(&deltas, elapsed_fraction);
    let duration_expired = elapsed_fraction >= 1.0;

    let recommendation = match meets_criteria(&deltas, &experiment.config.success_criteria) {
        Some(true) if confidence >= PROMOTE_CONFIDENCE_THRESHOLD => Recommendation::Promote,
        Some(true) => Recommendation::Neutral,
        Some(false) if duration_expired => Recommendation::Reject,
        Some(false) => Recommendation::Continue,
        None if duration_expired => Recommendation::Neutral,
        None => Recommendation::Continue,
    };

    let report = render_report(&baseline, &candidate, &deltas, recommendation, confidence);
    ExperimentResults {
        baseline,
        candidate,
        deltas,
        recommendation,
        confidence,
        report,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flowctl_types::{
        Error, ExperimentConfig, HostId, MetricValue, Result, TemplateRef,
    };
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FixedMetrics {
        values: Mutex<HashMap<String, f64>>,
    }

    impl FixedMetrics {
        fn new(values: Vec<(&str, f64)>) -> Self {
            Self {
                values: Mutex::new(values.into_iter().map(|(k, v)| (k.to_string(), v)).collect()),
            }
        }
    }

    #[async_trait]
    impl MetricsClient for FixedMetrics {
        async fn query(&self, expr: &str, _at: DateTime<Utc>) -> Result<MetricValue> {
            let metric = expr.split('{').next().unwrap_or(expr);
            let variant = if expr.contains("baseline") { "baseline" } else { "candidate" };
            let key = format!("{metric}:{variant}");
            self.values
                .lock()
                .unwrap()
                .get(&key)
                .map(|v| MetricValue::Scalar(*v))
                .ok_or_else(|| Error::NotFound(format!("no fixture for {key}")))
        }
    }

    fn criteria() -> SuccessCriteria {
        SuccessCriteria {
            min_cardinality_reduction_pct: 50.0,
            max_cpu_overhead_pct: 5.0,
            max_memory_overhead_pct: 10.0,
            min_critical_process_coverage_pct: 95.0,
        }
    }

    fn experiment(started: bool) -> Experiment {
        let config = ExperimentConfig {
            baseline_template: TemplateRef::new("base-v1"),
            candidate_template: TemplateRef::new("topk-20"),
            target_hosts: vec![HostId::new("h1")],
            duration: chrono::Duration::seconds(600),
            variables: HashMap::new(),
            success_criteria: criteria(),
        };
        let now = Utc::now();
        let mut exp = Experiment::new("e1", "alice", "t1", config, now);
        if started {
            exp.start_time = Some(now - chrono::Duration::seconds(600));
        }
        exp
    }

    #[tokio::test]
    async fn promotes_when_all_criteria_met() {
        let client = FixedMetrics::new(vec![
            ("cpu_usage:baseline", 20.0),
            ("cpu_usage:candidate", 22.0),
            ("memory_usage:baseline", 500.0),
            ("memory_usage:candidate", 505.0),
            ("process_count:baseline", 10.0),
            ("process_count:candidate", 10.0),
            ("cardinality:baseline", 1_000_000.0),
            ("cardinality:candidate", 400_000.0),
            ("throughput:baseline", 5000.0),
            ("throughput:candidate", 5000.0),
        ]);
        let exp = experiment(true);
        let results = analyze(&client, &exp, Utc::now()).await;
        assert_eq!(results.recommendation, Recommendation::Promote);
        assert!(results.confidence > 0.9);
    }

    #[tokio::test]
    async fn rejects_when_criteria_fail_after_duration_expiry() {
        let client = FixedMetrics::new(vec![
            ("cpu_usage:baseline", 20.0),
            ("cpu_usage:candidate", 40.0),
            ("memory_usage:baseline", 500.0),
            ("memory_usage:candidate", 505.0),
            ("process_count:baseline", 10.0),
            ("process_count:candidate", 10.0),
            ("cardinality:baseline", 1_000_000.0),
            ("cardinality:candidate", 400_000.0),
            ("throughput:baseline", 5000.0),
            ("throughput:candidate", 5000.0),
        ]);
        let exp = experiment(true);
        let results = analyze(&client, &exp, Utc::now()).await;
        assert_eq!(results.recommendation, Recommendation::Reject);
    }

    #[tokio::test]
    async fn passing_criteria_with_low_confidence_is_neutral_not_promote() {
        let client = FixedMetrics::new(vec![
            ("cpu_usage:baseline", 20.0),
            ("cpu_usage:candidate", 22.0),
            ("memory_usage:baseline", 500.0),
            ("memory_usage:candidate", 505.0),
            ("process_count:baseline", 10.0),
            ("process_count:candidate", 10.0),
            ("cardinality:baseline", 1_000_000.0),
            ("cardinality:candidate", 400_000.0),
            ("throughput:baseline", 5000.0),
            ("throughput:candidate", 5000.0),
        ]);
        let mut exp = experiment(true);
        // Half the window elapsed: deltas already clear every threshold but
        // confidence (completeness * elapsed_fraction) sits at ~0.5, below
        // the promote gate.
        exp.start_time = Some(Utc::now() - chrono::Duration::seconds(300));
        let results = analyze(&client, &exp, Utc::now()).await;
        assert_eq!(results.recommendation, Recommendation::Neutral);
        assert!(results.confidence < PROMOTE_CONFIDENCE_THRESHOLD);
    }

    #[tokio::test]
    async fn continues_when_criteria_fail_before_duration_expiry() {
        let client = FixedMetrics::new(vec![
            ("cpu_usage:baseline", 20.0),
            ("cpu_usage:candidate", 40.0),
            ("memory_usage:baseline", 500.0),
            ("memory_usage:candidate", 505.0),
            ("process_count:baseline", 10.0),
            ("process_count:candidate", 10.0),
            ("cardinality:baseline", 1_000_000.0),
            ("cardinality:candidate", 400_000.0),
            ("throughput:baseline", 5000.0),
            ("throughput:candidate", 5000.0),
        ]);
        let mut exp = experiment(true);
        exp.start_time = Some(Utc::now());
        let results = analyze(&client, &exp, Utc::now()).await;
        assert_eq!(results.recommendation, Recommendation::Continue);
    }

    #[tokio::test]
    async fn missing_data_after_expiry_is_neutral_not_reject() {
        let client = FixedMetrics::new(vec![
            ("cpu_usage:baseline", 20.0),
            ("cpu_usage:candidate", 22.0),
        ]);
        let exp = experiment(true);
        let results = analyze(&client, &exp, Utc::now()).await;
        assert_eq!(results.recommendation, Recommendation::Neutral);
        assert!(results.confidence < 0.5);
    }

    #[test]
    fn confidence_is_monotonic_in_completeness() {
        let complete = MetricDeltas {
            cardinality_reduction: Some(60.0),
            cpu_overhead: Some(2.0),
            memory_overhead: Some(3.0),
            process_coverage: Some(100.0),
        };
        let mut partial = complete;
        partial.process_coverage = None;
        assert!(compute_confidence(&complete, 1.0) > compute_confidence(&partial, 1.0));
    }

    #[test]
    fn confidence_is_monotonic_in_elapsed_time() {
        let deltas = MetricDeltas {
            cardinality_reduction: Some(60.0),
            cpu_overhead: Some(2.0),
            memory_overhead: Some(3.0),
            process_coverage: Some(100.0),
        };
        assert!(compute_confidence(&deltas, 1.0) > compute_confidence(&deltas, 0.5));
    }

    #[test]
    fn cardinality_reduction_missing_when_baseline_zero() {
        let baseline = MetricSnapshot {
            cardinality: Some(0.0),
            ..Default::default()
        };
        let candidate = MetricSnapshot {
            cardinality: Some(10.0),
            ..Default::default()
        };
        let deltas = compute_deltas(&baseline, &candidate);
        assert_eq!(deltas.cardinality_reduction, None);
    }
}
