// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)
// M-624-style metric name centralization: one place for every
// flowctl_* series, so components never hand-roll a name string twice.

//! Prometheus metrics shared by every component (spec §10.4).
//!
//! Metrics are `LazyLock`-initialized against the process-global default
//! registry. Registration failures (e.g. a metric already registered by
//! an earlier call in the same process) are logged and the existing
//! series is reused rather than panicking, the same defensive posture
//! `dashflow-streaming::metrics_utils` takes for a multi-binary crate.

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, Opts, TextEncoder,
};
use std::sync::LazyLock;
use tracing::warn;

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let metric = IntCounterVec::new(Opts::new(name, help), labels)
        .unwrap_or_else(|e| panic!("invalid metric definition for {name}: {e}"));
    if let Err(e) = prometheus::default_registry().register(Box::new(metric.clone())) {
        warn!(metric = name, error = %e, "metric registration failed; reusing existing series");
    }
    metric
}

fn histogram(name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    let metric = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .unwrap_or_else(|e| panic!("invalid metric definition for {name}: {e}"));
    if let Err(e) = prometheus::default_registry().register(Box::new(metric.clone())) {
        warn!(metric = name, error = %e, "metric registration failed; reusing existing series");
    }
    metric
}

fn histogram_vec(name: &str, help: &str, buckets: Vec<f64>, labels: &[&str]) -> HistogramVec {
    let metric = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .unwrap_or_else(|e| panic!("invalid metric definition for {name}: {e}"));
    if let Err(e) = prometheus::default_registry().register(Box::new(metric.clone())) {
        warn!(metric = name, error = %e, "metric registration failed; reusing existing series");
    }
    metric
}

/// Tasks enqueued, labeled by `kind`.
pub static TASKS_ENQUEUED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec("flowctl_tasks_enqueued_total", "Total tasks enqueued, by kind", &["kind"])
});
/// Tasks leased, labeled by `kind`.
pub static TASKS_LEASED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec("flowctl_tasks_leased_total", "Total tasks leased, by kind", &["kind"])
});
/// Tasks acked, labeled by `kind`.
pub static TASKS_ACKED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec("flowctl_tasks_acked_total", "Total tasks acked, by kind", &["kind"])
});
/// Tasks nacked, labeled by `kind`.
pub static TASKS_NACKED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec("flowctl_tasks_nacked_total", "Total tasks nacked, by kind", &["kind"])
});
/// Tasks dead-lettered after exhausting their retry budget, labeled by `kind`.
pub static TASKS_DEAD_LETTERED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec(
        "flowctl_tasks_dead_lettered_total",
        "Total tasks dead-lettered, by kind",
        &["kind"],
    )
});
/// Visibility-timeout reaper sweeps performed.
pub static REAPER_SWEEPS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec("flowctl_reaper_sweeps_total", "Total reaper sweep passes run", &["outcome"])
});

/// Events published on the bus, labeled by `event_type`.
pub static EVENTS_PUBLISHED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec(
        "flowctl_events_published_total",
        "Total events published on the bus, by type",
        &["event_type"],
    )
});
/// Events dropped due to subscriber backpressure, labeled by `event_type`.
pub static EVENTS_DROPPED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec(
        "flowctl_events_dropped_total",
        "Total events dropped for a backpressured subscriber, by type",
        &["event_type"],
    )
});

/// Wall-clock duration of one deployment-reconciler pass.
pub static RECONCILE_DURATION_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    histogram(
        "flowctl_reconcile_duration_seconds",
        "Duration of one deployment reconcile pass",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
    )
});

/// HTTP request latency, labeled by `route` and `status`.
pub static HTTP_REQUEST_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    histogram_vec(
        "flowctl_http_request_duration_seconds",
        "HTTP request latency, by route and status",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5],
        &["route", "status"],
    )
});

/// Render every registered metric in Prometheus text exposition format
/// (spec §10.4: `GET /metrics`).
#[must_use]
pub fn encode() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::default_registry().gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        warn!(error = %e, "failed to encode metrics");
        return String::from("# error encoding metrics\n");
    }
    String::from_utf8(buffer).unwrap_or_else(|_| String::from("# metrics output was not valid utf-8\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_includes_registered_series() {
        TASKS_ENQUEUED_TOTAL.with_label_values(&["deploy_pipeline"]).inc();
        let output = encode();
        assert!(output.contains("flowctl_tasks_enqueued_total"));
    }

    #[test]
    fn http_duration_histogram_observes() {
        HTTP_REQUEST_DURATION_SECONDS
            .with_label_values(&["/v1/experiments", "200"])
            .observe(0.02);
        let output = encode();
        assert!(output.contains("flowctl_http_request_duration_seconds"));
    }
}
