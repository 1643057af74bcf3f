//! Trait interfaces for the two out-of-scope external collaborators named
//! in spec §1/§3/§4.G: the pipeline template registry and the metrics
//! query backend. Pipeline *content* and the metrics storage engine are
//! explicitly out of scope; only the interface is specified here.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Resolution result for a template: a canonical config blob plus its
/// content hash (spec §3, Pipeline Template).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTemplate {
    /// The canonical, opaque configuration blob (e.g. rendered YAML).
    pub config_blob: String,
    /// A stable content hash of `config_blob`, used for deploy-task
    /// idempotence (spec §4.E).
    pub content_hash: String,
}

/// The pipeline template registry collaborator (spec §3, §4.F). Pipeline
/// content itself — the YAML/OTel collector config — is opaque to this
/// crate; only `resolve` and `validate` are specified.
#[async_trait]
pub trait TemplateRegistry: Send + Sync {
    /// Resolve `name` with `vars` substituted in, returning the canonical
    /// blob and its content hash.
    async fn resolve(&self, name: &str, vars: &HashMap<String, String>) -> Result<ResolvedTemplate>;

    /// Validate `name`/`vars`, returning the set of validation errors (empty
    /// iff valid).
    async fn validate(&self, name: &str, vars: &HashMap<String, String>) -> Result<Vec<String>>;
}

/// One value returned by the metrics collaborator's instant-query API
/// (spec §4.G).
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    /// A single scalar result.
    Scalar(f64),
    /// A labeled vector result (label value, sample value) pairs.
    Vector(Vec<(String, f64)>),
}

impl MetricValue {
    /// Reduce a query result to a single scalar the analyzer can use,
    /// summing vector samples (the analyzer's five tracked metrics are
    /// all either already scalar or meant to be aggregated across the
    /// matched series). Returns `None` for an empty vector or a `NaN`
    /// scalar — NaN propagates as missing-data per spec §4.G's numeric
    /// policy, never as a value.
    #[must_use]
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            MetricValue::Scalar(v) => (!v.is_nan()).then_some(*v),
            MetricValue::Vector(items) => {
                if items.is_empty() {
                    return None;
                }
                let sum: f64 = items.iter().map(|(_, v)| v).sum();
                (!sum.is_nan()).then_some(sum)
            }
        }
    }
}

/// The metrics-query collaborator (spec §4.G): an instant-query API over
/// a Prometheus-compatible backend, treated as read-only.
#[async_trait]
pub trait MetricsClient: Send + Sync {
    /// Evaluate `expr` at instant `at`. Query-level failures are returned
    /// as `Err`; the analyzer treats any `Err` as a missing-data flag for
    /// that metric rather than propagating the failure.
    async fn query(&self, expr: &str, at: DateTime<Utc>) -> Result<MetricValue>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_scalar_is_missing() {
        let v = MetricValue::Scalar(f64::NAN);
        assert_eq!(v.as_scalar(), None);
    }

    #[test]
    fn empty_vector_is_missing() {
        let v = MetricValue::Vector(vec![]);
        assert_eq!(v.as_scalar(), None);
    }

    #[test]
    fn vector_sums_samples() {
        let v = MetricValue::Vector(vec![("a".into(), 1.5), ("b".into(), 2.5)]);
        assert_eq!(v.as_scalar(), Some(4.0));
    }
}
