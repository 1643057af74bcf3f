// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! HTTP-backed implementations of the two out-of-scope collaborators
//! (spec §3/§4.G): a pipeline template registry and a Prometheus-compatible
//! metrics backend. Both traits are defined in `flowctl_types::collaborators`;
//! everything here is wire format.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowctl_types::{Error, MetricValue, MetricsClient, Result, ResolvedTemplate, TemplateRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn transient(err: reqwest::Error) -> Error {
    Error::Transient(err.to_string())
}

fn internal(err: reqwest::Error) -> Error {
    Error::Internal(err.to_string())
}

/// Queries a Prometheus-compatible instant-query API (spec §4.G: "an
/// instant-query API over a Prometheus-compatible backend, treated as
/// read-only").
pub struct PrometheusMetricsClient {
    client: reqwest::Client,
    base_url: String,
}

impl PrometheusMetricsClient {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct InstantQueryResponse {
    status: String,
    data: Option<InstantQueryData>,
}

#[derive(Debug, Deserialize)]
struct InstantQueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Vec<InstantSample>,
}

#[derive(Debug, Deserialize)]
struct InstantSample {
    metric: HashMap<String, String>,
    value: (f64, String),
}

#[async_trait]
impl MetricsClient for PrometheusMetricsClient {
    async fn query(&self, expr: &str, at: DateTime<Utc>) -> Result<MetricValue> {
        let url = format!("{}/api/v1/query", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .query(&[("query", expr), ("time", &at.timestamp().to_string())])
            .send()
            .await
            .map_err(transient)?;
        if !response.status().is_success() {
            return Err(Error::Transient(format!("metrics query returned {}", response.status())));
        }
        let body: InstantQueryResponse = response.json().await.map_err(internal)?;
        if body.status != "success" {
            return Err(Error::Transient(format!("metrics query status {}", body.status)));
        }
        let Some(data) = body.data else {
            return Ok(MetricValue::Vector(vec![]));
        };
        if data.result_type != "vector" {
            return Err(Error::Internal(format!("unsupported result type {}", data.result_type)));
        }
        let samples = data
            .result
            .into_iter()
            .map(|sample| {
                let label = sample
                    .metric
                    .get("variant")
                    .cloned()
                    .unwrap_or_else(|| "value".to_string());
                let value = sample.value.1.parse::<f64>().unwrap_or(f64::NAN);
                (label, value)
            })
            .collect();
        Ok(MetricValue::Vector(samples))
    }
}

/// Resolves and validates pipeline templates against an HTTP template
/// registry (spec §3, Pipeline Template: content itself is opaque, only
/// `resolve`/`validate` are specified).
pub struct HttpTemplateRegistry {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTemplateRegistry {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct VariablesBody<'a> {
    variables: &'a HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ResolveResponse {
    #[serde(rename = "configBlob")]
    config_blob: String,
    #[serde(rename = "contentHash")]
    content_hash: String,
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    errors: Vec<String>,
}

#[async_trait]
impl TemplateRegistry for HttpTemplateRegistry {
    async fn resolve(&self, name: &str, vars: &HashMap<String, String>) -> Result<ResolvedTemplate> {
        let url = format!("{}/templates/{name}/resolve", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&VariablesBody { variables: vars })
            .send()
            .await
            .map_err(transient)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("template {name} not found")));
        }
        if !response.status().is_success() {
            return Err(Error::Transient(format!("template resolve returned {}", response.status())));
        }
        let body: ResolveResponse = response.json().await.map_err(internal)?;
        Ok(ResolvedTemplate {
            config_blob: body.config_blob,
            content_hash: body.content_hash,
        })
    }

    async fn validate(&self, name: &str, vars: &HashMap<String, String>) -> Result<Vec<String>> {
        let url = format!("{}/templates/{name}/validate", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&VariablesBody { variables: vars })
            .send()
            .await
            .map_err(transient)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("template {name} not found")));
        }
        if !response.status().is_success() {
            return Err(Error::Transient(format!("template validate returned {}", response.status())));
        }
        let body: ValidateResponse = response.json().await.map_err(internal)?;
        Ok(body.errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clients_are_constructible_from_a_base_url() {
        let _metrics = PrometheusMetricsClient::new("http://metrics.internal:9090");
        let _templates = HttpTemplateRegistry::new("http://templates.internal:8081");
    }
}
