// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Tracing/logging setup: an `EnvFilter` + fmt layer always, plus an
//! optional OTLP exporter when `OTEL_EXPORTER_OTLP_ENDPOINT` is set
//! (spec §10.1).

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Failure initializing the global tracing subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The OTLP exporter could not connect to its configured endpoint.
    #[error("failed to build OTLP exporter: {0}")]
    ExporterConnection(String),
    /// `tracing_subscriber` was already initialized (e.g. in tests).
    #[error("tracing subscriber already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Install the global `tracing` subscriber for `service_name`. Returns the
/// tracer provider; keep it alive until shutdown so buffered spans flush.
pub fn init(service_name: &str) -> Result<Option<SdkTracerProvider>, LoggingError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();
    let Some(endpoint) = otlp_endpoint else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;
        return Ok(None);
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .build()
        .map_err(|e| LoggingError::ExporterConnection(e.to_string()))?;

    let resource = Resource::builder_empty()
        .with_attributes(vec![KeyValue::new("service.name", service_name.to_string())])
        .build();

    let provider = SdkTracerProvider::builder()
        .with_resource(resource)
        .with_batch_exporter(exporter)
        .build();

    let tracer = provider.tracer(service_name.to_string());
    let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(telemetry_layer)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    Ok(Some(provider))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_without_otlp_endpoint_does_not_panic() {
        std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT");
        let result = init("flowctl-test");
        let _ = result;
    }
}
