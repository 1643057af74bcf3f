// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Process configuration, read once from the environment at startup
//! (spec §6, §9 `Context` value in place of ambient globals).

use std::env::VarError;
use std::time::Duration;
use thiserror::Error;

/// Failure loading configuration from the environment. Surfaced at
/// startup as exit code 64 (spec §6).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable was missing or empty.
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    /// A variable was present but not parseable as its expected type.
    #[error("invalid value for {name}: {value:?} ({source})")]
    Invalid {
        /// Offending variable name.
        name: &'static str,
        /// Offending raw value.
        value: String,
        /// Underlying parse error.
        source: std::num::ParseIntError,
    },
}

/// Runtime configuration for the `flowctl` controller (spec §6 env vars,
/// plus `TEMPLATES_URL` for the template-registry collaborator, which
/// `flowctl-server::collaborators` dials directly rather than reaching
/// through the operator-facing wire API).
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string for the Store Adapter.
    pub store_url: String,
    /// Endpoint for the metrics collaborator queried by the analyzer.
    pub metrics_url: Option<String>,
    /// Endpoint for the pipeline template registry collaborator.
    pub templates_url: String,
    /// Address the HTTP server binds to.
    pub listen_addr: String,
    /// Default task-lease duration.
    pub lease_ttl: Duration,
    /// Agent long-poll / heartbeat cadence.
    pub poll_interval: Duration,
    /// Deployment reconciler loop period.
    pub reconcile_interval: Duration,
    /// Task retry budget before dead-lettering.
    pub max_task_attempts: u32,
    /// Base of the exponential backoff schedule.
    pub backoff_base: Duration,
    /// Cap of the exponential backoff schedule.
    pub backoff_cap: Duration,
}

impl Config {
    /// Load configuration from the process environment, applying the
    /// documented defaults for everything but `STORE_URL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            store_url: require("STORE_URL")?,
            metrics_url: optional("METRICS_URL"),
            templates_url: optional("TEMPLATES_URL").unwrap_or_else(|| "http://localhost:8090".to_string()),
            listen_addr: optional("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            lease_ttl: Duration::from_secs(parse_u64("LEASE_TTL_SECONDS", 30)?),
            poll_interval: Duration::from_secs(parse_u64("POLL_INTERVAL_SECONDS", 10)?),
            reconcile_interval: Duration::from_secs(parse_u64("RECONCILE_INTERVAL_SECONDS", 15)?),
            max_task_attempts: parse_u64("MAX_TASK_ATTEMPTS", 5)? as u32,
            backoff_base: Duration::from_secs(parse_u64("BACKOFF_BASE_SECONDS", 2)?),
            backoff_cap: Duration::from_secs(parse_u64("BACKOFF_CAP_SECONDS", 300)?),
        })
    }
}

fn optional(name: &'static str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        Ok(_) | Err(VarError::NotPresent) => Err(ConfigError::Missing(name)),
        Err(VarError::NotUnicode(_)) => Err(ConfigError::Missing(name)),
    }
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match optional(name) {
        None => Ok(default),
        Some(raw) => raw.parse::<u64>().map_err(|source| ConfigError::Invalid {
            name,
            value: raw,
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear() {
        for key in [
            "STORE_URL",
            "METRICS_URL",
            "TEMPLATES_URL",
            "LISTEN_ADDR",
            "LEASE_TTL_SECONDS",
            "POLL_INTERVAL_SECONDS",
            "RECONCILE_INTERVAL_SECONDS",
            "MAX_TASK_ATTEMPTS",
            "BACKOFF_BASE_SECONDS",
            "BACKOFF_CAP_SECONDS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn missing_store_url_is_a_config_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear();
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("STORE_URL")));
    }

    #[test]
    fn defaults_apply_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear();
        std::env::set_var("STORE_URL", "postgres://localhost/flowctl");
        let config = Config::from_env().unwrap();
        assert_eq!(config.lease_ttl, Duration::from_secs(30));
        assert_eq!(config.max_task_attempts, 5);
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        clear();
    }

    #[test]
    fn invalid_integer_is_reported_with_the_offending_name() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear();
        std::env::set_var("STORE_URL", "postgres://localhost/flowctl");
        std::env::set_var("MAX_TASK_ATTEMPTS", "not-a-number");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "MAX_TASK_ATTEMPTS", .. }));
        clear();
    }
}
