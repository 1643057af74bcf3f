// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Ambient stack shared by every `flowctl` binary and crate: process
//! configuration, logging/tracing setup, and Prometheus metrics
//! (spec §10.1, §10.3, §10.4). Has no knowledge of the experiment domain.

#![forbid(unsafe_code)]

pub mod config;
pub mod logging;
pub mod metrics;

pub use config::{Config, ConfigError};
pub use logging::LoggingError;
