// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Durable persistence for the FlowCtl control plane (spec component 4.A).
//!
//! The `Store` trait is the sole mutator of persisted state; every other
//! component reads and writes through it rather than touching a database
//! directly. Two implementations are provided: [`memory::InMemoryStore`]
//! for tests and single-node deployments, and [`postgres::PostgresStore`]
//! for durable multi-node deployments.

#![forbid(unsafe_code)]

pub mod memory;
pub mod postgres;
pub mod traits;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use traits::{backoff_duration, content_hash, DeploymentFilter, DeploymentPatch, ExperimentFilter, Store};
