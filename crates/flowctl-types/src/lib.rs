//! Shared data model, error taxonomy, and collaborator traits for the
//! FlowCtl experiment control plane.
//!
//! This crate has no I/O of its own; it exists so that `flowctl-store`,
//! `flowctl-queue`, `flowctl-deploy`, `flowctl-statemachine`,
//! `flowctl-analyzer`, `flowctl-dispatch`, and `flowctl-hub` can all agree
//! on the entities and errors described in spec §3 without depending on
//! each other.

#![forbid(unsafe_code)]

pub mod agent;
pub mod collaborators;
pub mod deployment;
pub mod error;
pub mod event;
pub mod experiment;
pub mod ids;
pub mod task;

pub use agent::{Agent, AgentStatus, ResourceSnapshot};
pub use collaborators::{MetricValue, MetricsClient, ResolvedTemplate, TemplateRegistry};
pub use deployment::{
    Deployment, DeploymentHistoryEntry, DeploymentPhase, DeploymentSnapshot, DeploymentStatus,
    HistoryAction, InstanceCounts,
};
pub use error::{Error, Result};
pub use event::{Event, EventEnvelope, EventKey, EventPayload, TaskOutcome};
pub use experiment::{
    Condition, Experiment, ExperimentConfig, ExperimentPhase, ExperimentResults, MetricDeltas,
    MetricSnapshot, Recommendation, SuccessCriteria, TemplateRef,
};
pub use ids::{DeploymentId, ExperimentId, HostId, TaskId};
pub use task::{Task, TaskKind, TaskPayload, TaskStatus};
