//! Updater library for vertical pod autoscaling
//!
//! This crate provides the core functionality for:
//! - The reconciliation loop that applies resource recommendations to pods
//! - In-place resize with fallback to eviction
//! - Shared token-bucket rate limits on disruption
//! - Kubernetes-backed listers, resolvers and disruptors
//! - Health checks and observability

pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod models;
pub mod observability;
pub mod priority;
pub mod ratelimit;
pub mod recommendation;
pub mod restriction;
pub mod selector;
pub mod status;
pub mod target;
pub mod updater;

pub use config::UpdaterConfig;
pub use error::UpdaterError;
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{StructuredLogger, UpdaterMetrics};
pub use updater::{CycleOutcome, Updater, UpdaterBuilder, UpdaterLoop, WorkloadOutcome};
