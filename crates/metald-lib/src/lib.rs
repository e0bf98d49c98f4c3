//! Control plane library for Firecracker micro-VM hosts
//!
//! This crate provides the core functionality for:
//! - VM lifecycle management over a hypervisor backend
//! - Reconciliation of recorded VM state against running processes
//! - Usage metering and aggregation for billing
//! - Health checks and observability

pub mod backend;
pub mod billing;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod models;
pub mod observability;
pub mod reconciler;
pub mod repository;

#[cfg(test)]
mod test_support;

pub use error::{CleanupError, RepositoryError, VmError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ControlPlaneMetrics, StructuredLogger};
