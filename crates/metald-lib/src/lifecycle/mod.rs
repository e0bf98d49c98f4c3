//! VM lifecycle management
//!
//! This module provides:
//! - Request validation for VM configurations and ids
//! - The lifecycle service driving the backend and the repository
//! - Bounded-retry cleanup decoupled from caller cancellation

mod cleanup;
mod service;
mod validation;


pub use cleanup::{
    perform_vm_cleanup, CLEANUP_GRACE_PERIOD, CLEANUP_MAX_ATTEMPTS, CLEANUP_RETRY_BACKOFF,
};
pub use service::{CreateVmResponse, VmService};
pub use validation::{validate_vm_config, validate_vm_id};

use anyhow::Result;
use async_trait::async_trait;

/// Customer id used when a request carries no tenant
pub const DEFAULT_CUSTOMER_ID: &str = "default";

/// Per-request context supplied by the transport layer
///
/// The caller is already authenticated; the tenant is carried through
/// unchanged.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub customer_id: Option<String>,
}

impl RequestContext {
    pub fn for_customer(customer_id: impl Into<String>) -> Self {
        Self {
            customer_id: Some(customer_id.into()),
        }
    }

    /// Tenant of the request, if the transport supplied a non-empty one
    pub fn customer_id(&self) -> Option<&str> {
        self.customer_id.as_deref().filter(|c| !c.is_empty())
    }
}

/// Hooks into per-VM resource metrics collection
#[async_trait]
pub trait CollectionHooks: Send + Sync {
    async fn start_collection(&self, vm_id: &str, customer_id: &str) -> Result<()>;

    async fn stop_collection(&self, vm_id: &str) -> Result<()>;
}
