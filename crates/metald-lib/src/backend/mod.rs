//! Hypervisor backend abstraction
//!
//! The concrete backend (jailer process spawning, the Firecracker API) lives
//! outside this crate. The control plane only depends on the operations
//! below. Enumeration is an optional capability exposed via
//! [`Backend::as_lister`].

use crate::models::{MetricSample, VmConfig, VmState};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Point-in-time view of a VM as reported by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmInfo {
    pub vm_id: String,
    pub state: VmState,
    pub config: VmConfig,
    /// Pid of the Firecracker process, when one is running
    pub process_id: Option<u32>,
}

/// A VM known to a backend that supports enumeration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedVm {
    pub vm_id: String,
    pub state: VmState,
    pub config: VmConfig,
}

/// Hypervisor operations consumed by the control plane
#[async_trait]
pub trait Backend: Send + Sync {
    /// Create a VM and return its id
    async fn create_vm(&self, config: &VmConfig) -> Result<String>;

    async fn delete_vm(&self, vm_id: &str) -> Result<()>;

    async fn boot_vm(&self, vm_id: &str) -> Result<()>;

    async fn shutdown_vm(&self, vm_id: &str) -> Result<()>;

    /// Shut down with an explicit force flag and a graceful timeout
    async fn shutdown_vm_with_options(
        &self,
        vm_id: &str,
        force: bool,
        timeout_seconds: u32,
    ) -> Result<()>;

    async fn pause_vm(&self, vm_id: &str) -> Result<()>;

    async fn resume_vm(&self, vm_id: &str) -> Result<()>;

    async fn reboot_vm(&self, vm_id: &str) -> Result<()>;

    async fn get_vm_info(&self, vm_id: &str) -> Result<VmInfo>;

    /// Read the current raw counters for a VM
    async fn get_vm_metrics(&self, vm_id: &str) -> Result<MetricSample>;

    async fn ping(&self) -> Result<()>;

    /// Enumeration capability, if this backend supports it
    fn as_lister(&self) -> Option<&dyn VmLister> {
        None
    }
}

/// Optional capability for backends that can enumerate their VMs
pub trait VmLister: Send + Sync {
    fn list_vms(&self) -> Vec<ManagedVm>;
}
