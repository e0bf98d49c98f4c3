//! VM persistence
//!
//! The repository is the system of record for VM state. Implementations must
//! report a missing (or soft-deleted) record as [`RepositoryError::NotFound`]
//! so callers can tell "already gone" apart from a storage failure.

mod memory;

pub use memory::InMemoryVmRepository;

use crate::error::RepositoryResult;
use crate::models::{PortMapping, Vm, VmState};
use async_trait::async_trait;

/// Filter for [`VmRepository::list_vms`]
#[derive(Debug, Clone, Default)]
pub struct VmFilter {
    pub customer_id: Option<String>,
    /// Empty means any state
    pub states: Vec<VmState>,
    /// Zero means no limit
    pub limit: usize,
    pub offset: usize,
}

impl VmFilter {
    pub fn customer(customer_id: impl Into<String>) -> Self {
        Self {
            customer_id: Some(customer_id.into()),
            ..Default::default()
        }
    }

    fn matches(&self, vm: &Vm) -> bool {
        if let Some(ref customer) = self.customer_id {
            if &vm.customer_id != customer {
                return false;
            }
        }
        self.states.is_empty() || self.states.contains(&vm.state)
    }
}

#[async_trait]
pub trait VmRepository: Send + Sync {
    async fn create_vm(&self, vm: Vm) -> RepositoryResult<()>;

    async fn get_vm(&self, vm_id: &str) -> RepositoryResult<Vm>;

    /// Set the state and process id, bumping `updated_at`
    async fn update_vm_state(
        &self,
        vm_id: &str,
        state: VmState,
        process_id: Option<u32>,
    ) -> RepositoryResult<()>;

    /// Non-deleted VMs matching the filter, ordered by creation time
    async fn list_vms(&self, filter: &VmFilter) -> RepositoryResult<Vec<Vm>>;

    /// All non-deleted VMs
    async fn list_all_vms(&self) -> RepositoryResult<Vec<Vm>>;

    /// Soft delete: sets `deleted_at`, keeps the record for audit
    async fn delete_vm(&self, vm_id: &str) -> RepositoryResult<()>;

    async fn count_vms(&self, customer_id: Option<&str>) -> RepositoryResult<usize>;

    async fn update_vm_port_mappings(
        &self,
        vm_id: &str,
        port_mappings: Vec<PortMapping>,
    ) -> RepositoryResult<()>;
}
