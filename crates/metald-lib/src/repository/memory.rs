//! In-memory VM repository
//!
//! Concurrent map-backed store with soft-delete semantics. Used as the
//! default engine for single-node deployments and in tests.

use super::{VmFilter, VmRepository};
use crate::error::{RepositoryError, RepositoryResult};
use crate::models::{PortMapping, Vm, VmState};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;

/// Repository keeping every record, including soft-deleted ones, in memory
#[derive(Debug, Default)]
pub struct InMemoryVmRepository {
    vms: DashMap<String, Vm>,
}

impl InMemoryVmRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a record regardless of its deletion status
    pub fn get_record(&self, vm_id: &str) -> Option<Vm> {
        self.vms.get(vm_id).map(|r| r.clone())
    }

    /// Number of records, including soft-deleted ones
    pub fn len(&self) -> usize {
        self.vms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }

    fn live(&self) -> Vec<Vm> {
        let mut vms: Vec<Vm> = self
            .vms
            .iter()
            .filter(|r| !r.value().is_deleted())
            .map(|r| r.value().clone())
            .collect();
        vms.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        vms
    }
}

#[async_trait]
impl VmRepository for InMemoryVmRepository {
    async fn create_vm(&self, vm: Vm) -> RepositoryResult<()> {
        use dashmap::mapref::entry::Entry;

        match self.vms.entry(vm.id.clone()) {
            Entry::Occupied(_) => Err(RepositoryError::AlreadyExists(vm.id)),
            Entry::Vacant(slot) => {
                debug!(vm_id = %vm.id, customer_id = %vm.customer_id, "Storing vm record");
                slot.insert(vm);
                Ok(())
            }
        }
    }

    async fn get_vm(&self, vm_id: &str) -> RepositoryResult<Vm> {
        self.vms
            .get(vm_id)
            .filter(|r| !r.is_deleted())
            .map(|r| r.clone())
            .ok_or_else(|| RepositoryError::NotFound(vm_id.to_string()))
    }

    async fn update_vm_state(
        &self,
        vm_id: &str,
        state: VmState,
        process_id: Option<u32>,
    ) -> RepositoryResult<()> {
        let mut entry = self
            .vms
            .get_mut(vm_id)
            .filter(|r| !r.is_deleted())
            .ok_or_else(|| RepositoryError::NotFound(vm_id.to_string()))?;

        entry.state = state;
        entry.process_id = process_id;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn list_vms(&self, filter: &VmFilter) -> RepositoryResult<Vec<Vm>> {
        let matching = self
            .live()
            .into_iter()
            .filter(|vm| filter.matches(vm))
            .skip(filter.offset);

        Ok(if filter.limit > 0 {
            matching.take(filter.limit).collect()
        } else {
            matching.collect()
        })
    }

    async fn list_all_vms(&self) -> RepositoryResult<Vec<Vm>> {
        Ok(self.live())
    }

    async fn delete_vm(&self, vm_id: &str) -> RepositoryResult<()> {
        let mut entry = self
            .vms
            .get_mut(vm_id)
            .filter(|r| !r.is_deleted())
            .ok_or_else(|| RepositoryError::NotFound(vm_id.to_string()))?;

        let now = Utc::now();
        entry.deleted_at = Some(now);
        entry.updated_at = now;
        Ok(())
    }

    async fn count_vms(&self, customer_id: Option<&str>) -> RepositoryResult<usize> {
        Ok(self
            .vms
            .iter()
            .filter(|r| !r.is_deleted())
            .filter(|r| customer_id.map_or(true, |c| r.customer_id == c))
            .count())
    }

    async fn update_vm_port_mappings(
        &self,
        vm_id: &str,
        port_mappings: Vec<PortMapping>,
    ) -> RepositoryResult<()> {
        let mut entry = self
            .vms
            .get_mut(vm_id)
            .filter(|r| !r.is_deleted())
            .ok_or_else(|| RepositoryError::NotFound(vm_id.to_string()))?;

        entry.port_mappings = port_mappings;
        entry.updated_at = Utc::now();
        Ok(())
    }
}
