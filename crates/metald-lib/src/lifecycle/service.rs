//! VM lifecycle service
//!
//! Validates requests, delegates to the hypervisor backend and records the
//! resulting state transition in the repository. Backend errors surface as
//! `VmError::Internal` and are never retried here; the only retrying path
//! is the bounded cleanup used for deletion.

use super::cleanup::perform_vm_cleanup;
use super::validation::{validate_vm_config, validate_vm_id};
use super::{CollectionHooks, RequestContext, DEFAULT_CUSTOMER_ID};
use crate::backend::{Backend, ManagedVm, VmInfo};
use crate::error::{RepositoryError, VmError, VmResult};
use crate::models::{Vm, VmConfig, VmState};
use crate::observability::ControlPlaneMetrics;
use crate::repository::VmRepository;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of a successful `create_vm`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateVmResponse {
    pub vm_id: String,
    pub state: VmState,
}

pub struct VmService {
    backend: Arc<dyn Backend>,
    repository: Arc<dyn VmRepository>,
    collection: Option<Arc<dyn CollectionHooks>>,
    metrics: ControlPlaneMetrics,
}

impl VmService {
    pub fn new(backend: Arc<dyn Backend>, repository: Arc<dyn VmRepository>) -> Self {
        Self {
            backend,
            repository,
            collection: None,
            metrics: ControlPlaneMetrics::new(),
        }
    }

    /// Attach metrics collection hooks driven by boot, shutdown and delete
    pub fn with_collection(mut self, hooks: Arc<dyn CollectionHooks>) -> Self {
        self.collection = Some(hooks);
        self
    }

    pub async fn create_vm(
        &self,
        ctx: &RequestContext,
        config: VmConfig,
    ) -> VmResult<CreateVmResponse> {
        let result = self.create_vm_inner(ctx, config).await;
        self.finish("create_vm", result)
    }

    async fn create_vm_inner(
        &self,
        ctx: &RequestContext,
        config: VmConfig,
    ) -> VmResult<CreateVmResponse> {
        if let Err(e) = validate_vm_config(&config) {
            warn!(customer_id = ?ctx.customer_id(), error = %e, "Rejected vm configuration");
            return Err(e);
        }

        let customer_id = self.customer_or_default(ctx, "create_vm");

        let vm_id = self.backend.create_vm(&config).await.map_err(|e| {
            error!(customer_id = %customer_id, error = %e, "Backend failed to create vm");
            VmError::internal("failed to create vm", e)
        })?;

        if let Err(e) = self
            .repository
            .create_vm(Vm::new(&vm_id, &customer_id, config))
            .await
        {
            error!(vm_id = %vm_id, customer_id = %customer_id, error = %e, "Failed to persist vm, rolling back");
            if let Err(cleanup_err) = perform_vm_cleanup(self.backend.clone(), &vm_id).await {
                error!(
                    vm_id = %vm_id,
                    error = %cleanup_err,
                    "Rollback cleanup failed, reconciliation will retire the vm"
                );
            }
            return Err(VmError::internal(
                format!("failed to persist vm {}", vm_id),
                e.into(),
            ));
        }

        info!(vm_id = %vm_id, customer_id = %customer_id, "VM created");

        Ok(CreateVmResponse {
            vm_id,
            state: VmState::Created,
        })
    }

    pub async fn delete_vm(&self, ctx: &RequestContext, vm_id: &str) -> VmResult<()> {
        let result = self.delete_vm_inner(ctx, vm_id).await;
        self.finish("delete_vm", result)
    }

    async fn delete_vm_inner(&self, ctx: &RequestContext, vm_id: &str) -> VmResult<()> {
        validate_vm_id(vm_id)?;

        // Billing must not see samples from a VM that is being torn down
        self.stop_collection(vm_id).await;

        perform_vm_cleanup(self.backend.clone(), vm_id)
            .await
            .map_err(|e| {
                error!(vm_id = %vm_id, customer_id = ?ctx.customer_id(), error = %e, "Failed to delete vm");
                VmError::internal(format!("failed to delete vm {}", vm_id), e.into())
            })?;

        match self.repository.delete_vm(vm_id).await {
            Ok(()) => {}
            Err(RepositoryError::NotFound(_)) => {
                info!(vm_id = %vm_id, "VM record already gone");
            }
            Err(e) => return Err(self.repository_error(vm_id, e)),
        }

        info!(vm_id = %vm_id, customer_id = ?ctx.customer_id(), "VM deleted");
        Ok(())
    }

    pub async fn boot_vm(&self, ctx: &RequestContext, vm_id: &str) -> VmResult<VmState> {
        let result = self.boot_vm_inner(ctx, vm_id).await;
        self.finish("boot_vm", result)
    }

    async fn boot_vm_inner(&self, ctx: &RequestContext, vm_id: &str) -> VmResult<VmState> {
        validate_vm_id(vm_id)?;

        self.backend
            .boot_vm(vm_id)
            .await
            .map_err(|e| self.backend_error("boot", vm_id, ctx, e))?;

        let process_id = self.backend_process_id(vm_id).await;
        self.transition(vm_id, VmState::Running, process_id).await?;

        // Metered only once the record says running
        let customer_id = self.customer_or_default(ctx, "boot_vm");
        if let Some(ref hooks) = self.collection {
            if let Err(e) = hooks.start_collection(vm_id, &customer_id).await {
                warn!(
                    vm_id = %vm_id,
                    customer_id = %customer_id,
                    error = %e,
                    "Failed to start metrics collection, vm booted without billing"
                );
            }
        }

        info!(vm_id = %vm_id, customer_id = %customer_id, process_id = ?process_id, "VM booted");
        Ok(VmState::Running)
    }

    pub async fn shutdown_vm(
        &self,
        ctx: &RequestContext,
        vm_id: &str,
        force: bool,
        timeout_seconds: u32,
    ) -> VmResult<VmState> {
        let result = self
            .shutdown_vm_inner(ctx, vm_id, force, timeout_seconds)
            .await;
        self.finish("shutdown_vm", result)
    }

    async fn shutdown_vm_inner(
        &self,
        ctx: &RequestContext,
        vm_id: &str,
        force: bool,
        timeout_seconds: u32,
    ) -> VmResult<VmState> {
        validate_vm_id(vm_id)?;

        self.stop_collection(vm_id).await;

        self.backend
            .shutdown_vm_with_options(vm_id, force, timeout_seconds)
            .await
            .map_err(|e| self.backend_error("shutdown", vm_id, ctx, e))?;

        self.transition(vm_id, VmState::Shutdown, None).await?;

        info!(vm_id = %vm_id, force = force, timeout_seconds = timeout_seconds, "VM shut down");
        Ok(VmState::Shutdown)
    }

    pub async fn pause_vm(&self, ctx: &RequestContext, vm_id: &str) -> VmResult<VmState> {
        let result = async {
            validate_vm_id(vm_id)?;
            self.backend
                .pause_vm(vm_id)
                .await
                .map_err(|e| self.backend_error("pause", vm_id, ctx, e))?;
            let process_id = self.backend_process_id(vm_id).await;
            self.transition(vm_id, VmState::Paused, process_id).await?;
            Ok::<_, VmError>(VmState::Paused)
        }
        .await;
        self.finish("pause_vm", result)
    }

    pub async fn resume_vm(&self, ctx: &RequestContext, vm_id: &str) -> VmResult<VmState> {
        let result = async {
            validate_vm_id(vm_id)?;
            self.backend
                .resume_vm(vm_id)
                .await
                .map_err(|e| self.backend_error("resume", vm_id, ctx, e))?;
            let process_id = self.backend_process_id(vm_id).await;
            self.transition(vm_id, VmState::Running, process_id).await?;
            Ok::<_, VmError>(VmState::Running)
        }
        .await;
        self.finish("resume_vm", result)
    }

    pub async fn reboot_vm(&self, ctx: &RequestContext, vm_id: &str) -> VmResult<VmState> {
        let result = async {
            validate_vm_id(vm_id)?;
            self.backend
                .reboot_vm(vm_id)
                .await
                .map_err(|e| self.backend_error("reboot", vm_id, ctx, e))?;
            let process_id = self.backend_process_id(vm_id).await;
            self.transition(vm_id, VmState::Running, process_id).await?;
            Ok::<_, VmError>(VmState::Running)
        }
        .await;
        self.finish("reboot_vm", result)
    }

    pub async fn get_vm_info(&self, ctx: &RequestContext, vm_id: &str) -> VmResult<VmInfo> {
        let result = async {
            validate_vm_id(vm_id)?;
            self.backend
                .get_vm_info(vm_id)
                .await
                .map_err(|e| self.backend_error("get_info", vm_id, ctx, e))
        }
        .await;
        self.finish("get_vm_info", result)
    }

    /// VMs known to the backend; empty when it cannot enumerate
    pub async fn list_vms(&self, _ctx: &RequestContext) -> VmResult<Vec<ManagedVm>> {
        let vms = match self.backend.as_lister() {
            Some(lister) => lister.list_vms(),
            None => {
                debug!("Backend does not support listing, returning empty vm list");
                Vec::new()
            }
        };
        self.finish("list_vms", Ok(vms))
    }

    fn customer_or_default(&self, ctx: &RequestContext, operation: &str) -> String {
        match ctx.customer_id() {
            Some(customer) => customer.to_string(),
            None => {
                warn!(
                    operation = %operation,
                    default_customer = DEFAULT_CUSTOMER_ID,
                    "No customer id in request context, using default"
                );
                DEFAULT_CUSTOMER_ID.to_string()
            }
        }
    }

    async fn stop_collection(&self, vm_id: &str) {
        if let Some(ref hooks) = self.collection {
            if let Err(e) = hooks.stop_collection(vm_id).await {
                warn!(vm_id = %vm_id, error = %e, "Failed to stop metrics collection");
            }
        }
    }

    /// Pid of the VM's Firecracker process according to the backend
    async fn backend_process_id(&self, vm_id: &str) -> Option<u32> {
        match self.backend.get_vm_info(vm_id).await {
            Ok(info) => info.process_id,
            Err(e) => {
                debug!(vm_id = %vm_id, error = %e, "Could not read vm info for process id");
                None
            }
        }
    }

    async fn transition(
        &self,
        vm_id: &str,
        state: VmState,
        process_id: Option<u32>,
    ) -> VmResult<()> {
        self.repository
            .update_vm_state(vm_id, state, process_id)
            .await
            .map_err(|e| self.repository_error(vm_id, e))
    }

    fn backend_error(
        &self,
        operation: &str,
        vm_id: &str,
        ctx: &RequestContext,
        e: anyhow::Error,
    ) -> VmError {
        error!(
            vm_id = %vm_id,
            customer_id = ?ctx.customer_id(),
            operation = %operation,
            error = %e,
            "Backend operation failed"
        );
        VmError::internal(format!("failed to {} vm {}", operation, vm_id), e)
    }

    fn repository_error(&self, vm_id: &str, e: RepositoryError) -> VmError {
        match e {
            RepositoryError::NotFound(_) => {
                warn!(vm_id = %vm_id, "VM record not found in repository");
                VmError::NotFound {
                    vm_id: vm_id.to_string(),
                }
            }
            other => {
                error!(vm_id = %vm_id, error = %other, "Repository operation failed");
                VmError::internal(format!("failed to persist state for vm {}", vm_id), other.into())
            }
        }
    }

    fn finish<T>(&self, operation: &str, result: VmResult<T>) -> VmResult<T> {
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        self.metrics.record_lifecycle_operation(operation, outcome);
        result
    }
}
