//! Shared test doubles

use crate::backend::{Backend, ManagedVm, VmInfo, VmLister};
use crate::models::{
    BootConfig, CpuConfig, MemoryConfig, MetricSample, StorageDevice, VmConfig, VmState,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn valid_vm_config() -> VmConfig {
    VmConfig {
        cpu: Some(CpuConfig {
            vcpu_count: 2,
            max_vcpu_count: Some(4),
        }),
        memory: Some(MemoryConfig {
            size_bytes: 512 * 1024 * 1024,
        }),
        boot: Some(BootConfig {
            kernel_path: "/var/lib/metald/vmlinux".to_string(),
            initrd_path: None,
            kernel_args: "console=ttyS0".to_string(),
        }),
        storage: vec![StorageDevice {
            id: "rootfs".to_string(),
            path: "/var/lib/metald/rootfs.ext4".to_string(),
            read_only: false,
            is_root_device: false,
        }],
        ..Default::default()
    }
}

/// Sample taken `offset_secs` after now
pub fn sample(
    offset_secs: i64,
    cpu_nanos: u64,
    memory: u64,
    disk_read: u64,
    disk_write: u64,
) -> MetricSample {
    MetricSample {
        timestamp: chrono::Utc::now() + chrono::Duration::seconds(offset_secs),
        cpu_time_nanos: cpu_nanos,
        memory_usage_bytes: memory,
        disk_read_bytes: disk_read,
        disk_write_bytes: disk_write,
        network_rx_bytes: 0,
        network_tx_bytes: 0,
    }
}

/// Backend double that records calls and fails on demand
#[derive(Default)]
pub struct MockBackend {
    pub delete_calls: AtomicU32,
    pub deletes_completed: AtomicU32,
    delete_failures: AtomicU32,
    delete_delay: Mutex<Duration>,
    failing_ops: Mutex<HashSet<&'static str>>,
    calls: Mutex<Vec<String>>,
    next_id: AtomicU32,
    metrics: Mutex<HashMap<String, MetricSample>>,
    listed: Mutex<Option<Vec<ManagedVm>>>,
}

impl MockBackend {
    pub const BOOTED_PID: u32 = 4242;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lister(vms: Vec<ManagedVm>) -> Self {
        let backend = Self::new();
        *backend.listed.lock().unwrap() = Some(vms);
        backend
    }

    pub fn fail_next_deletes(&self, count: u32) {
        self.delete_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_delete_delay(&self, delay: Duration) {
        *self.delete_delay.lock().unwrap() = delay;
    }

    pub fn fail_op(&self, op: &'static str) {
        self.failing_ops.lock().unwrap().insert(op);
    }

    pub fn set_metrics(&self, vm_id: &str, sample: MetricSample) {
        self.metrics
            .lock()
            .unwrap()
            .insert(vm_id.to_string(), sample);
    }

    pub fn clear_metrics(&self, vm_id: &str) {
        self.metrics.lock().unwrap().remove(vm_id);
    }

    /// Operation log, e.g. `["create:vm-1", "boot:vm-1"]`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, op: &'static str, vm_id: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("{}:{}", op, vm_id));
        if self.failing_ops.lock().unwrap().contains(op) {
            return Err(anyhow!("backend {} failed for {}", op, vm_id));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn create_vm(&self, _config: &VmConfig) -> Result<String> {
        let id = format!("vm-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.record("create", &id)?;
        Ok(id)
    }

    async fn delete_vm(&self, vm_id: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.record("delete", vm_id)?;

        let delay = *self.delete_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let remaining = self.delete_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.delete_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("jailer still holds resources for {}", vm_id));
        }

        self.deletes_completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn boot_vm(&self, vm_id: &str) -> Result<()> {
        self.record("boot", vm_id)
    }

    async fn shutdown_vm(&self, vm_id: &str) -> Result<()> {
        self.record("shutdown", vm_id)
    }

    async fn shutdown_vm_with_options(
        &self,
        vm_id: &str,
        _force: bool,
        _timeout_seconds: u32,
    ) -> Result<()> {
        self.record("shutdown", vm_id)
    }

    async fn pause_vm(&self, vm_id: &str) -> Result<()> {
        self.record("pause", vm_id)
    }

    async fn resume_vm(&self, vm_id: &str) -> Result<()> {
        self.record("resume", vm_id)
    }

    async fn reboot_vm(&self, vm_id: &str) -> Result<()> {
        self.record("reboot", vm_id)
    }

    async fn get_vm_info(&self, vm_id: &str) -> Result<VmInfo> {
        self.record("info", vm_id)?;
        Ok(VmInfo {
            vm_id: vm_id.to_string(),
            state: VmState::Running,
            config: valid_vm_config(),
            process_id: Some(Self::BOOTED_PID),
        })
    }

    async fn get_vm_metrics(&self, vm_id: &str) -> Result<MetricSample> {
        self.metrics
            .lock()
            .unwrap()
            .get(vm_id)
            .cloned()
            .ok_or_else(|| anyhow!("no metrics for {}", vm_id))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn as_lister(&self) -> Option<&dyn VmLister> {
        if self.listed.lock().unwrap().is_some() {
            Some(self)
        } else {
            None
        }
    }
}

impl VmLister for MockBackend {
    fn list_vms(&self) -> Vec<ManagedVm> {
        self.listed.lock().unwrap().clone().unwrap_or_default()
    }
}
