//! Core data models for the control plane

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Lifecycle state of a VM as recorded by the repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Created,
    Running,
    Paused,
    Shutdown,
}

impl VmState {
    /// States in which a live Firecracker process is expected
    pub fn expects_process(&self) -> bool {
        matches!(self, VmState::Created | VmState::Running)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Created => write!(f, "created"),
            VmState::Running => write!(f, "running"),
            VmState::Paused => write!(f, "paused"),
            VmState::Shutdown => write!(f, "shutdown"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuConfig {
    pub vcpu_count: u32,
    pub max_vcpu_count: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BootConfig {
    pub kernel_path: String,
    pub initrd_path: Option<String>,
    pub kernel_args: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageDevice {
    pub id: String,
    pub path: String,
    pub read_only: bool,
    pub is_root_device: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub id: String,
    pub tap_device: String,
    pub mac_address: Option<String>,
}

/// VM configuration as supplied by the caller of `create_vm`
///
/// Sections are optional so that incomplete requests can be rejected with a
/// precise validation error instead of failing to deserialize.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    pub cpu: Option<CpuConfig>,
    pub memory: Option<MemoryConfig>,
    pub boot: Option<BootConfig>,
    #[serde(default)]
    pub storage: Vec<StorageDevice>,
    #[serde(default)]
    pub network: Vec<NetworkInterface>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: String,
}

/// Persisted VM record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vm {
    pub id: String,
    pub customer_id: String,
    pub config: VmConfig,
    pub state: VmState,
    pub process_id: Option<u32>,
    pub port_mappings: Vec<PortMapping>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Vm {
    /// Build a freshly created record
    pub fn new(id: impl Into<String>, customer_id: impl Into<String>, config: VmConfig) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            customer_id: customer_id.into(),
            config,
            state: VmState::Created,
            process_id: None,
            port_mappings: Vec::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A Firecracker process found in the OS process table
///
/// Rebuilt on every reconciliation cycle, never persisted. `vm_id` is empty
/// when no id could be extracted from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirecrackerProcess {
    pub pid: u32,
    pub cmdline: String,
    pub vm_id: String,
}

/// One raw resource reading for a VM
///
/// CPU, disk and network values are monotonic counters for the lifetime of
/// the VM process and reset to zero when it restarts. Memory is a gauge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_time_nanos: u64,
    pub memory_usage_bytes: u64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

/// Whether a summary was produced by a periodic tick or by VM stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryKind {
    Periodic,
    Final,
}

/// Billing summary for one VM over one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub vm_id: String,
    pub customer_id: String,
    pub kind: SummaryKind,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub duration_secs: f64,
    pub total_cpu_time_nanos: u64,
    /// CPU-seconds consumed per wall-clock second
    pub avg_cpu_usage: f64,
    pub max_memory_bytes: u64,
    pub total_disk_read_bytes: u64,
    pub total_disk_write_bytes: u64,
    pub total_network_rx_bytes: u64,
    pub total_network_tx_bytes: u64,
    pub resource_score: f64,
    pub sample_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_wire_names_match_display() {
        for state in [
            VmState::Created,
            VmState::Running,
            VmState::Paused,
            VmState::Shutdown,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state));
        }
    }

    #[test]
    fn test_only_created_and_running_expect_process() {
        assert!(VmState::Created.expects_process());
        assert!(VmState::Running.expects_process());
        assert!(!VmState::Paused.expects_process());
        assert!(!VmState::Shutdown.expects_process());
    }

    #[test]
    fn test_new_vm_starts_created() {
        let vm = Vm::new("vm-1", "cust-1", VmConfig::default());

        assert_eq!(vm.state, VmState::Created);
        assert_eq!(vm.process_id, None);
        assert!(!vm.is_deleted());
        assert_eq!(vm.created_at, vm.updated_at);
    }

    #[test]
    fn test_summary_kind_serializes_lowercase() {
        let value = serde_json::to_value(SummaryKind::Final).unwrap();
        assert_eq!(value, serde_json::json!("final"));
    }
}
