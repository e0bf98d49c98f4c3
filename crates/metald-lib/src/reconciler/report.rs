//! Reconciliation reports

use crate::models::VmState;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Action taken for one VM during a reconciliation cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    /// Record claimed a live process but none exists
    MarkDead,
    /// Record claimed no process but one is running
    StateUpdate,
    /// Long-stopped record with no remaining evidence, soft-deleted
    OrphanDelete,
    NoChange,
    Error,
}

/// Outcome for a single VM
#[derive(Debug, Clone, Serialize)]
pub struct VmReconciliationReport {
    pub vm_id: String,
    pub customer_id: String,
    pub previous_state: VmState,
    pub new_state: Option<VmState>,
    pub action: ReconcileAction,
    pub process_id: Option<u32>,
    pub error: Option<String>,
}

impl VmReconciliationReport {
    pub(crate) fn new(vm_id: &str, customer_id: &str, previous_state: VmState) -> Self {
        Self {
            vm_id: vm_id.to_string(),
            customer_id: customer_id.to_string(),
            previous_state,
            new_state: None,
            action: ReconcileAction::NoChange,
            process_id: None,
            error: None,
        }
    }
}

/// Tallies of one reconciliation cycle
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_vms: usize,
    pub processes_found: usize,
    pub marked_dead: usize,
    pub state_updated: usize,
    pub orphans_deleted: usize,
    pub unchanged: usize,
    pub errors: usize,
    /// Set when the process table could not be read; the per-VM pass is skipped
    pub scan_error: Option<String>,
    /// Set when the repository could not be listed; the cycle ends early
    pub list_error: Option<String>,
    pub vms: Vec<VmReconciliationReport>,
}

impl ReconciliationReport {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            completed_at: None,
            total_vms: 0,
            processes_found: 0,
            marked_dead: 0,
            state_updated: 0,
            orphans_deleted: 0,
            unchanged: 0,
            errors: 0,
            scan_error: None,
            list_error: None,
            vms: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, vm: VmReconciliationReport) {
        match vm.action {
            ReconcileAction::MarkDead => self.marked_dead += 1,
            ReconcileAction::StateUpdate => self.state_updated += 1,
            ReconcileAction::OrphanDelete => self.orphans_deleted += 1,
            ReconcileAction::NoChange => self.unchanged += 1,
            ReconcileAction::Error => self.errors += 1,
        }
        self.vms.push(vm);
    }

    /// Number of VMs whose record was changed this cycle
    pub fn actions_taken(&self) -> usize {
        self.marked_dead + self.state_updated + self.orphans_deleted
    }

    /// Whether the cycle ran the full per-VM pass
    pub fn is_complete(&self) -> bool {
        self.scan_error.is_none() && self.list_error.is_none()
    }

    pub(crate) fn finish(&mut self) {
        self.completed_at = Some(Utc::now());
    }
}

impl Default for ReconciliationReport {
    fn default() -> Self {
        Self::new()
    }
}
