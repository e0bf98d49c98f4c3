//! VM state reconciliation
//!
//! This module provides:
//! - Firecracker process discovery from the OS process table
//! - Orphaned record detection
//! - The periodic reconciler aligning repository state with reality

mod orphan;
mod process;
mod report;


pub use orphan::{NoEvidence, OrphanDetector, OrphanEvidence, ORPHANED_RECORD_AGE_THRESHOLD};
pub use process::{
    extract_vm_id, is_firecracker_cmdline, parse_process, ProcFsScanner, ProcessScanner,
};
pub use report::{ReconcileAction, ReconciliationReport, VmReconciliationReport};

use crate::error::RepositoryError;
use crate::health::HealthRegistry;
use crate::lifecycle::CollectionHooks;
use crate::models::{FirecrackerProcess, Vm, VmState};
use crate::observability::{ControlPlaneMetrics, StructuredLogger};
use crate::repository::VmRepository;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Configuration for the reconciliation loop
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Time between cycles (default: 5 minutes)
    pub interval: Duration,
    /// Minimum age of a stopped record before it may be deleted (default: 7 days)
    pub orphan_age_threshold: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            orphan_age_threshold: ORPHANED_RECORD_AGE_THRESHOLD,
        }
    }
}

/// Live Firecracker processes, indexed by pid and by extracted VM id
struct ProcessIndex {
    pids: HashSet<u32>,
    by_vm_id: HashMap<String, u32>,
}

impl ProcessIndex {
    fn new(processes: &[FirecrackerProcess]) -> Self {
        let mut pids = HashSet::with_capacity(processes.len());
        let mut by_vm_id = HashMap::new();
        for process in processes {
            pids.insert(process.pid);
            if !process.vm_id.is_empty() {
                by_vm_id.entry(process.vm_id.clone()).or_insert(process.pid);
            }
        }
        Self { pids, by_vm_id }
    }

    /// Pid of the VM's live process, if any
    fn running_pid(&self, vm: &Vm) -> Option<u32> {
        vm.process_id
            .filter(|pid| self.pids.contains(pid))
            .or_else(|| self.by_vm_id.get(&vm.id).copied())
    }
}

/// Periodically aligns repository records with the processes actually running
pub struct VmReconciler {
    repository: Arc<dyn VmRepository>,
    scanner: Arc<dyn ProcessScanner>,
    orphans: OrphanDetector,
    config: ReconcilerConfig,
    metrics: ControlPlaneMetrics,
    logger: Option<StructuredLogger>,
    health: Option<HealthRegistry>,
    collection: Option<Arc<dyn CollectionHooks>>,
}

impl VmReconciler {
    pub fn new(
        repository: Arc<dyn VmRepository>,
        scanner: Arc<dyn ProcessScanner>,
        config: ReconcilerConfig,
    ) -> Self {
        let orphans = OrphanDetector::new(Arc::new(NoEvidence), config.orphan_age_threshold);
        Self {
            repository,
            scanner,
            orphans,
            config,
            metrics: ControlPlaneMetrics::new(),
            logger: None,
            health: None,
            collection: None,
        }
    }

    /// Use a host evidence source for orphan detection
    pub fn with_orphan_evidence(mut self, evidence: Arc<dyn OrphanEvidence>) -> Self {
        self.orphans = OrphanDetector::new(evidence, self.config.orphan_age_threshold);
        self
    }

    /// Emit a structured event per cycle
    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Report each cycle's outcome to the health registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Stop metering VMs whose process is found dead
    pub fn with_collection(mut self, hooks: Arc<dyn CollectionHooks>) -> Self {
        self.collection = Some(hooks);
        self
    }

    /// Run cycles until shutdown; the first cycle starts immediately
    pub async fn run(self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting vm reconciliation loop"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.reconcile_once().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down vm reconciliation loop");
                    break;
                }
            }
        }
    }

    /// Run a single reconciliation cycle
    pub async fn reconcile_once(&self) -> ReconciliationReport {
        let start = Instant::now();
        let mut report = ReconciliationReport::new();

        self.reconcile_into(&mut report).await;

        report.finish();
        self.metrics
            .record_reconciliation(&report, start.elapsed().as_secs_f64());
        if let Some(ref logger) = self.logger {
            logger.log_reconciliation(&report);
        }
        if let Some(ref health) = self.health {
            health.record_reconciliation(&report).await;
        }

        report
    }

    async fn reconcile_into(&self, report: &mut ReconciliationReport) {
        let vms = match self.repository.list_all_vms().await {
            Ok(vms) => vms,
            Err(e) => {
                error!(error = %e, "Failed to list vms for reconciliation");
                report.list_error = Some(e.to_string());
                return;
            }
        };
        report.total_vms = vms.len();

        let processes = match self.scanner.scan().await {
            Ok(processes) => processes,
            Err(e) => {
                // Without a process table every vm would look dead
                error!(error = %e, "Process scan failed, skipping reconciliation pass");
                report.scan_error = Some(format!("{:#}", e));
                return;
            }
        };
        report.processes_found = processes.len();

        let index = ProcessIndex::new(&processes);
        let now = Utc::now();

        for vm in &vms {
            let vm_report = self.reconcile_vm(vm, &index, now).await;
            report.record(vm_report);
        }
    }

    async fn reconcile_vm(
        &self,
        vm: &Vm,
        index: &ProcessIndex,
        now: DateTime<Utc>,
    ) -> VmReconciliationReport {
        let mut report = VmReconciliationReport::new(&vm.id, &vm.customer_id, vm.state);
        let running_pid = index.running_pid(vm);
        report.process_id = running_pid;

        let result = match (vm.state.expects_process(), running_pid) {
            (true, None) => {
                warn!(vm_id = %vm.id, state = %vm.state, "VM process is gone, marking shut down");
                let result = self
                    .apply_state(&mut report, VmState::Shutdown, None, ReconcileAction::MarkDead)
                    .await;
                if result.is_ok() {
                    self.stop_collection(&vm.id).await;
                }
                result
            }
            (true, Some(_)) => Ok(()),
            (false, Some(pid)) => {
                info!(vm_id = %vm.id, state = %vm.state, pid = pid, "Found running process, promoting to running");
                self.apply_state(&mut report, VmState::Running, Some(pid), ReconcileAction::StateUpdate)
                    .await
            }
            (false, None) => self.check_orphan(vm, now, &mut report).await,
        };

        if let Err(e) = result {
            error!(vm_id = %vm.id, error = %e, "Failed to reconcile vm");
            report.action = ReconcileAction::Error;
            report.error = Some(e);
        }

        report
    }

    async fn apply_state(
        &self,
        report: &mut VmReconciliationReport,
        state: VmState,
        process_id: Option<u32>,
        action: ReconcileAction,
    ) -> Result<(), String> {
        match self
            .repository
            .update_vm_state(&report.vm_id, state, process_id)
            .await
        {
            Ok(()) => {
                report.action = action;
                report.new_state = Some(state);
                Ok(())
            }
            Err(RepositoryError::NotFound(_)) => {
                debug!(vm_id = %report.vm_id, "VM record removed during reconciliation");
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    async fn stop_collection(&self, vm_id: &str) {
        if let Some(ref hooks) = self.collection {
            if let Err(e) = hooks.stop_collection(vm_id).await {
                warn!(vm_id = %vm_id, error = %e, "Failed to stop metrics collection for dead vm");
            }
        }
    }

    async fn check_orphan(
        &self,
        vm: &Vm,
        now: DateTime<Utc>,
        report: &mut VmReconciliationReport,
    ) -> Result<(), String> {
        let orphaned = self
            .orphans
            .is_orphaned(vm, now)
            .await
            .map_err(|e| format!("orphan check failed: {:#}", e))?;

        if !orphaned {
            return Ok(());
        }

        match self.repository.delete_vm(&vm.id).await {
            Ok(()) => {
                info!(
                    vm_id = %vm.id,
                    customer_id = %vm.customer_id,
                    last_updated = %vm.updated_at,
                    "Deleted orphaned vm record"
                );
                report.action = ReconcileAction::OrphanDelete;
                Ok(())
            }
            Err(RepositoryError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.to_string()),
        }
    }
}
