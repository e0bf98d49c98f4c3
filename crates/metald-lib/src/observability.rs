//! Observability infrastructure for the control plane
//!
//! Provides:
//! - Prometheus metrics (lifecycle operations, reconciliation actions,
//!   billing summaries, collection errors)
//! - Structured JSON logging of significant control-plane events

use crate::models::UsageSummary;
use crate::reconciler::ReconciliationReport;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for reconciliation cycle latency (in seconds)
const CYCLE_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ControlPlaneMetricsInner> = OnceLock::new();

struct ControlPlaneMetricsInner {
    lifecycle_operations: IntCounterVec,
    reconciliation_actions: IntCounterVec,
    reconciliation_cycle_seconds: Histogram,
    reconciliation_scan_failures: IntCounter,
    usage_summaries_emitted: IntCounterVec,
    aggregator_active_vms: IntGauge,
    collected_vms: IntGauge,
    collection_errors: IntCounter,
    billing_send_failures: IntCounter,
}

impl ControlPlaneMetricsInner {
    fn new() -> Self {
        Self {
            lifecycle_operations: register_int_counter_vec!(
                "metald_vm_lifecycle_operations_total",
                "VM lifecycle operations by operation and outcome",
                &["operation", "outcome"]
            )
            .expect("Failed to register vm_lifecycle_operations_total"),

            reconciliation_actions: register_int_counter_vec!(
                "metald_reconciliation_actions_total",
                "Reconciliation actions taken, by action",
                &["action"]
            )
            .expect("Failed to register reconciliation_actions_total"),

            reconciliation_cycle_seconds: register_histogram!(
                "metald_reconciliation_cycle_seconds",
                "Time spent in one reconciliation cycle",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register reconciliation_cycle_seconds"),

            reconciliation_scan_failures: register_int_counter!(
                "metald_reconciliation_scan_failures_total",
                "Reconciliation cycles cut short by a scan or listing failure"
            )
            .expect("Failed to register reconciliation_scan_failures_total"),

            usage_summaries_emitted: register_int_counter_vec!(
                "metald_usage_summaries_emitted_total",
                "Billing usage summaries emitted, by kind",
                &["kind"]
            )
            .expect("Failed to register usage_summaries_emitted_total"),

            aggregator_active_vms: register_int_gauge!(
                "metald_aggregator_active_vms",
                "VMs with live usage aggregation state"
            )
            .expect("Failed to register aggregator_active_vms"),

            collected_vms: register_int_gauge!(
                "metald_collected_vms",
                "VMs whose resource metrics are being collected"
            )
            .expect("Failed to register collected_vms"),

            collection_errors: register_int_counter!(
                "metald_collection_errors_total",
                "Failed backend metric reads"
            )
            .expect("Failed to register collection_errors_total"),

            billing_send_failures: register_int_counter!(
                "metald_billing_send_failures_total",
                "Failed sends to the billing client"
            )
            .expect("Failed to register billing_send_failures_total"),
        }
    }
}

/// Control-plane metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct ControlPlaneMetrics {
    _private: (),
}

impl Default for ControlPlaneMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlPlaneMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ControlPlaneMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ControlPlaneMetricsInner {
        GLOBAL_METRICS.get_or_init(ControlPlaneMetricsInner::new)
    }

    pub fn record_lifecycle_operation(&self, operation: &str, outcome: &str) {
        self.inner()
            .lifecycle_operations
            .with_label_values(&[operation, outcome])
            .inc();
    }

    /// Record the tallies of one reconciliation cycle
    pub fn record_reconciliation(&self, report: &ReconciliationReport, elapsed_secs: f64) {
        let inner = self.inner();
        inner.reconciliation_cycle_seconds.observe(elapsed_secs);

        for (action, count) in [
            ("mark_dead", report.marked_dead),
            ("state_update", report.state_updated),
            ("orphan_delete", report.orphans_deleted),
            ("no_change", report.unchanged),
            ("error", report.errors),
        ] {
            inner
                .reconciliation_actions
                .with_label_values(&[action])
                .inc_by(count as u64);
        }

        if !report.is_complete() {
            inner.reconciliation_scan_failures.inc();
        }
    }

    pub fn inc_summaries_emitted(&self, kind: &str) {
        self.inner()
            .usage_summaries_emitted
            .with_label_values(&[kind])
            .inc();
    }

    pub fn set_aggregator_active_vms(&self, count: i64) {
        self.inner().aggregator_active_vms.set(count);
    }

    pub fn set_collected_vms(&self, count: i64) {
        self.inner().collected_vms.set(count);
    }

    pub fn inc_collection_errors(&self) {
        self.inner().collection_errors.inc();
    }

    pub fn inc_billing_send_failures(&self) {
        self.inner().billing_send_failures.inc();
    }
}

/// Structured logger for control-plane events
///
/// Provides consistent JSON-formatted logging for reconciliation,
/// billing and daemon lifecycle events.
#[derive(Clone)]
pub struct StructuredLogger {
    instance_id: String,
}

impl StructuredLogger {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
        }
    }

    /// Log the outcome of a reconciliation cycle
    pub fn log_reconciliation(&self, report: &ReconciliationReport) {
        if report.errors > 0 || !report.is_complete() {
            warn!(
                event = "vm_reconciled",
                instance = %self.instance_id,
                total_vms = report.total_vms,
                processes_found = report.processes_found,
                marked_dead = report.marked_dead,
                state_updated = report.state_updated,
                orphans_deleted = report.orphans_deleted,
                unchanged = report.unchanged,
                errors = report.errors,
                scan_error = ?report.scan_error,
                list_error = ?report.list_error,
                "Reconciliation cycle completed with errors"
            );
        } else {
            info!(
                event = "vm_reconciled",
                instance = %self.instance_id,
                total_vms = report.total_vms,
                processes_found = report.processes_found,
                marked_dead = report.marked_dead,
                state_updated = report.state_updated,
                orphans_deleted = report.orphans_deleted,
                unchanged = report.unchanged,
                "Reconciliation cycle completed"
            );
        }
    }

    /// Log a billing summary
    pub fn log_usage_summary(&self, summary: &UsageSummary) {
        info!(
            event = "usage_summary_emitted",
            instance = %self.instance_id,
            vm_id = %summary.vm_id,
            customer_id = %summary.customer_id,
            kind = ?summary.kind,
            duration_secs = summary.duration_secs,
            cpu_time_nanos = summary.total_cpu_time_nanos,
            max_memory_bytes = summary.max_memory_bytes,
            resource_score = summary.resource_score,
            sample_count = summary.sample_count,
            "Usage summary emitted"
        );
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "daemon_started",
            instance = %self.instance_id,
            version = %version,
            "metald started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "daemon_shutdown",
            instance = %self.instance_id,
            reason = %reason,
            "metald shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_handles_share_registry() {
        let metrics = ControlPlaneMetrics::new();
        let other = metrics.clone();

        metrics.record_lifecycle_operation("boot_vm", "ok");
        other.record_lifecycle_operation("boot_vm", "ok");
        metrics.record_reconciliation(&ReconciliationReport::default(), 0.01);
        metrics.inc_summaries_emitted("final");
        metrics.set_aggregator_active_vms(3);

        let families = prometheus::gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "metald_vm_lifecycle_operations_total"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("node-1");
        assert_eq!(logger.instance_id, "node-1");
    }
}
