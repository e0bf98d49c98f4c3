//! Usage metering and billing
//!
//! This module provides:
//! - The billing client interface metrics are delivered through
//! - Per-VM metrics collection from the backend, batched and gap-aware
//! - Usage aggregation into periodic and final summaries
//! - An in-process billing client feeding the aggregator

mod aggregator;
mod collector;
mod r#loop;
mod sink;

#[cfg(test)]
mod tests;

pub use aggregator::{
    resource_score, AggregatorStats, UsageAggregator, CPU_WEIGHT, DISK_WEIGHT, MEMORY_WEIGHT,
};
pub use collector::{CollectorConfig, MetricsCollector};
pub use r#loop::AggregationLoop;
pub use sink::AggregatorBillingClient;

use crate::models::MetricSample;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Destination for collected VM usage
#[async_trait]
pub trait BillingClient: Send + Sync {
    /// Deliver cumulative samples for one VM, oldest first
    async fn send_metrics_batch(
        &self,
        vm_id: &str,
        customer_id: &str,
        samples: &[MetricSample],
    ) -> Result<()>;

    /// Liveness signal listing the VMs this instance is metering
    async fn send_heartbeat(&self, instance_id: &str, active_vms: &[String]) -> Result<()>;

    async fn notify_vm_started(
        &self,
        vm_id: &str,
        customer_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn notify_vm_stopped(&self, vm_id: &str, stopped_at: DateTime<Utc>) -> Result<()>;

    /// Report that samples between `last_sent` and `resume_time` may be missing
    async fn notify_possible_gap(
        &self,
        vm_id: &str,
        last_sent: DateTime<Utc>,
        resume_time: DateTime<Utc>,
    ) -> Result<()>;
}
