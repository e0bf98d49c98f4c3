//! In-process billing client
//!
//! Delivers collected samples straight into a local `UsageAggregator`, for
//! deployments without a remote billing service.

use super::{BillingClient, UsageAggregator};
use crate::models::MetricSample;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct AggregatorBillingClient {
    aggregator: Arc<UsageAggregator>,
}

impl AggregatorBillingClient {
    pub fn new(aggregator: Arc<UsageAggregator>) -> Self {
        Self { aggregator }
    }
}

#[async_trait]
impl BillingClient for AggregatorBillingClient {
    async fn send_metrics_batch(
        &self,
        vm_id: &str,
        customer_id: &str,
        samples: &[MetricSample],
    ) -> Result<()> {
        self.aggregator
            .process_metrics_batch(vm_id, customer_id, samples);
        Ok(())
    }

    async fn send_heartbeat(&self, instance_id: &str, active_vms: &[String]) -> Result<()> {
        debug!(
            instance = %instance_id,
            collected_vms = active_vms.len(),
            aggregated_vms = self.aggregator.active_vm_count(),
            "Billing heartbeat"
        );
        Ok(())
    }

    async fn notify_vm_started(
        &self,
        vm_id: &str,
        customer_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        self.aggregator
            .notify_vm_started(vm_id, customer_id, started_at);
        Ok(())
    }

    async fn notify_vm_stopped(&self, vm_id: &str, stopped_at: DateTime<Utc>) -> Result<()> {
        self.aggregator.notify_vm_stopped(vm_id, stopped_at);
        Ok(())
    }

    async fn notify_possible_gap(
        &self,
        vm_id: &str,
        last_sent: DateTime<Utc>,
        resume_time: DateTime<Utc>,
    ) -> Result<()> {
        warn!(
            vm_id = %vm_id,
            last_sent = %last_sent,
            resume_time = %resume_time,
            gap_secs = resume_time.signed_duration_since(last_sent).num_seconds(),
            "Possible gap in usage data"
        );
        Ok(())
    }
}
