//! Per-VM metrics collection
//!
//! Polls the backend for each VM being metered, batches the samples and
//! delivers them to the billing client. Samples that fail to send stay
//! buffered up to a bound; anything that could leave a hole in the usage
//! record (dropped samples, a stalled collector) is reported as a possible
//! gap.

use super::BillingClient;
use crate::backend::Backend;
use crate::health::{components, HealthRegistry};
use crate::lifecycle::CollectionHooks;
use crate::models::MetricSample;
use crate::observability::ControlPlaneMetrics;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for metrics collection
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Identifies this instance in heartbeats
    pub instance_id: String,
    /// Time between backend polls (default: 15 seconds)
    pub interval: Duration,
    /// Time between heartbeats (default: 30 seconds)
    pub heartbeat_interval: Duration,
    /// Samples per billing batch (default: 4)
    pub batch_size: usize,
    /// Per-VM cap on unsent samples, oldest dropped first (default: 1000)
    pub max_buffered_samples: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            instance_id: "metald".to_string(),
            interval: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(30),
            batch_size: 4,
            max_buffered_samples: 1000,
        }
    }
}

/// Collection state of one VM
#[derive(Debug)]
struct CollectedVm {
    customer_id: String,
    started_at: DateTime<Utc>,
    pending: VecDeque<MetricSample>,
    last_collected: Option<DateTime<Utc>>,
    last_sent: Option<DateTime<Utc>>,
    /// Held for the duration of any billing send for this VM
    send_lock: Arc<Mutex<()>>,
}

impl CollectedVm {
    fn new(customer_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            customer_id: customer_id.to_string(),
            started_at,
            pending: VecDeque::new(),
            last_collected: None,
            last_sent: None,
            send_lock: Arc::new(Mutex::new(())),
        }
    }
}

pub struct MetricsCollector {
    backend: Arc<dyn Backend>,
    billing: Arc<dyn BillingClient>,
    config: CollectorConfig,
    vms: DashMap<String, CollectedVm>,
    metrics: ControlPlaneMetrics,
    health: Option<HealthRegistry>,
}

impl MetricsCollector {
    pub fn new(
        backend: Arc<dyn Backend>,
        billing: Arc<dyn BillingClient>,
        config: CollectorConfig,
    ) -> Self {
        Self {
            backend,
            billing,
            config,
            vms: DashMap::new(),
            metrics: ControlPlaneMetrics::new(),
            health: None,
        }
    }

    /// Report heartbeat outcomes to the health registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Ids of the VMs being collected, sorted
    pub fn active_vms(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.vms.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn is_collecting(&self, vm_id: &str) -> bool {
        self.vms.contains_key(vm_id)
    }

    /// Unsent samples held for a VM
    pub fn buffered_samples(&self, vm_id: &str) -> usize {
        self.vms.get(vm_id).map(|vm| vm.pending.len()).unwrap_or(0)
    }

    /// Poll every registered VM once
    pub async fn collect_once(&self) {
        self.collect_at(Utc::now()).await;
    }

    async fn collect_at(&self, now: DateTime<Utc>) {
        for vm_id in self.active_vms() {
            self.collect_vm(&vm_id, now).await;
        }
    }

    async fn collect_vm(&self, vm_id: &str, now: DateTime<Utc>) {
        let sample = match self.backend.get_vm_metrics(vm_id).await {
            Ok(sample) => sample,
            Err(e) => {
                self.metrics.inc_collection_errors();
                warn!(vm_id = %vm_id, error = %e, "Failed to collect vm metrics");
                return;
            }
        };

        let max_gap = chrono::Duration::milliseconds((self.config.interval.as_millis() * 2) as i64);

        let gap_since = {
            // Stopped while the backend was being polled
            let Some(mut vm) = self.vms.get_mut(vm_id) else {
                return;
            };

            let mut gap_since = None;
            if let Some(previous) = vm.last_collected {
                if now.signed_duration_since(previous) > max_gap {
                    gap_since = Some(vm.last_sent.unwrap_or(previous));
                }
            }
            vm.last_collected = Some(now);

            vm.pending.push_back(sample);
            let mut dropped = 0usize;
            while vm.pending.len() > self.config.max_buffered_samples {
                vm.pending.pop_front();
                dropped += 1;
            }
            if dropped > 0 {
                warn!(
                    vm_id = %vm_id,
                    dropped = dropped,
                    buffered = vm.pending.len(),
                    "Sample buffer full, dropped oldest samples"
                );
                gap_since = gap_since.or(Some(vm.last_sent.unwrap_or(vm.started_at)));
            }

            gap_since
        };

        if let Some(last_sent) = gap_since {
            if let Err(e) = self.billing.notify_possible_gap(vm_id, last_sent, now).await {
                warn!(vm_id = %vm_id, error = %e, "Failed to report usage gap");
            }
        }

        self.flush_if_ready(vm_id).await;
    }

    /// Send the buffered samples once a full batch is available
    async fn flush_if_ready(&self, vm_id: &str) {
        let send_lock = match self.vms.get(vm_id) {
            Some(vm) => vm.send_lock.clone(),
            None => return,
        };
        let _sending = send_lock.lock().await;

        // Taken out of the buffer so a concurrent stop cannot send them again
        let (customer_id, batch) = {
            let Some(mut vm) = self.vms.get_mut(vm_id) else {
                return;
            };
            if vm.pending.len() < self.config.batch_size.max(1) {
                return;
            }
            let batch: Vec<MetricSample> = vm.pending.drain(..).collect();
            (vm.customer_id.clone(), batch)
        };

        let sent = self.send_batch(vm_id, &customer_id, &batch).await.is_ok();

        let Some(mut vm) = self.vms.get_mut(vm_id) else {
            if !sent {
                warn!(vm_id = %vm_id, samples = batch.len(), "Dropping unsent samples, collection stopped");
            }
            return;
        };
        if sent {
            vm.last_sent = batch.last().map(|s| s.timestamp);
            return;
        }

        for sample in batch.into_iter().rev() {
            vm.pending.push_front(sample);
        }
        let mut dropped = 0usize;
        while vm.pending.len() > self.config.max_buffered_samples {
            vm.pending.pop_front();
            dropped += 1;
        }
        if dropped > 0 {
            warn!(vm_id = %vm_id, dropped = dropped, "Sample buffer full, dropped oldest samples");
        }
    }

    async fn send_batch(&self, vm_id: &str, customer_id: &str, batch: &[MetricSample]) -> Result<()> {
        match self
            .billing
            .send_metrics_batch(vm_id, customer_id, batch)
            .await
        {
            Ok(()) => {
                debug!(vm_id = %vm_id, samples = batch.len(), "Sent metrics batch");
                Ok(())
            }
            Err(e) => {
                self.metrics.inc_billing_send_failures();
                warn!(
                    vm_id = %vm_id,
                    customer_id = %customer_id,
                    samples = batch.len(),
                    error = %e,
                    "Failed to send metrics batch, keeping samples buffered"
                );
                Err(e)
            }
        }
    }

    pub async fn send_heartbeat(&self) -> Result<()> {
        let active = self.active_vms();
        self.billing
            .send_heartbeat(&self.config.instance_id, &active)
            .await
            .context("Failed to send billing heartbeat")
    }

    /// Collect and heartbeat until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            heartbeat_secs = self.config.heartbeat_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Starting metrics collection loop"
        );

        let mut collect_ticker = interval(self.config.interval);
        collect_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat_ticker = interval(self.config.heartbeat_interval);
        heartbeat_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = collect_ticker.tick() => {
                    self.collect_once().await;
                }
                _ = heartbeat_ticker.tick() => {
                    let result = self.send_heartbeat().await;
                    if let Err(ref e) = result {
                        warn!(error = %e, "Heartbeat failed");
                    }
                    if let Some(ref health) = self.health {
                        match result {
                            Ok(()) => health.set_healthy(components::COLLECTOR).await,
                            Err(e) => health.set_degraded(components::COLLECTOR, format!("{:#}", e)).await,
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down metrics collection loop");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl CollectionHooks for MetricsCollector {
    async fn start_collection(&self, vm_id: &str, customer_id: &str) -> Result<()> {
        let now = Utc::now();
        self.vms
            .entry(vm_id.to_string())
            .and_modify(|vm| vm.customer_id = customer_id.to_string())
            .or_insert_with(|| CollectedVm::new(customer_id, now));
        self.metrics.set_collected_vms(self.vms.len() as i64);

        self.billing
            .notify_vm_started(vm_id, customer_id, now)
            .await
            .with_context(|| format!("Failed to notify billing that vm {} started", vm_id))?;

        info!(vm_id = %vm_id, customer_id = %customer_id, "Metrics collection started");
        Ok(())
    }

    async fn stop_collection(&self, vm_id: &str) -> Result<()> {
        let send_lock = match self.vms.get(vm_id) {
            Some(vm) => vm.send_lock.clone(),
            None => {
                debug!(vm_id = %vm_id, "Collection not active, nothing to stop");
                return Ok(());
            }
        };
        // Waits out an in-flight flush so each sample is sent once
        let _sending = send_lock.lock().await;

        let Some((_, vm)) = self.vms.remove(vm_id) else {
            debug!(vm_id = %vm_id, "Collection stopped concurrently");
            return Ok(());
        };
        self.metrics.set_collected_vms(self.vms.len() as i64);

        if !vm.pending.is_empty() {
            let remaining: Vec<MetricSample> = vm.pending.into_iter().collect();
            if self
                .send_batch(vm_id, &vm.customer_id, &remaining)
                .await
                .is_err()
            {
                warn!(vm_id = %vm_id, samples = remaining.len(), "Dropping unsent samples on stop");
            }
        }

        self.billing
            .notify_vm_stopped(vm_id, Utc::now())
            .await
            .with_context(|| format!("Failed to notify billing that vm {} stopped", vm_id))?;

        info!(vm_id = %vm_id, "Metrics collection stopped");
        Ok(())
    }
}
