//! Usage aggregation
//!
//! Turns cumulative per-VM resource counters into billable deltas and emits
//! usage summaries: periodic snapshots while a VM runs and a final one when
//! it stops. All state lives behind a single lock; summaries leave through a
//! bounded channel handed out at construction.

use crate::models::{MetricSample, SummaryKind, UsageSummary};
use crate::observability::ControlPlaneMetrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Score weight per CPU second
pub const CPU_WEIGHT: f64 = 1.0;
/// Score weight per GiB of peak memory
pub const MEMORY_WEIGHT: f64 = 0.5;
/// Score weight per MiB of disk read plus write
pub const DISK_WEIGHT: f64 = 0.3;

const NANOS_PER_SECOND: f64 = 1_000_000_000.0;
const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;
const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Weighted resource score of a usage period
pub fn resource_score(cpu_time_nanos: u64, max_memory_bytes: u64, disk_bytes: u64) -> f64 {
    let cpu_seconds = cpu_time_nanos as f64 / NANOS_PER_SECOND;
    let memory_gib = max_memory_bytes as f64 / BYTES_PER_GIB;
    let disk_mib = disk_bytes as f64 / BYTES_PER_MIB;

    cpu_seconds * CPU_WEIGHT + memory_gib * MEMORY_WEIGHT + disk_mib * DISK_WEIGHT
}

/// Cumulative counters, either the last observed values or accumulated totals
#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    cpu_time_nanos: u64,
    disk_read_bytes: u64,
    disk_write_bytes: u64,
    network_rx_bytes: u64,
    network_tx_bytes: u64,
}

impl Counters {
    fn from_sample(sample: &MetricSample) -> Self {
        Self {
            cpu_time_nanos: sample.cpu_time_nanos,
            disk_read_bytes: sample.disk_read_bytes,
            disk_write_bytes: sample.disk_write_bytes,
            network_rx_bytes: sample.network_rx_bytes,
            network_tx_bytes: sample.network_tx_bytes,
        }
    }

    /// Add `current - last` per counter; a counter that went backwards was
    /// reset and contributes nothing.
    fn accumulate(&mut self, last: &Counters, current: &Counters) -> usize {
        let mut resets = 0;
        let mut add = |total: &mut u64, last: u64, current: u64| match current.checked_sub(last) {
            Some(delta) => *total = total.saturating_add(delta),
            None => resets += 1,
        };

        add(&mut self.cpu_time_nanos, last.cpu_time_nanos, current.cpu_time_nanos);
        add(&mut self.disk_read_bytes, last.disk_read_bytes, current.disk_read_bytes);
        add(&mut self.disk_write_bytes, last.disk_write_bytes, current.disk_write_bytes);
        add(&mut self.network_rx_bytes, last.network_rx_bytes, current.network_rx_bytes);
        add(&mut self.network_tx_bytes, last.network_tx_bytes, current.network_tx_bytes);

        resets
    }
}

/// Live usage state of one VM
#[derive(Debug, Clone)]
struct VmUsageData {
    customer_id: String,
    start_time: DateTime<Utc>,
    last_update: DateTime<Utc>,
    last: Counters,
    totals: Counters,
    max_memory_bytes: u64,
    sample_count: u64,
}

impl VmUsageData {
    fn new(customer_id: &str, start_time: DateTime<Utc>) -> Self {
        Self {
            customer_id: customer_id.to_string(),
            start_time,
            last_update: Utc::now(),
            last: Counters::default(),
            totals: Counters::default(),
            max_memory_bytes: 0,
            sample_count: 0,
        }
    }

    fn summarize(&self, vm_id: &str, kind: SummaryKind, period_end: DateTime<Utc>) -> UsageSummary {
        let duration_secs = period_end
            .signed_duration_since(self.start_time)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;

        let cpu_seconds = self.totals.cpu_time_nanos as f64 / NANOS_PER_SECOND;
        let avg_cpu_usage = if duration_secs > 0.0 {
            cpu_seconds / duration_secs
        } else {
            0.0
        };

        let disk_bytes = self
            .totals
            .disk_read_bytes
            .saturating_add(self.totals.disk_write_bytes);

        UsageSummary {
            vm_id: vm_id.to_string(),
            customer_id: self.customer_id.clone(),
            kind,
            period_start: self.start_time,
            period_end,
            duration_secs,
            total_cpu_time_nanos: self.totals.cpu_time_nanos,
            avg_cpu_usage,
            max_memory_bytes: self.max_memory_bytes,
            total_disk_read_bytes: self.totals.disk_read_bytes,
            total_disk_write_bytes: self.totals.disk_write_bytes,
            total_network_rx_bytes: self.totals.network_rx_bytes,
            total_network_tx_bytes: self.totals.network_tx_bytes,
            resource_score: resource_score(
                self.totals.cpu_time_nanos,
                self.max_memory_bytes,
                disk_bytes,
            ),
            sample_count: self.sample_count,
        }
    }
}

#[derive(Default)]
struct AggregatorState {
    vms: HashMap<String, VmUsageData>,
    customers: HashMap<String, HashSet<String>>,
}

impl AggregatorState {
    fn entry(&mut self, vm_id: &str, customer_id: &str, start_time: DateTime<Utc>) -> &mut VmUsageData {
        if !self.vms.contains_key(vm_id) {
            self.customers
                .entry(customer_id.to_string())
                .or_default()
                .insert(vm_id.to_string());
        }
        self.vms
            .entry(vm_id.to_string())
            .or_insert_with(|| VmUsageData::new(customer_id, start_time))
    }

    fn evict(&mut self, vm_id: &str) -> Option<VmUsageData> {
        let data = self.vms.remove(vm_id)?;
        if let Some(vms) = self.customers.get_mut(&data.customer_id) {
            vms.remove(vm_id);
            if vms.is_empty() {
                self.customers.remove(&data.customer_id);
            }
        }
        Some(data)
    }
}

/// Point-in-time aggregator statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregatorStats {
    pub active_vms: usize,
    pub customers: usize,
    pub total_samples: u64,
}

/// In-memory usage aggregator
pub struct UsageAggregator {
    state: RwLock<AggregatorState>,
    interval: Duration,
    summaries_tx: mpsc::Sender<UsageSummary>,
    metrics: ControlPlaneMetrics,
}

impl UsageAggregator {
    /// Create an aggregator emitting periodic summaries every `interval`
    ///
    /// Returns the aggregator and the receiving end of its summary channel.
    pub fn new(interval: Duration, buffer_size: usize) -> (Self, mpsc::Receiver<UsageSummary>) {
        let (summaries_tx, summaries_rx) = mpsc::channel(buffer_size.max(1));

        let aggregator = Self {
            state: RwLock::new(AggregatorState::default()),
            interval,
            summaries_tx,
            metrics: ControlPlaneMetrics::new(),
        };

        (aggregator, summaries_rx)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn read(&self) -> RwLockReadGuard<'_, AggregatorState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, AggregatorState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fold a batch of cumulative samples into the VM's usage state
    pub fn process_metrics_batch(&self, vm_id: &str, customer_id: &str, samples: &[MetricSample]) {
        let Some(first) = samples.first() else {
            return;
        };

        let mut resets = 0;
        let active = {
            let mut state = self.write();
            let data = state.entry(vm_id, customer_id, first.timestamp);

            for sample in samples {
                let current = Counters::from_sample(sample);
                resets += data.totals.accumulate(&data.last, &current);
                data.last = current;
                data.max_memory_bytes = data.max_memory_bytes.max(sample.memory_usage_bytes);
                data.sample_count += 1;
            }
            data.last_update = Utc::now();

            state.vms.len()
        };

        if resets > 0 {
            debug!(vm_id = %vm_id, resets = resets, "Counter reset detected, deltas discarded");
        }
        self.metrics.set_aggregator_active_vms(active as i64);
    }

    pub fn notify_vm_started(&self, vm_id: &str, customer_id: &str, started_at: DateTime<Utc>) {
        let active = {
            let mut state = self.write();
            state.entry(vm_id, customer_id, started_at);
            state.vms.len()
        };

        info!(vm_id = %vm_id, customer_id = %customer_id, "Usage tracking started");
        self.metrics.set_aggregator_active_vms(active as i64);
    }

    /// Emit the final summary for a VM and evict its state
    pub fn notify_vm_stopped(&self, vm_id: &str, stopped_at: DateTime<Utc>) {
        let (data, active) = {
            let mut state = self.write();
            let data = state.evict(vm_id);
            (data, state.vms.len())
        };

        let Some(data) = data else {
            debug!(vm_id = %vm_id, "Stop for untracked vm ignored");
            return;
        };

        self.metrics.set_aggregator_active_vms(active as i64);
        self.emit(data.summarize(vm_id, SummaryKind::Final, stopped_at));
    }

    /// Emit a periodic summary for every VM updated within two intervals
    ///
    /// Returns the number of summaries handed to the channel.
    pub fn generate_periodic_summaries(&self) -> usize {
        let now = Utc::now();
        let staleness = chrono::Duration::milliseconds((self.interval.as_millis() * 2) as i64);

        let summaries: Vec<UsageSummary> = {
            let state = self.read();
            state
                .vms
                .iter()
                .filter(|(vm_id, data)| {
                    let fresh = now.signed_duration_since(data.last_update) <= staleness;
                    if !fresh {
                        debug!(vm_id = %vm_id, last_update = %data.last_update, "Skipping stale vm");
                    }
                    fresh
                })
                .map(|(vm_id, data)| data.summarize(vm_id, SummaryKind::Periodic, now))
                .collect()
        };

        summaries
            .into_iter()
            .filter(|summary| self.emit(summary.clone()))
            .count()
    }

    pub fn active_vm_count(&self) -> usize {
        self.read().vms.len()
    }

    pub fn customer_vm_count(&self, customer_id: &str) -> usize {
        self.read()
            .customers
            .get(customer_id)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> AggregatorStats {
        let state = self.read();
        AggregatorStats {
            active_vms: state.vms.len(),
            customers: state.customers.len(),
            total_samples: state.vms.values().map(|d| d.sample_count).sum(),
        }
    }

    fn emit(&self, summary: UsageSummary) -> bool {
        let kind = match summary.kind {
            SummaryKind::Periodic => "periodic",
            SummaryKind::Final => "final",
        };
        let vm_id = summary.vm_id.clone();

        match self.summaries_tx.try_send(summary) {
            Ok(()) => {
                self.metrics.inc_summaries_emitted(kind);
                true
            }
            Err(e) => {
                warn!(vm_id = %vm_id, kind = kind, error = %e, "Dropping usage summary");
                false
            }
        }
    }
}
