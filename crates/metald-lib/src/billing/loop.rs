//! Periodic summary loop

use super::UsageAggregator;
use std::sync::Arc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Drives `generate_periodic_summaries` on the aggregator's interval
pub struct AggregationLoop {
    aggregator: Arc<UsageAggregator>,
}

impl AggregationLoop {
    pub fn new(aggregator: Arc<UsageAggregator>) -> Self {
        Self { aggregator }
    }

    pub async fn run(self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let period = self.aggregator.interval();
        info!(interval_secs = period.as_secs(), "Starting usage aggregation loop");

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let emitted = self.aggregator.generate_periodic_summaries();
                    debug!(
                        emitted = emitted,
                        active_vms = self.aggregator.active_vm_count(),
                        "Periodic usage summaries generated"
                    );
                }
                _ = shutdown.recv() => {
                    info!("Shutting down usage aggregation loop");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SummaryKind;
    use crate::test_support::sample;
    use std::time::Duration;

    #[tokio::test]
    async fn test_loop_emits_periodic_summaries_until_shutdown() {
        let (aggregator, mut rx) = UsageAggregator::new(Duration::from_millis(20), 16);
        let aggregator = Arc::new(aggregator);
        aggregator.process_metrics_batch("vm-1", "cust", &[sample(0, 1_000, 1, 0, 0)]);

        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
        let handle = tokio::spawn(AggregationLoop::new(aggregator.clone()).run(shutdown_rx));

        let summary = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.kind, SummaryKind::Periodic);
        assert_eq!(summary.vm_id, "vm-1");

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
