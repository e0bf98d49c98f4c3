//! Daemon wiring
//!
//! Builds the long-running components from configuration, runs each on its
//! own task and stops them all through one broadcast shutdown signal.
//!
//! No hypervisor backend ships with this crate. Lifecycle operations and
//! metrics collection exist only once one is attached with
//! [`Daemon::with_backend`]; until then the reconciler and aggregator run
//! against an empty in-memory repository.

use crate::api::{self, AppState};
use crate::config::DaemonConfig;
use anyhow::Result;
use metald_lib::{
    backend::Backend,
    billing::{AggregationLoop, AggregatorBillingClient, MetricsCollector, UsageAggregator},
    health::{components, HealthRegistry},
    lifecycle::VmService,
    models::UsageSummary,
    observability::{ControlPlaneMetrics, StructuredLogger},
    reconciler::{ProcFsScanner, VmReconciler},
    repository::{InMemoryVmRepository, VmRepository},
};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct Daemon {
    config: DaemonConfig,
    health: HealthRegistry,
    metrics: ControlPlaneMetrics,
    logger: StructuredLogger,
    repository: Arc<dyn VmRepository>,
    aggregator: Arc<UsageAggregator>,
    summaries: mpsc::Receiver<UsageSummary>,
    collector: Option<Arc<MetricsCollector>>,
    service: Option<VmService>,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Self {
        let (aggregator, summaries) =
            UsageAggregator::new(config.aggregation_interval(), config.summary_buffer_size);
        let logger = StructuredLogger::new(&config.instance_id);

        Self {
            health: HealthRegistry::new(),
            metrics: ControlPlaneMetrics::new(),
            logger,
            repository: Arc::new(InMemoryVmRepository::new()),
            aggregator: Arc::new(aggregator),
            summaries,
            collector: None,
            service: None,
            config,
        }
    }

    /// Attach a hypervisor backend, enabling lifecycle operations and metering
    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        let billing = Arc::new(AggregatorBillingClient::new(self.aggregator.clone()));
        let collector = Arc::new(
            MetricsCollector::new(backend.clone(), billing, self.config.collector_config())
                .with_health(self.health.clone()),
        );

        self.service = Some(
            VmService::new(backend, self.repository.clone()).with_collection(collector.clone()),
        );
        self.collector = Some(collector);
        self
    }

    /// Lifecycle service, present once a backend is attached
    pub fn service(&self) -> Option<&VmService> {
        self.service.as_ref()
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    /// Run every component until `signal` resolves
    pub async fn run(self, signal: impl Future<Output = ()>) -> Result<()> {
        let Daemon {
            config,
            health,
            metrics,
            logger,
            repository,
            aggregator,
            summaries,
            collector,
            service: _service,
        } = self;

        health.register_all().await;
        if collector.is_none() {
            warn!("No hypervisor backend attached, metrics collection disabled");
            health
                .set_degraded(components::COLLECTOR, "no hypervisor backend attached")
                .await;
        }

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let mut reconciler = VmReconciler::new(
            repository,
            Arc::new(ProcFsScanner::with_proc_path(config.proc_path.clone())),
            config.reconciler_config(),
        )
        .with_logger(logger.clone())
        .with_health(health.clone());
        if let Some(ref collector) = collector {
            reconciler = reconciler.with_collection(collector.clone());
        }
        tasks.push((
            components::RECONCILER,
            tokio::spawn(reconciler.run(shutdown_tx.subscribe())),
        ));

        tasks.push((
            components::AGGREGATOR,
            tokio::spawn(AggregationLoop::new(aggregator.clone()).run(shutdown_tx.subscribe())),
        ));
        tasks.push((
            "summaries",
            tokio::spawn(log_summaries(
                summaries,
                logger.clone(),
                shutdown_tx.subscribe(),
            )),
        ));

        if let Some(collector) = collector {
            tasks.push((
                components::COLLECTOR,
                tokio::spawn(collector.run(shutdown_tx.subscribe())),
            ));
        }

        let state = Arc::new(AppState::new(
            config.instance_id.clone(),
            health.clone(),
            metrics,
            aggregator,
        ));
        let api_shutdown = shutdown_tx.subscribe();
        let api_port = config.api_port;
        let api_handle = tokio::spawn(async move {
            if let Err(e) = api::serve(api_port, state, api_shutdown).await {
                error!(error = %e, "API server failed");
            }
        });
        tasks.push(("api", api_handle));

        health.set_ready(true).await;
        logger.log_startup(env!("CARGO_PKG_VERSION"));

        signal.await;
        logger.log_shutdown("signal received");
        health.set_ready(false).await;

        // Receivers only fail to exist if every task already exited
        let _ = shutdown_tx.send(());
        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "Task panicked during shutdown");
            }
        }

        info!("All tasks stopped");
        Ok(())
    }
}

/// Log every emitted usage summary until shutdown
async fn log_summaries(
    mut summaries: mpsc::Receiver<UsageSummary>,
    logger: StructuredLogger,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            summary = summaries.recv() => match summary {
                Some(summary) => logger.log_usage_summary(&summary),
                None => break,
            },
            _ = shutdown.recv() => break,
        }
    }

    // Drain what was emitted before shutdown
    while let Ok(summary) = summaries.try_recv() {
        logger.log_usage_summary(&summary);
    }
}
