//! metald - Firecracker host control plane daemon
//!
//! Runs VM reconciliation and usage aggregation on a single host and
//! serves health and metrics endpoints.
//!
//! This binary attaches no hypervisor backend, so there is no lifecycle
//! path: VMs are neither created nor metered and the reconciler scans an
//! empty in-memory repository. Embedders supply a backend through
//! [`metald::Daemon::with_backend`].

use anyhow::{Context, Result};
use metald::{Daemon, DaemonConfig};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = DaemonConfig::load()?;
    info!(
        instance_id = %config.instance_id,
        api_port = config.api_port,
        proc_path = %config.proc_path.display(),
        "metald configured"
    );

    let daemon = Daemon::new(config);

    let (signal_tx, signal_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let result = tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for SIGINT");
        let _ = signal_tx.send(result);
    });

    daemon
        .run(async move {
            match signal_rx.await {
                Ok(Ok(())) => info!("SIGINT received"),
                Ok(Err(e)) => tracing::error!(error = %e, "Signal handler failed, shutting down"),
                Err(_) => tracing::error!("Signal task dropped, shutting down"),
            }
        })
        .await
}
