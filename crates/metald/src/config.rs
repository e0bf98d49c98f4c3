//! Daemon configuration

use anyhow::{Context, Result};
use metald_lib::billing::CollectorConfig;
use metald_lib::reconciler::ReconcilerConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, read from `METALD_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Identifies this host in logs and billing heartbeats
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Periodic usage summary interval in seconds
    #[serde(default = "default_aggregation_interval")]
    pub aggregation_interval_secs: u64,

    #[serde(default = "default_collection_interval")]
    pub collection_interval_secs: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Samples per billing batch
    #[serde(default = "default_billing_batch_size")]
    pub billing_batch_size: usize,

    /// Capacity of the usage summary channel
    #[serde(default = "default_summary_buffer_size")]
    pub summary_buffer_size: usize,

    /// Root of the process table scanned by the reconciler
    #[serde(default = "default_proc_path")]
    pub proc_path: PathBuf,
}

fn default_instance_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "metald".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_reconcile_interval() -> u64 {
    300
}

fn default_aggregation_interval() -> u64 {
    60
}

fn default_collection_interval() -> u64 {
    15
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_billing_batch_size() -> usize {
    4
}

fn default_summary_buffer_size() -> usize {
    1024
}

fn default_proc_path() -> PathBuf {
    PathBuf::from("/proc")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            api_port: default_api_port(),
            reconcile_interval_secs: default_reconcile_interval(),
            aggregation_interval_secs: default_aggregation_interval(),
            collection_interval_secs: default_collection_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            billing_batch_size: default_billing_batch_size(),
            summary_buffer_size: default_summary_buffer_size(),
            proc_path: default_proc_path(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        Self::from_builder(
            config::Config::builder()
                .add_source(config::Environment::with_prefix("METALD").try_parsing(true)),
        )
    }

    /// Build from an arbitrary source stack; unset fields take their defaults
    pub fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self> {
        let config = builder.build().context("Failed to read configuration")?;
        let config: Self = config
            .try_deserialize()
            .context("Invalid METALD_ configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, secs) in [
            ("reconcile_interval_secs", self.reconcile_interval_secs),
            ("aggregation_interval_secs", self.aggregation_interval_secs),
            ("collection_interval_secs", self.collection_interval_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
        ] {
            if secs == 0 {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }
        if self.billing_batch_size == 0 {
            anyhow::bail!("billing_batch_size must be greater than zero");
        }
        Ok(())
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: Duration::from_secs(self.reconcile_interval_secs),
            ..Default::default()
        }
    }

    pub fn aggregation_interval(&self) -> Duration {
        Duration::from_secs(self.aggregation_interval_secs)
    }

    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            instance_id: self.instance_id.clone(),
            interval: Duration::from_secs(self.collection_interval_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            batch_size: self.billing_batch_size,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_source_uses_defaults() {
        let config = DaemonConfig::from_builder(config::Config::builder()).unwrap();

        assert_eq!(config.api_port, 8080);
        assert_eq!(config.reconcile_interval_secs, 300);
        assert_eq!(config.proc_path, PathBuf::from("/proc"));
        assert_eq!(config.reconciler_config().interval, Duration::from_secs(300));
    }

    #[test]
    fn test_overrides_apply() {
        let builder = config::Config::builder()
            .set_override("api_port", 9100)
            .unwrap()
            .set_override("instance_id", "host-7")
            .unwrap()
            .set_override("collection_interval_secs", 5)
            .unwrap();

        let config = DaemonConfig::from_builder(builder).unwrap();

        assert_eq!(config.api_port, 9100);
        let collector = config.collector_config();
        assert_eq!(collector.instance_id, "host-7");
        assert_eq!(collector.interval, Duration::from_secs(5));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let builder = config::Config::builder()
            .set_override("reconcile_interval_secs", 0)
            .unwrap();

        assert!(DaemonConfig::from_builder(builder).is_err());
    }
}
