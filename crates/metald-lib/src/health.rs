//! Component health for liveness and readiness probes
//!
//! Each long-running part of the daemon (reconciler, aggregator, collector,
//! repository) reports into a shared registry; the overall status is the
//! worst component status.

use crate::reconciler::ReconciliationReport;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Working, but the last run hit recoverable errors
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        !matches!(self, ComponentStatus::Unhealthy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn with_status(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::with_status(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Unhealthy, Some(message.into()))
    }

    /// Health of the reconciler as shown by its latest cycle
    ///
    /// A skipped pass (unreadable process table) or per-VM failures degrade
    /// it; an unlistable repository makes it unhealthy.
    pub fn from_reconciliation(report: &ReconciliationReport) -> Self {
        if let Some(ref e) = report.list_error {
            Self::unhealthy(format!("repository unavailable: {}", e))
        } else if let Some(ref e) = report.scan_error {
            Self::degraded(format!("process scan failed: {}", e))
        } else if report.errors > 0 {
            Self::degraded(format!("{} vm(s) failed to reconcile", report.errors))
        } else {
            Self::healthy()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across components, healthy when there are none
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const RECONCILER: &str = "reconciler";
    pub const AGGREGATOR: &str = "aggregator";
    pub const COLLECTOR: &str = "collector";
    pub const REPOSITORY: &str = "repository";

    pub const ALL: &[&str] = &[RECONCILER, AGGREGATOR, COLLECTOR, REPOSITORY];
}

#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            ready: Arc::new(RwLock::new(false)),
        }
    }

    /// Register a component as healthy
    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    /// Register every daemon component
    pub async fn register_all(&self) {
        for name in components::ALL {
            self.register(name).await;
        }
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.components
            .write()
            .await
            .insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    /// Fold a reconciliation cycle into the reconciler and repository entries
    pub async fn record_reconciliation(&self, report: &ReconciliationReport) {
        self.update(
            components::RECONCILER,
            ComponentHealth::from_reconciliation(report),
        )
        .await;

        match report.list_error {
            Some(ref e) => self.set_unhealthy(components::REPOSITORY, e.clone()).await,
            None => self.set_healthy(components::REPOSITORY).await,
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = *self.ready.read().await;
        let health = self.health().await;

        let reason = if !ready {
            Some("metald not yet initialized".to_string())
        } else if !health.status.is_operational() {
            let failing: Vec<&str> = health
                .components
                .iter()
                .filter(|(_, c)| !c.status.is_operational())
                .map(|(name, _)| name.as_str())
                .collect();
            Some(format!("unhealthy components: {}", failing.join(", ")))
        } else {
            None
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_state_is_healthy() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_register_all_components() {
        let registry = HealthRegistry::new();
        registry.register_all().await;

        let health = registry.health().await;
        assert_eq!(health.components.len(), 4);
        assert_eq!(
            health.components[components::RECONCILER].status,
            ComponentStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_worst_status_wins() {
        let registry = HealthRegistry::new();
        registry.register_all().await;

        registry
            .set_degraded(components::COLLECTOR, "billing unreachable")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        registry
            .set_unhealthy(components::REPOSITORY, "database is locked")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_reconciliation_scan_failure_degrades() {
        let registry = HealthRegistry::new();
        let mut report = ReconciliationReport::new();
        report.scan_error = Some("permission denied".to_string());

        registry.record_reconciliation(&report).await;

        let health = registry.health().await;
        assert_eq!(
            health.components[components::RECONCILER].status,
            ComponentStatus::Degraded
        );
        assert_eq!(
            health.components[components::REPOSITORY].status,
            ComponentStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_reconciliation_list_failure_is_unhealthy() {
        let registry = HealthRegistry::new();
        registry.set_ready(true).await;
        let mut report = ReconciliationReport::new();
        report.list_error = Some("connection refused".to_string());

        registry.record_reconciliation(&report).await;

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert!(readiness.reason.unwrap().contains("repository"));
    }

    #[tokio::test]
    async fn test_readiness_requires_initialization() {
        let registry = HealthRegistry::new();
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert!(readiness.reason.is_some());

        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);
    }
}
