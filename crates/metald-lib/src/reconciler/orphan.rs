//! Orphaned record detection
//!
//! A stopped VM record is orphaned when it is old enough and nothing on the
//! host still belongs to it. The checks are conjunctive and short-circuit in
//! order: age, resource existence, shutdown markers.

use crate::models::Vm;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Minimum time since the last update before a stopped record may be deleted
pub const ORPHANED_RECORD_AGE_THRESHOLD: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Host-side evidence that a VM record is still meaningful
#[async_trait]
pub trait OrphanEvidence: Send + Sync {
    /// Whether any host resource (socket, tap device, chroot) still exists for the VM
    async fn resources_exist(&self, vm: &Vm) -> Result<bool>;

    /// Whether a clean-shutdown marker was recorded for the VM
    async fn has_shutdown_markers(&self, vm: &Vm) -> Result<bool>;
}

/// Evidence source that never finds anything
///
/// With this probe, age alone decides whether a stopped record is orphaned.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEvidence;

#[async_trait]
impl OrphanEvidence for NoEvidence {
    async fn resources_exist(&self, _vm: &Vm) -> Result<bool> {
        Ok(false)
    }

    async fn has_shutdown_markers(&self, _vm: &Vm) -> Result<bool> {
        Ok(false)
    }
}

pub struct OrphanDetector {
    evidence: Arc<dyn OrphanEvidence>,
    age_threshold: chrono::Duration,
}

impl OrphanDetector {
    pub fn new(evidence: Arc<dyn OrphanEvidence>, age_threshold: Duration) -> Self {
        Self {
            evidence,
            age_threshold: chrono::Duration::seconds(age_threshold.as_secs() as i64),
        }
    }

    pub async fn is_orphaned(&self, vm: &Vm, now: DateTime<Utc>) -> Result<bool> {
        if now.signed_duration_since(vm.updated_at) < self.age_threshold {
            return Ok(false);
        }
        if self.evidence.resources_exist(vm).await? {
            return Ok(false);
        }
        if self.evidence.has_shutdown_markers(vm).await? {
            return Ok(false);
        }
        Ok(true)
    }
}

impl Default for OrphanDetector {
    fn default() -> Self {
        Self::new(Arc::new(NoEvidence), ORPHANED_RECORD_AGE_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VmState;
    use crate::test_support::valid_vm_config;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn stopped_vm(age: chrono::Duration) -> Vm {
        let mut vm = Vm::new("vm-old", "cust", valid_vm_config());
        vm.state = VmState::Shutdown;
        vm.updated_at = Utc::now() - age;
        vm
    }

    #[derive(Default)]
    struct FixedEvidence {
        resources: bool,
        markers: bool,
        probes: AtomicUsize,
    }

    #[async_trait]
    impl OrphanEvidence for FixedEvidence {
        async fn resources_exist(&self, _vm: &Vm) -> Result<bool> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(self.resources)
        }

        async fn has_shutdown_markers(&self, _vm: &Vm) -> Result<bool> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(self.markers)
        }
    }

    #[tokio::test]
    async fn test_age_threshold() {
        let detector = OrphanDetector::default();
        let now = Utc::now();

        assert!(detector
            .is_orphaned(&stopped_vm(chrono::Duration::days(8)), now)
            .await
            .unwrap());
        assert!(!detector
            .is_orphaned(&stopped_vm(chrono::Duration::hours(1)), now)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_young_record_skips_probes() {
        let evidence = Arc::new(FixedEvidence::default());
        let detector = OrphanDetector::new(evidence.clone(), ORPHANED_RECORD_AGE_THRESHOLD);

        let orphaned = detector
            .is_orphaned(&stopped_vm(chrono::Duration::days(1)), Utc::now())
            .await
            .unwrap();

        assert!(!orphaned);
        assert_eq!(evidence.probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_any_evidence_keeps_record() {
        let old = stopped_vm(chrono::Duration::days(30));

        let resources = OrphanDetector::new(
            Arc::new(FixedEvidence {
                resources: true,
                ..Default::default()
            }),
            ORPHANED_RECORD_AGE_THRESHOLD,
        );
        assert!(!resources.is_orphaned(&old, Utc::now()).await.unwrap());

        let markers = OrphanDetector::new(
            Arc::new(FixedEvidence {
                markers: true,
                ..Default::default()
            }),
            ORPHANED_RECORD_AGE_THRESHOLD,
        );
        assert!(!markers.is_orphaned(&old, Utc::now()).await.unwrap());
    }
}
