//! Bounded-retry VM cleanup
//!
//! Deletion through the backend is not fully reliable, so cleanup retries a
//! fixed number of times. The retries run on a detached task with their own
//! per-attempt deadline: dropping the caller's future (client disconnect,
//! request timeout) does not abandon a cleanup that is already in flight.
//! A terminal failure is left for the next reconciliation cycle.

use crate::backend::Backend;
use crate::error::CleanupError;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

/// Number of delete attempts before giving up
pub const CLEANUP_MAX_ATTEMPTS: u32 = 3;

/// Deadline for a single delete attempt, independent of the caller
pub const CLEANUP_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Base delay between attempts, multiplied by the attempt number
pub const CLEANUP_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Delete a VM through the backend, retrying up to [`CLEANUP_MAX_ATTEMPTS`]
pub async fn perform_vm_cleanup(backend: Arc<dyn Backend>, vm_id: &str) -> Result<(), CleanupError> {
    let task_vm_id = vm_id.to_string();
    let handle = tokio::spawn(async move {
        cleanup_with_retries(backend.as_ref(), &task_vm_id, CLEANUP_GRACE_PERIOD).await
    });

    match handle.await {
        Ok(result) => result,
        Err(e) => Err(CleanupError::TaskFailed {
            vm_id: vm_id.to_string(),
            reason: e.to_string(),
        }),
    }
}

async fn cleanup_with_retries(
    backend: &dyn Backend,
    vm_id: &str,
    grace_period: Duration,
) -> Result<(), CleanupError> {
    let mut last_error = String::new();

    for attempt in 1..=CLEANUP_MAX_ATTEMPTS {
        match timeout(grace_period, backend.delete_vm(vm_id)).await {
            Ok(Ok(())) => {
                if attempt > 1 {
                    info!(vm_id = %vm_id, attempt = attempt, "VM cleanup succeeded after retry");
                }
                return Ok(());
            }
            Ok(Err(e)) => {
                warn!(
                    vm_id = %vm_id,
                    attempt = attempt,
                    max_attempts = CLEANUP_MAX_ATTEMPTS,
                    error = %e,
                    "VM cleanup attempt failed"
                );
                last_error = format!("{:#}", e);
            }
            Err(_) => {
                warn!(
                    vm_id = %vm_id,
                    attempt = attempt,
                    grace_ms = grace_period.as_millis() as u64,
                    "VM cleanup attempt timed out"
                );
                last_error = format!("timed out after {}ms", grace_period.as_millis());
            }
        }

        if attempt < CLEANUP_MAX_ATTEMPTS {
            sleep(CLEANUP_RETRY_BACKOFF * attempt).await;
        }
    }

    error!(
        vm_id = %vm_id,
        attempts = CLEANUP_MAX_ATTEMPTS,
        error = %last_error,
        "VM cleanup exhausted retries, leaving it to reconciliation"
    );

    Err(CleanupError::Exhausted {
        vm_id: vm_id.to_string(),
        attempts: CLEANUP_MAX_ATTEMPTS,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockBackend;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_succeeds_on_first_attempt() {
        let backend = Arc::new(MockBackend::new());

        perform_vm_cleanup(backend.clone(), "vm-1").await.unwrap();

        assert_eq!(backend.delete_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_succeeds_on_second_and_third_attempt() {
        for failures in [1u32, 2] {
            let backend = Arc::new(MockBackend::new());
            backend.fail_next_deletes(failures);

            perform_vm_cleanup(backend.clone(), "vm-1").await.unwrap();

            assert_eq!(backend.delete_calls.load(Ordering::SeqCst), failures + 1);
        }
    }

    #[tokio::test]
    async fn test_fails_after_exactly_three_attempts() {
        let backend = Arc::new(MockBackend::new());
        backend.fail_next_deletes(10);

        let err = perform_vm_cleanup(backend.clone(), "vm-1").await.unwrap_err();

        assert_eq!(backend.delete_calls.load(Ordering::SeqCst), 3);
        match err {
            CleanupError::Exhausted { attempts, vm_id, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(vm_id, "vm-1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_failure() {
        let backend = MockBackend::new();
        backend.set_delete_delay(Duration::from_millis(200));

        let result = cleanup_with_retries(&backend, "vm-1", Duration::from_millis(10)).await;

        assert!(matches!(result, Err(CleanupError::Exhausted { .. })));
        assert_eq!(backend.delete_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cleanup_survives_caller_cancellation() {
        let backend = Arc::new(MockBackend::new());
        backend.set_delete_delay(Duration::from_millis(50));

        // The caller gives up long before the backend finishes
        let caller = timeout(
            Duration::from_millis(5),
            perform_vm_cleanup(backend.clone(), "vm-1"),
        )
        .await;
        assert!(caller.is_err());

        sleep(Duration::from_millis(200)).await;
        assert_eq!(backend.deletes_completed.load(Ordering::SeqCst), 1);
    }
}
