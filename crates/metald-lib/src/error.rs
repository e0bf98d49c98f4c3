//! Error types for the control plane
//!
//! Domain errors use `thiserror`. The OS and collaborator boundaries
//! (backend, billing client, process scanning) return `anyhow::Result`
//! and are wrapped into these types where they surface to callers.

use thiserror::Error;

/// Errors returned by the VM lifecycle service
#[derive(Debug, Error)]
pub enum VmError {
    /// Malformed request; never retried
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("vm not found: {vm_id}")]
    NotFound { vm_id: String },

    /// Backend or persistence failure
    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

impl VmError {
    pub fn invalid(message: impl Into<String>) -> Self {
        VmError::InvalidArgument(message.into())
    }

    pub fn internal(message: impl Into<String>, source: anyhow::Error) -> Self {
        VmError::Internal {
            message: message.into(),
            source,
        }
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            VmError::InvalidArgument(_) => "invalid_argument",
            VmError::NotFound { .. } => "not_found",
            VmError::Internal { .. } => "internal",
        }
    }
}

/// Errors returned by a `VmRepository`
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The record does not exist or was already soft-deleted
    #[error("vm {0} not found")]
    NotFound(String),

    #[error("vm {0} already exists")]
    AlreadyExists(String),

    #[error("storage failure: {0}")]
    Storage(#[from] anyhow::Error),
}

impl RepositoryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepositoryError::NotFound(_))
    }
}

/// Terminal failure of the bounded-retry cleanup routine
#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("cleanup of vm {vm_id} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        vm_id: String,
        attempts: u32,
        last_error: String,
    },

    /// The detached cleanup task panicked or was aborted by the runtime
    #[error("cleanup task for vm {vm_id} did not complete: {reason}")]
    TaskFailed { vm_id: String, reason: String },
}

pub type VmResult<T> = std::result::Result<T, VmError>;
pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;
