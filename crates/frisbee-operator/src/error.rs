//! Errors surfaced by the controllers

use frisbee_common::Error;
use frisbee_lifecycle::LifecycleError;
use thiserror::Error;

/// Error returned by a reconcile
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Shared Frisbee error (kube, validation, invariant, ...)
    #[error(transparent)]
    Common(#[from] Error),

    /// Error raised by the lifecycle engine
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl ControllerError {
    /// Whether the error breaks an internal invariant. The object is not
    /// requeued, since the same input would fail the same way.
    pub fn is_invariant(&self) -> bool {
        match self {
            Self::Common(e) => e.is_invariant(),
            Self::Lifecycle(e) => e.is_invariant(),
        }
    }

    /// Whether retrying the reconcile may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Common(e) => e.is_retryable(),
            Self::Lifecycle(e) => e.is_retryable(),
        }
    }
}

impl From<kube::Error> for ControllerError {
    fn from(e: kube::Error) -> Self {
        Self::Common(e.into())
    }
}

/// Result of controller operations
pub type Result<T, E = ControllerError> = std::result::Result<T, E>;
