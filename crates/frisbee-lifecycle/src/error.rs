//! Lifecycle engine error types

use frisbee_common::crd::Phase;
use frisbee_common::Error;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("{0}")]
    Common(#[from] Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// A tracked set of children settled in a phase other than the awaited one
    #[error("expected {expected} but got {got} ({message})")]
    UnexpectedPhase {
        expected: Phase,
        got: Phase,
        message: String,
    },

    /// Children moved along an edge the parent lifecycle does not allow
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: Phase, to: Phase },
}

impl LifecycleError {
    /// Whether the error was raised by a violated invariant
    pub fn is_invariant(&self) -> bool {
        matches!(self, Self::Common(e) if e.is_invariant())
    }

    /// Whether a wait was cancelled before it completed
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Common(e) if e.is_cancelled())
    }

    /// Whether retrying the operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Common(e) => e.is_retryable(),
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::UnexpectedPhase { .. } | Self::InvalidTransition { .. } => false,
        }
    }
}

impl From<kube::Error> for LifecycleError {
    fn from(e: kube::Error) -> Self {
        Self::Common(e.into())
    }
}

impl From<serde_json::Error> for LifecycleError {
    fn from(e: serde_json::Error) -> Self {
        Self::Common(e.into())
    }
}

pub type Result<T, E = LifecycleError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates_see_through_the_wrapper() {
        let err: LifecycleError = Error::invariant("grouped_jobs", "no rule matched").into();
        assert!(err.is_invariant());
        assert!(!err.is_cancelled());

        let err: LifecycleError = Error::cancelled("expect").into();
        assert!(err.is_cancelled());
        assert!(!err.is_retryable());
    }

    #[test]
    fn common_errors_display_unchanged() {
        let err: LifecycleError = Error::scheduling("servers", "bad cron").into();
        assert_eq!(err.to_string(), "scheduling error for servers: bad cron");
    }
}
