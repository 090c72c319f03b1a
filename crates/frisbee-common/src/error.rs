//! Error types for the Frisbee operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the resource or expression it concerns so that
//! a log line alone is enough to locate the offending object.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Frisbee operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.until")
        field: Option<String>,
    },

    /// A metrics or state expression could not be parsed or evaluated
    #[error("expression error in '{expr}': {message}")]
    Expression {
        /// The offending expression, verbatim
        expr: String,
        /// Description of what failed
        message: String,
    },

    /// Scheduling could not decide on the next job
    #[error("scheduling error for {resource}: {message}")]
    Scheduling {
        /// Name of the parent being scheduled
        resource: String,
        /// Description of what failed
        message: String,
    },

    /// Alerting backend error
    #[error("alerting error: {message}")]
    Alerting {
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// A programming invariant was violated
    ///
    /// These are not retried. The state space was assumed exhaustive and
    /// continuing would corrupt the status of the resource.
    #[error("invariant violation [{context}]: {message}")]
    Invariant {
        /// Where the invariant was checked (e.g., "grouped_jobs", "notifier")
        context: String,
        /// Description of the violated assumption
        message: String,
    },

    /// A blocking wait or callback was cancelled before it completed
    #[error("cancelled [{context}]")]
    Cancelled {
        /// The operation that was waiting
        context: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "webhook")
        context: String,
    },
}

impl Error {
    /// Create a validation error without resource context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an expression error for the given expression
    pub fn expression(expr: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Expression {
            expr: expr.into(),
            message: msg.into(),
        }
    }

    /// Create a scheduling error for the given parent
    pub fn scheduling(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Scheduling {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a retryable alerting error
    pub fn alerting(msg: impl Into<String>) -> Self {
        Self::Alerting {
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create an alerting error that will not succeed on retry
    pub fn alerting_permanent(msg: impl Into<String>) -> Self {
        Self::Alerting {
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create an invariant violation
    pub fn invariant(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Invariant {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a cancellation error for the given operation
    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled {
            context: context.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error for a specific resource kind
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error without context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether retrying the failed operation may succeed
    ///
    /// Kubernetes conflicts and not-found races, alerting backends that are not
    /// reachable yet, and internal errors are transient. A schedule that cannot
    /// be parsed or has fallen too far behind is permanent, like validation and
    /// expression errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube { .. } => true,
            Self::Alerting { retryable, .. } => *retryable,
            Self::Internal { .. } => true,
            Self::Validation { .. }
            | Self::Scheduling { .. }
            | Self::Expression { .. }
            | Self::Invariant { .. }
            | Self::Cancelled { .. }
            | Self::Serialization { .. } => false,
        }
    }

    /// Whether this error reports a violated programming invariant
    pub fn is_invariant(&self) -> bool {
        matches!(self, Self::Invariant { .. })
    }

    /// Whether this error reports a cancelled wait
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_carries_field_path() {
        let err = Error::validation_for_field("web", "spec.until", "both forms set");
        match &err {
            Error::Validation {
                resource, field, ..
            } => {
                assert_eq!(resource, "web");
                assert_eq!(field.as_deref(), Some("spec.until"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
        assert_eq!(
            err.to_string(),
            "validation error for web: both forms set"
        );
    }

    #[test]
    fn expression_error_names_expression() {
        let err = Error::expression("{{.Nope}}", "unknown method");
        assert!(err.to_string().contains("{{.Nope}}"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn broken_schedules_are_permanent() {
        assert!(!Error::scheduling("servers", "unparseable schedule 'nope'").is_retryable());
    }

    #[test]
    fn invariants_and_cancellation_are_permanent() {
        assert!(!Error::invariant("notifier", "cannot wait").is_retryable());
        assert!(!Error::cancelled("expect").is_retryable());
        assert!(Error::invariant("x", "y").is_invariant());
        assert!(Error::cancelled("x").is_cancelled());
    }

    #[test]
    fn alerting_retryability_follows_constructor() {
        assert!(Error::alerting("dashboard not found").is_retryable());
        assert!(!Error::alerting_permanent("panel already has alert").is_retryable());
    }

    #[test]
    fn json_errors_become_serialization_errors() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { kind: None, .. }));
    }
}
