//! Conditional expressions, scheduling and toleration policies
//!
//! These types are embedded in the specs of grouped resources (Cluster,
//! Cascade) and persisted with them.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

// =============================================================================
// ConditionalExpr
// =============================================================================

/// A condition evaluated either against external metrics or against the
/// phases of the children.
///
/// At most one of the two forms may be set. An expression with neither form
/// is unconditional.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalExpr {
    /// Alert expression registered on a dashboard panel, e.g.
    /// `avg() of query(wpFnYRwGk/2/bitrate, 15m, now) is below(14)`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<String>,

    /// Boolean expression over the children, e.g.
    /// `{{.NumSuccessfulJobs}} >= 3 || {{.IsFailed "db-0"}}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl ConditionalExpr {
    /// Create a metrics expression
    pub fn metrics(expr: impl Into<String>) -> Self {
        Self {
            metrics: Some(expr.into()),
            state: None,
        }
    }

    /// Create a state expression
    pub fn state(expr: impl Into<String>) -> Self {
        Self {
            metrics: None,
            state: Some(expr.into()),
        }
    }

    /// The metrics form, if set and non-empty
    pub fn metrics_expr(&self) -> Option<&str> {
        self.metrics.as_deref().filter(|s| !s.is_empty())
    }

    /// The state form, if set and non-empty
    pub fn state_expr(&self) -> Option<&str> {
        self.state.as_deref().filter(|s| !s.is_empty())
    }

    /// Whether the metrics form is set
    pub fn has_metrics_expr(&self) -> bool {
        self.metrics_expr().is_some()
    }

    /// Whether the state form is set
    pub fn has_state_expr(&self) -> bool {
        self.state_expr().is_some()
    }

    /// Whether neither form is set
    pub fn is_unconditional(&self) -> bool {
        !self.has_metrics_expr() && !self.has_state_expr()
    }

    /// Reject expressions that set both forms
    pub fn validate(&self, resource: &str, field: &str) -> Result<(), Error> {
        if self.has_metrics_expr() && self.has_state_expr() {
            return Err(Error::validation_for_field(
                resource,
                field,
                "metrics and state expressions are mutually exclusive",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// SchedulerSpec
// =============================================================================

/// When the next job of a group is created
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSpec {
    /// Cron rule, e.g. `*/5 * * * *`, `0 30 * * * *`, `@hourly`, `@every 1h30m`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,

    /// Deadline in seconds for starting a job that missed its scheduled time.
    /// Past the deadline the activation is skipped and the next one awaited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_deadline_seconds: Option<i64>,

    /// Create the next job only when this condition holds. Takes precedence
    /// over `cron`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<ConditionalExpr>,
}

impl SchedulerSpec {
    /// Reject a spec with no trigger or with an invalid event
    pub fn validate(&self, resource: &str) -> Result<(), Error> {
        if let Some(event) = &self.event {
            event.validate(resource, "spec.schedule.event")?;
            if event.is_unconditional() {
                return Err(Error::validation_for_field(
                    resource,
                    "spec.schedule.event",
                    "event must set either a metrics or a state expression",
                ));
            }
        } else if self.cron.as_deref().is_none_or(str::is_empty) {
            return Err(Error::validation_for_field(
                resource,
                "spec.schedule",
                "either cron or event must be set",
            ));
        }
        if self.starting_deadline_seconds.is_some_and(|s| s < 0) {
            return Err(Error::validation_for_field(
                resource,
                "spec.schedule.startingDeadlineSeconds",
                "must not be negative",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// TolerateSpec
// =============================================================================

/// How many failed children a group survives
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TolerateSpec {
    /// Number of children that may fail before the group fails itself
    #[serde(default)]
    pub failed_jobs: u32,
}

impl std::fmt::Display for TolerateSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.failed_jobs == 0 {
            write!(f, "None")
        } else {
            write!(f, "FailedJobs:{}", self.failed_jobs)
        }
    }
}
