//! Lifecycle shared by every Frisbee resource
//!
//! A [`Lifecycle`] is the high-level summary of where an object is. Parents
//! compute theirs from the lifecycles of their children.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Phase
// =============================================================================

/// High-level summary of where an object is in its lifecycle.
///
/// Valid transitions:
///
/// ```text
/// Uninitialized -> Pending -> Running -> Success | Failed
/// Uninitialized -> Pending -> Chaos   -> Success
/// Uninitialized -> Failed
/// ```
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Not yet accepted by the controller
    #[default]
    #[serde(rename = "")]
    Uninitialized,
    /// Accepted, but at least one child has not been created
    Pending,
    /// All children are created and at least one is still running
    Running,
    /// All children exited voluntarily and will not be restarted
    Success,
    /// At least one child terminated in failure
    Failed,
    /// At least one child is experiencing an injected fault
    Chaos,
}

impl Phase {
    /// Whether the phase is one of `refs`
    pub fn is(&self, refs: &[Phase]) -> bool {
        refs.contains(self)
    }

    /// Whether the phase can never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "Uninitialized"),
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Success => write!(f, "Success"),
            Self::Failed => write!(f, "Failed"),
            Self::Chaos => write!(f, "Chaos"),
        }
    }
}

// =============================================================================
// Conditions
// =============================================================================

/// Well-known condition types
pub mod condition_types {
    /// The resource has been initialized by its controller
    pub const INITIALIZED: &str = "Initialized";
    /// All jobs of the group have been created
    pub const ALL_JOBS_ARE_SCHEDULED: &str = "AllJobsAreScheduled";
    /// All jobs of the group have completed
    pub const ALL_JOBS_ARE_COMPLETED: &str = "AllJobsAreCompleted";
    /// A job terminated unexpectedly (success or failure)
    pub const UNEXPECTED_TERMINATION: &str = "UnexpectedTermination";
    /// User-defined termination conditions are met
    pub const TERMINATED: &str = "Terminated";
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition explaining why a phase was reached
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., AllJobsAreScheduled)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Observed lifecycle of a resource
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Lifecycle {
    /// Current phase
    #[serde(default)]
    pub phase: Phase,

    /// Brief CamelCase reason for the phase (e.g. 'TooManyJobsHaveFailed')
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Details about the reason
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// When the resource entered Running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// When the resource reached a terminal phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Conditions that warrant the present phase, one per type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Lifecycle {
    /// Move to a new phase.
    ///
    /// Entering Running stamps `start_time` if it is not already set. Entering
    /// a terminal phase stamps `end_time`. Leaving a terminal phase is never
    /// done by the calculators, but clears `end_time` so the two stay coherent.
    pub fn transition(
        &mut self,
        phase: Phase,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.phase = phase;
        self.reason = reason.into();
        self.message = message.into();

        if phase == Phase::Running && self.start_time.is_none() {
            self.start_time = Some(Utc::now());
        }

        if phase.is_terminal() {
            if self.end_time.is_none() {
                self.end_time = Some(Utc::now());
            }
        } else {
            self.end_time = None;
        }
    }

    /// Insert a condition, replacing any existing one of the same type.
    ///
    /// The transition time is kept when neither status nor reason changed.
    /// Returns true if the stored conditions changed.
    pub fn set_condition(&mut self, condition: Condition) -> bool {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            Some(existing) => {
                if existing.status == condition.status
                    && existing.reason == condition.reason
                    && existing.message == condition.message
                {
                    return false;
                }
                let keep_time = existing.status == condition.status;
                let time = existing.last_transition_time;
                *existing = condition;
                if keep_time {
                    existing.last_transition_time = time;
                }
                true
            }
            None => {
                self.conditions.push(condition);
                true
            }
        }
    }

    /// Look up a condition by type
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Whether a condition of the given type is True
    pub fn is_condition_true(&self, type_: &str) -> bool {
        self.condition(type_)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.phase == Phase::Failed {
            let reason = if self.reason.is_empty() {
                "check the logs"
            } else {
                self.reason.as_str()
            };
            return write!(f, "phase:{} reason:{}", self.phase, reason);
        }
        write!(f, "phase:{} ", self.phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uninitialized_serializes_as_empty_string() {
        let json = serde_json::to_string(&Phase::Uninitialized).unwrap();
        assert_eq!(json, "\"\"");
        let phase: Phase = serde_json::from_str("\"Running\"").unwrap();
        assert_eq!(phase, Phase::Running);
    }

    #[test]
    fn terminal_transition_sets_end_time() {
        let mut lf = Lifecycle::default();
        lf.transition(Phase::Running, "AtLeastOneJobIsRunning", "");
        assert!(lf.start_time.is_some());
        assert!(lf.end_time.is_none());

        lf.transition(Phase::Failed, "JobHasFailed", "a");
        assert!(lf.end_time.is_some());
    }

    #[test]
    fn start_time_is_not_overwritten() {
        let mut lf = Lifecycle::default();
        lf.transition(Phase::Running, "r", "");
        let first = lf.start_time;
        lf.transition(Phase::Running, "r2", "");
        assert_eq!(lf.start_time, first);
    }

    #[test]
    fn conditions_are_upserted_by_type() {
        let mut lf = Lifecycle::default();
        assert!(lf.set_condition(Condition::new(
            condition_types::ALL_JOBS_ARE_SCHEDULED,
            ConditionStatus::True,
            "AtLeastOneJobIsRunning",
            "",
        )));
        assert!(!lf.set_condition(Condition::new(
            condition_types::ALL_JOBS_ARE_SCHEDULED,
            ConditionStatus::True,
            "AtLeastOneJobIsRunning",
            "",
        )));
        assert!(lf.set_condition(Condition::new(
            condition_types::ALL_JOBS_ARE_SCHEDULED,
            ConditionStatus::True,
            "UntilCondition",
            "",
        )));

        assert_eq!(lf.conditions.len(), 1);
        assert!(lf.is_condition_true(condition_types::ALL_JOBS_ARE_SCHEDULED));
        assert_eq!(lf.conditions[0].reason, "UntilCondition");
    }

    #[test]
    fn failed_lifecycle_display_includes_reason() {
        let mut lf = Lifecycle::default();
        lf.transition(Phase::Failed, "", "");
        assert_eq!(lf.to_string(), "phase:Failed reason:check the logs");
        lf.reason = "Boom".to_string();
        assert_eq!(lf.to_string(), "phase:Failed reason:Boom");
    }
}
