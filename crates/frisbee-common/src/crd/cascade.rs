//! Cascade CRD types
//!
//! A `Cascade` is a group of Chaos faults injected one after another.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::chaos::ChaosSpec;
use super::expressions::{ConditionalExpr, SchedulerSpec};
use super::group::{queue_length, validate_group};
use super::lifecycle::Lifecycle;
use crate::Error;

/// A group of Chaos faults created from one template
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "frisbee.dev",
    version = "v1alpha1",
    kind = "Cascade",
    plural = "cascades",
    shortname = "fca",
    namespaced,
    status = "CascadeStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Scheduled","type":"integer","jsonPath":".status.scheduledJobs"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CascadeSpec {
    /// Chaos template. String values may reference `{{ inputs.<key> }}`.
    pub template: ChaosSpec,

    /// Number of faults to inject. With `until`, the upper bound (0 = unbounded).
    #[serde(default)]
    pub instances: u32,

    /// Parameters applied round-robin to the instances
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<BTreeMap<String, String>>,

    /// Keep injecting faults until this condition holds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<ConditionalExpr>,

    /// Pace of fault injection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<SchedulerSpec>,

    /// Stop injecting new faults. Active ones are unaffected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
}

impl CascadeSpec {
    /// Validate the fields of a cascade
    pub fn validate(&self, name: &str) -> Result<(), Error> {
        validate_group(
            name,
            self.instances,
            self.inputs.len(),
            self.until.as_ref(),
            self.schedule.as_ref(),
        )
    }

    /// Number of faults queued at initialization
    pub fn queue_length(&self) -> usize {
        queue_length(self.instances, self.inputs.len(), self.until.as_ref())
    }

    /// Whether new faults must not be injected
    pub fn is_suspended(&self) -> bool {
        self.suspend.unwrap_or(false)
    }
}

fn no_job_scheduled() -> i64 {
    -1
}

/// Observed state of a Cascade
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CascadeStatus {
    /// Aggregated lifecycle of the faults
    #[serde(flatten)]
    pub lifecycle: Lifecycle,

    /// Rendered Chaos specs, one per instance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub queued_jobs: Vec<ChaosSpec>,

    /// Index of the last created fault (-1 before the first)
    #[serde(default = "no_job_scheduled")]
    pub scheduled_jobs: i64,

    /// When the last fault was created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_schedule_time: Option<DateTime<Utc>>,
}

impl Default for CascadeStatus {
    fn default() -> Self {
        Self {
            lifecycle: Lifecycle::default(),
            queued_jobs: Vec::new(),
            scheduled_jobs: no_job_scheduled(),
            last_schedule_time: None,
        }
    }
}
