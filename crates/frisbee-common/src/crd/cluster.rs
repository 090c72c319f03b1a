//! Cluster CRD types
//!
//! A `Cluster` is a group of Services rendered from a single template.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::expressions::{ConditionalExpr, SchedulerSpec, TolerateSpec};
use super::group::{queue_length, validate_group};
use super::lifecycle::Lifecycle;
use super::service::ServiceSpec;
use crate::Error;

/// A group of Services created from one template
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "frisbee.dev",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    shortname = "fcl",
    namespaced,
    status = "ClusterStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Scheduled","type":"integer","jsonPath":".status.scheduledJobs"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Service template. String values may reference `{{ inputs.<key> }}`.
    pub template: ServiceSpec,

    /// Number of Services to create. With `until`, the upper bound of
    /// created Services (0 = unbounded).
    #[serde(default)]
    pub instances: u32,

    /// Parameters applied round-robin to the instances
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<BTreeMap<String, String>>,

    /// Keep creating Services until this condition holds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<ConditionalExpr>,

    /// Failures the cluster survives. Absent means none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerate: Option<TolerateSpec>,

    /// Pace of Service creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<SchedulerSpec>,

    /// Stop creating new Services. Running ones are unaffected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
}

impl ClusterSpec {
    /// Validate the fields of a cluster
    pub fn validate(&self, name: &str) -> Result<(), Error> {
        validate_group(
            name,
            self.instances,
            self.inputs.len(),
            self.until.as_ref(),
            self.schedule.as_ref(),
        )
    }

    /// Number of Services queued at initialization
    pub fn queue_length(&self) -> usize {
        queue_length(self.instances, self.inputs.len(), self.until.as_ref())
    }

    /// Whether new Services must not be created
    pub fn is_suspended(&self) -> bool {
        self.suspend.unwrap_or(false)
    }
}

fn no_job_scheduled() -> i64 {
    -1
}

/// Observed state of a Cluster
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Aggregated lifecycle of the Services
    #[serde(flatten)]
    pub lifecycle: Lifecycle,

    /// Rendered Service specs, one per instance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub queued_jobs: Vec<ServiceSpec>,

    /// Index of the last created Service (-1 before the first)
    #[serde(default = "no_job_scheduled")]
    pub scheduled_jobs: i64,

    /// When the last Service was created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_schedule_time: Option<DateTime<Utc>>,
}

impl Default for ClusterStatus {
    fn default() -> Self {
        Self {
            lifecycle: Lifecycle::default(),
            queued_jobs: Vec::new(),
            scheduled_jobs: no_job_scheduled(),
            last_schedule_time: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::Phase;

    #[test]
    fn status_defaults_cursor_before_first_job() {
        let status: ClusterStatus = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(status.scheduled_jobs, -1);
        assert_eq!(status.lifecycle.phase, Phase::Uninitialized);
    }

    #[test]
    fn spec_parses_from_yaml_shape() {
        let spec: ClusterSpec = serde_json::from_value(serde_json::json!({
            "template": {
                "containers": [{"name": "app", "image": "busybox"}]
            },
            "instances": 3,
            "inputs": [{"port": "80"}, {"port": "81"}],
            "tolerate": {"failedJobs": 1}
        }))
        .unwrap();

        assert_eq!(spec.instances, 3);
        assert_eq!(spec.template.pod.containers.len(), 1);
        assert_eq!(spec.tolerate.as_ref().map(|t| t.failed_jobs), Some(1));
        assert!(!spec.is_suspended());
    }

    #[test]
    fn validation_rejects_conflicting_until() {
        let spec = ClusterSpec {
            instances: 2,
            until: Some(ConditionalExpr {
                metrics: Some("avg() of query(a/1/b, 1m, now) is below(1)".into()),
                state: Some("{{.Count}} > 1".into()),
            }),
            ..Default::default()
        };
        assert!(spec.validate("web").is_err());
    }
}
