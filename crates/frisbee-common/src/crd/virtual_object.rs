//! VirtualObject CRD types
//!
//! A `VirtualObject` has no controller of its own. It stands in for an action
//! that runs inside the operator (a call, a deletion) so that the action can
//! be tracked like any other job.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::lifecycle::Lifecycle;

/// Placeholder for an action executed by the operator
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "frisbee.dev",
    version = "v1alpha1",
    kind = "VirtualObject",
    plural = "virtualobjects",
    shortname = "vobj",
    namespaced,
    status = "VirtualObjectStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct VirtualObjectSpec {}

/// Observed state of a VirtualObject
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualObjectStatus {
    /// Outcome of the action
    #[serde(flatten)]
    pub lifecycle: Lifecycle,

    /// Values produced by the action
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
}
