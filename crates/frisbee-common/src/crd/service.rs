//! Service CRD types
//!
//! A `Service` is a single Pod whose lifecycle is tracked by Frisbee. Clusters
//! create Services from a templated [`ServiceSpec`].

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PodSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::lifecycle::Lifecycle;

/// Metadata applied to the Pod on top of the inherited labels
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Decorators {
    /// Extra labels for the Pod
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Extra annotations for the Pod
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// A single Pod tracked as a job
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "frisbee.dev",
    version = "v1alpha1",
    kind = "Service",
    plural = "services",
    shortname = "fsvc",
    namespaced,
    status = "ServiceStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Labels and annotations added to the Pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decorators: Option<Decorators>,

    /// The Pod to run
    #[serde(flatten)]
    pub pod: PodSpec,
}

/// Observed state of a Service
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    /// Lifecycle of the Pod
    #[serde(flatten)]
    pub lifecycle: Lifecycle,
}
