//! Chaos CRD types
//!
//! A `Chaos` is a single injected fault. Its parameters are unstructured and
//! interpreted by the fault injector, so the engine only tracks its lifecycle.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::lifecycle::Lifecycle;

/// A single injected fault
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "frisbee.dev",
    version = "v1alpha1",
    kind = "Chaos",
    plural = "chaos",
    shortname = "fch",
    namespaced,
    status = "ChaosStatus",
    printcolumn = r#"{"name":"Fault","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ChaosSpec {
    /// Kind of fault (e.g. "partition", "kill")
    #[serde(rename = "type")]
    pub fault_type: String,

    /// Fault parameters, passed through to the injector
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,
}

/// Observed state of a Chaos
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChaosStatus {
    /// Lifecycle of the fault
    #[serde(flatten)]
    pub lifecycle: Lifecycle,
}
