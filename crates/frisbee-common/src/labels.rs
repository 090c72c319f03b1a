//! Well-known labels and helpers for tagging children with their lineage
//!
//! Every object a controller creates carries the scenario it belongs to, the
//! action that produced it, the name of its creator and its component role.
//! Listing children is always done through the created-by label.

use std::collections::BTreeMap;
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::Error;

/// Points to the scenario an object belongs to
pub const LABEL_SCENARIO: &str = "scenario.frisbee.dev/name";

/// Points to the action (step of the scenario) an object is part of
pub const LABEL_ACTION: &str = "scenario.frisbee.dev/action";

/// Points to the parent that created an object
pub const LABEL_CREATED_BY: &str = "scenario.frisbee.dev/created-by";

/// Role of the object within the scenario (`SYS` or `SUT`)
pub const LABEL_COMPONENT: &str = "scenario.frisbee.dev/component";

/// Used to discover Frisbee resources across namespaces
pub const LABEL_DISCOVERY: &str = "discover.frisbee.dev/name";

/// Role of an object within a scenario
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Component {
    /// Part of the testing platform itself (e.g. dashboards). Never a chaos target.
    Sys,
    /// Part of the system under test
    Sut,
}

impl Component {
    /// Label value for this component
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sys => "SYS",
            Self::Sut => "SUT",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Component {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SYS" => Ok(Self::Sys),
            "SUT" => Ok(Self::Sut),
            other => Err(Error::validation_for_field(
                "labels",
                LABEL_COMPONENT,
                format!("unknown component type '{other}'"),
            )),
        }
    }
}

/// Insert or overwrite a label
pub fn append_label(meta: &mut ObjectMeta, key: impl Into<String>, value: impl Into<String>) {
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .insert(key.into(), value.into());
}

/// Insert or overwrite an annotation
pub fn append_annotation(meta: &mut ObjectMeta, key: impl Into<String>, value: impl Into<String>) {
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.into(), value.into());
}

/// Tag an object with the scenario it belongs to
pub fn set_scenario(meta: &mut ObjectMeta, scenario: &str) {
    append_label(meta, LABEL_SCENARIO, scenario);
}

/// Tag an object with the action it is part of
pub fn set_action(meta: &mut ObjectMeta, action: &str) {
    append_label(meta, LABEL_ACTION, action);
}

/// Tag an object with its component role
pub fn set_component(meta: &mut ObjectMeta, component: Component) {
    append_label(meta, LABEL_COMPONENT, component.as_str());
}

/// Tag a child with the name of its creator
pub fn set_created_by(child: &mut ObjectMeta, parent: &str) {
    append_label(child, LABEL_CREATED_BY, parent);
}

/// Copy every label of the parent onto the child.
///
/// Labels already on the child are overwritten by the parent's value.
pub fn propagate(child: &mut ObjectMeta, parent: &ObjectMeta) {
    if let Some(labels) = &parent.labels {
        let target = child.labels.get_or_insert_with(BTreeMap::new);
        for (k, v) in labels {
            target.insert(k.clone(), v.clone());
        }
    }
}

fn label<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.labels.as_ref()?.get(key).map(String::as_str)
}

/// Scenario the object belongs to, if labelled
pub fn scenario(meta: &ObjectMeta) -> Option<&str> {
    label(meta, LABEL_SCENARIO)
}

/// Action the object is part of, if labelled
pub fn action(meta: &ObjectMeta) -> Option<&str> {
    label(meta, LABEL_ACTION)
}

/// Creator of the object, if labelled
pub fn created_by(meta: &ObjectMeta) -> Option<&str> {
    label(meta, LABEL_CREATED_BY)
}

/// Component role of the object.
///
/// Returns `None` when the label is absent or holds an unknown value.
pub fn component(meta: &ObjectMeta) -> Option<Component> {
    label(meta, LABEL_COMPONENT).and_then(|c| c.parse().ok())
}

/// Whether the object is part of the testing platform
pub fn is_system_service(meta: &ObjectMeta) -> bool {
    component(meta) == Some(Component::Sys)
}

/// Label selector matching every child created by `parent`
pub fn created_by_selector(parent: &str) -> String {
    format!("{LABEL_CREATED_BY}={parent}")
}
