//! Tagged references to the children a parent tracks
//!
//! Every child kind the engine can aggregate is listed in [`ChildKind`]. A
//! [`ChildRef`] captures what the engine needs from a child at the moment it
//! was observed: its lifecycle, component role, and whether it is being
//! deleted.

use frisbee_common::crd::{
    Cascade, Chaos, Cluster, Lifecycle, Phase, ReportsLifecycle, Service, VirtualObject,
};
use frisbee_common::labels::{self, Component};
use k8s_openapi::api::core::v1::Pod;
use kube::{Resource, ResourceExt};

/// Kinds of children a parent can own
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChildKind {
    Service,
    Cluster,
    Cascade,
    Chaos,
    VirtualObject,
    Pod,
}

impl std::fmt::Display for ChildKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Service => write!(f, "Service"),
            Self::Cluster => write!(f, "Cluster"),
            Self::Cascade => write!(f, "Cascade"),
            Self::Chaos => write!(f, "Chaos"),
            Self::VirtualObject => write!(f, "VirtualObject"),
            Self::Pod => write!(f, "Pod"),
        }
    }
}

/// A Kubernetes object the engine knows how to read a lifecycle from
pub trait ChildObject: Resource<DynamicType = ()> + ReportsLifecycle {
    /// Tag of the kind
    const KIND: ChildKind;
}

macro_rules! child_object {
    ($($kind:ident),+ $(,)?) => {
        $(
            impl ChildObject for $kind {
                const KIND: ChildKind = ChildKind::$kind;
            }
        )+
    };
}

child_object!(Service, Cluster, Cascade, Chaos, VirtualObject, Pod);

/// Snapshot of a child as seen by the engine
#[derive(Clone, Debug, PartialEq)]
pub struct ChildRef {
    pub kind: ChildKind,
    pub name: String,
    pub namespace: Option<String>,
    pub lifecycle: Lifecycle,
    pub component: Option<Component>,
    pub terminating: bool,
}

impl ChildRef {
    /// Snapshot a typed object
    pub fn from_object<K: ChildObject>(obj: &K) -> Self {
        Self {
            kind: K::KIND,
            name: obj.name_any(),
            namespace: obj.namespace(),
            lifecycle: obj.lifecycle(),
            component: labels::component(obj.meta()),
            terminating: obj.meta().deletion_timestamp.is_some(),
        }
    }

    /// Build a reference by hand. Used for children observed through other
    /// channels and in tests.
    pub fn new(kind: ChildKind, name: impl Into<String>, lifecycle: Lifecycle) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: None,
            lifecycle,
            component: None,
            terminating: false,
        }
    }

    /// Set the component role
    pub fn with_component(mut self, component: Component) -> Self {
        self.component = Some(component);
        self
    }

    /// Mark the child as being deleted
    pub fn terminating(mut self) -> Self {
        self.terminating = true;
        self
    }

    /// Current phase of the child
    pub fn phase(&self) -> Phase {
        self.lifecycle.phase
    }

    /// Whether the child belongs to the system under test
    pub fn is_sut(&self) -> bool {
        self.component == Some(Component::Sut)
    }
}

impl std::fmt::Display for ChildRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} {}", self.kind, self.name, self.lifecycle)
    }
}
