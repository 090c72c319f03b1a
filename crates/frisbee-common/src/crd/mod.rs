//! Custom Resource Definitions for Frisbee
//!
//! This module contains all CRD definitions used by the Frisbee operator,
//! plus [`ReportsLifecycle`], the closed mapping from every child kind the
//! engine tracks to its [`Lifecycle`].

mod cascade;
mod chaos;
mod cluster;
mod expressions;
mod group;
mod lifecycle;
mod service;
mod virtual_object;

pub use cascade::{Cascade, CascadeSpec, CascadeStatus};
pub use chaos::{Chaos, ChaosSpec, ChaosStatus};
pub use cluster::{Cluster, ClusterSpec, ClusterStatus};
pub use expressions::{ConditionalExpr, SchedulerSpec, TolerateSpec};
pub use group::{queue_length, validate_group};
pub use lifecycle::{condition_types, Condition, ConditionStatus, Lifecycle, Phase};
pub use service::{Decorators, Service, ServiceSpec, ServiceStatus};
pub use virtual_object::{VirtualObject, VirtualObjectSpec, VirtualObjectStatus};

use k8s_openapi::api::core::v1::Pod;

/// Kinds whose lifecycle the engine can read.
///
/// Implemented for every Frisbee CRD and for `Pod`. An object without a
/// status reports the default (Uninitialized) lifecycle.
pub trait ReportsLifecycle {
    /// Current lifecycle of the object
    fn lifecycle(&self) -> Lifecycle;
}

macro_rules! reports_status_lifecycle {
    ($($kind:ty),+ $(,)?) => {
        $(
            impl ReportsLifecycle for $kind {
                fn lifecycle(&self) -> Lifecycle {
                    self.status
                        .as_ref()
                        .map(|s| s.lifecycle.clone())
                        .unwrap_or_default()
                }
            }
        )+
    };
}

reports_status_lifecycle!(Service, Cluster, Cascade, Chaos, VirtualObject);

impl ReportsLifecycle for Pod {
    fn lifecycle(&self) -> Lifecycle {
        let Some(status) = &self.status else {
            return Lifecycle::default();
        };

        let phase = match status.phase.as_deref() {
            Some("Pending") => Phase::Pending,
            Some("Running") => Phase::Running,
            Some("Succeeded") => Phase::Success,
            Some("Failed") | Some("Unknown") => Phase::Failed,
            _ => Phase::Uninitialized,
        };

        Lifecycle {
            phase,
            reason: status.reason.clone().unwrap_or_default(),
            message: status.message.clone().unwrap_or_default(),
            start_time: status.start_time.as_ref().map(|t| t.0),
            end_time: None,
            conditions: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;

    fn pod_in(phase: &str) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                reason: Some("Evicted".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn pod_phases_map_to_lifecycle_phases() {
        assert_eq!(pod_in("Pending").lifecycle().phase, Phase::Pending);
        assert_eq!(pod_in("Running").lifecycle().phase, Phase::Running);
        assert_eq!(pod_in("Succeeded").lifecycle().phase, Phase::Success);
        assert_eq!(pod_in("Failed").lifecycle().phase, Phase::Failed);
        assert_eq!(pod_in("Unknown").lifecycle().phase, Phase::Failed);
        assert_eq!(pod_in("Failed").lifecycle().reason, "Evicted");
    }

    #[test]
    fn objects_without_status_are_uninitialized() {
        assert_eq!(Pod::default().lifecycle().phase, Phase::Uninitialized);
        let svc = Service::new("db", ServiceSpec::default());
        assert_eq!(svc.lifecycle().phase, Phase::Uninitialized);
    }

    #[test]
    fn crd_status_lifecycle_is_reported() {
        let mut chaos = Chaos::new("kill-db", ChaosSpec::default());
        let mut status = ChaosStatus::default();
        status.lifecycle.transition(Phase::Running, "Injected", "");
        chaos.status = Some(status);
        assert_eq!(chaos.lifecycle().phase, Phase::Running);
    }
}
