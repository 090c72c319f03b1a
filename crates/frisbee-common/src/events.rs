//! Kubernetes Event recording for Frisbee controllers.
//!
//! Controllers emit Events for the milestones a user looks for with
//! `kubectl describe`: a virtual job starting or finishing, a cluster being
//! suspended after a failure, an alert arriving from the dashboard.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations log a warning on failure but never return an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "VExecBegin")
    /// * `action` - What action was taken (e.g. "Execute")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events
    /// (e.g. "frisbee-cluster-controller").
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    // Virtual execution
    /// A virtual job has been created and its callback started
    pub const VEXEC_BEGIN: &str = "VExecBegin";
    /// The callback of a virtual job returned successfully
    pub const VEXEC_SUCCESS: &str = "VExecSuccess";
    /// The callback of a virtual job failed or was cancelled
    pub const VEXEC_FAILED: &str = "VExecFailed";

    // Grouped jobs
    /// A failed group was suspended and its remaining children removed
    pub const SUSPENDED: &str = "Suspended";
    /// A group created more jobs than its `maxInstances` bound
    pub const MAX_INSTANCES_REACHED: &str = "MaxInstancesReached";
    /// A job of the group was created
    pub const JOB_SCHEDULED: &str = "JobScheduled";
    /// The Until condition of a group fired
    pub const UNTIL_FIRED: &str = "UntilFired";

    // Alerting
    /// An alert was registered on a dashboard panel
    pub const ALERT_REGISTERED: &str = "AlertRegistered";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Creating the next job of a group
    pub const SCHEDULE: &str = "Schedule";
    /// Running a virtual job callback
    pub const EXECUTE: &str = "Execute";
    /// Recording an alert
    pub const ALERT: &str = "Alert";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn reason_constants_are_pascal_case() {
        assert_eq!(reasons::VEXEC_BEGIN, "VExecBegin");
        assert_eq!(reasons::VEXEC_FAILED, "VExecFailed");
        assert_eq!(reasons::SUSPENDED, "Suspended");
    }

    #[test]
    fn action_constants_are_defined() {
        assert_eq!(actions::RECONCILE, "Reconcile");
        assert_eq!(actions::EXECUTE, "Execute");
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        let publisher = NoopEventPublisher;
        let obj_ref = ObjectReference::default();
        publisher
            .publish(
                &obj_ref,
                EventType::Warning,
                reasons::VEXEC_FAILED,
                actions::EXECUTE,
                Some("Job failed: boom".to_string()),
            )
            .await;
    }
}
