//! Service controller
//!
//! A Service runs exactly one Pod and mirrors its lifecycle. The Pod is
//! removed once the Service reaches a terminal phase.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use frisbee_common::crd::{
    condition_types, Condition, ConditionStatus, Phase, Service, ServiceStatus,
};
use frisbee_common::kube_utils;
use frisbee_common::labels;
use frisbee_lifecycle::{single_job, ChildRef, Classifier};

use super::{after_status_write, Context};
use crate::error::Result;

/// Reasons recorded on the Service lifecycle by the controller itself
pub mod reasons {
    /// The Pod has been submitted
    pub const POD_CREATED: &str = "PodCreated";
}

/// Reconcile a Service
#[instrument(skip(service, ctx), fields(service = %service.name_any()))]
pub async fn reconcile(service: Arc<Service>, ctx: Arc<Context>) -> Result<Action> {
    if kube_utils::is_terminating(service.as_ref()) {
        debug!("service is being deleted");
        return Ok(Action::await_change());
    }

    let name = service.name_any();
    let namespace = service.namespace().unwrap_or_default();
    let mut status = service.status.clone().unwrap_or_default();

    if status.lifecycle.phase == Phase::Uninitialized {
        let pod = build_pod(&service)?;
        ctx.kube.create_pod(&pod).await?;

        status
            .lifecycle
            .transition(Phase::Pending, reasons::POD_CREATED, format!("pod '{name}' submitted"));
        status.lifecycle.set_condition(Condition::new(
            condition_types::INITIALIZED,
            ConditionStatus::True,
            reasons::POD_CREATED,
            "",
        ));
        info!("pod submitted");
        return write_status(&ctx, &namespace, &name, &status).await;
    }

    let pods = ctx.kube.list_pods(&namespace, &name).await?;

    // the Pod inherits the labels of the Service, so it is never excluded
    // as a system service here
    let mut state = Classifier::new();
    for pod in &pods {
        state.classify(&pod.name_any(), ChildRef::from_object(pod));
    }

    if single_job(&state, &mut status.lifecycle)? {
        info!(lifecycle = %status.lifecycle, "service lifecycle changed");
        return write_status(&ctx, &namespace, &name, &status).await;
    }

    if status.lifecycle.phase.is_terminal() {
        for pod in pods.iter().filter(|p| !kube_utils::is_terminating(*p)) {
            ctx.kube.delete_pod(pod).await?;
        }
    }

    Ok(Action::await_change())
}

/// The Pod of a Service: inherits its labels, owned by it, decorated with
/// the decorators of the Service
fn build_pod(service: &Service) -> Result<Pod> {
    let mut pod = Pod {
        metadata: ObjectMeta {
            name: Some(service.name_any()),
            namespace: service.namespace(),
            ..Default::default()
        },
        spec: Some(service.spec.pod.clone()),
        ..Default::default()
    };

    labels::propagate(&mut pod.metadata, &service.metadata);
    labels::set_created_by(&mut pod.metadata, &service.name_any());

    if let Some(decorators) = &service.spec.decorators {
        for (k, v) in &decorators.labels {
            labels::append_label(&mut pod.metadata, k, v);
        }
        for (k, v) in &decorators.annotations {
            labels::append_annotation(&mut pod.metadata, k, v);
        }
    }

    kube_utils::set_owner(&mut pod, service)?;
    Ok(pod)
}

async fn write_status(
    ctx: &Context,
    namespace: &str,
    name: &str,
    status: &ServiceStatus,
) -> Result<Action> {
    let outcome = ctx
        .kube
        .patch_service_status(namespace, name, status)
        .await?;
    Ok(after_status_write(name, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::test_support::{awaits_change, lifecycle_in};
    use crate::controller::MockKubeClient;
    use frisbee_common::crd::{Decorators, ServiceSpec};
    use frisbee_common::kube_utils::StatusOutcome;
    use frisbee_lifecycle::calculator::reasons as calc_reasons;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn sample_service(phase: Option<Phase>) -> Service {
        let mut svc = Service::new(
            "servers-0",
            ServiceSpec {
                decorators: Some(Decorators {
                    labels: [("tier".to_string(), "db".to_string())].into(),
                    annotations: [("sidecar".to_string(), "off".to_string())].into(),
                }),
                pod: PodSpec {
                    containers: vec![Container {
                        name: "app".to_string(),
                        image: Some("busybox".to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            },
        );
        svc.metadata.namespace = Some("demo".to_string());
        svc.metadata.uid = Some("uid-svc".to_string());
        labels::set_scenario(&mut svc.metadata, "scenario-a");
        svc.status = phase.map(|p| ServiceStatus {
            lifecycle: lifecycle_in(p),
        });
        svc
    }

    fn pod(phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("servers-0".to_string()),
                namespace: Some("demo".to_string()),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    async fn run(service: Service, mock: MockKubeClient) -> Result<Action> {
        let ctx = Arc::new(Context::for_testing(Arc::new(mock)));
        reconcile(Arc::new(service), ctx).await
    }

    #[tokio::test]
    async fn new_service_submits_its_pod() {
        let mut mock = MockKubeClient::new();
        mock.expect_list_pods().never();
        mock.expect_create_pod()
            .withf(|pod: &Pod| {
                let meta = &pod.metadata;
                pod.name_any() == "servers-0"
                    && labels::scenario(meta) == Some("scenario-a")
                    && labels::created_by(meta) == Some("servers-0")
                    && meta.labels.as_ref().is_some_and(|l| l["tier"] == "db")
                    && meta.annotations.as_ref().is_some_and(|a| a["sidecar"] == "off")
                    && meta.owner_references.as_ref().is_some_and(|o| o[0].uid == "uid-svc")
            })
            .times(1)
            .returning(|_| Ok(true));
        mock.expect_patch_service_status()
            .withf(|_, _, status: &ServiceStatus| {
                status.lifecycle.phase == Phase::Pending
                    && status.lifecycle.reason == reasons::POD_CREATED
            })
            .times(1)
            .returning(|_, _, _| Ok(StatusOutcome::Stored));

        let action = run(sample_service(None), mock).await.unwrap();
        assert!(awaits_change(&action));
    }

    #[tokio::test]
    async fn running_pod_makes_the_service_running() {
        let mut mock = MockKubeClient::new();
        mock.expect_list_pods().returning(|_, _| Ok(vec![pod("Running")]));
        mock.expect_patch_service_status()
            .withf(|_, _, status: &ServiceStatus| {
                status.lifecycle.phase == Phase::Running
                    && status.lifecycle.reason == calc_reasons::EXACTLY_ONE_JOB_IS_RUNNING
                    && status.lifecycle.start_time.is_some()
            })
            .times(1)
            .returning(|_, _, _| Ok(StatusOutcome::Stored));
        mock.expect_delete_pod().never();

        run(sample_service(Some(Phase::Pending)), mock).await.unwrap();
    }

    /// Story: once the pod has exited and the service recorded it, the pod
    /// is garbage collected and the service keeps its final phase.
    #[tokio::test]
    async fn finished_pod_is_removed_after_the_status_is_stored() {
        let mut service = sample_service(None);
        let mut status = ServiceStatus::default();
        status.lifecycle.transition(
            Phase::Success,
            calc_reasons::EXACTLY_ONE_JOB_IS_SUCCESSFUL,
            "successful: [\"servers-0\"]",
        );
        service.status = Some(status);

        let mut mock = MockKubeClient::new();
        mock.expect_list_pods().returning(|_, _| Ok(vec![pod("Succeeded")]));
        mock.expect_patch_service_status().never();
        mock.expect_delete_pod().times(1).returning(|_| Ok(()));

        run(service, mock).await.unwrap();
    }

    #[tokio::test]
    async fn terminating_pod_is_not_deleted_twice() {
        let mut terminating = pod("Failed");
        terminating.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

        let mut mock = MockKubeClient::new();
        mock.expect_list_pods()
            .returning(move |_, _| Ok(vec![terminating.clone()]));
        mock.expect_patch_service_status().never();
        mock.expect_delete_pod().never();

        run(sample_service(Some(Phase::Failed)), mock).await.unwrap();
    }
}
