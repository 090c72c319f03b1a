//! Controllers for the Frisbee custom resources
//!
//! - [`cluster`]: a Cluster creates Services from its queue
//! - [`cascade`]: a Cascade creates Chaos faults from its queue
//! - [`service`]: a Service runs exactly one Pod
//!
//! The controllers share a [`Context`] holding the API client behind the
//! mockable [`KubeClient`] trait, the event publisher, and the alerting
//! registry.

pub mod cascade;
pub mod cluster;
pub mod service;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use frisbee_common::crd::{
    Cascade, CascadeStatus, Chaos, Cluster, ClusterStatus, ConditionalExpr, SchedulerSpec,
    Service, ServiceStatus,
};
use frisbee_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use frisbee_common::kube_utils::{self, StatusOutcome};
use frisbee_common::labels;
use frisbee_common::retry::Backoff;
use frisbee_common::template::TemplateEngine;
use frisbee_lifecycle::alerting::set_alert;
use frisbee_lifecycle::{AlertingRegistry, ChildObject, ChildRef, Classifier, LifecycleError};

use crate::error::{ControllerError, Result};

/// Name reported on the Events emitted by the controllers
pub const CONTROLLER_NAME: &str = "frisbee-controller";

/// Delay before retrying a reconcile that failed with a transient error
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Delay before recomputing after a status write raced with another writer
const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Kubernetes operations used by the controllers
///
/// This trait allows mocking the API server in tests while using the real
/// client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// List the Services created by the named Cluster
    async fn list_services(&self, namespace: &str, parent: &str) -> Result<Vec<Service>>;

    /// Create a Service. Returns false if it already existed.
    async fn create_service(&self, service: &Service) -> Result<bool>;

    /// Delete a Service in the background
    async fn delete_service(&self, service: &Service) -> Result<()>;

    /// Persist the status of a Cluster
    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ClusterStatus,
    ) -> Result<StatusOutcome>;

    /// Force `spec.suspend` on a Cluster
    async fn suspend_cluster(&self, namespace: &str, name: &str) -> Result<()>;

    /// List the Chaos faults created by the named Cascade
    async fn list_chaos(&self, namespace: &str, parent: &str) -> Result<Vec<Chaos>>;

    /// Create a Chaos. Returns false if it already existed.
    async fn create_chaos(&self, chaos: &Chaos) -> Result<bool>;

    /// Delete a Chaos in the background
    async fn delete_chaos(&self, chaos: &Chaos) -> Result<()>;

    /// Persist the status of a Cascade
    async fn patch_cascade_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CascadeStatus,
    ) -> Result<StatusOutcome>;

    /// Force `spec.suspend` on a Cascade
    async fn suspend_cascade(&self, namespace: &str, name: &str) -> Result<()>;

    /// List the Pods created by the named Service
    async fn list_pods(&self, namespace: &str, parent: &str) -> Result<Vec<Pod>>;

    /// Create a Pod. Returns false if it already existed.
    async fn create_pod(&self, pod: &Pod) -> Result<bool>;

    /// Delete a Pod in the background
    async fn delete_pod(&self, pod: &Pod) -> Result<()>;

    /// Persist the status of a Service
    async fn patch_service_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ServiceStatus,
    ) -> Result<StatusOutcome>;
}

/// [`KubeClient`] backed by the API server
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Wrap a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn api_for<K>(&self, obj: &K) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        self.api(&obj.namespace().unwrap_or_default())
    }

    async fn suspend<K>(&self, namespace: &str, name: &str) -> Result<()>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api: Api<K> = self.api(namespace);
        kube_utils::patch_spec(&api, name, serde_json::json!({ "suspend": true })).await?;
        Ok(())
    }

    async fn status<K, S>(&self, namespace: &str, name: &str, status: &S) -> Result<StatusOutcome>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
        S: Serialize + Sync,
    {
        let api: Api<K> = self.api(namespace);
        Ok(kube_utils::patch_status(&api, name, status).await?)
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn list_services(&self, namespace: &str, parent: &str) -> Result<Vec<Service>> {
        Ok(kube_utils::list_children(&self.api(namespace), parent).await?)
    }

    async fn create_service(&self, service: &Service) -> Result<bool> {
        Ok(kube_utils::create_child(&self.api_for(service), service).await?)
    }

    async fn delete_service(&self, service: &Service) -> Result<()> {
        Ok(kube_utils::delete_child(&self.api_for(service), service).await?)
    }

    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ClusterStatus,
    ) -> Result<StatusOutcome> {
        self.status::<Cluster, _>(namespace, name, status).await
    }

    async fn suspend_cluster(&self, namespace: &str, name: &str) -> Result<()> {
        self.suspend::<Cluster>(namespace, name).await
    }

    async fn list_chaos(&self, namespace: &str, parent: &str) -> Result<Vec<Chaos>> {
        Ok(kube_utils::list_children(&self.api(namespace), parent).await?)
    }

    async fn create_chaos(&self, chaos: &Chaos) -> Result<bool> {
        Ok(kube_utils::create_child(&self.api_for(chaos), chaos).await?)
    }

    async fn delete_chaos(&self, chaos: &Chaos) -> Result<()> {
        Ok(kube_utils::delete_child(&self.api_for(chaos), chaos).await?)
    }

    async fn patch_cascade_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CascadeStatus,
    ) -> Result<StatusOutcome> {
        self.status::<Cascade, _>(namespace, name, status).await
    }

    async fn suspend_cascade(&self, namespace: &str, name: &str) -> Result<()> {
        self.suspend::<Cascade>(namespace, name).await
    }

    async fn list_pods(&self, namespace: &str, parent: &str) -> Result<Vec<Pod>> {
        Ok(kube_utils::list_children(&self.api(namespace), parent).await?)
    }

    async fn create_pod(&self, pod: &Pod) -> Result<bool> {
        Ok(kube_utils::create_child(&self.api_for(pod), pod).await?)
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        Ok(kube_utils::delete_child(&self.api_for(pod), pod).await?)
    }

    async fn patch_service_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ServiceStatus,
    ) -> Result<StatusOutcome> {
        self.status::<Service, _>(namespace, name, status).await
    }
}

/// Shared state of the controllers
pub struct Context {
    /// Kubernetes operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Event recorder
    pub events: Arc<dyn EventPublisher>,
    /// Alerting clients, keyed by scenario
    pub alerting: Arc<AlertingRegistry>,
    /// Renders queued jobs from templates
    pub templates: TemplateEngine,
    /// Pace of retries and of event-driven scheduling
    pub backoff: Backoff,
}

impl Context {
    /// Create a context talking to the API server
    pub fn new(client: Client, alerting: Arc<AlertingRegistry>) -> Self {
        Self {
            kube: Arc::new(KubeClientImpl::new(client.clone())),
            events: Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)),
            alerting,
            templates: TemplateEngine::new(),
            backoff: Backoff::default(),
        }
    }

    /// Create a context for testing with a mock client
    ///
    /// This method is primarily for unit tests where a real Kubernetes
    /// client is not available.
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>) -> Self {
        Self {
            kube,
            events: Arc::new(frisbee_common::events::NoopEventPublisher),
            alerting: Arc::new(AlertingRegistry::new()),
            templates: TemplateEngine::new(),
            backoff: Backoff {
                jitter: 0.0,
                ..Backoff::default()
            },
        }
    }
}

/// Requeue policy for failed reconciles.
///
/// Invariant violations are logged and the object is left alone until it
/// changes: the same input would break the same invariant again.
pub fn error_policy<K>(obj: Arc<K>, error: &ControllerError, _ctx: Arc<Context>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    let kind = K::kind(&());
    if error.is_invariant() {
        error!(
            ?error,
            %kind,
            object = %obj.name_any(),
            "invariant violated, not requeueing"
        );
        return Action::await_change();
    }

    warn!(
        ?error,
        %kind,
        object = %obj.name_any(),
        "reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE)
}

/// Next step after a status write
pub(crate) fn after_status_write(name: &str, outcome: StatusOutcome) -> Action {
    match outcome {
        StatusOutcome::Stored => Action::await_change(),
        StatusOutcome::Requeue => {
            debug!(object = %name, "status write raced, recomputing");
            Action::requeue(CONFLICT_REQUEUE)
        }
        StatusOutcome::Rejected => Action::await_change(),
    }
}

/// Classify children for a parent. System services are only accounted once
/// they fail.
pub(crate) fn classify<K: ChildObject>(children: &[K]) -> Classifier {
    let mut state = Classifier::new();
    for child in children {
        let name = child.name_any();
        let child_ref = ChildRef::from_object(child);
        if labels::is_system_service(child.meta()) {
            state.exclude(&name, child_ref);
        } else {
            state.classify(&name, child_ref);
        }
    }
    state
}

/// Register the metrics alerts a group depends on: its Until condition and
/// its schedule event. Returns the number of alerts registered.
pub(crate) async fn register_alerts<K>(
    ctx: &Context,
    obj: &K,
    until: Option<&ConditionalExpr>,
    schedule: Option<&SchedulerSpec>,
) -> std::result::Result<usize, LifecycleError>
where
    K: Resource<DynamicType = ()>,
{
    let exprs = until
        .into_iter()
        .chain(schedule.and_then(|s| s.event.as_ref()))
        .filter_map(ConditionalExpr::metrics_expr);

    let mut registered = 0;
    for expr in exprs {
        set_alert(&ctx.alerting, obj, expr, &ctx.backoff).await?;
        registered += 1;

        info!(object = %obj.name_any(), %expr, "registered alert");
        ctx.events
            .publish(
                &obj.object_ref(&()),
                EventType::Normal,
                reasons::ALERT_REGISTERED,
                actions::ALERT,
                Some(format!("Alert registered for '{expr}'")),
            )
            .await;
    }
    Ok(registered)
}

/// Index of the next job to create, or `None` once every queued job has
/// been created. Groups driven by an Until condition cycle through their
/// queue without bound.
pub(crate) fn next_job_index(scheduled_jobs: i64, queue_len: usize, bounded: bool) -> Option<usize> {
    let next = usize::try_from(scheduled_jobs + 1).ok()?;
    if bounded && next >= queue_len {
        return None;
    }
    Some(next)
}

/// Failed children, as a retry step for the backoff
pub(crate) fn failures(state: &Classifier) -> u32 {
    u32::try_from(state.num_failed_jobs()).unwrap_or(u32::MAX)
}
