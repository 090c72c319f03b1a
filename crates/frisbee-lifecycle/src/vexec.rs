//! Virtual execution of operator-side actions
//!
//! Some jobs (calls into running services, deletions) run inside the operator
//! instead of in a Pod. Each run is backed by a `VirtualObject` so that the
//! parent tracks it like any other child: it has a phase, a reason, and the
//! data the action produced.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;

use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[cfg(test)]
use mockall::automock;

use frisbee_common::crd::{Lifecycle, Phase, VirtualObject, VirtualObjectSpec, VirtualObjectStatus};
use frisbee_common::events::{actions, reasons, EventPublisher};
use frisbee_common::kube_utils::{self, StatusOutcome};
use frisbee_common::labels::{self, Component};
use frisbee_common::Error;

use crate::Result;

/// Storage of the objects backing virtual jobs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VirtualObjectStore: Send + Sync {
    /// Create the object. An object that already exists counts as created.
    async fn create(&self, obj: &VirtualObject) -> Result<()>;

    /// Persist the status of the named object
    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: &VirtualObjectStatus,
    ) -> Result<()>;
}

/// [`VirtualObjectStore`] backed by the API server
#[derive(Clone)]
pub struct KubeVirtualObjectStore {
    client: Client,
}

impl KubeVirtualObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl VirtualObjectStore for KubeVirtualObjectStore {
    async fn create(&self, obj: &VirtualObject) -> Result<()> {
        let namespace = obj.namespace().unwrap_or_default();
        let api: Api<VirtualObject> = Api::namespaced(self.client.clone(), &namespace);
        match api.create(&PostParams::default(), obj).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: &VirtualObjectStatus,
    ) -> Result<()> {
        let api: Api<VirtualObject> = Api::namespaced(self.client.clone(), namespace);
        match kube_utils::patch_status(&api, name, status).await? {
            StatusOutcome::Stored => Ok(()),
            StatusOutcome::Requeue => Err(Error::internal_with_context(
                "vexec",
                format!("status of '{name}' changed concurrently"),
            )
            .into()),
            StatusOutcome::Rejected => {
                Err(Error::validation_for(name, "status rejected by the API server").into())
            }
        }
    }
}

/// Object backing the virtual job `job_name` of `parent`
pub fn build_virtual_object<P>(parent: &P, job_name: &str) -> Result<VirtualObject>
where
    P: Resource<DynamicType = ()>,
{
    let parent_name = parent.name_any();

    let mut obj = VirtualObject::new(job_name, VirtualObjectSpec {});
    obj.metadata.namespace = parent.namespace();

    labels::propagate(&mut obj.metadata, parent.meta());
    labels::set_scenario(&mut obj.metadata, &parent_name);
    labels::set_action(&mut obj.metadata, job_name);
    labels::set_component(&mut obj.metadata, Component::Sut);
    labels::set_created_by(&mut obj.metadata, &parent_name);
    kube_utils::set_owner(&mut obj, parent)?;

    Ok(obj)
}

fn stored_data_suffix(data: &BTreeMap<String, String>) -> String {
    let keys: Vec<&str> = data.keys().map(String::as_str).collect();
    format!(". <StoredData>: '[{}]'", keys.join(" "))
}

/// Run `callback` as the virtual job `job_name` of `parent`.
///
/// The outcome of the callback, including cancellation, is recorded on the
/// backing object and announced with events on the parent. The data the
/// callback returns is stored on the object.
///
/// # Errors
///
/// Only when the backing object cannot be created or its final status cannot
/// be stored. A failing callback is reported through the status.
pub async fn virtual_execution<P, F, Fut, E>(
    cancel: &CancellationToken,
    store: &dyn VirtualObjectStore,
    events: &dyn EventPublisher,
    parent: &P,
    job_name: &str,
    callback: F,
) -> Result<()>
where
    P: Resource<DynamicType = ()>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<BTreeMap<String, String>, E>>,
    E: Display,
{
    let obj = build_virtual_object(parent, job_name)?;
    let namespace = obj.namespace().unwrap_or_default();

    if let Err(e) = store.create(&obj).await {
        error!(job = %job_name, error = %e, "cannot create virtual resource");
        return Err(Error::internal_with_context(
            "vexec",
            format!("cannot create virtual resource for vJob '{job_name}': {e}"),
        )
        .into());
    }

    let parent_ref = parent.object_ref(&());
    events
        .publish(
            &parent_ref,
            EventType::Normal,
            reasons::VEXEC_BEGIN,
            actions::EXECUTE,
            Some(format!("vJob '{job_name}' started")),
        )
        .await;

    let outcome = tokio::select! {
        biased;

        _ = cancel.cancelled() => Err("cancelled".to_string()),
        result = callback() => result.map_err(|e| e.to_string()),
    };

    let mut status = VirtualObjectStatus {
        lifecycle: Lifecycle::default(),
        data: BTreeMap::new(),
    };

    match outcome {
        Err(e) => {
            warn!(job = %job_name, error = %e, "vJob failed");
            status
                .lifecycle
                .transition(Phase::Failed, reasons::VEXEC_FAILED, format!("Job failed: {e}"));
            events
                .publish(
                    &parent_ref,
                    EventType::Warning,
                    reasons::VEXEC_FAILED,
                    actions::EXECUTE,
                    Some(format!("vJob '{job_name}' failed: {e}")),
                )
                .await;
        }
        Ok(data) => {
            info!(job = %job_name, stored = data.len(), "vJob completed");
            status
                .lifecycle
                .transition(Phase::Success, reasons::VEXEC_SUCCESS, "Job completed");
            status.data = data;
            events
                .publish(
                    &parent_ref,
                    EventType::Normal,
                    reasons::VEXEC_SUCCESS,
                    actions::EXECUTE,
                    Some(format!("vJob '{job_name}' completed")),
                )
                .await;
        }
    }

    if !status.data.is_empty() {
        let suffix = stored_data_suffix(&status.data);
        status.lifecycle.message.push_str(&suffix);
    }

    store
        .update_status(&namespace, job_name, &status)
        .await
        .map_err(|e| {
            error!(job = %job_name, error = %e, "vexec status update error");
            e
        })
}
