//! Shared Kubernetes utilities using kube-rs
//!
//! Thin helpers over `kube::Api` for the operations every Frisbee controller
//! repeats: creating a child owned by its parent, listing children by the
//! created-by label, deleting them, and persisting status.

use std::fmt::Debug;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::labels::created_by_selector;
use crate::{Error, FIELD_MANAGER};

// =============================================================================
// Status persistence
// =============================================================================

/// Outcome of persisting a status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusOutcome {
    /// The status was stored. Nothing else to do in this reconcile.
    Stored,
    /// The object changed underneath us (409) or vanished (404). Requeue and
    /// recompute from fresh state.
    Requeue,
    /// The API server rejected the status as invalid (422). Retrying the same
    /// payload cannot succeed.
    Rejected,
}

/// Classify the result of a status write.
///
/// Errors other than 409/404/422 are returned as-is.
pub fn status_outcome(result: Result<(), kube::Error>, name: &str) -> Result<StatusOutcome, Error> {
    match result {
        Ok(()) => Ok(StatusOutcome::Stored),
        Err(kube::Error::Api(ae)) if ae.code == 409 || ae.code == 404 => {
            debug!(object = %name, code = ae.code, "status update raced, requeueing");
            Ok(StatusOutcome::Requeue)
        }
        Err(kube::Error::Api(ae)) if ae.code == 422 => {
            error!(object = %name, error = %ae.message, "status update rejected as invalid");
            Ok(StatusOutcome::Rejected)
        }
        Err(e) => Err(e.into()),
    }
}

/// Merge-patch the status subresource of a namespaced object
pub async fn patch_status<K, S>(api: &Api<K>, name: &str, status: &S) -> Result<StatusOutcome, Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    S: Serialize,
{
    let patch = serde_json::json!({ "status": status });
    let result = api
        .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
        .map(|_| ());
    status_outcome(result, name)
}

/// Merge-patch the spec of a namespaced object (e.g. to force `suspend`)
pub async fn patch_spec<K>(
    api: &Api<K>,
    name: &str,
    spec: serde_json::Value,
) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let patch = serde_json::json!({ "spec": spec });
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

// =============================================================================
// Children
// =============================================================================

/// Build a controller owner reference pointing at `parent`
pub fn owner_reference<P>(parent: &P) -> Result<OwnerReference, Error>
where
    P: Resource<DynamicType = ()>,
{
    parent.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context(
            "owner_reference",
            format!("parent '{}' has no uid", parent.meta().name.as_deref().unwrap_or_default()),
        )
    })
}

/// Attach a controller owner reference to the child
pub fn set_owner<C, P>(child: &mut C, parent: &P) -> Result<(), Error>
where
    C: Resource,
    P: Resource<DynamicType = ()>,
{
    let owner = owner_reference(parent)?;
    child.meta_mut().owner_references = Some(vec![owner]);
    Ok(())
}

/// Create a child object. An already existing object (409) counts as created.
///
/// Returns true if this call created the object.
pub async fn create_child<C>(api: &Api<C>, child: &C) -> Result<bool, Error>
where
    C: Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    let name = child.meta().name.clone().unwrap_or_default();
    match api.create(&PostParams::default(), child).await {
        Ok(_) => {
            info!(child = %name, "created child");
            Ok(true)
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            debug!(child = %name, "child already exists");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// List every child created by `parent`
pub async fn list_children<C>(api: &Api<C>, parent: &str) -> Result<Vec<C>, Error>
where
    C: Resource + Clone + DeserializeOwned + Debug,
{
    let lp = ListParams::default().labels(&created_by_selector(parent));
    Ok(api.list(&lp).await?.items)
}

/// Delete a child in the background. A missing object (404) counts as deleted.
pub async fn delete_child<C>(api: &Api<C>, child: &C) -> Result<(), Error>
where
    C: Resource + Clone + DeserializeOwned + Debug,
{
    let name = child.name_any();
    match api.delete(&name, &DeleteParams::background()).await {
        Ok(_) => {
            debug!(child = %name, "deleted child");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Whether the object is being deleted
pub fn is_terminating<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Cluster, ClusterSpec, Service, ServiceSpec};
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("code {code}"),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn conflicts_and_missing_objects_requeue() {
        assert_eq!(
            status_outcome(Err(api_error(409)), "web").unwrap(),
            StatusOutcome::Requeue
        );
        assert_eq!(
            status_outcome(Err(api_error(404)), "web").unwrap(),
            StatusOutcome::Requeue
        );
    }

    #[test]
    fn invalid_status_is_rejected_without_error() {
        assert_eq!(
            status_outcome(Err(api_error(422)), "web").unwrap(),
            StatusOutcome::Rejected
        );
    }

    #[test]
    fn other_errors_propagate() {
        assert!(status_outcome(Err(api_error(500)), "web").is_err());
        assert_eq!(status_outcome(Ok(()), "web").unwrap(), StatusOutcome::Stored);
    }

    #[test]
    fn owner_reference_requires_uid() {
        let mut parent = Cluster::new("servers", ClusterSpec::default());
        assert!(owner_reference(&parent).is_err());

        parent.metadata.uid = Some("uid-1".to_string());
        let mut child = Service::new("servers-0", ServiceSpec::default());
        set_owner(&mut child, &parent).unwrap();

        let owners = child.metadata.owner_references.unwrap_or_default();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].uid, "uid-1");
        assert_eq!(owners[0].kind, "Cluster");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn terminating_is_read_from_deletion_timestamp() {
        let mut svc = Service::new("db", ServiceSpec::default());
        assert!(!is_terminating(&svc));
        svc.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        assert!(is_terminating(&svc));
    }
}
