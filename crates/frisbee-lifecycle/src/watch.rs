//! Bridge from a kube watcher to a [`Notifier`]
//!
//! Only events about children owned by the parent and tracked by the
//! notifier reach [`Notifier::handle`].

use std::collections::HashSet;
use std::fmt::Debug;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::watcher::{self, Event};
use kube::{Api, ResourceExt};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use frisbee_common::Error;

use crate::notifier::Notifier;
use crate::status::{ChildObject, ChildRef};
use crate::Result;

/// Server-side timeout of a watch request
pub const WATCH_TIMEOUT_SECS: u32 = 25;

const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Accept objects that have `parent_uid` among their owners.
///
/// # Errors
///
/// An invariant error if `parent_uid` is empty.
pub fn filter_by_parent(parent_uid: &str) -> Result<impl Fn(&ObjectMeta) -> bool + Send + Sync> {
    if parent_uid.is_empty() {
        return Err(Error::invariant("filter_by_parent", "parent has no uid").into());
    }

    let parent_uid = parent_uid.to_string();
    Ok(move |meta: &ObjectMeta| {
        meta.owner_references
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|owner| owner.uid == parent_uid)
    })
}

/// Accept objects named in `names`.
///
/// # Errors
///
/// An invariant error if `names` is empty.
pub fn filter_by_names<S: AsRef<str>>(
    names: &[S],
) -> Result<impl Fn(&ObjectMeta) -> bool + Send + Sync> {
    if names.is_empty() {
        return Err(Error::invariant("filter_by_names", "no names to filter by").into());
    }

    let names: HashSet<String> = names.iter().map(|n| n.as_ref().to_string()).collect();
    Ok(move |meta: &ObjectMeta| meta.name.as_deref().is_some_and(|n| names.contains(n)))
}

/// Forward a single watch event to the notifier if `accept` lets it through
fn dispatch<K, F>(event: Event<K>, accept: &F, notifier: &Notifier)
where
    K: ChildObject,
    F: Fn(&ObjectMeta) -> bool,
{
    let obj = match event {
        Event::Apply(obj) | Event::InitApply(obj) | Event::Delete(obj) => obj,
        Event::Init | Event::InitDone => return,
    };

    if !accept(obj.meta()) || !notifier.tracks(&obj.name_any()) {
        return;
    }

    let child = ChildRef::from_object(&obj);
    if let Err(e) = notifier.handle(&child) {
        error!(child = %child, error = %e, "notifier rejected child");
    }
}

/// Watch the children of `parent_uid` in `api` and feed the notifier until
/// `cancel` fires.
///
/// Watch errors are logged and the watch is resumed.
///
/// # Errors
///
/// An invariant error if `parent_uid` is empty.
pub async fn watch_children<K>(
    api: Api<K>,
    parent_uid: &str,
    notifier: &Notifier,
    cancel: &CancellationToken,
) -> Result<()>
where
    K: ChildObject + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let owned = filter_by_parent(parent_uid)?;

    let config = watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);
    let mut stream = std::pin::pin!(watcher::watcher(api, config));

    info!(kind = %K::KIND, parent = %parent_uid, "watching children");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(kind = %K::KIND, parent = %parent_uid, "stopped watching children");
                return Ok(());
            }
            next = stream.next() => match next {
                Some(Ok(event)) => dispatch(event, &owned, notifier),
                Some(Err(e)) => {
                    warn!(kind = %K::KIND, error = %e, "watcher error, will retry");
                    tokio::time::sleep(WATCH_RETRY_DELAY).await;
                }
                None => return Ok(()),
            },
        }
    }
}
