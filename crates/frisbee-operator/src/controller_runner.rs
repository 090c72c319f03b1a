//! Controller runner - builds the controller futures
//!
//! Each controller watches its own kind plus the children it owns, so that a
//! change of a child wakes up its parent.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use frisbee_common::crd::{Cascade, Chaos, Cluster, Service};

use crate::controller::{cascade, cluster, error_policy, service, Context};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build the Cluster, Cascade and Service controller futures
pub fn build_controllers(client: Client, ctx: Arc<Context>) -> Vec<ControllerFuture> {
    let cluster_ctrl = Controller::new(Api::<Cluster>::all(client.clone()), watcher_config())
        .owns(Api::<Service>::all(client.clone()), watcher_config())
        .shutdown_on_signal()
        .run(cluster::reconcile, error_policy, ctx.clone())
        .for_each(log_reconcile_result("Cluster"));

    let cascade_ctrl = Controller::new(Api::<Cascade>::all(client.clone()), watcher_config())
        .owns(Api::<Chaos>::all(client.clone()), watcher_config())
        .shutdown_on_signal()
        .run(cascade::reconcile, error_policy, ctx.clone())
        .for_each(log_reconcile_result("Cascade"));

    let service_ctrl = Controller::new(Api::<Service>::all(client.clone()), watcher_config())
        .owns(Api::<Pod>::all(client), watcher_config())
        .shutdown_on_signal()
        .run(service::reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("Service"));

    tracing::info!("- Cluster controller");
    tracing::info!("- Cascade controller");
    tracing::info!("- Service controller");

    vec![
        Box::pin(cluster_ctrl),
        Box::pin(cascade_ctrl),
        Box::pin(service_ctrl),
    ]
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
