//! Cluster controller
//!
//! A Cluster renders its template into a queue of Service specs when it is
//! first seen, then creates one Service per activation of its schedule. Its
//! lifecycle is the aggregate of the lifecycles of those Services.

use std::sync::Arc;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use frisbee_common::crd::{
    condition_types, Cluster, ClusterStatus, Condition, ConditionStatus, Phase,
    ReportsLifecycle, Service, ServiceSpec,
};
use frisbee_common::events::{actions, reasons as event_reasons};
use frisbee_common::kube_utils;
use frisbee_common::labels::{self, Component};
use frisbee_common::template::RenderScope;
use frisbee_lifecycle::scheduler::failure_reason;
use frisbee_lifecycle::{
    calculate_group, job_name, job_spec, schedule, GroupKind, GroupView, ScheduleParams,
};

use super::{after_status_write, classify, failures, next_job_index, register_alerts, Context};
use crate::error::Result;

/// Reasons recorded on the Cluster lifecycle by the controller itself
pub mod reasons {
    /// The queue was rendered and alerts registered
    pub const INITIALIZED: &str = "Initialized";
    /// The template and inputs could not be turned into a queue of jobs
    pub const INITIALIZATION_FAILED: &str = "InitializationFailed";
    /// An alert the cluster depends on could not be registered
    pub const ALERT_REGISTRATION_FAILED: &str = "AlertRegistrationFailed";
}

/// Reconcile a Cluster
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    if kube_utils::is_terminating(cluster.as_ref()) {
        debug!("cluster is being deleted");
        return Ok(Action::await_change());
    }

    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();
    let mut status = cluster.status.clone().unwrap_or_default();

    let children = ctx.kube.list_services(&namespace, &name).await?;
    let state = classify(&children);

    let view = GroupView {
        name: &name,
        kind: GroupKind::Cluster,
        until: cluster.spec.until.as_ref(),
        max_instances: cluster.spec.instances,
        queued_jobs: status.queued_jobs.len(),
        scheduled_jobs: status.scheduled_jobs,
        tolerate: cluster.spec.tolerate.as_ref(),
        state: &state,
        meta: &cluster.metadata,
    };
    let calculation = calculate_group(&view, &mut status.lifecycle)?;

    if calculation.fired {
        ctx.events
            .publish(
                &cluster.object_ref(&()),
                EventType::Normal,
                event_reasons::UNTIL_FIRED,
                actions::SCHEDULE,
                Some(status.lifecycle.message.clone()),
            )
            .await;
    }

    if calculation.changed {
        info!(lifecycle = %status.lifecycle, jobs = %state.num_all(), "cluster lifecycle changed");
        return write_status(&ctx, &namespace, &name, &status).await;
    }

    if calculation.suspend {
        debug!("until condition holds, no more services");
        return Ok(Action::await_change());
    }

    match status.lifecycle.phase {
        Phase::Uninitialized => initialize(&cluster, &ctx, status).await,
        Phase::Pending => create_next_job(&cluster, &ctx, &state, status).await,
        Phase::Running | Phase::Chaos => Ok(Action::await_change()),
        Phase::Success => {
            for svc in children.iter().filter(|s| s.lifecycle().phase == Phase::Success) {
                ctx.kube.delete_service(svc).await?;
            }
            Ok(Action::await_change())
        }
        Phase::Failed => {
            suspend(&cluster, &ctx).await?;
            for svc in children
                .iter()
                .filter(|s| s.lifecycle().phase != Phase::Failed)
                .filter(|s| !kube_utils::is_terminating(*s))
            {
                ctx.kube.delete_service(svc).await?;
            }
            Ok(Action::await_change())
        }
    }
}

/// Render the queue, register alerts, and move to Pending
async fn initialize(cluster: &Cluster, ctx: &Context, mut status: ClusterStatus) -> Result<Action> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();

    let scope = RenderScope {
        parent: name.clone(),
        scenario: labels::scenario(&cluster.metadata)
            .unwrap_or_default()
            .to_string(),
        namespace: namespace.clone(),
    };

    let queue = cluster.spec.validate(&name).and_then(|()| {
        ctx.templates.render_jobs(
            &cluster.spec.template,
            cluster.spec.queue_length(),
            &cluster.spec.inputs,
            &scope,
        )
    });

    let queue = match queue {
        Ok(queue) => queue,
        Err(e) => {
            warn!(error = %e, "cannot initialize cluster");
            fail(&mut status, reasons::INITIALIZATION_FAILED, e.to_string());
            return write_status(ctx, &namespace, &name, &status).await;
        }
    };

    if let Err(e) = register_alerts(
        ctx,
        cluster,
        cluster.spec.until.as_ref(),
        cluster.spec.schedule.as_ref(),
    )
    .await
    {
        if e.is_retryable() {
            return Err(e.into());
        }
        warn!(error = %e, "cannot register alerts");
        fail(&mut status, reasons::ALERT_REGISTRATION_FAILED, e.to_string());
        return write_status(ctx, &namespace, &name, &status).await;
    }

    let queued = queue.len();
    status.queued_jobs = queue;
    status.scheduled_jobs = -1;
    status.last_schedule_time = None;
    status.lifecycle.transition(
        Phase::Pending,
        reasons::INITIALIZED,
        format!("{queued} jobs queued"),
    );
    status.lifecycle.set_condition(Condition::new(
        condition_types::INITIALIZED,
        ConditionStatus::True,
        reasons::INITIALIZED,
        format!("{queued} jobs queued"),
    ));

    info!(queued, "cluster initialized");
    write_status(ctx, &namespace, &name, &status).await
}

/// Create the next queued Service once the schedule allows it
async fn create_next_job(
    cluster: &Cluster,
    ctx: &Context,
    state: &frisbee_lifecycle::Classifier,
    mut status: ClusterStatus,
) -> Result<Action> {
    if cluster.spec.is_suspended() {
        debug!("cluster is suspended");
        return Ok(Action::await_change());
    }

    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();
    let bounded = cluster
        .spec
        .until
        .as_ref()
        .is_none_or(|u| u.is_unconditional());

    let Some(next) = next_job_index(status.scheduled_jobs, status.queued_jobs.len(), bounded)
    else {
        debug!("every queued service has been created");
        return Ok(Action::await_change());
    };

    let now = Utc::now();
    let decision = match schedule(ScheduleParams {
        parent: &name,
        spec: cluster.spec.schedule.as_ref(),
        last_schedule_time: status.last_schedule_time,
        creation_time: cluster.metadata.creation_timestamp.as_ref().map(|t| t.0),
        failures: failures(state),
        state,
        meta: &cluster.metadata,
        backoff: &ctx.backoff,
        now,
    }) {
        Ok(decision) => decision,
        Err(e) => {
            let Some(reason) = failure_reason(&e) else {
                return Err(e.into());
            };
            warn!(error = %e, "schedule can never be honored");
            fail(&mut status, reason, e.to_string());
            return write_status(ctx, &namespace, &name, &status).await;
        }
    };

    if !decision.has_job {
        let after = decision.requeue_after.unwrap_or(ctx.backoff.base_delay);
        debug!(next, ?after, "next service is not due yet");
        return Ok(Action::requeue(after));
    }

    // until-driven clusters create an open-ended series, so every job gets an index
    let naming = if bounded { cluster.spec.instances } else { 0 };
    let job = job_name(&name, next, naming);
    let spec = job_spec(&name, &status.queued_jobs, next)?;
    let svc = build_service(cluster, &job, spec)?;

    if ctx.kube.create_service(&svc).await? {
        ctx.events
            .publish(
                &cluster.object_ref(&()),
                EventType::Normal,
                event_reasons::JOB_SCHEDULED,
                actions::SCHEDULE,
                Some(format!("Created service '{job}'")),
            )
            .await;
    }

    status.scheduled_jobs = next as i64;
    status.last_schedule_time = Some(decision.activation.unwrap_or(now));
    info!(job = %job, index = next, "scheduled service");

    write_status(ctx, &namespace, &name, &status).await
}

/// Service running the `job`-th entry of the queue
fn build_service(cluster: &Cluster, job: &str, spec: ServiceSpec) -> Result<Service> {
    let mut svc = Service::new(job, spec);
    svc.metadata.namespace = cluster.namespace();

    labels::propagate(&mut svc.metadata, &cluster.metadata);
    labels::set_created_by(&mut svc.metadata, &cluster.name_any());
    if labels::component(&svc.metadata).is_none() {
        labels::set_component(&mut svc.metadata, Component::Sut);
    }
    kube_utils::set_owner(&mut svc, cluster)?;

    Ok(svc)
}

/// Force `suspend` so that a failed cluster creates no more Services
async fn suspend(cluster: &Cluster, ctx: &Context) -> Result<()> {
    if cluster.spec.is_suspended() {
        return Ok(());
    }

    let name = cluster.name_any();
    ctx.kube
        .suspend_cluster(&cluster.namespace().unwrap_or_default(), &name)
        .await?;

    let message = cluster
        .status
        .as_ref()
        .map(|s| s.lifecycle.message.clone())
        .unwrap_or_default();
    ctx.events
        .publish(
            &cluster.object_ref(&()),
            EventType::Warning,
            event_reasons::SUSPENDED,
            actions::RECONCILE,
            Some(format!("Cluster failed: {message}")),
        )
        .await;

    info!("cluster suspended after failure");
    Ok(())
}

fn fail(status: &mut ClusterStatus, reason: &str, message: String) {
    status.lifecycle.set_condition(Condition::new(
        condition_types::UNEXPECTED_TERMINATION,
        ConditionStatus::True,
        reason,
        message.clone(),
    ));
    status.lifecycle.transition(Phase::Failed, reason, message);
}

async fn write_status(
    ctx: &Context,
    namespace: &str,
    name: &str,
    status: &ClusterStatus,
) -> Result<Action> {
    let outcome = ctx
        .kube
        .patch_cluster_status(namespace, name, status)
        .await?;
    Ok(after_status_write(name, outcome))
}
