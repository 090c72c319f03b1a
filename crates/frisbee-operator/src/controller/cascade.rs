//! Cascade controller
//!
//! A Cascade injects a queue of Chaos faults one after another. It follows
//! the same flow as a Cluster, with the completion rules of faults: a fault
//! that is active counts as running and there is no toleration.

use std::sync::Arc;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use frisbee_common::crd::{
    condition_types, Cascade, CascadeStatus, Chaos, ChaosSpec, Condition, ConditionStatus,
    Phase, ReportsLifecycle,
};
use frisbee_common::events::{actions, reasons as event_reasons};
use frisbee_common::kube_utils;
use frisbee_common::labels::{self, Component};
use frisbee_common::template::RenderScope;
use frisbee_lifecycle::scheduler::failure_reason;
use frisbee_lifecycle::{
    calculate_group, job_name, job_spec, schedule, Classifier, GroupKind, GroupView,
    ScheduleParams,
};

use super::cluster::reasons;
use super::{after_status_write, classify, failures, next_job_index, register_alerts, Context};
use crate::error::Result;

/// Reconcile a Cascade
#[instrument(skip(cascade, ctx), fields(cascade = %cascade.name_any()))]
pub async fn reconcile(cascade: Arc<Cascade>, ctx: Arc<Context>) -> Result<Action> {
    if kube_utils::is_terminating(cascade.as_ref()) {
        debug!("cascade is being deleted");
        return Ok(Action::await_change());
    }

    let name = cascade.name_any();
    let namespace = cascade.namespace().unwrap_or_default();
    let mut status = cascade.status.clone().unwrap_or_default();

    let children = ctx.kube.list_chaos(&namespace, &name).await?;
    let state = classify(&children);

    let view = GroupView {
        name: &name,
        kind: GroupKind::Cascade,
        until: cascade.spec.until.as_ref(),
        max_instances: cascade.spec.instances,
        queued_jobs: status.queued_jobs.len(),
        scheduled_jobs: status.scheduled_jobs,
        tolerate: None,
        state: &state,
        meta: &cascade.metadata,
    };
    let calculation = calculate_group(&view, &mut status.lifecycle)?;

    if calculation.fired {
        ctx.events
            .publish(
                &cascade.object_ref(&()),
                EventType::Normal,
                event_reasons::UNTIL_FIRED,
                actions::SCHEDULE,
                Some(status.lifecycle.message.clone()),
            )
            .await;
    }

    if calculation.changed {
        info!(lifecycle = %status.lifecycle, faults = %state.num_all(), "cascade lifecycle changed");
        return write_status(&ctx, &namespace, &name, &status).await;
    }

    if calculation.suspend {
        debug!("until condition holds, no more faults");
        return Ok(Action::await_change());
    }

    match status.lifecycle.phase {
        Phase::Uninitialized => initialize(&cascade, &ctx, status).await,
        Phase::Pending => inject_next_fault(&cascade, &ctx, &state, status).await,
        Phase::Running | Phase::Chaos => Ok(Action::await_change()),
        Phase::Success => {
            for chaos in children.iter().filter(|c| c.lifecycle().phase == Phase::Success) {
                ctx.kube.delete_chaos(chaos).await?;
            }
            Ok(Action::await_change())
        }
        Phase::Failed => {
            suspend(&cascade, &ctx).await?;
            for chaos in children
                .iter()
                .filter(|c| c.lifecycle().phase != Phase::Failed)
                .filter(|c| !kube_utils::is_terminating(*c))
            {
                ctx.kube.delete_chaos(chaos).await?;
            }
            Ok(Action::await_change())
        }
    }
}

async fn initialize(cascade: &Cascade, ctx: &Context, mut status: CascadeStatus) -> Result<Action> {
    let name = cascade.name_any();
    let namespace = cascade.namespace().unwrap_or_default();

    let scope = RenderScope {
        parent: name.clone(),
        scenario: labels::scenario(&cascade.metadata)
            .unwrap_or_default()
            .to_string(),
        namespace: namespace.clone(),
    };

    let queue = cascade.spec.validate(&name).and_then(|()| {
        ctx.templates.render_jobs(
            &cascade.spec.template,
            cascade.spec.queue_length(),
            &cascade.spec.inputs,
            &scope,
        )
    });

    let queue = match queue {
        Ok(queue) => queue,
        Err(e) => {
            warn!(error = %e, "cannot initialize cascade");
            fail(&mut status, reasons::INITIALIZATION_FAILED, e.to_string());
            return write_status(ctx, &namespace, &name, &status).await;
        }
    };

    if let Err(e) = register_alerts(
        ctx,
        cascade,
        cascade.spec.until.as_ref(),
        cascade.spec.schedule.as_ref(),
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
        format!("{queued} faults queued"),
    );
    status.lifecycle.set_condition(Condition::new(
        condition_types::INITIALIZED,
        ConditionStatus::True,
        reasons::INITIALIZED,
        format!("{queued} faults queued"),
    ));

    info!(queued, "cascade initialized");
    write_status(ctx, &namespace, &name, &status).await
}

async fn inject_next_fault(
    cascade: &Cascade,
    ctx: &Context,
    state: &Classifier,
    mut status: CascadeStatus,
) -> Result<Action> {
    if cascade.spec.is_suspended() {
        debug!("cascade is suspended");
        return Ok(Action::await_change());
    }

    let name = cascade.name_any();
    let namespace = cascade.namespace().unwrap_or_default();
    let bounded = cascade
        .spec
        .until
        .as_ref()
        .is_none_or(|u| u.is_unconditional());

    let Some(next) = next_job_index(status.scheduled_jobs, status.queued_jobs.len(), bounded)
    else {
        debug!("every queued fault has been injected");
        return Ok(Action::await_change());
    };

    let now = Utc::now();
    let decision = match schedule(ScheduleParams {
        parent: &name,
        spec: cascade.spec.schedule.as_ref(),
        last_schedule_time: status.last_schedule_time,
        creation_time: cascade.metadata.creation_timestamp.as_ref().map(|t| t.0),
        failures: failures(state),
        state,
        meta: &cascade.metadata,
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
        debug!(next, ?after, "next fault is not due yet");
        return Ok(Action::requeue(after));
    }

    let naming = if bounded { cascade.spec.instances } else { 0 };
    let job = job_name(&name, next, naming);
    let spec = job_spec(&name, &status.queued_jobs, next)?;
    let chaos = build_chaos(cascade, &job, spec)?;

    if ctx.kube.create_chaos(&chaos).await? {
        ctx.events
            .publish(
                &cascade.object_ref(&()),
                EventType::Normal,
                event_reasons::JOB_SCHEDULED,
                actions::SCHEDULE,
                Some(format!("Injected fault '{job}'")),
            )
            .await;
    }

    status.scheduled_jobs = next as i64;
    status.last_schedule_time = Some(decision.activation.unwrap_or(now));
    info!(job = %job, index = next, "injected fault");

    write_status(ctx, &namespace, &name, &status).await
}

fn build_chaos(cascade: &Cascade, job: &str, spec: ChaosSpec) -> Result<Chaos> {
    let mut chaos = Chaos::new(job, spec);
    chaos.metadata.namespace = cascade.namespace();

    labels::propagate(&mut chaos.metadata, &cascade.metadata);
    labels::set_created_by(&mut chaos.metadata, &cascade.name_any());
    labels::set_component(&mut chaos.metadata, Component::Sut);
    kube_utils::set_owner(&mut chaos, cascade)?;

    Ok(chaos)
}

async fn suspend(cascade: &Cascade, ctx: &Context) -> Result<()> {
    if cascade.spec.is_suspended() {
        return Ok(());
    }

    ctx.kube
        .suspend_cascade(&cascade.namespace().unwrap_or_default(), &cascade.name_any())
        .await?;

    let message = cascade
        .status
        .as_ref()
        .map(|s| s.lifecycle.message.clone())
        .unwrap_or_default();
    ctx.events
        .publish(
            &cascade.object_ref(&()),
            EventType::Warning,
            event_reasons::SUSPENDED,
            actions::RECONCILE,
            Some(format!("Cascade failed: {message}")),
        )
        .await;

    info!("cascade suspended after failure");
    Ok(())
}

fn fail(status: &mut CascadeStatus, reason: &str, message: String) {
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
    status: &CascadeStatus,
) -> Result<Action> {
    let outcome = ctx
        .kube
        .patch_cascade_status(namespace, name, status)
        .await?;
    Ok(after_status_write(name, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::test_support::{awaits_change, lifecycle_in, settled};
    use crate::controller::MockKubeClient;
    use frisbee_common::crd::{CascadeSpec, ChaosStatus, ConditionalExpr, SchedulerSpec};
    use frisbee_common::kube_utils::StatusOutcome;
    use frisbee_lifecycle::scheduler::reasons as schedule_reasons;
    use frisbee_lifecycle::until::reasons as until_reasons;
    use mockall::mock;
    use mockall::predicate::*;

    use frisbee_common::events::EventPublisher;
    use frisbee_lifecycle::expressions::metrics::AlertDescriptor;
    use frisbee_lifecycle::AlertingClient;
    use k8s_openapi::api::core::v1::ObjectReference;

    // Local mock, the generated one is only available to the lifecycle
    // crate's own tests
    mock! {
        pub Alerting {}

        #[async_trait::async_trait]
        impl AlertingClient for Alerting {
            async fn set_alert(
                &self,
                alert: &AlertDescriptor,
                name: &str,
                message: &str,
            ) -> frisbee_lifecycle::Result<()>;
        }
    }

    mock! {
        pub Events {}

        #[async_trait::async_trait]
        impl EventPublisher for Events {
            async fn publish(
                &self,
                resource_ref: &ObjectReference,
                type_: EventType,
                reason: &str,
                action: &str,
                note: Option<String>,
            );
        }
    }

    fn template() -> ChaosSpec {
        ChaosSpec {
            fault_type: "partition".to_string(),
            params: [(
                "target".to_string(),
                serde_json::json!("{{ inputs.target }}"),
            )]
            .into(),
        }
    }

    fn sample_cascade(instances: u32) -> Cascade {
        let mut cascade = Cascade::new(
            "killer",
            CascadeSpec {
                template: template(),
                instances,
                inputs: vec![
                    [("target".to_string(), "servers-0".to_string())].into(),
                    [("target".to_string(), "servers-1".to_string())].into(),
                ],
                ..Default::default()
            },
        );
        cascade.metadata.namespace = Some("demo".to_string());
        cascade.metadata.uid = Some("uid-killer".to_string());
        labels::set_scenario(&mut cascade.metadata, "scenario-a");
        cascade
    }

    fn cascade_in(phase: Phase, queued: usize, scheduled: i64) -> Cascade {
        let mut cascade = sample_cascade(queued as u32);
        cascade.status = Some(CascadeStatus {
            lifecycle: lifecycle_in(phase),
            queued_jobs: vec![template(); queued],
            scheduled_jobs: scheduled,
            last_schedule_time: None,
        });
        cascade
    }

    fn fault(name: &str, phase: Phase) -> Chaos {
        let mut chaos = Chaos::new(name, template());
        chaos.metadata.namespace = Some("demo".to_string());
        chaos.status = Some(ChaosStatus {
            lifecycle: lifecycle_in(phase),
        });
        chaos
    }

    fn with_faults(mock: &mut MockKubeClient, faults: Vec<Chaos>) {
        mock.expect_list_chaos()
            .with(eq("demo"), eq("killer"))
            .returning(move |_, _| Ok(faults.clone()));
    }

    async fn run_with(cascade: Cascade, ctx: Context) -> Result<Action> {
        reconcile(Arc::new(cascade), Arc::new(ctx)).await
    }

    async fn run(cascade: Cascade, mock: MockKubeClient) -> Result<Action> {
        run_with(cascade, Context::for_testing(Arc::new(mock))).await
    }

    #[tokio::test]
    async fn first_reconcile_renders_fault_targets() {
        let mut mock = MockKubeClient::new();
        with_faults(&mut mock, vec![]);
        mock.expect_patch_cascade_status()
            .withf(|_, _, status: &CascadeStatus| {
                status.lifecycle.phase == Phase::Pending
                    && status.queued_jobs.len() == 2
                    && status.queued_jobs[1].params["target"] == "servers-1"
            })
            .times(1)
            .returning(|_, _, _| Ok(StatusOutcome::Stored));

        let action = run(sample_cascade(2), mock).await.unwrap();
        assert!(awaits_change(&action));
    }

    /// Story: the alert a metrics-driven cascade waits on is registered on
    /// the dashboard of its scenario before the first fault is injected.
    #[tokio::test]
    async fn metrics_until_registers_an_alert() {
        let mut cascade = sample_cascade(0);
        cascade.spec.until = Some(ConditionalExpr::metrics(
            "avg() of query(summary/2/A, 5m, now) is below(14)",
        ));

        let mut mock = MockKubeClient::new();
        with_faults(&mut mock, vec![]);
        mock.expect_patch_cascade_status()
            .withf(|_, _, status: &CascadeStatus| {
                status.lifecycle.phase == Phase::Pending && status.queued_jobs.len() == 2
            })
            .times(1)
            .returning(|_, _, _| Ok(StatusOutcome::Stored));

        let mut alerting = MockAlerting::new();
        alerting
            .expect_set_alert()
            .withf(|alert, name, _| alert.dashboard_uid == "summary" && name == "demo/Cascade/killer")
            .times(1)
            .returning(|_, _, _| Ok(()));

        let ctx = Context::for_testing(Arc::new(mock));
        ctx.alerting
            .register("scenario-a", Arc::new(alerting))
            .unwrap();

        run_with(cascade, ctx).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_scenario_fails_alert_registration() {
        let mut cascade = sample_cascade(1);
        cascade.spec.until = Some(ConditionalExpr::metrics(
            "avg() of query(summary/2/A, 5m, now) is below(14)",
        ));

        let mut mock = MockKubeClient::new();
        with_faults(&mut mock, vec![]);
        mock.expect_patch_cascade_status()
            .withf(|_, _, status: &CascadeStatus| {
                status.lifecycle.phase == Phase::Failed
                    && status.lifecycle.reason == reasons::ALERT_REGISTRATION_FAILED
            })
            .times(1)
            .returning(|_, _, _| Ok(StatusOutcome::Stored));

        run(cascade, mock).await.unwrap();
    }

    #[tokio::test]
    async fn pending_cascade_injects_the_next_fault() {
        let mut cascade = cascade_in(Phase::Pending, 2, -1);
        if let Some(status) = cascade.status.as_mut() {
            status.lifecycle = settled(Phase::Pending, "Initialized", "2 faults queued");
        }

        let mut mock = MockKubeClient::new();
        with_faults(&mut mock, vec![]);
        mock.expect_create_chaos()
            .withf(|chaos: &Chaos| {
                chaos.name_any() == "killer-0"
                    && labels::created_by(&chaos.metadata) == Some("killer")
                    && labels::component(&chaos.metadata) == Some(Component::Sut)
            })
            .times(1)
            .returning(|_| Ok(true));
        mock.expect_patch_cascade_status()
            .withf(|_, _, status: &CascadeStatus| status.scheduled_jobs == 0)
            .times(1)
            .returning(|_, _, _| Ok(StatusOutcome::Stored));

        run(cascade, mock).await.unwrap();
    }

    #[tokio::test]
    async fn unparseable_cron_fails_the_cascade() {
        let mut cascade = cascade_in(Phase::Pending, 2, -1);
        cascade.spec.schedule = Some(SchedulerSpec {
            cron: Some("*/5 * *".to_string()),
            ..Default::default()
        });
        if let Some(status) = cascade.status.as_mut() {
            status.lifecycle = settled(Phase::Pending, "Initialized", "2 faults queued");
        }

        let mut mock = MockKubeClient::new();
        with_faults(&mut mock, vec![]);
        mock.expect_create_chaos().never();
        mock.expect_patch_cascade_status()
            .withf(|_, _, status: &CascadeStatus| {
                status.lifecycle.phase == Phase::Failed
                    && status.lifecycle.reason == schedule_reasons::SCHEDULE_ERROR
                    && status
                        .lifecycle
                        .is_condition_true(condition_types::UNEXPECTED_TERMINATION)
            })
            .times(1)
            .returning(|_, _, _| Ok(StatusOutcome::Stored));

        let action = run(cascade, mock).await.unwrap();
        assert!(awaits_change(&action));
    }

    #[tokio::test]
    async fn active_faults_make_the_cascade_running() {
        let mut mock = MockKubeClient::new();
        with_faults(
            &mut mock,
            vec![fault("killer-0", Phase::Success), fault("killer-1", Phase::Chaos)],
        );
        mock.expect_patch_cascade_status()
            .withf(|_, _, status: &CascadeStatus| {
                status.lifecycle.phase == Phase::Running
                    && status.lifecycle.reason == until_reasons::ALL_JOBS_RUNNING
            })
            .times(1)
            .returning(|_, _, _| Ok(StatusOutcome::Stored));

        run(cascade_in(Phase::Pending, 2, 1), mock).await.unwrap();
    }

    #[tokio::test]
    async fn state_until_fires_on_successful_faults() {
        let mut cascade = cascade_in(Phase::Pending, 1, 2);
        cascade.spec.instances = 0;
        cascade.spec.until = Some(ConditionalExpr::state("{{.NumSuccessfulJobs}} >= 2"));

        let mut mock = MockKubeClient::new();
        with_faults(
            &mut mock,
            vec![
                fault("killer-0", Phase::Success),
                fault("killer-1", Phase::Success),
                fault("killer-2", Phase::Running),
            ],
        );
        mock.expect_create_chaos().never();
        mock.expect_patch_cascade_status()
            .withf(|_, _, status: &CascadeStatus| {
                status.lifecycle.reason == until_reasons::STATE_EVENT_FIRED
                    && status
                        .lifecycle
                        .is_condition_true(condition_types::TERMINATED)
            })
            .times(1)
            .returning(|_, _, _| Ok(StatusOutcome::Stored));

        let mut events = MockEvents::new();
        events
            .expect_publish()
            .withf(|obj, _, reason, action, note| {
                obj.name.as_deref() == Some("killer")
                    && reason == event_reasons::UNTIL_FIRED
                    && action == actions::SCHEDULE
                    && note.is_some()
            })
            .times(1)
            .return_const(());

        let mut ctx = Context::for_testing(Arc::new(mock));
        ctx.events = Arc::new(events);
        run_with(cascade, ctx).await.unwrap();
    }

    #[tokio::test]
    async fn failed_cascade_revokes_active_faults() {
        let mut mock = MockKubeClient::new();
        with_faults(
            &mut mock,
            vec![fault("killer-0", Phase::Failed), fault("killer-1", Phase::Chaos)],
        );
        mock.expect_suspend_cascade()
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_delete_chaos()
            .withf(|chaos: &Chaos| chaos.name_any() == "killer-1")
            .times(1)
            .returning(|_| Ok(()));

        run(cascade_in(Phase::Failed, 2, 1), mock).await.unwrap();
    }
}
