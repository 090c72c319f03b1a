//! Lifecycle of groups driven by an Until condition, and job materialization
//!
//! A group with `until` keeps recycling its queued jobs round-robin until the
//! condition holds. `instances` then bounds the number of jobs created: a
//! group that reaches the bound before the condition holds never converges
//! and fails.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::debug;

use frisbee_common::crd::{
    condition_types, Condition, ConditionStatus, ConditionalExpr, Lifecycle, Phase, TolerateSpec,
};
use frisbee_common::Error;

use crate::calculator::{apply_first, grouped_jobs, Rule};
use crate::classifier::Classifier;
use crate::expressions::condition::{evaluate, Source, Verdict};
use crate::Result;

/// Reasons reported for grouped resources
pub mod reasons {
    /// The Until condition of a Cluster holds
    pub const UNTIL_CONDITION: &str = "UntilCondition";
    /// The metrics Until condition of a Cascade holds
    pub const METRICS_EVENT_FIRED: &str = "MetricsEventFired";
    /// The state Until condition of a Cascade holds
    pub const STATE_EVENT_FIRED: &str = "StateEventFired";
    pub const MAX_INSTANCES_REACHED: &str = "MaxInstancesReached";
    pub const SPAWN_UNTIL_EVENT: &str = "SpawnUntilEvent";
    pub const STATE_QUERY_ERROR: &str = "StateQueryError";

    /// A fault could not be injected or reverted
    pub const JOB_FAILED: &str = "JobFailed";
    pub const ALL_JOBS_COMPLETED: &str = "AllJobsCompleted";
    pub const ALL_JOBS_RUNNING: &str = "AllJobsRunning";
    pub const JOB_IS_PENDING: &str = "JobIsPending";
}

const UNTIL_PENDING_MESSAGE: &str = "Assertion is not yet satisfied.";

/// Which controller's rules apply
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupKind {
    Cluster,
    Cascade,
}

/// Everything the group calculator looks at
pub struct GroupView<'a> {
    pub name: &'a str,
    pub kind: GroupKind,
    pub until: Option<&'a ConditionalExpr>,
    /// Upper bound of created jobs under Until (0 = unbounded)
    pub max_instances: u32,
    pub queued_jobs: usize,
    pub scheduled_jobs: i64,
    pub tolerate: Option<&'a TolerateSpec>,
    pub state: &'a Classifier,
    pub meta: &'a ObjectMeta,
}

/// Result of evaluating an Until condition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UntilOutcome {
    /// The condition holds. No more jobs are created.
    Fired,
    /// The bound on created jobs was exceeded first
    MaxInstancesReached,
    /// Keep creating jobs
    Waiting,
    /// The condition can never be evaluated
    QueryError,
}

/// Outcome of [`calculate_group`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupCalculation {
    /// The lifecycle was modified
    pub changed: bool,
    /// The group must stop creating jobs
    pub suspend: bool,
    /// The Until condition fired in this round
    pub fired: bool,
}

fn set(lf: &mut Lifecycle, phase: Phase, reason: &str, message: &str, condition: Option<&str>) {
    if let Some(type_) = condition {
        lf.set_condition(Condition::new(type_, ConditionStatus::True, reason, message));
    }
    lf.transition(phase, reason, message);
}

/// Apply the Until rules of a group.
///
/// 1. fired: Running, `AllJobsAreScheduled` and `Terminated` conditions
/// 2. more jobs scheduled than `max_instances`: Failed
/// 3. otherwise: Pending, keep spawning
///
/// A broken state expression fails the group with `StateQueryError`.
pub fn evaluate_until(
    group: &GroupView<'_>,
    until: &ConditionalExpr,
    lf: &mut Lifecycle,
) -> UntilOutcome {
    match evaluate(until, group.state, group.meta) {
        Verdict::Fired { source, info } => {
            let reason = match (group.kind, source) {
                (GroupKind::Cluster, _) => reasons::UNTIL_CONDITION,
                (GroupKind::Cascade, Source::Metrics) => reasons::METRICS_EVENT_FIRED,
                (GroupKind::Cascade, Source::State) => reasons::STATE_EVENT_FIRED,
            };
            lf.set_condition(Condition::new(
                condition_types::TERMINATED,
                ConditionStatus::True,
                reason,
                info.clone(),
            ));
            set(
                lf,
                Phase::Running,
                reason,
                &info,
                Some(condition_types::ALL_JOBS_ARE_SCHEDULED),
            );
            debug!(group = %group.name, %info, "until condition fired");
            return UntilOutcome::Fired;
        }
        Verdict::Failed { source, error } => {
            let reason = match source {
                Source::State => reasons::STATE_QUERY_ERROR,
                Source::Metrics => error_reason(&error),
            };
            set(
                lf,
                Phase::Failed,
                reason,
                &error.to_string(),
                Some(condition_types::UNEXPECTED_TERMINATION),
            );
            return UntilOutcome::QueryError;
        }
        Verdict::NotYet { .. } => {}
    }

    let max = i64::from(group.max_instances);
    if max > 0 && group.scheduled_jobs > max {
        let message = format!(
            "{} [{}] has reached max instances [{max}] before the until condition is met. \
             Abort the experiment as it is too flaky to accept. You can retry without defining instances.",
            kind_name(group.kind),
            group.name
        );
        set(
            lf,
            Phase::Failed,
            reasons::MAX_INSTANCES_REACHED,
            &message,
            Some(condition_types::UNEXPECTED_TERMINATION),
        );
        return UntilOutcome::MaxInstancesReached;
    }

    set(
        lf,
        Phase::Pending,
        reasons::SPAWN_UNTIL_EVENT,
        UNTIL_PENDING_MESSAGE,
        None,
    );
    UntilOutcome::Waiting
}

fn kind_name(kind: GroupKind) -> &'static str {
    match kind {
        GroupKind::Cluster => "Cluster",
        GroupKind::Cascade => "Cascade",
    }
}

/// Failure reason of a condition that cannot be evaluated
pub(crate) fn error_reason(error: &Error) -> &'static str {
    match error {
        Error::Alerting { .. } => "AlertChannelError",
        _ => reasons::STATE_QUERY_ERROR,
    }
}

/// Completion rules of a Cascade, whose children are faults rather than
/// jobs. Any failed fault fails the Cascade.
///
/// # Errors
///
/// An invariant error if no rule matches the classified state.
pub fn cascade_jobs(expected: usize, state: &Classifier, lf: &mut Lifecycle) -> Result<bool> {
    if state.count() == 0 {
        return Ok(false);
    }

    let successful = state.num_successful_jobs();
    let running = state.num_running_jobs();

    let rules = vec![
        Rule::new(
            state.num_failed_jobs() > 0,
            Phase::Failed,
            reasons::JOB_FAILED,
            format!("failed jobs: {:?}", state.list_failed_jobs()),
        )
        .with_condition(condition_types::UNEXPECTED_TERMINATION),
        Rule::new(
            successful == expected,
            Phase::Success,
            reasons::ALL_JOBS_COMPLETED,
            format!("successful jobs: {:?}", state.list_successful_jobs()),
        )
        .with_condition(condition_types::ALL_JOBS_ARE_COMPLETED),
        Rule::new(
            running + successful == expected,
            Phase::Running,
            reasons::ALL_JOBS_RUNNING,
            format!("running jobs: {:?}", state.list_running_jobs()),
        )
        .with_condition(condition_types::ALL_JOBS_ARE_SCHEDULED),
        Rule::new(
            lf.phase == Phase::Pending,
            Phase::Pending,
            reasons::JOB_IS_PENDING,
            "at least one jobs has not yet created",
        ),
    ];

    let current = lf.phase;
    apply_first(rules, lf).ok_or_else(|| {
        Error::invariant(
            "cascade_jobs",
            format!(
                "unhandled lifecycle. current: {current}, expected: {expected}, jobs: {}",
                state.list_all()
            ),
        )
        .into()
    })
}

/// Recompute the lifecycle of a group from its classified children.
///
/// Uninitialized and terminal groups are left alone. A group whose Until
/// condition already fired is judged on the jobs it created so far.
///
/// # Errors
///
/// An invariant error if the classified state matches no rule.
pub fn calculate_group(group: &GroupView<'_>, lf: &mut Lifecycle) -> Result<GroupCalculation> {
    if lf.phase.is(&[Phase::Uninitialized, Phase::Success, Phase::Failed]) {
        return Ok(GroupCalculation::default());
    }

    let before = lf.clone();

    if let Some(until) = group.until.filter(|u| !u.is_unconditional()) {
        if !lf.is_condition_true(condition_types::TERMINATED) {
            let outcome = evaluate_until(group, until, lf);
            let fired = outcome == UntilOutcome::Fired;
            return Ok(GroupCalculation {
                changed: *lf != before,
                suspend: fired,
                fired,
            });
        }

        // jobs still being created by the last scheduling round
        if group.state.num_pending_jobs() > 0 {
            return Ok(GroupCalculation {
                changed: false,
                suspend: true,
                fired: false,
            });
        }

        let created = usize::try_from(group.scheduled_jobs + 1).unwrap_or_default();
        let changed = reduce(group, created, lf)?;
        return Ok(GroupCalculation {
            changed,
            suspend: true,
            fired: false,
        });
    }

    let changed = reduce(group, group.queued_jobs, lf)?;
    Ok(GroupCalculation {
        changed,
        suspend: false,
        fired: false,
    })
}

fn reduce(group: &GroupView<'_>, expected: usize, lf: &mut Lifecycle) -> Result<bool> {
    match group.kind {
        GroupKind::Cluster => grouped_jobs(expected, group.state, lf, group.tolerate),
        GroupKind::Cascade => cascade_jobs(expected, group.state, lf),
    }
}

/// Name of the `i`-th job of a group.
///
/// A group of a single instance names its only job after itself.
pub fn job_name(parent: &str, i: usize, max_instances: u32) -> String {
    if max_instances == 1 {
        parent.to_string()
    } else {
        format!("{parent}-{i}")
    }
}

/// Spec of the `i`-th job. The queue is recycled round-robin.
///
/// # Errors
///
/// An invariant error if the queue is empty.
pub fn job_spec<T: Clone>(parent: &str, queue: &[T], i: usize) -> Result<T> {
    if queue.is_empty() {
        return Err(Error::invariant(
            "job_spec",
            format!("group '{parent}' has no queued jobs"),
        )
        .into());
    }
    Ok(queue[i % queue.len()].clone())
}
