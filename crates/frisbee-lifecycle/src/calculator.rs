//! Reduction of a classified child set to the parent's lifecycle
//!
//! Each reducer walks an ordered list of rules and applies the first one
//! whose predicate holds. The lifecycle is only touched when the outcome
//! differs from what is already stored, so calling a reducer twice with the
//! same inputs reports `false` the second time.

use frisbee_common::crd::{condition_types, Condition, ConditionStatus, Lifecycle, Phase, TolerateSpec};
use frisbee_common::Error;

use crate::classifier::Classifier;
use crate::Result;

/// Reasons reported by the reducers
pub mod reasons {
    /// More jobs failed than the toleration allows
    pub const TOO_MANY_JOBS_HAVE_FAILED: &str = "TooManyJobsHaveFailed";
    /// A job failed and no toleration is defined
    pub const JOB_HAS_FAILED: &str = "JobHasFailed";
    pub const EXACTLY_ONE_JOB_IS_FAILED: &str = "ExactlyOneJobIsFailed";

    pub const ALL_JOBS_ARE_SUCCESSFUL: &str = "AllJobsAreSuccessful";
    /// Every job terminated and the failures are within the toleration
    pub const TOLERATED_JOBS_ARE_SUCCESSFUL: &str = "ToleratedJobsAreSuccessful";
    pub const EXACTLY_ONE_JOB_IS_SUCCESSFUL: &str = "ExactlyOneJobIsSuccessful";

    /// All jobs are created and at least one is still running
    pub const AT_LEAST_ONE_JOB_IS_RUNNING: &str = "AtLeastOneJobIsRunning";
    pub const EXACTLY_ONE_JOB_IS_RUNNING: &str = "ExactlyOneJobIsRunning";

    /// At least one job is not yet created
    pub const AT_LEAST_ONE_JOB_IS_NOT_SCHEDULED: &str = "AtLeastOneJobIsNotScheduled";
    pub const EXACTLY_ONE_JOB_IS_PENDING: &str = "ExactlyOneJobIsPending";
}

/// Outcome of a rule: the lifecycle it leads to and the condition it upserts
#[derive(Clone, Debug)]
pub struct Rule {
    pub when: bool,
    pub phase: Phase,
    pub reason: &'static str,
    pub message: String,
    pub condition: Option<&'static str>,
}

impl Rule {
    pub fn new(when: bool, phase: Phase, reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            when,
            phase,
            reason,
            message: message.into(),
            condition: None,
        }
    }

    /// Upsert a True condition of this type when the rule fires
    pub fn with_condition(mut self, type_: &'static str) -> Self {
        self.condition = Some(type_);
        self
    }
}

/// Apply the first rule that holds.
///
/// Returns `Some(changed)` if a rule fired, `None` if none did.
pub fn apply_first(rules: Vec<Rule>, lf: &mut Lifecycle) -> Option<bool> {
    let rule = rules.into_iter().find(|r| r.when)?;

    if lf.phase == rule.phase && lf.reason == rule.reason && lf.message == rule.message {
        return Some(false);
    }

    if let Some(type_) = rule.condition {
        lf.set_condition(Condition::new(
            type_,
            ConditionStatus::True,
            rule.reason,
            rule.message.clone(),
        ));
    }
    lf.transition(rule.phase, rule.reason, rule.message);

    Some(true)
}

/// Lifecycle of a parent that owns `expected` jobs.
///
/// Returns `Ok(false)` while nothing is scheduled, so that a parent with an
/// empty queue is never vacuously successful.
///
/// # Errors
///
/// An invariant error if no rule matches the classified state.
pub fn grouped_jobs(
    expected: usize,
    state: &Classifier,
    lf: &mut Lifecycle,
    tolerate: Option<&TolerateSpec>,
) -> Result<bool> {
    if state.count() == 0 {
        return Ok(false);
    }

    let failed = state.num_failed_jobs();
    let successful = state.num_successful_jobs();
    let running = state.num_running_jobs();
    let scheduled = state.count();

    let k = tolerate.map(|t| t.failed_jobs as usize);
    let tolerated_message = |k: usize| {
        format!("tolerate: {k}. failed: {failed} ({:?})", state.list_failed_jobs())
    };
    let running_message =
        format!("{running} (running) / {scheduled} (scheduled) / {expected} (total)");

    let mut rules = Vec::with_capacity(7);

    rules.push(match k {
        Some(k) => Rule::new(
            failed > k,
            Phase::Failed,
            reasons::TOO_MANY_JOBS_HAVE_FAILED,
            tolerated_message(k),
        ),
        None => Rule::new(
            failed > 0,
            Phase::Failed,
            reasons::JOB_HAS_FAILED,
            format!("failed: {:?}", state.list_failed_jobs()),
        ),
    }
    .with_condition(condition_types::UNEXPECTED_TERMINATION));

    rules.push(
        Rule::new(
            successful == expected,
            Phase::Success,
            reasons::ALL_JOBS_ARE_SUCCESSFUL,
            format!("{successful} (successful) / {scheduled} (scheduled) / {expected} (total)"),
        )
        .with_condition(condition_types::ALL_JOBS_ARE_COMPLETED),
    );

    // failures within tolerance count as finished jobs
    if let Some(k) = k {
        rules.push(
            Rule::new(
                successful + failed == expected,
                Phase::Success,
                reasons::TOLERATED_JOBS_ARE_SUCCESSFUL,
                tolerated_message(k),
            )
            .with_condition(condition_types::ALL_JOBS_ARE_COMPLETED),
        );
    }

    rules.push(
        Rule::new(
            running + successful == expected,
            Phase::Running,
            reasons::AT_LEAST_ONE_JOB_IS_RUNNING,
            running_message.clone(),
        )
        .with_condition(condition_types::ALL_JOBS_ARE_SCHEDULED),
    );

    if k.is_some() {
        rules.push(
            Rule::new(
                running + successful + failed == expected,
                Phase::Running,
                reasons::AT_LEAST_ONE_JOB_IS_RUNNING,
                running_message,
            )
            .with_condition(condition_types::ALL_JOBS_ARE_SCHEDULED),
        );
    }

    rules.push(Rule::new(
        lf.phase == Phase::Pending,
        Phase::Pending,
        reasons::AT_LEAST_ONE_JOB_IS_NOT_SCHEDULED,
        format!(
            "{} (pending) / {scheduled} (scheduled) / {expected} (total)",
            state.num_pending_jobs()
        ),
    ));

    let current = lf.phase;
    apply_first(rules, lf).ok_or_else(|| {
        Error::invariant(
            "grouped_jobs",
            format!(
                "unhandled lifecycle. current: {current}, expected: {expected}, jobs: {}",
                state.list_all()
            ),
        )
        .into()
    })
}

/// Lifecycle of a parent that proxies exactly one job (e.g. a Service and
/// its Pod).
///
/// # Errors
///
/// An invariant error if more than one child is classified.
pub fn single_job(state: &Classifier, lf: &mut Lifecycle) -> Result<bool> {
    match state.count() {
        0 => return Ok(false),
        1 => {}
        _ => {
            return Err(Error::invariant(
                "single_job",
                format!("more than one job for a single-job parent: {}", state.list_all()),
            )
            .into())
        }
    }

    let rules = vec![
        Rule::new(
            state.num_failed_jobs() == 1,
            Phase::Failed,
            reasons::EXACTLY_ONE_JOB_IS_FAILED,
            format!("failed: {:?}", state.list_failed_jobs()),
        )
        .with_condition(condition_types::UNEXPECTED_TERMINATION),
        Rule::new(
            state.num_successful_jobs() == 1,
            Phase::Success,
            reasons::EXACTLY_ONE_JOB_IS_SUCCESSFUL,
            format!("successful: {:?}", state.list_successful_jobs()),
        )
        .with_condition(condition_types::ALL_JOBS_ARE_COMPLETED),
        Rule::new(
            state.num_running_jobs() == 1,
            Phase::Running,
            reasons::EXACTLY_ONE_JOB_IS_RUNNING,
            format!("running: {:?}", state.list_running_jobs()),
        )
        .with_condition(condition_types::ALL_JOBS_ARE_SCHEDULED),
        Rule::new(
            state.num_pending_jobs() == 1,
            Phase::Pending,
            reasons::EXACTLY_ONE_JOB_IS_PENDING,
            format!("pending: {:?}", state.list_pending_jobs()),
        )
        .with_condition(condition_types::INITIALIZED),
    ];

    apply_first(rules, lf).ok_or_else(|| {
        Error::invariant("single_job", format!("unhandled lifecycle: {}", state.list_all())).into()
    })
}
