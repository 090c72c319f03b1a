//! Decides whether the next job of a group is due
//!
//! Groups pace the creation of their jobs in one of three ways:
//!
//! - no schedule: the next job is created as soon as the previous one exists
//! - time-driven: a cron rule (or `@every <duration>`) names the activations
//! - event-driven: the next job waits until a conditional expression holds
//!
//! Time-driven scheduling mirrors the semantics of a Kubernetes CronJob: the
//! latest missed activation is honored, activations older than the starting
//! deadline are skipped, and a wedged clock that produces more than
//! [`MAX_MISSED_STARTS`] activations is reported instead of replayed.

use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use regex::Regex;
use tracing::debug;

use frisbee_common::crd::SchedulerSpec;
use frisbee_common::retry::Backoff;
use frisbee_common::Error;

use crate::classifier::Classifier;
use crate::expressions::condition::{evaluate, Verdict};
use crate::until::error_reason;
use crate::{LifecycleError, Result};

/// Reasons reported when a schedule can never be honored
pub mod reasons {
    /// The cron rule cannot be parsed, or too many activations were missed
    pub const SCHEDULE_ERROR: &str = "ScheduleError";
}

/// Missed activations tolerated before scheduling gives up
pub const MAX_MISSED_STARTS: usize = 100;

const EVERY_PREFIX: &str = "@every ";

static DURATION_TERM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)(ns|us|µs|ms|s|m|h)").expect("duration syntax is a valid regex")
});

/// Inputs of a scheduling decision
pub struct ScheduleParams<'a> {
    /// Name of the parent, for errors and logs
    pub parent: &'a str,
    pub spec: Option<&'a SchedulerSpec>,
    pub last_schedule_time: Option<DateTime<Utc>>,
    pub creation_time: Option<DateTime<Utc>>,
    /// Consecutive job-creation failures
    pub failures: u32,
    pub state: &'a Classifier,
    pub meta: &'a ObjectMeta,
    pub backoff: &'a Backoff,
    pub now: DateTime<Utc>,
}

/// Outcome of [`schedule`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScheduleDecision {
    /// Create the next job now
    pub has_job: bool,
    /// The activation being honored, when time-driven
    pub activation: Option<DateTime<Utc>>,
    /// When to look again
    pub requeue_after: Option<Duration>,
}

impl ScheduleDecision {
    fn now() -> Self {
        Self {
            has_job: true,
            ..Default::default()
        }
    }
}

/// Sequence of activation times
#[derive(Clone, Debug)]
pub enum Timeline {
    Cron(Box<cron::Schedule>),
    Every(TimeDelta),
}

impl Timeline {
    /// Parse a cron rule.
    ///
    /// Accepts the 5-field standard form, the 6-field form with seconds,
    /// the `@hourly`/`@daily`/... descriptors and `@every <duration>`.
    pub fn parse(parent: &str, rule: &str) -> Result<Self> {
        let rule = rule.trim();

        if let Some(interval) = rule.strip_prefix(EVERY_PREFIX) {
            let interval = parse_interval(interval.trim()).ok_or_else(|| {
                Error::scheduling(parent, format!("unparseable interval in '{rule}'"))
            })?;
            return Ok(Self::Every(interval.max(TimeDelta::seconds(1))));
        }

        let normalized = if rule.split_whitespace().count() == 5 {
            format!("0 {rule}")
        } else {
            rule.to_string()
        };

        cron::Schedule::from_str(&normalized)
            .map(|s| Self::Cron(Box::new(s)))
            .map_err(|e| {
                Error::scheduling(parent, format!("unparseable schedule '{rule}': {e}")).into()
            })
    }

    /// First activation strictly after `t`
    pub fn next(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron(schedule) => schedule.after(&t).next(),
            Self::Every(interval) => t.checked_add_signed(*interval),
        }
    }
}

/// Parse a duration such as `1h30m`, `45s` or `1.5h`
pub fn parse_interval(text: &str) -> Option<TimeDelta> {
    if text.is_empty() {
        return None;
    }

    let mut consumed = 0;
    let mut total = 0f64;

    for caps in DURATION_TERM.captures_iter(text) {
        let whole = caps.get(0)?;
        if whole.start() != consumed {
            return None;
        }
        consumed = whole.end();

        let value: f64 = caps[1].parse().ok()?;
        let nanos_per_unit = match &caps[2] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        total += value * nanos_per_unit;
    }

    if consumed != text.len() || !total.is_finite() || total > i64::MAX as f64 {
        return None;
    }
    Some(TimeDelta::nanoseconds(total as i64))
}

fn until(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or_default()
}

/// Last activation not later than `now`, and the one after `now`.
///
/// Activations are counted from the last schedule time, else the creation
/// time, raised to `now - starting_deadline` when that is later.
fn activations(
    params: &ScheduleParams<'_>,
    timeline: &Timeline,
    deadline: Option<i64>,
) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> {
    let now = params.now;
    let mut earliest = params
        .last_schedule_time
        .or(params.creation_time)
        .unwrap_or(now);

    if let Some(deadline) = deadline {
        let horizon = now - TimeDelta::seconds(deadline);
        if horizon > earliest {
            earliest = horizon;
        }
    }

    if earliest > now {
        return Ok((None, timeline.next(now)));
    }

    let mut missed = None;
    let mut starts = 0;
    let mut cursor = timeline.next(earliest);

    while let Some(t) = cursor.filter(|t| *t <= now) {
        missed = Some(t);
        starts += 1;
        if starts > MAX_MISSED_STARTS {
            return Err(Error::scheduling(
                params.parent,
                format!(
                    "too many missed start times (> {MAX_MISSED_STARTS}). Set or decrease \
                     .spec.schedule.startingDeadlineSeconds or check clock skew"
                ),
            )
            .into());
        }
        cursor = timeline.next(t);
    }

    Ok((missed, cursor))
}

/// Reason a parent fails with when [`schedule`] returned `err`.
///
/// `None` for transient errors and invariant violations, which are left to
/// the requeue policy.
pub fn failure_reason(err: &LifecycleError) -> Option<&'static str> {
    match err {
        LifecycleError::Common(e @ (Error::Expression { .. } | Error::Alerting { .. }))
            if !e.is_retryable() =>
        {
            Some(error_reason(e))
        }
        LifecycleError::Common(Error::Scheduling { .. }) => Some(reasons::SCHEDULE_ERROR),
        _ => None,
    }
}

/// Decide whether the next job should be created now.
///
/// # Errors
///
/// - scheduling error for an unparseable cron rule or too many missed starts
/// - the evaluation error of a broken event expression
pub fn schedule(params: ScheduleParams<'_>) -> Result<ScheduleDecision> {
    let Some(spec) = params.spec else {
        return Ok(ScheduleDecision::now());
    };

    let backoff = params.backoff.delay(params.failures);

    if let Some(event) = spec.event.as_ref().filter(|e| !e.is_unconditional()) {
        return match evaluate(event, params.state, params.meta) {
            Verdict::Fired { info, .. } => {
                debug!(parent = %params.parent, %info, "schedule event fired");
                Ok(ScheduleDecision::now())
            }
            Verdict::NotYet { info } => {
                debug!(parent = %params.parent, %info, "waiting for schedule event");
                Ok(ScheduleDecision {
                    has_job: false,
                    activation: None,
                    requeue_after: Some(backoff),
                })
            }
            Verdict::Failed { error, .. } => Err(error.into()),
        };
    }

    let Some(rule) = spec.cron.as_deref().filter(|c| !c.trim().is_empty()) else {
        return Ok(ScheduleDecision::now());
    };

    let timeline = Timeline::parse(params.parent, rule)?;
    let (missed, next) = activations(&params, &timeline, spec.starting_deadline_seconds)?;

    let requeue_after = next
        .map(|n| until(params.now, n).max(backoff))
        .or(Some(backoff));

    debug!(
        parent = %params.parent,
        due = missed.is_some(),
        next = ?next,
        "evaluated schedule"
    );

    Ok(ScheduleDecision {
        has_job: missed.is_some(),
        activation: missed,
        requeue_after,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::classified;
    use chrono::TimeZone;
    use frisbee_common::crd::{ConditionalExpr, Phase};

    fn no_jitter() -> Backoff {
        Backoff {
            base_delay: Duration::from_secs(3),
            factor: 5.0,
            jitter: 0.0,
            steps: 3,
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    struct Fixture {
        state: Classifier,
        meta: ObjectMeta,
        backoff: Backoff,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                state: Classifier::new(),
                meta: ObjectMeta::default(),
                backoff: no_jitter(),
            }
        }

        fn params<'a>(
            &'a self,
            spec: Option<&'a SchedulerSpec>,
            now: DateTime<Utc>,
        ) -> ScheduleParams<'a> {
            ScheduleParams {
                parent: "servers",
                spec,
                last_schedule_time: None,
                creation_time: Some(at(10, 0, 0)),
                failures: 0,
                state: &self.state,
                meta: &self.meta,
                backoff: &self.backoff,
                now,
            }
        }
    }

    fn cron(rule: &str) -> SchedulerSpec {
        SchedulerSpec {
            cron: Some(rule.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn no_schedule_means_now() {
        let f = Fixture::new();
        let decision = schedule(f.params(None, at(10, 0, 0))).unwrap();
        assert!(decision.has_job);
        assert!(decision.requeue_after.is_none());
    }

    #[test]
    fn every_interval_is_due_after_one_period() {
        let f = Fixture::new();
        let spec = cron("@every 1m");

        let early = schedule(f.params(Some(&spec), at(10, 0, 30))).unwrap();
        assert!(!early.has_job);
        assert_eq!(early.requeue_after, Some(Duration::from_secs(30)));

        let due = schedule(f.params(Some(&spec), at(10, 1, 10))).unwrap();
        assert!(due.has_job);
        assert_eq!(due.activation, Some(at(10, 1, 0)));
        assert_eq!(due.requeue_after, Some(Duration::from_secs(50)));
    }

    #[test]
    fn standard_cron_gets_a_seconds_field() {
        let f = Fixture::new();
        let spec = cron("*/5 * * * *");

        let decision = schedule(f.params(Some(&spec), at(10, 7, 0))).unwrap();
        assert!(decision.has_job);
        assert_eq!(decision.activation, Some(at(10, 5, 0)));
        assert_eq!(decision.requeue_after, Some(Duration::from_secs(180)));
    }

    #[test]
    fn descriptors_are_accepted() {
        assert!(Timeline::parse("p", "@hourly").is_ok());
        assert!(Timeline::parse("p", "0 30 * * * *").is_ok());
        assert!(Timeline::parse("p", "not a rule").is_err());
        assert!(Timeline::parse("p", "@every forever").is_err());
    }

    #[test]
    fn requeue_is_at_least_the_backoff() {
        let f = Fixture::new();
        let spec = cron("@every 1m");
        let mut params = f.params(Some(&spec), at(10, 0, 59));
        params.failures = 1;

        let decision = schedule(params).unwrap();
        assert!(!decision.has_job);
        assert_eq!(decision.requeue_after, Some(Duration::from_secs(15)));
    }

    /// Story: a controller that was down for a day must not replay every
    /// missed second-level activation.
    #[test]
    fn too_many_missed_starts_is_an_error() {
        let f = Fixture::new();
        let spec = cron("@every 1s");

        let err = schedule(f.params(Some(&spec), at(11, 0, 0))).unwrap_err();
        assert!(err.to_string().contains("too many missed start times"));
    }

    #[test]
    fn starting_deadline_skips_old_activations() {
        let f = Fixture::new();
        let mut spec = cron("@every 1s");
        spec.starting_deadline_seconds = Some(30);

        let decision = schedule(f.params(Some(&spec), at(11, 0, 0))).unwrap();
        assert!(decision.has_job);
        assert_eq!(decision.activation, Some(at(11, 0, 0)));
    }

    #[test]
    fn last_schedule_time_takes_precedence() {
        let f = Fixture::new();
        let spec = cron("@every 1m");
        let mut params = f.params(Some(&spec), at(10, 5, 30));
        params.last_schedule_time = Some(at(10, 5, 0));

        assert!(!schedule(params).unwrap().has_job);
    }

    #[test]
    fn event_schedule_waits_for_the_condition() {
        let spec = SchedulerSpec {
            cron: Some("@every 1s".to_string()),
            event: Some(ConditionalExpr::state(r#"{{.IsSuccessful "svc0"}} == true"#)),
            ..Default::default()
        };

        let mut f = Fixture::new();
        f.state = classified(&[("svc0", Phase::Running)]);
        let waiting = schedule(f.params(Some(&spec), at(10, 0, 5))).unwrap();
        assert!(!waiting.has_job);
        assert_eq!(waiting.requeue_after, Some(Duration::from_secs(3)));

        f.state = classified(&[("svc0", Phase::Success)]);
        assert!(schedule(f.params(Some(&spec), at(10, 0, 5))).unwrap().has_job);
    }

    #[test]
    fn broken_event_expression_is_an_error() {
        let spec = SchedulerSpec {
            event: Some(ConditionalExpr::state("{{.Unknown}} == 1")),
            ..Default::default()
        };
        let f = Fixture::new();
        let err = schedule(f.params(Some(&spec), at(10, 0, 0))).unwrap_err();
        assert_eq!(
            failure_reason(&err),
            Some(crate::until::reasons::STATE_QUERY_ERROR)
        );
    }

    #[test]
    fn broken_schedules_fail_the_parent() {
        let f = Fixture::new();
        let err = schedule(f.params(Some(&cron("every tuesday")), at(10, 0, 0))).unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(failure_reason(&err), Some(reasons::SCHEDULE_ERROR));

        let missed = schedule(f.params(Some(&cron("@every 1s")), at(11, 0, 0))).unwrap_err();
        assert_eq!(failure_reason(&missed), Some(reasons::SCHEDULE_ERROR));

        let transient: LifecycleError = Error::alerting("dashboard unreachable").into();
        assert_eq!(failure_reason(&transient), None);
        let invariant: LifecycleError = Error::invariant("scheduler", "broken").into();
        assert_eq!(failure_reason(&invariant), None);
    }

    #[test]
    fn intervals_follow_duration_syntax() {
        assert_eq!(parse_interval("1h30m"), Some(TimeDelta::minutes(90)));
        assert_eq!(parse_interval("45s"), Some(TimeDelta::seconds(45)));
        assert_eq!(parse_interval("1.5h"), Some(TimeDelta::minutes(90)));
        assert_eq!(parse_interval("250ms"), Some(TimeDelta::milliseconds(250)));
        assert_eq!(parse_interval("10"), None);
        assert_eq!(parse_interval("1h 30m"), None);
        assert_eq!(parse_interval(""), None);
    }
}
