//! Evaluation of a `ConditionalExpr` against a parent and its children

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use frisbee_common::crd::ConditionalExpr;
use frisbee_common::Error;

use super::alert::{alert_is_fired, AlertStatus, ALERT_CHANNEL_ERROR};
use super::state::fired_state;
use crate::classifier::Classifier;

/// Which half of the expression produced the verdict
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    Metrics,
    State,
}

/// Outcome of a conditional expression
#[derive(Debug)]
pub enum Verdict {
    /// The condition holds
    Fired { source: Source, info: String },
    /// The condition does not hold yet
    NotYet { info: String },
    /// The condition can never be decided
    Failed { source: Source, error: Error },
}

impl Verdict {
    pub fn is_fired(&self) -> bool {
        matches!(self, Self::Fired { .. })
    }
}

/// Evaluate `expr` for the object described by `meta`.
///
/// Metrics expressions are read from the alert annotations of `meta`. State
/// expressions are evaluated against `state`. An expression with neither
/// part never fires.
pub fn evaluate(expr: &ConditionalExpr, state: &Classifier, meta: &ObjectMeta) -> Verdict {
    if let Some(metrics) = expr.metrics_expr() {
        return match alert_is_fired(meta) {
            AlertStatus::Alerting { timestamp, details } => Verdict::Fired {
                source: Source::Metrics,
                info: format!("Alert '{metrics}' fired at {timestamp}: {details}"),
            },
            AlertStatus::NeverFired | AlertStatus::Resolved => Verdict::NotYet {
                info: format!("Alert '{metrics}' is not firing"),
            },
            AlertStatus::ChannelError(detail) => Verdict::Failed {
                source: Source::Metrics,
                error: Error::alerting_permanent(format!("{ALERT_CHANNEL_ERROR}: {detail}")),
            },
        };
    }

    if let Some(expr) = expr.state_expr() {
        let outcome = fired_state(expr, state);
        return match outcome.error {
            Some(error) => Verdict::Failed {
                source: Source::State,
                error,
            },
            None if outcome.passed => Verdict::Fired {
                source: Source::State,
                info: format!("State '{expr}' is true"),
            },
            None => Verdict::NotYet {
                info: format!("State '{expr}' is false"),
            },
        };
    }

    Verdict::NotYet {
        info: "no condition is defined".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expressions::alert::{ALERT_DETAILS, ALERT_NAME, ALERT_STATE, ALERT_TIMESTAMP};
    use crate::testing::classified;
    use frisbee_common::crd::Phase;
    use std::collections::BTreeMap;

    fn alerting() -> ObjectMeta {
        ObjectMeta {
            annotations: Some(BTreeMap::from([
                (ALERT_NAME.to_string(), "ns/Cluster/c".to_string()),
                (ALERT_STATE.to_string(), "alerting".to_string()),
                (ALERT_TIMESTAMP.to_string(), "2024-05-01T10:00:00Z".to_string()),
                (ALERT_DETAILS.to_string(), "{}".to_string()),
            ])),
            ..Default::default()
        }
    }

    #[test]
    fn metrics_condition_fires_on_alert() {
        let expr = ConditionalExpr::metrics("avg() of query(a/1/m, 1m, now) is below(1)");
        let state = Classifier::new();

        assert!(evaluate(&expr, &state, &alerting()).is_fired());
        assert!(matches!(
            evaluate(&expr, &state, &ObjectMeta::default()),
            Verdict::NotYet { .. }
        ));
    }

    #[test]
    fn broken_alert_channel_fails_the_condition() {
        let expr = ConditionalExpr::metrics("avg() of query(a/1/m, 1m, now) is below(1)");
        let mut meta = alerting();
        if let Some(a) = meta.annotations.as_mut() {
            a.remove(ALERT_STATE);
        }

        match evaluate(&expr, &Classifier::new(), &meta) {
            Verdict::Failed { source, error } => {
                assert_eq!(source, Source::Metrics);
                assert!(error.to_string().contains(ALERT_CHANNEL_ERROR));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn state_condition_uses_classified_children() {
        let expr = ConditionalExpr::state(r#"{{.IsSuccessful "a"}} == true"#);
        let meta = ObjectMeta::default();

        let done = classified(&[("a", Phase::Success)]);
        assert!(matches!(
            evaluate(&expr, &done, &meta),
            Verdict::Fired {
                source: Source::State,
                ..
            }
        ));

        let running = classified(&[("a", Phase::Running)]);
        assert!(matches!(evaluate(&expr, &running, &meta), Verdict::NotYet { .. }));

        let broken = ConditionalExpr::state("{{.Nope}} == 1");
        assert!(matches!(
            evaluate(&broken, &done, &meta),
            Verdict::Failed {
                source: Source::State,
                ..
            }
        ));
    }

    #[test]
    fn empty_condition_never_fires() {
        let verdict = evaluate(&ConditionalExpr::default(), &Classifier::new(), &ObjectMeta::default());
        assert!(!verdict.is_fired());
    }
}
