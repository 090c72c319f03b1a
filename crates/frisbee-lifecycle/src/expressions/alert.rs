//! Alert delivery through object annotations
//!
//! Alerts are registered on the dashboard under the name of the object that
//! waits on them (`namespace/kind/name`). When the alerting backend fires, the
//! webhook calls [`dispatch_alert`], which records the alert as annotations on
//! that object. Reconcilers later read them back with [`alert_is_fired`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use frisbee_common::crd::{Cascade, Chaos, Cluster, Service, VirtualObject};
use frisbee_common::{Error, FIELD_MANAGER};

use crate::Result;

/// Name of the alert (the endpoint it was registered for)
pub const ALERT_NAME: &str = "alert.frisbee.dev/name";
/// Last reported state of the alert
pub const ALERT_STATE: &str = "alert.frisbee.dev/state";
/// Full notification body, as JSON
pub const ALERT_DETAILS: &str = "alert.frisbee.dev/details";
/// When the notification was received (RFC3339)
pub const ALERT_TIMESTAMP: &str = "alert.frisbee.dev/timestamp";

/// Reason reported when the annotations are inconsistent
pub const ALERT_CHANNEL_ERROR: &str = "SOMETHING IS WRONG WITH THE ALERTING MECHANISMS";

/// Alert states reported by the alerting backend
pub mod states {
    pub const OK: &str = "ok";
    pub const ALERTING: &str = "alerting";
    pub const NO_DATA: &str = "no_data";
}

// =============================================================================
// Endpoint
// =============================================================================

/// Object an alert is addressed to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub namespace: String,
    pub kind: String,
    pub name: String,
}

impl Endpoint {
    pub fn new(
        namespace: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
    }
}

impl std::str::FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split('/').collect();
        match fields.as_slice() {
            [ns, kind, name] if !ns.is_empty() && !kind.is_empty() && !name.is_empty() => {
                Ok(Self::new(*ns, *kind, *name))
            }
            _ => Err(Error::validation_for(
                s,
                "alert endpoint must be namespace/kind/name",
            )),
        }
    }
}

// =============================================================================
// Notification
// =============================================================================

/// A series that matched the alert rule
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalMatch {
    #[serde(default)]
    pub value: f64,
    #[serde(default)]
    pub metric: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// Body posted by the alerting backend's webhook notifier
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifierBody {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub rule_id: i64,
    pub rule_name: String,
    pub state: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub eval_matches: Vec<EvalMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub panel_id: Option<i64>,
}

/// What to do with `no_data` notifications.
///
/// A `no_data` alert shows up when the evaluation window is idle, e.g. when
/// jobs are spaced further apart than the evaluation frequency.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NoDataPolicy {
    /// Drop the notification
    #[default]
    Ignore,
    /// Record it on the object. It reads back as not fired.
    Record,
}

impl std::str::FromStr for NoDataPolicy {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "record" => Ok(Self::Record),
            other => Err(Error::validation(format!(
                "unknown no_data policy '{other}', expected ignore or record"
            ))),
        }
    }
}

/// Annotations recording a notification, or `None` if it must be dropped.
///
/// # Errors
///
/// A validation error for a state other than ok, alerting or no_data.
pub fn alert_annotations(
    body: &NotifierBody,
    policy: NoDataPolicy,
    now: DateTime<Utc>,
) -> Result<Option<BTreeMap<String, String>>> {
    match body.state.as_str() {
        states::NO_DATA if policy == NoDataPolicy::Ignore => {
            info!(alert = %body.rule_name, "ignoring spurious no_data alert");
            return Ok(None);
        }
        states::OK | states::ALERTING | states::NO_DATA => {}
        other => {
            return Err(Error::validation_for(
                &body.rule_name,
                format!("alert state '{other}' is not handled, only ok and alerting are"),
            )
            .into())
        }
    }

    Ok(Some(BTreeMap::from([
        (ALERT_NAME.to_string(), body.rule_name.clone()),
        (ALERT_STATE.to_string(), body.state.clone()),
        (ALERT_DETAILS.to_string(), serde_json::to_string(body)?),
        (
            ALERT_TIMESTAMP.to_string(),
            now.to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
    ])))
}

/// Writes annotations on the object an alert is addressed to
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AnnotationWriter: Send + Sync {
    async fn annotate(&self, endpoint: &Endpoint, annotations: BTreeMap<String, String>)
        -> Result<()>;
}

/// [`AnnotationWriter`] backed by the Kubernetes API
pub struct KubeAnnotationWriter {
    client: Client,
}

impl KubeAnnotationWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn api_resource(kind: &str) -> Option<ApiResource> {
    Some(match kind {
        "Cluster" => ApiResource::erase::<Cluster>(&()),
        "Cascade" => ApiResource::erase::<Cascade>(&()),
        "Chaos" => ApiResource::erase::<Chaos>(&()),
        "Service" => ApiResource::erase::<Service>(&()),
        "VirtualObject" => ApiResource::erase::<VirtualObject>(&()),
        _ => return None,
    })
}

#[async_trait]
impl AnnotationWriter for KubeAnnotationWriter {
    async fn annotate(
        &self,
        endpoint: &Endpoint,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        let ar = api_resource(&endpoint.kind).ok_or_else(|| {
            Error::validation_for(
                endpoint.to_string(),
                format!("kind '{}' cannot receive alerts", endpoint.kind),
            )
        })?;

        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &endpoint.namespace, &ar);
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        api.patch(
            &endpoint.name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

/// Record a notification on the object it is addressed to.
///
/// Notifications whose rule name is not an endpoint were not registered by
/// this operator and are ignored.
pub async fn dispatch_alert(
    writer: &dyn AnnotationWriter,
    body: Option<&NotifierBody>,
    policy: NoDataPolicy,
) -> Result<()> {
    let body = body.ok_or_else(|| Error::validation("notifier body cannot be empty"))?;

    info!(
        alert = %body.rule_name,
        state = %body.state,
        message = %body.message,
        "received alert"
    );

    let Some(annotations) = alert_annotations(body, policy, Utc::now())? else {
        return Ok(());
    };

    let endpoint: Endpoint = match body.rule_name.parse() {
        Ok(e) => e,
        Err(_) => {
            debug!(alert = %body.rule_name, "alert is not addressed to a frisbee object");
            return Ok(());
        }
    };

    writer.annotate(&endpoint, annotations).await
}

// =============================================================================
// Liveness
// =============================================================================

/// State of the alert recorded on an object
#[derive(Clone, Debug, PartialEq)]
pub enum AlertStatus {
    /// No alert has been dispatched to the object
    NeverFired,
    /// The alert is firing
    Alerting {
        timestamp: DateTime<Utc>,
        details: String,
    },
    /// The alert fired and then returned to normal
    Resolved,
    /// The annotations are inconsistent. The alert can never be trusted.
    ChannelError(String),
}

impl AlertStatus {
    pub fn is_alerting(&self) -> bool {
        matches!(self, Self::Alerting { .. })
    }
}

/// Decode the alert annotations of an object
pub fn alert_is_fired(meta: &ObjectMeta) -> AlertStatus {
    let Some(annotations) = meta.annotations.as_ref() else {
        return AlertStatus::NeverFired;
    };

    if !annotations.contains_key(ALERT_NAME) {
        return AlertStatus::NeverFired;
    }

    let Some(state) = annotations.get(ALERT_STATE) else {
        return AlertStatus::ChannelError(format!("missing {ALERT_STATE}"));
    };

    match state.as_str() {
        states::ALERTING => {
            let Some(raw) = annotations.get(ALERT_TIMESTAMP) else {
                return AlertStatus::ChannelError(format!("missing {ALERT_TIMESTAMP}"));
            };
            let timestamp = match DateTime::parse_from_rfc3339(raw) {
                Ok(ts) => ts.with_timezone(&Utc),
                Err(e) => {
                    return AlertStatus::ChannelError(format!("invalid timestamp '{raw}': {e}"))
                }
            };
            let Some(details) = annotations.get(ALERT_DETAILS) else {
                return AlertStatus::ChannelError(format!("missing {ALERT_DETAILS}"));
            };
            AlertStatus::Alerting {
                timestamp,
                details: details.clone(),
            }
        }
        states::OK | states::NO_DATA => AlertStatus::Resolved,
        other => AlertStatus::ChannelError(format!("unknown alert state '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::*;

    fn body(state: &str) -> NotifierBody {
        NotifierBody {
            rule_name: "default/Cluster/servers".to_string(),
            state: state.to_string(),
            message: "bitrate is below 14".to_string(),
            ..Default::default()
        }
    }

    fn meta(annotations: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn endpoints_have_exactly_three_fields() {
        let e: Endpoint = "default/Cluster/servers".parse().unwrap();
        assert_eq!(e, Endpoint::new("default", "Cluster", "servers"));
        assert_eq!(e.to_string(), "default/Cluster/servers");

        assert!("default/servers".parse::<Endpoint>().is_err());
        assert!("a/b/c/d".parse::<Endpoint>().is_err());
        assert!("a//c".parse::<Endpoint>().is_err());
    }

    #[test]
    fn no_data_follows_the_policy() {
        let now = Utc::now();
        assert!(alert_annotations(&body("no_data"), NoDataPolicy::Ignore, now)
            .unwrap()
            .is_none());

        let recorded = alert_annotations(&body("no_data"), NoDataPolicy::Record, now)
            .unwrap()
            .unwrap();
        assert_eq!(recorded[ALERT_STATE], "no_data");
        assert_eq!(
            alert_is_fired(&meta(&[(ALERT_NAME, "x"), (ALERT_STATE, "no_data")])),
            AlertStatus::Resolved
        );
    }

    #[test]
    fn unknown_states_are_rejected() {
        assert!(alert_annotations(&body("pending"), NoDataPolicy::Ignore, Utc::now()).is_err());
    }

    /// Story: an alert dispatched by the webhook reads back as alerting with
    /// the same timestamp and the full notification as details.
    #[test]
    fn dispatched_annotations_read_back_as_alerting() {
        let now = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let annotations = alert_annotations(&body("alerting"), NoDataPolicy::Ignore, now)
            .unwrap()
            .unwrap();

        let meta = ObjectMeta {
            annotations: Some(annotations),
            ..Default::default()
        };

        match alert_is_fired(&meta) {
            AlertStatus::Alerting { timestamp, details } => {
                assert_eq!(timestamp, now);
                let decoded: NotifierBody = serde_json::from_str(&details).unwrap();
                assert_eq!(decoded, body("alerting"));
            }
            other => panic!("expected alerting, got {other:?}"),
        }
    }

    #[test]
    fn liveness_distinguishes_all_cases() {
        assert_eq!(alert_is_fired(&ObjectMeta::default()), AlertStatus::NeverFired);
        assert_eq!(
            alert_is_fired(&meta(&[(ALERT_NAME, "x"), (ALERT_STATE, "ok")])),
            AlertStatus::Resolved
        );
        assert!(matches!(
            alert_is_fired(&meta(&[(ALERT_NAME, "x")])),
            AlertStatus::ChannelError(_)
        ));
        assert!(matches!(
            alert_is_fired(&meta(&[(ALERT_NAME, "x"), (ALERT_STATE, "alerting")])),
            AlertStatus::ChannelError(_)
        ));
        assert!(matches!(
            alert_is_fired(&meta(&[
                (ALERT_NAME, "x"),
                (ALERT_STATE, "alerting"),
                (ALERT_TIMESTAMP, "yesterday"),
                (ALERT_DETAILS, "{}"),
            ])),
            AlertStatus::ChannelError(_)
        ));
        assert!(matches!(
            alert_is_fired(&meta(&[(ALERT_NAME, "x"), (ALERT_STATE, "paused")])),
            AlertStatus::ChannelError(_)
        ));
    }

    #[tokio::test]
    async fn dispatch_patches_the_addressed_object() {
        let mut writer = MockAnnotationWriter::new();
        writer
            .expect_annotate()
            .with(
                eq(Endpoint::new("default", "Cluster", "servers")),
                function(|a: &BTreeMap<String, String>| a[ALERT_STATE] == "alerting"),
            )
            .times(1)
            .returning(|_, _| Ok(()));

        dispatch_alert(&writer, Some(&body("alerting")), NoDataPolicy::Ignore)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn foreign_and_empty_notifications() {
        let mut writer = MockAnnotationWriter::new();
        writer.expect_annotate().never();

        let mut foreign = body("alerting");
        foreign.rule_name = "High CPU".to_string();
        dispatch_alert(&writer, Some(&foreign), NoDataPolicy::Ignore)
            .await
            .unwrap();
        dispatch_alert(&writer, Some(&body("no_data")), NoDataPolicy::Ignore)
            .await
            .unwrap();

        assert!(dispatch_alert(&writer, None, NoDataPolicy::Ignore).await.is_err());
    }
}
