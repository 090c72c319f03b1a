//! Registration of metrics alerts on dashboards
//!
//! Each scenario talks to its own dashboard service. Clients are kept in an
//! [`AlertingRegistry`] keyed by the scenario label and injected into the
//! controllers that set alerts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use kube::{Resource, ResourceExt};
use serde_json::{json, Value};
use tracing::info;

#[cfg(test)]
use mockall::automock;

use frisbee_common::labels;
use frisbee_common::retry::{retry_with_backoff, Backoff};
use frisbee_common::{Error, FRISBEE_API_VERSION};

use crate::expressions::alert::Endpoint;
use crate::expressions::metrics::{parse_metrics_expr, AlertDescriptor};
use crate::{LifecycleError, Result};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Alert state kept when the query errors or returns nothing
const KEEP_STATE: &str = "keep_state";

/// Registers alerts with an alerting backend
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AlertingClient: Send + Sync {
    /// Attach `alert` to its dashboard panel under `name`.
    /// `message` is delivered back with every notification.
    async fn set_alert(&self, alert: &AlertDescriptor, name: &str, message: &str) -> Result<()>;
}

// =============================================================================
// Registry
// =============================================================================

/// Alerting clients, one per scenario
#[derive(Default)]
pub struct AlertingRegistry {
    clients: DashMap<String, Arc<dyn AlertingClient>>,
}

impl AlertingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the client of a scenario.
    ///
    /// # Errors
    ///
    /// An invariant error if the scenario already has a client.
    pub fn register(&self, scenario: &str, client: Arc<dyn AlertingClient>) -> Result<()> {
        match self.clients.entry(scenario.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::invariant(
                "alerting_registry",
                format!("scenario '{scenario}' already has an alerting client"),
            )
            .into()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(client);
                info!(scenario = %scenario, "registered alerting client");
                Ok(())
            }
        }
    }

    /// Drop the client of a scenario
    pub fn unregister(&self, scenario: &str) -> bool {
        self.clients.remove(scenario).is_some()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Client for the scenario `obj` belongs to.
    ///
    /// # Errors
    ///
    /// - invariant error if `obj` has no scenario label
    /// - alerting error if the scenario has no client
    pub fn client_for<K: Resource>(&self, obj: &K) -> Result<Arc<dyn AlertingClient>> {
        let scenario = labels::scenario(obj.meta()).ok_or_else(|| {
            Error::invariant(
                "alerting_registry",
                format!("object '{}' has no scenario label", obj.name_any()),
            )
        })?;

        self.clients
            .get(scenario)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| {
                Error::alerting_permanent(format!("no alerting client for scenario '{scenario}'"))
                    .into()
            })
    }
}

/// Register the alert described by the metrics expression `expr` on behalf
/// of `obj`.
///
/// The alert is named after the endpoint of `obj`, so that notifications can
/// be routed back to it. Dashboards may not be provisioned yet when the
/// object is initialized, so registration is retried with `backoff` for as
/// long as the failure is transient.
pub async fn set_alert<K>(
    registry: &AlertingRegistry,
    obj: &K,
    expr: &str,
    backoff: &Backoff,
) -> Result<()>
where
    K: Resource<DynamicType = ()>,
{
    let alert = parse_metrics_expr(expr)?;
    let kind = K::kind(&());

    let name = Endpoint::new(obj.namespace().unwrap_or_default(), kind.as_ref(), obj.name_any())
        .to_string();
    let message = format!(
        "Alert [{name}] for object {FRISBEE_API_VERSION}, Kind={kind} {} has been fired",
        obj.name_any()
    );

    let client = registry.client_for(obj)?;
    retry_with_backoff(
        backoff,
        "set_alert",
        LifecycleError::is_retryable,
        || client.set_alert(&alert, &name, &message),
    )
    .await
}

// =============================================================================
// Grafana
// =============================================================================

/// [`AlertingClient`] for Grafana legacy dashboard alerts
#[derive(Clone)]
pub struct GrafanaClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl GrafanaClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into(),
            token,
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn get_dashboard(&self, uid: &str) -> Result<Value> {
        let response = self
            .authorize(self.client.get(self.url(&format!("/api/dashboards/uid/{uid}"))))
            .send()
            .await?
            .error_for_status()?;

        let mut body: Value = response.json().await?;
        body.get_mut("dashboard").map(Value::take).ok_or_else(|| {
            Error::alerting(format!("dashboard '{uid}' response has no dashboard")).into()
        })
    }

    async fn save_dashboard(&self, dashboard: Value) -> Result<()> {
        let response = self
            .authorize(self.client.post(self.url("/api/dashboards/db")))
            .json(&json!({ "dashboard": dashboard, "overwrite": true }))
            .send()
            .await?
            .error_for_status()?;

        let body: Value = response.json().await?;
        match body.get("status").and_then(Value::as_str) {
            Some("success") => Ok(()),
            _ => Err(Error::alerting(format!("unable to set alert: {body}")).into()),
        }
    }
}

/// Attach an alert to its panel in a dashboard model.
///
/// # Errors
///
/// A permanent alerting error if the panel already has an alert, a
/// retryable one if the panel does not exist (yet).
pub fn attach_alert(
    dashboard: &mut Value,
    alert: &AlertDescriptor,
    name: &str,
    message: &str,
) -> Result<()> {
    let panel = dashboard
        .get_mut("panels")
        .and_then(Value::as_array_mut)
        .and_then(|panels| {
            panels
                .iter_mut()
                .find(|p| p.get("id").and_then(Value::as_u64) == Some(u64::from(alert.panel_id)))
        })
        .ok_or_else(|| {
            Error::alerting(format!(
                "panel {} not found in dashboard '{}'",
                alert.panel_id, alert.dashboard_uid
            ))
        })?;

    if let Some(existing) = panel.get("alert").filter(|a| !a.is_null()) {
        let existing = existing.get("name").and_then(Value::as_str).unwrap_or_default();
        return Err(Error::alerting_permanent(format!(
            "Alert [{existing}] has already been set for this panel"
        ))
        .into());
    }

    panel["alert"] = json!({
        "name": name,
        "message": message,
        "conditions": [{
            "type": "query",
            "evaluator": alert.evaluator,
            "operator": { "type": "and" },
            "query": { "params": [alert.metric, alert.from, alert.to] },
            "reducer": { "type": alert.reducer, "params": [] },
        }],
        "executionErrorState": KEEP_STATE,
        "noDataState": KEEP_STATE,
        "handler": 1,
        "frequency": alert.every,
        "for": alert.for_duration,
        "notifications": [],
    });
    Ok(())
}

#[async_trait]
impl AlertingClient for GrafanaClient {
    async fn set_alert(&self, alert: &AlertDescriptor, name: &str, message: &str) -> Result<()> {
        let mut dashboard = self.get_dashboard(&alert.dashboard_uid).await?;
        attach_alert(&mut dashboard, alert, name, message)?;
        self.save_dashboard(dashboard).await?;

        info!(
            alert = %name,
            dashboard = %alert.dashboard_uid,
            panel = alert.panel_id,
            "alert registered"
        );
        Ok(())
    }
}
