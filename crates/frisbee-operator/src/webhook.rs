//! Alert webhook
//!
//! The alerting backend posts a notification here whenever an alert
//! registered by the controllers changes state. The notification is recorded
//! as annotations on the object named by the alert, where the Until and
//! schedule expressions read it back.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use frisbee_common::Error;
use frisbee_lifecycle::expressions::alert::{
    dispatch_alert, AnnotationWriter, NoDataPolicy, NotifierBody,
};
use frisbee_lifecycle::LifecycleError;

/// Shared state of the webhook handlers
pub struct WebhookState {
    /// Records notifications on their objects
    pub writer: Arc<dyn AnnotationWriter>,
    /// What to do with `no_data` notifications
    pub policy: NoDataPolicy,
}

/// Error answered to the alerting backend
#[derive(Debug)]
struct WebhookError(LifecycleError);

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            LifecycleError::Common(Error::Validation { .. } | Error::Serialization { .. }) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "status": "Failure",
            "message": self.0.to_string(),
            "code": status.as_u16(),
        });
        (status, Json(body)).into_response()
    }
}

/// Routes of the webhook
pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/alerts", post(alerts_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

async fn alerts_handler(
    State(state): State<Arc<WebhookState>>,
    body: Bytes,
) -> Result<StatusCode, WebhookError> {
    let notification = if body.is_empty() {
        None
    } else {
        let parsed: NotifierBody = serde_json::from_slice(&body).map_err(|e| {
            warn!(error = %e, "cannot decode alert notification");
            WebhookError(Error::serialization(format!("invalid notification: {e}")).into())
        })?;
        Some(parsed)
    };

    dispatch_alert(state.writer.as_ref(), notification.as_ref(), state.policy)
        .await
        .map_err(|e| {
            warn!(error = %e, "cannot dispatch alert");
            WebhookError(e)
        })?;

    Ok(StatusCode::OK)
}

/// Serve the webhook on `port` until `cancel` fires
pub async fn serve(
    port: u16,
    state: Arc<WebhookState>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "alert webhook listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use frisbee_lifecycle::expressions::alert::{Endpoint, ALERT_STATE};
    use mockall::mock;
    use std::collections::BTreeMap;
    use tower::ServiceExt;

    mock! {
        pub Writer {}

        #[async_trait::async_trait]
        impl AnnotationWriter for Writer {
            async fn annotate(
                &self,
                endpoint: &Endpoint,
                annotations: BTreeMap<String, String>,
            ) -> frisbee_lifecycle::Result<()>;
        }
    }

    fn app(writer: MockWriter, policy: NoDataPolicy) -> Router {
        router(Arc::new(WebhookState {
            writer: Arc::new(writer),
            policy,
        }))
    }

    fn post_alert(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/alerts")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn alert_is_recorded_on_its_endpoint() {
        let mut writer = MockWriter::new();
        writer
            .expect_annotate()
            .withf(|endpoint, annotations| {
                endpoint.to_string() == "demo/Cluster/servers"
                    && annotations.get(ALERT_STATE).map(String::as_str) == Some("alerting")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let response = app(writer, NoDataPolicy::Ignore)
            .oneshot(post_alert(
                r#"{"ruleName":"demo/Cluster/servers","state":"alerting","message":"fired"}"#,
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
    }

    /// Story: idle evaluation windows produce no_data alerts that must not
    /// be mistaken for the condition clearing.
    #[tokio::test]
    async fn no_data_is_dropped_by_default() {
        let mut writer = MockWriter::new();
        writer.expect_annotate().never();

        let response = app(writer, NoDataPolicy::Ignore)
            .oneshot(post_alert(
                r#"{"ruleName":"demo/Cluster/servers","state":"no_data"}"#,
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn no_data_is_recorded_when_configured() {
        let mut writer = MockWriter::new();
        writer.expect_annotate().times(1).returning(|_, _| Ok(()));

        let response = app(writer, NoDataPolicy::Record)
            .oneshot(post_alert(
                r#"{"ruleName":"demo/Cluster/servers","state":"no_data"}"#,
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_notifications_are_rejected() {
        for body in ["", "{not json", r#"{"ruleName":"a/b/c","state":"paused"}"#] {
            let mut writer = MockWriter::new();
            writer.expect_annotate().never();

            let response = app(writer, NoDataPolicy::Ignore)
                .oneshot(post_alert(body))
                .await
                .expect("response");

            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {body}");
        }
    }

    #[tokio::test]
    async fn foreign_alerts_are_acknowledged_and_ignored() {
        let mut writer = MockWriter::new();
        writer.expect_annotate().never();

        let response = app(writer, NoDataPolicy::Ignore)
            .oneshot(post_alert(r#"{"ruleName":"High CPU","state":"alerting"}"#))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn healthz_answers() {
        let response = app(MockWriter::new(), NoDataPolicy::Ignore)
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
    }
}
