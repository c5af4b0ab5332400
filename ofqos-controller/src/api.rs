//! HTTP control API.
//!
//! `POST /qos/update` creates or replaces a policy, `GET /qos/policies` lists the active
//! ones. The accepted body depends on the [`ApiVariant`] the router is built with.

use std::{fmt, io, net::SocketAddr, str::FromStr, sync::Arc};

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::policy::{
    ActivePolicy, PolicyError, PolicyService, PolicyUpdate, Protocol, Selector, CLASS_COUNT,
};

/// Shape of the `POST /qos/update` body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ApiVariant {
    /// `{"bw", "port1", "port2"}`: one UDP port-list policy.
    #[default]
    TwoPort,
    /// `{"bw", "port1" .. "port8"}`: one TCP class-table policy.
    EightPort,
}

impl fmt::Display for ApiVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TwoPort => f.write_str("two-port"),
            Self::EightPort => f.write_str("eight-port"),
        }
    }
}

/// An API variant name that is neither `two-port` nor `eight-port`.
#[derive(Debug, Error)]
#[error("Unknown API variant {0:?}, expected \"two-port\" or \"eight-port\"")]
pub struct UnknownVariant(String);

impl FromStr for ApiVariant {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "two-port" | "2" => Ok(Self::TwoPort),
            "eight-port" | "8" => Ok(Self::EightPort),
            other => Err(UnknownVariant(other.to_owned())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TwoPortBody {
    bw: u32,
    port1: u16,
    port2: u16,
}

#[derive(Debug, Deserialize)]
struct EightPortBody {
    bw: u32,
    port1: u16,
    port2: u16,
    port3: u16,
    port4: u16,
    port5: u16,
    port6: u16,
    port7: u16,
    port8: u16,
}

impl ApiVariant {
    fn parse(self, body: &[u8]) -> Result<PolicyUpdate, ApiError> {
        let update = match self {
            Self::TwoPort => {
                let b: TwoPortBody = serde_json::from_slice(body)?;
                PolicyUpdate::new(b.bw, Selector::port_list(Protocol::Udp, [b.port1, b.port2]))
            }
            Self::EightPort => {
                let b: EightPortBody = serde_json::from_slice(body)?;
                let ports: [u16; CLASS_COUNT] =
                    [b.port1, b.port2, b.port3, b.port4, b.port5, b.port6, b.port7, b.port8];
                PolicyUpdate::new(b.bw, Selector::class_table(ports))
            }
        };

        Ok(update)
    }
}

/// Any failure of a request. All of them are reported as `500` with the error text as body.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The body is not valid JSON for the variant.
    #[error("Invalid request body: {0}")]
    Json(#[from] serde_json::Error),
    /// The engine rejected the update.
    #[error("{0}")]
    Policy(#[from] PolicyError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

#[derive(Clone)]
struct ApiState {
    policy: Arc<dyn PolicyService>,
    variant: ApiVariant,
}

/// Builds the control API router on top of `policy`.
pub fn router(policy: Arc<dyn PolicyService>, variant: ApiVariant) -> Router {
    Router::new()
        .route("/qos/update", post(update_policy))
        .route("/qos/policies", get(list_policies))
        .with_state(ApiState { policy, variant })
}

async fn update_policy(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<&'static str, ApiError> {
    let update = state.variant.parse(&body).map_err(|e| {
        debug!("Rejected body: {e}");
        e
    })?;

    match state.policy.update_policy(update) {
        Ok(outcome) => {
            info!(meters = ?outcome.meter_ids, "QoS updated");
            Ok("QoS updated")
        }
        Err(e) => {
            warn!("QoS update rejected: {e}");
            Err(e.into())
        }
    }
}

async fn list_policies(State(state): State<ApiState>) -> Json<Vec<ActivePolicy>> {
    Json(state.policy.policies())
}

/// Serves the control API on `addr` until `cancel` fires.
pub async fn serve(
    addr: SocketAddr,
    policy: Arc<dyn PolicyService>,
    variant: ApiVariant,
    cancel: CancellationToken,
) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, %variant, "Control API listening");

    axum::serve(listener, router(policy, variant))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use parking_lot::Mutex;
    use tower::ServiceExt;

    use super::*;
    use crate::policy::{CapacityStatus, PolicyOutcome};

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<PolicyUpdate>>,
        reject: Option<PolicyError>,
    }

    impl PolicyService for Recorder {
        fn update_policy(&self, update: PolicyUpdate) -> Result<PolicyOutcome, PolicyError> {
            if let Some(e) = &self.reject {
                return Err(e.clone());
            }
            self.updates.lock().push(update);
            Ok(PolicyOutcome {
                meter_ids: vec![1],
                capacity: CapacityStatus { configured_kbps: 0, total_kbps: 15_000 },
            })
        }

        fn policies(&self) -> Vec<ActivePolicy> {
            self.updates
                .lock()
                .iter()
                .map(|u| ActivePolicy {
                    selector: u.selector.clone(),
                    protocol: u.selector.protocol(),
                    bandwidth_kbps: u.bandwidth_kbps,
                    meter_ids: vec![1],
                })
                .collect()
        }
    }

    async fn post(app: Router, body: &'static str) -> (StatusCode, String) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/qos/update")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn two_port_update() {
        let _ = tracing_subscriber::fmt::try_init();

        let recorder = Arc::new(Recorder::default());
        let app = router(recorder.clone(), ApiVariant::TwoPort);

        let (status, text) = post(app, r#"{"bw": 500, "port1": 5001, "port2": 5002}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, "QoS updated");

        let updates = recorder.updates.lock();
        assert_eq!(
            *updates,
            vec![PolicyUpdate::new(500, Selector::port_list(Protocol::Udp, [5001, 5002]))]
        );
    }

    #[tokio::test]
    async fn missing_bandwidth_is_rejected() {
        let recorder = Arc::new(Recorder::default());
        let app = router(recorder.clone(), ApiVariant::TwoPort);

        let (status, text) = post(app, r#"{"port1": 5001, "port2": 5002}"#).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(text.contains("bw"), "{text}");
        assert!(recorder.updates.lock().is_empty());
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let recorder = Arc::new(Recorder::default());
        let app = router(recorder.clone(), ApiVariant::TwoPort);

        let (status, _) = post(app, "not json").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(recorder.updates.lock().is_empty());
    }

    #[tokio::test]
    async fn eight_port_update() {
        let recorder = Arc::new(Recorder::default());
        let app = router(recorder.clone(), ApiVariant::EightPort);

        let body = r#"{"bw": 2000, "port1": 5000, "port2": 6000, "port3": 7000, "port4": 8000,
            "port5": 9000, "port6": 10000, "port7": 11000, "port8": 12000}"#;
        let (status, _) = post(app.clone(), body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            recorder.updates.lock()[0].selector,
            Selector::class_table([5000, 6000, 7000, 8000, 9000, 10000, 11000, 12000])
        );

        // A two-port body is missing fields for this variant.
        let (status, _) = post(app, r#"{"bw": 500, "port1": 5001, "port2": 5002}"#).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(recorder.updates.lock().len(), 1);
    }

    #[tokio::test]
    async fn policy_errors_are_reported() {
        let recorder =
            Arc::new(Recorder { reject: Some(PolicyError::ZeroBandwidth), ..Default::default() });
        let app = router(recorder, ApiVariant::TwoPort);

        let (status, text) = post(app, r#"{"bw": 0, "port1": 5001, "port2": 5002}"#).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(text, PolicyError::ZeroBandwidth.to_string());
    }

    #[tokio::test]
    async fn list_active_policies() {
        let recorder = Arc::new(Recorder::default());
        let app = router(recorder.clone(), ApiVariant::TwoPort);
        post(app.clone(), r#"{"bw": 500, "port1": 5001, "port2": 5002}"#).await;

        let response = app
            .oneshot(Request::builder().uri("/qos/policies").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json[0]["bandwidth_kbps"], 500);
        assert_eq!(json[0]["selector"]["ports"], serde_json::json!([5001, 5002]));
    }

    #[test]
    fn variant_from_str() {
        assert_eq!("two-port".parse::<ApiVariant>().unwrap(), ApiVariant::TwoPort);
        assert_eq!("8".parse::<ApiVariant>().unwrap(), ApiVariant::EightPort);
        assert!("four-port".parse::<ApiVariant>().is_err());
    }
}
