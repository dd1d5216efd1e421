//! HTTP surface of the test server.
//!
//! `/api/v1/test/*` routes to the probe dispatcher; `/speedtest/*` carries
//! the browser bandwidth endpoints. Authentication is an outer collaborator
//! and is not implemented here.

mod bandwidth;

use crate::dispatch::Dispatcher;
use crate::error::ProbeError;
use crate::model::{DeviceIdentity, ProbeRequest};
use crate::variant::ProtocolFamily;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/api/v1/test/http", post(test_http))
        .route("/api/v1/test/tcp", post(test_tcp))
        .route("/api/v1/test/udp", post(test_udp))
        .route("/api/v1/test/icmp", post(test_icmp))
        .route("/api/v1/test/trace", post(test_trace))
        .route("/health", get(health))
        .nest("/speedtest", bandwidth::router())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { dispatcher })
}

async fn test_http(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ProbeRequest>,
) -> Response {
    run_test(state, ProtocolFamily::Http, headers, req).await
}

async fn test_tcp(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ProbeRequest>,
) -> Response {
    run_test(state, ProtocolFamily::Tcp, headers, req).await
}

async fn test_udp(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ProbeRequest>,
) -> Response {
    run_test(state, ProtocolFamily::Udp, headers, req).await
}

async fn test_icmp(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ProbeRequest>,
) -> Response {
    run_test(state, ProtocolFamily::Icmp, headers, req).await
}

async fn test_trace(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ProbeRequest>,
) -> Response {
    run_test(state, ProtocolFamily::Trace, headers, req).await
}

async fn run_test(
    state: AppState,
    family: ProtocolFamily,
    headers: HeaderMap,
    req: ProbeRequest,
) -> Response {
    let device = device_identity(&headers);

    // If the client hangs up, axum drops this future; the guard then cancels
    // every in-flight sub-operation, subprocesses included.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    match state.dispatcher.dispatch(family, &req, cancel).await {
        Ok(mut report) => {
            if !device.is_empty() {
                report.device = Some(device);
            }
            // Protocol failures stay HTTP 200; only validation is 4xx.
            (StatusCode::OK, Json(report)).into_response()
        }
        Err(err) => validation_response(&err),
    }
}

fn validation_response(err: &ProbeError) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "success": false,
            "error": err.to_string(),
            "error_code": err.code(),
        })),
    )
        .into_response()
}

fn device_identity(headers: &HeaderMap) -> DeviceIdentity {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };
    DeviceIdentity {
        serial: get("x-device-serial"),
        hostname: get("x-device-hostname"),
        os: get("x-device-os"),
        os_version: get("x-device-os-version"),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
