//! Bandwidth endpoints for browser-driven throughput measurement.
//!
//! All four endpoints are stateless. Download streams per-request random
//! bytes (an OS-seeded generator per request, so parallel streams never
//! contend on a shared lock); upload drains and times the request body.
//! Ping deliberately does nothing but answer.

use axum::body::Body;
use axum::extract::Query;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tower_http::cors::{Any, CorsLayer};

pub const MAX_CHUNK_SIZE_MB: u64 = 100;
pub const DEFAULT_CHUNK_SIZE_MB: u64 = 10;
pub const RECOMMENDED_STREAMS: u32 = 6;
pub const MAX_STREAMS: u32 = 32;

/// Write granularity of the download stream.
const BUFFER_SIZE: usize = 64 * 1024;

const NO_CACHE: &str = "no-store, no-cache, must-revalidate, max-age=0";

pub fn router<S: Clone + Send + Sync + 'static>() -> Router<S> {
    Router::new()
        .route("/download", get(download))
        .route("/upload", post(upload))
        .route("/ping", get(ping))
        .route("/info", get(info))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
                .expose_headers([header::CONTENT_LENGTH]),
        )
}

#[derive(Debug, Deserialize)]
struct DownloadParams {
    size: Option<u64>,
}

async fn download(Query(params): Query<DownloadParams>) -> Response {
    let size_mb = params.size.unwrap_or(DEFAULT_CHUNK_SIZE_MB);
    if !(1..=MAX_CHUNK_SIZE_MB).contains(&size_mb) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": format!("size must be between 1 and {MAX_CHUNK_SIZE_MB} MB"),
            })),
        )
            .into_response();
    }
    let total = size_mb << 20;

    let stream = futures::stream::unfold(
        (total, StdRng::from_entropy()),
        |(remaining, mut rng)| async move {
            if remaining == 0 {
                return None;
            }
            let n = remaining.min(BUFFER_SIZE as u64) as usize;
            let mut buf = vec![0u8; n];
            rng.fill_bytes(&mut buf);
            // A send error here means the client hung up; axum drops the
            // stream and generation stops with it.
            Some((
                Ok::<_, std::io::Error>(Bytes::from(buf)),
                (remaining - n as u64, rng),
            ))
        },
    );

    Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, total)
        .header(header::CACHE_CONTROL, NO_CACHE)
        .header(header::PRAGMA, "no-cache")
        .body(Body::from_stream(stream))
        .expect("static response parts")
}

#[derive(Debug, Serialize)]
struct UploadSummary {
    success: bool,
    bytes_received: u64,
    duration_ms: f64,
    throughput_mbps: f64,
}

async fn upload(body: Body) -> Response {
    let start = Instant::now();
    let mut stream = body.into_data_stream();
    let mut bytes_received: u64 = 0;

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => bytes_received += chunk.len() as u64,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "success": false,
                        "error": format!("upload interrupted: {e}"),
                    })),
                )
                    .into_response();
            }
        }
    }

    let elapsed = start.elapsed();
    let secs = elapsed.as_secs_f64().max(1e-9);
    Json(UploadSummary {
        success: true,
        bytes_received,
        duration_ms: elapsed.as_secs_f64() * 1000.0,
        throughput_mbps: (bytes_received as f64) * 8.0 / (secs * 1_000_000.0),
    })
    .into_response()
}

// Hot path for browser latency sampling: no logging, no allocation beyond
// the response itself.
async fn ping() -> Response {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    (
        [
            (header::CACHE_CONTROL, NO_CACHE),
            (header::PRAGMA, "no-cache"),
        ],
        Json(json!({ "pong": true, "timestamp": timestamp })),
    )
        .into_response()
}

async fn info() -> Json<serde_json::Value> {
    Json(json!({
        "name": "WaddlePerf TestServer",
        "version": env!("CARGO_PKG_VERSION"),
        "max_chunk_size_mb": MAX_CHUNK_SIZE_MB,
        "default_chunk_size_mb": DEFAULT_CHUNK_SIZE_MB,
        "recommended_streams": RECOMMENDED_STREAMS,
        "max_streams": MAX_STREAMS,
    }))
}
