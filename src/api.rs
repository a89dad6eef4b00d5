//! Control HTTP API.
//!
//! Exposes runtime toggling of the blocking stage and the metrics
//! exposition endpoint:
//!
//! * `GET /blocking/enable`
//! * `GET /blocking/disable?duration=<duration>` (`300s`, `5m`, `5m30s`, ...)
//! * `GET /blocking/status`
//! * `GET /metrics`

use crate::metrics::Metrics;
use crate::resolver::BlockingStatus;
use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

pub const BLOCKING_ENABLE_PATH: &str = "/blocking/enable";
pub const BLOCKING_DISABLE_PATH: &str = "/blocking/disable";
pub const BLOCKING_STATUS_PATH: &str = "/blocking/status";
pub const METRICS_PATH: &str = "/metrics";

struct ApiState {
    status: BlockingStatus,
    metrics: Metrics,
}

pub fn router(status: BlockingStatus, metrics: Metrics) -> Router {
    let state = Arc::new(ApiState { status, metrics });

    Router::new()
        .route(BLOCKING_ENABLE_PATH, get(blocking_enable))
        .route(BLOCKING_DISABLE_PATH, get(blocking_disable))
        .route(BLOCKING_STATUS_PATH, get(blocking_status))
        .route(METRICS_PATH, get(metrics_text))
        .with_state(state)
}

pub async fn serve(status: BlockingStatus, metrics: Metrics, port: u16) -> Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("control API listening on http://{addr}");
    axum::serve(listener, router(status, metrics)).await?;
    Ok(())
}

async fn blocking_enable(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    info!("enabling blocking...");
    state.status.enable();
    StatusCode::OK
}

#[derive(Deserialize)]
struct DisableParams {
    duration: Option<String>,
}

async fn blocking_disable(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<DisableParams>,
) -> StatusCode {
    let duration = match params.duration.as_deref() {
        Some(raw) if !raw.is_empty() => match crate::config::parse_duration(raw) {
            Ok(duration) => duration,
            Err(_) => {
                error!("wrong duration format '{raw}'");
                return StatusCode::BAD_REQUEST;
            }
        },
        None | Some(_) => Duration::ZERO,
    };

    state.status.disable(duration);
    StatusCode::OK
}

#[derive(Serialize)]
struct BlockingStatusResponse {
    enabled: bool,
    #[serde(rename = "autoEnableInSec")]
    auto_enable_in_sec: u64,
}

async fn blocking_status(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let (enabled, auto_enable_in_sec) = state.status.current();
    Json(BlockingStatusResponse {
        enabled,
        auto_enable_in_sec,
    })
}

async fn metrics_text(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    state.metrics.render()
}
