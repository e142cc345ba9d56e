use axum::routing::get;
use axum::{Json, Router};
use std::sync::atomic::Ordering;

use crate::state::AppState;

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub mqtt_connected: bool,
    pub queue_depth: u64,
    pub last_flush_unix_ms: u64,
    pub last_batch_len: u64,
    pub dropped_invalid: u64,
    pub dropped_overflow: u64,
    pub stream_subscribers: usize,
    pub last_error: Option<String>,
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "OK", body = HealthResponse))
)]
pub(crate) async fn healthz_handler(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<HealthResponse> {
    let stats = &state.stats;
    let last_error = stats
        .last_error
        .lock()
        .ok()
        .and_then(|guard| guard.clone());
    Json(HealthResponse {
        status: "ok".to_string(),
        mqtt_connected: stats.mqtt_connected.load(Ordering::Relaxed),
        queue_depth: stats.queue_depth.load(Ordering::Relaxed),
        last_flush_unix_ms: stats.last_flush_unix_ms.load(Ordering::Relaxed),
        last_batch_len: stats.last_batch_len.load(Ordering::Relaxed),
        dropped_invalid: stats.dropped_invalid.load(Ordering::Relaxed),
        dropped_overflow: stats.dropped_overflow.load(Ordering::Relaxed),
        stream_subscribers: state.fanout.subscriber_count(),
        last_error,
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/healthz", get(healthz_handler))
}
