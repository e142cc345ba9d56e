use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use uuid::Uuid;

use crate::error::map_db_error;
use crate::services::alerts::{Alert, AlertEvent, AlertStatus};
use crate::services::evaluator::AlertType;
use crate::services::fanout::StreamEvent;
use crate::state::AppState;

#[derive(Debug, Clone, serde::Deserialize, utoipa::IntoParams)]
pub(crate) struct RecentQuery {
    #[param(minimum = 1, maximum = 250)]
    limit: Option<u32>,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateAlertRequest {
    pub device_id: String,
    #[serde(rename = "type")]
    pub alert_type: String,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct UpdateStatusRequest {
    pub status: String,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct AppendNoteRequest {
    pub note: String,
}

#[utoipa::path(
    get,
    path = "/api/alerts/recent",
    tag = "alerts",
    params(RecentQuery),
    responses((status = 200, description = "Recent alerts, newest first", body = Vec<Alert>))
)]
pub(crate) async fn recent_alerts(
    axum::extract::State(state): axum::extract::State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Vec<Alert>>, (StatusCode, String)> {
    let limit = query.limit.unwrap_or(100).clamp(1, 250) as i64;
    Ok(Json(
        state.alerts.recent(limit).await.map_err(map_db_error)?,
    ))
}

#[utoipa::path(
    post,
    path = "/api/alerts/create",
    tag = "alerts",
    request_body = CreateAlertRequest,
    responses(
        (status = 200, description = "Created or refreshed alert", body = Alert),
        (status = 400, description = "Invalid request")
    )
)]
pub(crate) async fn create_alert(
    axum::extract::State(state): axum::extract::State<AppState>,
    Json(payload): Json<CreateAlertRequest>,
) -> Result<Json<Alert>, (StatusCode, String)> {
    let device_id = payload.device_id.trim();
    if device_id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "deviceId cannot be empty".to_string()));
    }
    let Some(alert_type) = AlertType::parse(&payload.alert_type) else {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("unknown alert type `{}`", payload.alert_type),
        ));
    };

    let event = state
        .alerts
        .create_manual(device_id, alert_type)
        .await
        .map_err(map_db_error)?;
    let alert = event.alert().clone();
    state.fanout.broadcast(event.into());
    Ok(Json(alert))
}

#[utoipa::path(
    patch,
    path = "/api/alerts/{id}/status",
    tag = "alerts",
    params(("id" = Uuid, Path, description = "Alert id")),
    request_body = UpdateStatusRequest,
    responses(
        (status = 200, description = "Updated alert", body = Alert),
        (status = 400, description = "Invalid status"),
        (status = 404, description = "Alert not found or not in a transitionable state")
    )
)]
pub(crate) async fn update_alert_status(
    axum::extract::State(state): axum::extract::State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<Alert>, (StatusCode, String)> {
    let alert = match AlertStatus::parse(&payload.status) {
        Some(AlertStatus::Acknowledged) => {
            state.alerts.acknowledge(id).await.map_err(map_db_error)?
        }
        Some(AlertStatus::Resolved) => state.alerts.resolve(id).await.map_err(map_db_error)?,
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                "status must be `acknowledged` or `resolved`".to_string(),
            ));
        }
    };

    let Some(alert) = alert else {
        return Err((StatusCode::NOT_FOUND, "Alert not found".to_string()));
    };
    let event = match alert.status {
        AlertStatus::Resolved => AlertEvent::Resolved(alert.clone()),
        _ => AlertEvent::Updated(alert.clone()),
    };
    state.fanout.broadcast(StreamEvent::from(event));
    Ok(Json(alert))
}

#[utoipa::path(
    patch,
    path = "/api/alerts/{id}/notes",
    tag = "alerts",
    params(("id" = Uuid, Path, description = "Alert id")),
    request_body = AppendNoteRequest,
    responses(
        (status = 200, description = "Alert with the appended note", body = Alert),
        (status = 400, description = "Empty note"),
        (status = 404, description = "Alert not found")
    )
)]
pub(crate) async fn append_alert_note(
    axum::extract::State(state): axum::extract::State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AppendNoteRequest>,
) -> Result<Json<Alert>, (StatusCode, String)> {
    let note = payload.note.trim();
    if note.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "note cannot be empty".to_string()));
    }

    let alert = state
        .alerts
        .append_note(id, note)
        .await
        .map_err(map_db_error)?;
    let Some(alert) = alert else {
        return Err((StatusCode::NOT_FOUND, "Alert not found".to_string()));
    };
    state
        .fanout
        .broadcast(StreamEvent::AlertUpdated(alert.clone()));
    Ok(Json(alert))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/alerts/recent", get(recent_alerts))
        .route("/alerts/create", post(create_alert))
        .route("/alerts/{id}/status", patch(update_alert_status))
        .route("/alerts/{id}/notes", patch(append_alert_note))
}
