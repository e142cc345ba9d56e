use axum::extract::Query;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};

use crate::error::map_db_error;
use crate::services::readings::StoredReading;
use crate::state::AppState;

#[derive(Debug, Clone, serde::Deserialize, utoipa::IntoParams)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ReadingsQuery {
    device_id: String,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    #[param(minimum = 1, maximum = 10000)]
    limit: Option<u32>,
}

#[utoipa::path(
    get,
    path = "/api/sensors/get-all-sensor-readings",
    tag = "sensors",
    params(ReadingsQuery),
    responses(
        (status = 200, description = "Stored readings, ascending by time", body = Vec<StoredReading>),
        (status = 400, description = "Invalid request")
    )
)]
pub(crate) async fn get_all_sensor_readings(
    axum::extract::State(state): axum::extract::State<AppState>,
    Query(query): Query<ReadingsQuery>,
) -> Result<Json<Vec<StoredReading>>, (StatusCode, String)> {
    let device_id = query.device_id.trim();
    if device_id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "deviceId cannot be empty".to_string()));
    }
    let to = query.to.unwrap_or_else(Utc::now);
    let from = query.from.unwrap_or_else(|| to - Duration::hours(24));
    if from > to {
        return Err((StatusCode::BAD_REQUEST, "`from` must not be after `to`".to_string()));
    }
    let limit = query.limit.unwrap_or(1000).clamp(1, 10_000) as i64;

    Ok(Json(
        state
            .store
            .query_range(device_id, from, to, limit)
            .await
            .map_err(map_db_error)?,
    ))
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::IntoParams)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TrendsQuery {
    device_id: String,
    #[param(minimum = 1, maximum = 720)]
    hours: Option<u32>,
    #[param(minimum = 1, maximum = 1440)]
    bucket_minutes: Option<u32>,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TrendPoint {
    bucket_start: DateTime<Utc>,
    avg_sewage_level: f64,
    avg_methane_level: f64,
    avg_flow_rate: f64,
    avg_battery_level: f64,
    samples: i64,
}

#[utoipa::path(
    get,
    path = "/api/sensors/trends",
    tag = "sensors",
    params(TrendsQuery),
    responses(
        (status = 200, description = "Time-bucketed averages, ascending by bucket", body = Vec<TrendPoint>),
        (status = 400, description = "Invalid request")
    )
)]
pub(crate) async fn sensor_trends(
    axum::extract::State(state): axum::extract::State<AppState>,
    Query(query): Query<TrendsQuery>,
) -> Result<Json<Vec<TrendPoint>>, (StatusCode, String)> {
    let device_id = query.device_id.trim();
    if device_id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "deviceId cannot be empty".to_string()));
    }
    let hours = query.hours.unwrap_or(24).clamp(1, 720);
    let bucket_seconds = f64::from(query.bucket_minutes.unwrap_or(60).clamp(1, 1440)) * 60.0;
    let since = Utc::now() - Duration::hours(i64::from(hours));

    let points: Vec<TrendPoint> = sqlx::query_as(
        r#"
        SELECT to_timestamp(floor(extract(epoch FROM observed_at) / $2) * $2) AS bucket_start,
               AVG(sewage_level)  AS avg_sewage_level,
               AVG(methane_level) AS avg_methane_level,
               AVG(flow_rate)     AS avg_flow_rate,
               AVG(battery_level) AS avg_battery_level,
               COUNT(*)           AS samples
        FROM readings
        WHERE device_id = $1 AND observed_at >= $3
        GROUP BY bucket_start
        ORDER BY bucket_start ASC
        "#,
    )
    .bind(device_id)
    .bind(bucket_seconds)
    .bind(since)
    .fetch_all(&state.db)
    .await
    .map_err(map_db_error)?;

    Ok(Json(points))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sensors/get-all-sensor-readings", get(get_all_sensor_readings))
        .route("/sensors/trends", get(sensor_trends))
}
