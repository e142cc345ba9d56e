use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};

use crate::error::map_db_error;
use crate::services::evaluator::Thresholds;
use crate::state::AppState;

#[derive(sqlx::FromRow)]
pub(crate) struct DeviceRow {
    device_id: String,
    name: Option<String>,
    location: Option<String>,
    max_distance: Option<f64>,
    max_gas: Option<f64>,
    min_flow: Option<f64>,
    min_battery: Option<f64>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DeviceResponse {
    device_id: String,
    name: Option<String>,
    location: Option<String>,
    thresholds: Thresholds,
    created_at: DateTime<Utc>,
}

impl From<DeviceRow> for DeviceResponse {
    fn from(row: DeviceRow) -> Self {
        // Nulls collapse to the system defaults, so the response always
        // carries the bounds actually in effect.
        let thresholds = Thresholds::from_partial(
            row.max_distance,
            row.max_gas,
            row.min_flow,
            row.min_battery,
        );
        Self {
            device_id: row.device_id,
            name: row.name,
            location: row.location,
            thresholds,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UpdateThresholdsRequest {
    pub max_distance: Option<f64>,
    pub max_gas: Option<f64>,
    pub min_flow: Option<f64>,
    pub min_battery: Option<f64>,
}

impl UpdateThresholdsRequest {
    fn validate(&self) -> Result<(), String> {
        for (label, value) in [
            ("maxDistance", self.max_distance),
            ("maxGas", self.max_gas),
            ("minFlow", self.min_flow),
            ("minBattery", self.min_battery),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(format!("{label} must be a finite non-negative number"));
                }
            }
        }
        Ok(())
    }
}

#[utoipa::path(
    get,
    path = "/api/devices",
    tag = "devices",
    responses((status = 200, description = "Registered devices with effective thresholds", body = Vec<DeviceResponse>))
)]
pub(crate) async fn list_devices(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<Json<Vec<DeviceResponse>>, (StatusCode, String)> {
    let rows: Vec<DeviceRow> = sqlx::query_as(
        r#"
        SELECT device_id, name, location, max_distance, max_gas, min_flow, min_battery, created_at
        FROM devices
        ORDER BY device_id ASC
        "#,
    )
    .fetch_all(&state.db)
    .await
    .map_err(map_db_error)?;

    Ok(Json(rows.into_iter().map(DeviceResponse::from).collect()))
}

#[utoipa::path(
    put,
    path = "/api/devices/{id}/thresholds",
    tag = "devices",
    params(("id" = String, Path, description = "Device id")),
    request_body = UpdateThresholdsRequest,
    responses(
        (status = 200, description = "Device with the updated thresholds", body = DeviceResponse),
        (status = 400, description = "Invalid thresholds")
    )
)]
pub(crate) async fn update_thresholds(
    axum::extract::State(state): axum::extract::State<AppState>,
    Path(device_id): Path<String>,
    Json(payload): Json<UpdateThresholdsRequest>,
) -> Result<Json<DeviceResponse>, (StatusCode, String)> {
    let device_id = device_id.trim().to_string();
    if device_id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "device id cannot be empty".to_string()));
    }
    payload
        .validate()
        .map_err(|message| (StatusCode::BAD_REQUEST, message))?;

    let row: DeviceRow = sqlx::query_as(
        r#"
        INSERT INTO devices (device_id, max_distance, max_gas, min_flow, min_battery)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (device_id) DO UPDATE
        SET max_distance = EXCLUDED.max_distance,
            max_gas = EXCLUDED.max_gas,
            min_flow = EXCLUDED.min_flow,
            min_battery = EXCLUDED.min_battery
        RETURNING device_id, name, location, max_distance, max_gas, min_flow, min_battery, created_at
        "#,
    )
    .bind(&device_id)
    .bind(payload.max_distance)
    .bind(payload.max_gas)
    .bind(payload.min_flow)
    .bind(payload.min_battery)
    .fetch_one(&state.db)
    .await
    .map_err(map_db_error)?;

    let response = DeviceResponse::from(row);
    // The next reading for this device must see the new bounds.
    state.thresholds.store(&device_id, response.thresholds);

    Ok(Json(response))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/devices", get(list_devices))
        .route("/devices/{id}/thresholds", put(update_thresholds))
}
