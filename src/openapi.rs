use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "sewerwatch-core",
        description = "Smart sewage monitoring core server"
    ),
    paths(
        crate::routes::health::healthz_handler,
        crate::routes::alerts::recent_alerts,
        crate::routes::alerts::create_alert,
        crate::routes::alerts::update_alert_status,
        crate::routes::alerts::append_alert_note,
        crate::routes::sensors::get_all_sensor_readings,
        crate::routes::sensors::sensor_trends,
        crate::routes::devices::list_devices,
        crate::routes::devices::update_thresholds,
        crate::routes::stream::stream_handler,
    ),
    components(schemas(
        crate::routes::health::HealthResponse,
        crate::routes::alerts::CreateAlertRequest,
        crate::routes::alerts::UpdateStatusRequest,
        crate::routes::alerts::AppendNoteRequest,
        crate::routes::sensors::TrendPoint,
        crate::routes::devices::DeviceResponse,
        crate::routes::devices::UpdateThresholdsRequest,
        crate::services::alerts::Alert,
        crate::services::alerts::AlertStatus,
        crate::services::evaluator::AlertType,
        crate::services::evaluator::ReadingStatus,
        crate::services::evaluator::Measurements,
        crate::services::evaluator::SensorSample,
        crate::services::evaluator::Thresholds,
        crate::services::evaluator::EvaluatedReading,
        crate::services::readings::StoredReading,
    )),
    tags(
        (name = "alerts", description = "Alert lifecycle"),
        (name = "sensors", description = "Stored sensor readings"),
        (name = "devices", description = "Device threshold configuration"),
        (name = "stream", description = "Realtime fanout")
    )
)]
pub struct ApiDoc;

pub fn openapi_json() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

pub(crate) async fn serve_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(openapi_json())
}

pub fn router() -> Router<AppState> {
    Router::new().route("/openapi.json", get(serve_openapi))
}
