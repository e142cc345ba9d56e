pub mod alerts;
pub mod devices;
pub mod health;
pub mod sensors;
pub mod stream;

use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .nest(
            "/api",
            Router::new()
                .merge(alerts::router())
                .merge(sensors::router())
                .merge(devices::router())
                .merge(stream::router())
                .merge(crate::openapi::router()),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod surface_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn app() -> Router {
        router(crate::test_support::test_state())
    }

    #[tokio::test]
    async fn healthz_reports_ok_without_backends() {
        let resp = app()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn openapi_document_is_served() {
        let resp = app()
            .oneshot(
                Request::builder()
                    .uri("/api/openapi.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_alert_rejects_unknown_type() {
        let resp = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/alerts/create")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"deviceId": "MH001", "type": "volcano"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn readings_query_requires_device_id() {
        let resp = app()
            .oneshot(
                Request::builder()
                    .uri("/api/sensors/get-all-sensor-readings?deviceId=%20")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn threshold_update_rejects_negative_bounds() {
        let resp = app()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/devices/MH001/thresholds")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"maxDistance": -5.0}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
