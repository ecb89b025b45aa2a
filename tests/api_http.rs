use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::{Duration, DurationRound, Utc};
use powercast::{
    forecast_router, ForecastConfig, ForecastService, InMemoryReadingStore, Reading,
};
use serde_json::Value;
use tower::util::ServiceExt;

fn app_with_days(device_id: &str, days: i64) -> Router {
    let end = Utc::now().duration_trunc(Duration::hours(1)).unwrap();
    let start = end - Duration::days(days);
    let readings = (0..days * 24).map(|h| {
        let power = match h % 24 {
            0..=6 => 60.0,
            18..=21 => 180.0,
            _ => 110.0 + (h % 4) as f64,
        };
        Reading::new(device_id, start + Duration::hours(h), power)
    });
    let store = Arc::new(InMemoryReadingStore::with_readings(readings));
    let service = ForecastService::with_seasonal_baseline(store, ForecastConfig::default()).unwrap();
    forecast_router(Arc::new(service))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn health_reports_healthy() {
    let app = app_with_days("plug", 1);
    let (status, body) = send(&app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn unknown_horizon_label_is_a_bad_request() {
    let app = app_with_days("plug", 8);
    let (status, body) = send(&app, get("/api/predictions/plug?horizons=1h,2h")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("2h"));
}

#[tokio::test]
async fn missing_history_is_a_bad_request_and_missing_model_a_conflict() {
    let app = app_with_days("plug", 8);

    let (status, body) = send(&app, get("/api/predictions/fridge")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("fridge"));

    let (status, _) = send(&app, get("/api/predictions/plug?horizons=1h")).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn training_then_predicting_returns_requested_horizons() {
    let app = app_with_days("plug", 31);

    let (status, report) = send(&app, post_empty("/api/train-model/plug")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["predictor"], "seasonal_baseline");
    assert_eq!(report["scaler"], "robust");

    let (status, body) = send(&app, get("/api/predictions/plug?horizons=6h,1h")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["device_id"], "plug");
    assert_eq!(body["horizons"]["1h"].as_array().unwrap().len(), 1);
    assert_eq!(body["horizons"]["6h"].as_array().unwrap().len(), 6);
    assert!(body["horizons"].get("24h").is_none());
    assert!(body["anomalies"].is_array());
    assert!(body["insights"].is_array());
}

#[tokio::test]
async fn consumption_is_stored_and_invalid_power_rejected() {
    let app = app_with_days("plug", 1);

    let (status, body) = send(
        &app,
        post_json(
            "/api/consumption/kettle",
            serde_json::json!({"timestamp": "2025-01-01T10:00:00Z", "power_watts": 2000.0}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "success");
    assert_eq!(body["reading"]["device_id"], "kettle");
    assert_eq!(body["reading"]["power_watts"], 2000.0);

    let (status, body) = send(
        &app,
        post_json("/api/consumption/kettle", serde_json::json!({"power_watts": -5.0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("power_watts"));
}

#[tokio::test]
async fn schedule_requests_are_validated_before_forecasting() {
    let app = app_with_days("plug", 8);

    let (status, _) = send(
        &app,
        post_json("/api/optimize-schedule/plug", serde_json::json!({"appliances": []})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        post_json(
            "/api/optimize-schedule/plug",
            serde_json::json!({"appliances": [
                {"name": "kiln", "power_watts": 3000.0, "duration_hours": 30}
            ]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("kiln"));
}

#[tokio::test]
async fn trained_device_gets_a_schedule() {
    let app = app_with_days("plug", 31);
    let (status, _) = send(&app, post_empty("/api/train-model/plug")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        post_json(
            "/api/optimize-schedule/plug",
            serde_json::json!({"appliances": [
                {"name": "dishwasher", "power_watts": 1200.0, "duration_hours": 2}
            ]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["optimization_confidence"], 0.75);
    let start = body["schedule"][0]["start_offset_hours"].as_u64().unwrap();
    assert!(start <= 22);
}

#[tokio::test]
async fn training_on_three_days_is_a_bad_request() {
    let app = app_with_days("plug", 3);
    let (status, body) = send(&app, post_empty("/api/train-model/plug")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("insufficient data"));
}
