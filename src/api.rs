//! HTTP routes over a shared `ForecastService`.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::forecast::{ForecastError, ForecastService};
use crate::horizon::{parse_horizon_list, ALL_HORIZONS};
use crate::readings::Reading;
use crate::scaling::ScalerError;
use crate::schedule::Appliance;
use crate::sequences::SequenceError;
use crate::store::StoreError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PredictionsQuery {
    /// Comma-separated labels such as `1h,24h`; all horizons when absent.
    pub horizons: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsumptionRequest {
    pub timestamp: Option<DateTime<Utc>>,
    pub power_watts: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleRequest {
    pub appliances: Vec<Appliance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumptionResponse {
    pub status: String,
    pub reading: Reading,
}

pub fn forecast_router(service: Arc<ForecastService>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/api/predictions/{device_id}", get(get_predictions))
        .route("/api/consumption/{device_id}", post(post_consumption))
        .route("/api/train-model/{device_id}", post(post_train_model))
        .route("/api/optimize-schedule/{device_id}", post(post_optimize_schedule))
        .with_state(ApiState { service })
}

/// Status code for a failed service call.
pub fn status_for(err: &ForecastError) -> StatusCode {
    match err {
        ForecastError::NoData { .. }
        | ForecastError::InvalidRequest(_)
        | ForecastError::Sequence(SequenceError::InsufficientData { .. })
        | ForecastError::Schedule(_)
        | ForecastError::Store(StoreError::InvalidReading(_)) => StatusCode::BAD_REQUEST,
        ForecastError::Scaler(ScalerError::NotFitted(_)) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Clone)]
struct ApiState {
    service: Arc<ForecastService>,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<ForecastError> for ApiError {
    fn from(err: ForecastError) -> Self {
        Self {
            status: status_for(&err),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(
                component = "api",
                event = "http.request.failed",
                status = self.status.as_u16(),
                error = %self.message
            );
        }
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
    })
}

async fn get_predictions(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    Query(query): Query<PredictionsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let horizons = match query.horizons.as_deref() {
        Some(raw) => parse_horizon_list(raw).map_err(|err| ApiError::bad_request(err.to_string()))?,
        None => ALL_HORIZONS.into_iter().collect(),
    };

    info!(
        component = "api",
        event = "http.predictions",
        device_id = %device_id,
        horizons = horizons.len()
    );
    let result = state.service.forecast(&device_id, &horizons).await?;
    Ok(Json(result))
}

async fn post_consumption(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    Json(body): Json<ConsumptionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let timestamp = body.timestamp.unwrap_or_else(Utc::now);
    let reading = state
        .service
        .record_reading(&device_id, timestamp, body.power_watts)
        .await?;

    info!(
        component = "api",
        event = "http.consumption.stored",
        device_id = %device_id
    );
    Ok((
        StatusCode::CREATED,
        Json(ConsumptionResponse {
            status: "success".to_string(),
            reading,
        }),
    ))
}

async fn post_train_model(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    info!(
        component = "api",
        event = "http.train",
        device_id = %device_id
    );
    let report = state.service.train(&device_id).await?;
    Ok(Json(report))
}

async fn post_optimize_schedule(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    Json(body): Json<ScheduleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.appliances.is_empty() {
        return Err(ApiError::bad_request("appliances must not be empty"));
    }
    let schedule = state
        .service
        .optimize_schedule(&device_id, &body.appliances)
        .await?;
    Ok(Json(schedule))
}
