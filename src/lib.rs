//! Powercast core crate.
//!
//! Current implemented scope:
//! - feature engineering over hourly device readings
//! - multi-horizon sequence construction and scaling
//! - pluggable predictors with a seasonal baseline
//! - anomaly scoring, insights and appliance scheduling
//! - a cached forecasting service with SQLite persistence and HTTP routes

mod anomaly;
mod api;
mod cache;
mod config;
mod features;
mod forecast;
mod horizon;
mod insights;
mod metrics;
mod observability;
mod outliers;
mod predictor;
mod readings;
mod scaling;
mod schedule;
mod sequences;
mod stats;
mod store;
mod weather;

pub use anomaly::{
    score_baseline, score_interval, AnomalyError, AnomalyKind, AnomalyRecord, Deviation,
    ExpectedRange, IntervalSummary, Severity, INTERVAL_Z,
};
pub use api::{
    forecast_router, status_for, ConsumptionRequest, ConsumptionResponse, ErrorResponse,
    HealthResponse, PredictionsQuery, ScheduleRequest,
};
pub use cache::{CacheEntry, CacheKey, ResultCache};
pub use config::{
    forecast_config_from_env, runtime_paths_from_env, validate_forecast_config, ConfigError,
    ForecastConfig, RuntimePaths,
};
pub use features::{
    build_feature_schema, validate_feature_config, DataQualityReport, FeatureColumn,
    FeatureConfig, FeatureEngineer, FeatureError, FeatureGroup, FeatureRow, FeatureSchema,
    FeatureTable, TempCategory, FEATURE_SCHEMA_VERSION, TARGET_COLUMN,
};
pub use forecast::{
    ForecastError, ForecastPoint, ForecastResult, ForecastService, PredictorFactory, SplitSizes,
    TrainingReport,
};
pub use horizon::{
    max_horizon_hours, parse_horizon, parse_horizon_list, Horizon, HorizonError, ALL_HORIZONS,
};
pub use insights::{
    validate_insight_config, InsightConfig, InsightError, InsightGenerator, InsightKind,
    InsightRecord,
};
pub use metrics::{evaluate, ForecastMetrics};
pub use observability::{
    init_logging, log_app_bind, log_app_start, log_models_restored, log_store_opened,
    logging_config_from_env, LogFormat, LoggingConfig, LoggingInitError,
};
pub use predictor::{
    validate_horizon_values, HorizonValues, Predictor, PredictorError, SeasonalBaselinePredictor,
    TrainingSummary,
};
pub use readings::{load_readings_csv, Reading};
pub use scaling::{
    saved_scalers, scaler_path, ColumnScaler, PowerTensor, ScalerError, ScalerKind, ScalerState,
    SCALER_FILE_SUFFIX,
};
pub use schedule::{
    best_start_hour, estimated_savings, optimize_schedule, Appliance, Schedule, ScheduleError,
    ScheduledAppliance, OPTIMIZATION_CONFIDENCE,
};
pub use sequences::{
    build_inference_window, build_training_sequences, context_columns, InferenceWindow,
    SequenceError, SeriesMatrix, SplitSets, TrainingSet, EXCLUDED_CONTEXT_COLUMNS,
    FALLBACK_CONTEXT_WIDTH,
};
pub use store::{InMemoryReadingStore, ReadingStore, SqliteReadingStore, StoreError};
pub use weather::{
    SuppliedWeather, SyntheticWeather, WeatherProvider, WeatherSample, DEFAULT_WEATHER_SEED,
};
