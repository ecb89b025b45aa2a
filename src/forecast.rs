//! End-to-end forecasting service.
//!
//! A forecast runs `FETCH → FEATURES → SCALE → PREDICT → INVERSE → ANOMALY →
//! INSIGHT → ASSEMBLE`. Any failure up to and including the inverse transform
//! aborts the call; anomaly scoring and insights degrade to empty lists.
//! Results are memoized per `(device, horizon set)` in a `ResultCache`.
//!
//! Forecasts need a model installed for the device, either by `train` or by
//! `install_model` with a previously persisted scaler. The scaler is never
//! refit from inference data.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::anomaly::{score_baseline, score_interval, AnomalyError, AnomalyRecord};
use crate::cache::{CacheKey, ResultCache};
use crate::config::{validate_forecast_config, ConfigError, ForecastConfig};
use crate::features::{DataQualityReport, FeatureEngineer, FeatureError};
use crate::horizon::{max_horizon_hours, Horizon, ALL_HORIZONS};
use crate::insights::{InsightGenerator, InsightRecord};
use crate::metrics::{evaluate, ForecastMetrics};
use crate::predictor::{
    validate_horizon_values, HorizonValues, Predictor, PredictorError, SeasonalBaselinePredictor,
    TrainingSummary,
};
use crate::readings::Reading;
use crate::scaling::{ScalerError, ScalerKind, ScalerState};
use crate::schedule::{optimize_schedule, Appliance, Schedule, ScheduleError};
use crate::sequences::{
    build_inference_window, build_training_sequences, context_columns, InferenceWindow, SequenceError,
    SeriesMatrix, TrainingSet,
};
use crate::store::{ReadingStore, StoreError};
use crate::weather::WeatherProvider;

pub type PredictorFactory = Arc<dyn Fn() -> Box<dyn Predictor> + Send + Sync>;

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("no readings for device {device_id} between {start} and {end}")]
    NoData {
        device_id: String,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Sequence(#[from] SequenceError),
    #[error(transparent)]
    Scaler(#[from] ScalerError),
    #[error(transparent)]
    Predictor(#[from] PredictorError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error("background worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub device_id: String,
    pub generated_at: DateTime<Utc>,
    pub predictor: String,
    pub horizons: BTreeMap<Horizon, Vec<ForecastPoint>>,
    pub anomalies: Vec<AnomalyRecord>,
    pub insights: Vec<InsightRecord>,
}

impl ForecastResult {
    pub fn values(&self, horizon: Horizon) -> Option<Vec<f64>> {
        self.horizons
            .get(&horizon)
            .map(|points| points.iter().map(|p| p.value).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitSizes {
    pub train: usize,
    pub validation: usize,
    pub test: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub device_id: String,
    pub trained_at: DateTime<Utc>,
    pub predictor: String,
    pub scaler: ScalerKind,
    pub feature_fingerprint: String,
    pub windows: SplitSizes,
    pub training: TrainingSummary,
    pub validation_metrics: Option<ForecastMetrics>,
    pub test_metrics: Option<ForecastMetrics>,
    pub data_quality: DataQualityReport,
}

struct DeviceModel {
    scaler: ScalerState,
    predictor: Box<dyn Predictor>,
}

pub struct ForecastService {
    store: Arc<dyn ReadingStore>,
    predictor_factory: PredictorFactory,
    features: FeatureEngineer,
    insights: InsightGenerator,
    models: RwLock<HashMap<String, Arc<DeviceModel>>>,
    cache: ResultCache<ForecastResult>,
    fetch_permits: Semaphore,
    cfg: ForecastConfig,
}

impl ForecastService {
    pub fn new(
        store: Arc<dyn ReadingStore>,
        predictor_factory: PredictorFactory,
        cfg: ForecastConfig,
    ) -> Result<Self, ForecastError> {
        validate_forecast_config(&cfg)?;
        let features = FeatureEngineer::new(cfg.features.clone()).map_err(ConfigError::from)?;
        let insights = InsightGenerator::new(cfg.insights.clone()).map_err(ConfigError::from)?;
        Ok(Self {
            store,
            predictor_factory,
            features,
            insights,
            models: RwLock::new(HashMap::new()),
            cache: ResultCache::new(),
            fetch_permits: Semaphore::new(cfg.fetch_workers),
            cfg,
        })
    }

    /// Service backed by `SeasonalBaselinePredictor`.
    pub fn with_seasonal_baseline(
        store: Arc<dyn ReadingStore>,
        cfg: ForecastConfig,
    ) -> Result<Self, ForecastError> {
        let seed = cfg.predictor_seed;
        let factory: PredictorFactory =
            Arc::new(move || Box::new(SeasonalBaselinePredictor::new(seed)) as Box<dyn Predictor>);
        Self::new(store, factory, cfg)
    }

    pub fn with_weather_provider(mut self, provider: Arc<dyn WeatherProvider>) -> Self {
        self.features = self.features.with_weather_provider(provider);
        self
    }

    pub fn config(&self) -> &ForecastConfig {
        &self.cfg
    }

    pub fn has_model(&self, device_id: &str) -> bool {
        self.models
            .read()
            .expect("model registry lock should not be poisoned")
            .contains_key(device_id)
    }

    /// The training-fit scaler for `device_id`, e.g. to persist with `save_json`.
    pub fn scaler_state(&self, device_id: &str) -> Option<ScalerState> {
        self.models
            .read()
            .expect("model registry lock should not be poisoned")
            .get(device_id)
            .map(|model| model.scaler.clone())
    }

    /// Installs an externally fit scaler/predictor pair for `device_id`.
    pub fn install_model(
        &self,
        device_id: &str,
        scaler: ScalerState,
        predictor: Box<dyn Predictor>,
    ) -> Result<(), ForecastError> {
        self.check_context_columns(&scaler)?;
        self.put_model(device_id, DeviceModel { scaler, predictor });
        Ok(())
    }

    fn check_context_columns(&self, scaler: &ScalerState) -> Result<(), ForecastError> {
        let expected = context_columns(self.features.schema());
        if scaler.context_columns != expected {
            return Err(ScalerError::ContextMismatch {
                expected: expected.join(","),
                found: scaler.context_columns.join(","),
            }
            .into());
        }
        Ok(())
    }

    fn put_model(&self, device_id: &str, model: DeviceModel) {
        self.models
            .write()
            .expect("model registry lock should not be poisoned")
            .insert(device_id.to_string(), Arc::new(model));
        self.cache.invalidate_device(device_id);
        info!(
            component = "forecast",
            event = "forecast.model.installed",
            device_id
        );
    }

    fn model(&self, device_id: &str) -> Result<Arc<DeviceModel>, ScalerError> {
        self.models
            .read()
            .expect("model registry lock should not be poisoned")
            .get(device_id)
            .cloned()
            .ok_or_else(|| ScalerError::NotFitted(device_id.to_string()))
    }

    pub async fn forecast(
        &self,
        device_id: &str,
        horizons: &BTreeSet<Horizon>,
    ) -> Result<ForecastResult, ForecastError> {
        self.forecast_at(device_id, horizons, Utc::now()).await
    }

    pub async fn forecast_at(
        &self,
        device_id: &str,
        horizons: &BTreeSet<Horizon>,
        now: DateTime<Utc>,
    ) -> Result<ForecastResult, ForecastError> {
        validate_device_id(device_id)?;
        if horizons.is_empty() {
            return Err(ForecastError::InvalidRequest(
                "at least one horizon is required".to_string(),
            ));
        }

        let key = CacheKey::new(device_id, horizons.iter().copied());
        let ttl = Duration::seconds(self.cfg.cache_ttl_seconds);
        self.cache
            .get_or_compute(key, ttl, now, || {
                self.compute_forecast(device_id, horizons, now)
            })
            .await
    }

    async fn compute_forecast(
        &self,
        device_id: &str,
        horizons: &BTreeSet<Horizon>,
        now: DateTime<Utc>,
    ) -> Result<ForecastResult, ForecastError> {
        let requested: Vec<Horizon> = horizons.iter().copied().collect();
        info!(
            component = "forecast",
            event = "forecast.start",
            device_id,
            horizons = ?requested
        );

        let start = now - Duration::days(self.cfg.lookback_days);
        let readings = self.fetch_readings(device_id, start, now).await?;

        let table = self.features.augment(&readings, None)?;
        debug!(
            component = "forecast",
            event = "forecast.stage.features",
            device_id,
            complete_rows = table.complete_len()
        );

        let model = self.model(device_id)?;
        let scaled = model.scaler.transform(&SeriesMatrix::from_table(&table))?;
        let window = build_inference_window(&scaled, self.cfg.sequence_length)?;

        let raw = model.predictor.predict(&window)?;
        validate_horizon_values(&raw, &requested)?;

        let forecasts: HorizonValues = requested
            .iter()
            .map(|h| (*h, model.scaler.inverse_power(&raw[h])))
            .collect();

        let power: Vec<f64> = readings.iter().map(|r| r.power_watts).collect();
        let recent_start = power.len().saturating_sub(self.cfg.sequence_length);
        let recent = &power[recent_start..];
        let anomalies = match self.score_anomalies(&model, &window, &forecasts, recent, now) {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    component = "forecast",
                    event = "forecast.anomaly.degraded",
                    device_id,
                    error = %err
                );
                Vec::new()
            }
        };

        let insights = match self.insights.generate(&forecasts, &power, now) {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    component = "forecast",
                    event = "forecast.insight.degraded",
                    device_id,
                    error = %err
                );
                Vec::new()
            }
        };

        let result = ForecastResult {
            device_id: device_id.to_string(),
            generated_at: now,
            predictor: model.predictor.name().to_string(),
            horizons: forecasts
                .iter()
                .map(|(h, values)| (*h, points_from(now, values)))
                .collect(),
            anomalies,
            insights,
        };

        info!(
            component = "forecast",
            event = "forecast.finish",
            device_id,
            readings = readings.len(),
            anomalies = result.anomalies.len(),
            insights = result.insights.len()
        );

        Ok(result)
    }

    /// Interval scoring from stochastic draws when the predictor supports it,
    /// the 2σ/3σ baseline otherwise.
    fn score_anomalies(
        &self,
        model: &DeviceModel,
        window: &InferenceWindow,
        forecasts: &HorizonValues,
        recent: &[f64],
        now: DateTime<Utc>,
    ) -> Result<Vec<AnomalyRecord>, AnomalyStageError> {
        let draws = match model
            .predictor
            .predict_stochastic(window, self.cfg.stochastic_draws)
        {
            Ok(draws) => Some(draws),
            Err(PredictorError::Unsupported(_)) => None,
            Err(err) => return Err(err.into()),
        };

        let mut out = Vec::new();
        for (horizon, values) in forecasts {
            let timestamps: Vec<DateTime<Utc>> =
                points_from(now, values).into_iter().map(|p| p.timestamp).collect();
            let records = match &draws {
                Some(draws) => {
                    let population = draws
                        .iter()
                        .map(|draw| {
                            draw.get(horizon)
                                .map(|scaled| model.scaler.inverse_power(scaled))
                                .ok_or(PredictorError::MissingHorizon(*horizon))
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    score_interval(*horizon, &population, values, &timestamps)?
                }
                None => score_baseline(*horizon, recent, values, &timestamps)?,
            };
            out.extend(records);
        }
        Ok(out)
    }

    /// Fits a fresh scaler and predictor on the training lookback and installs
    /// them for `device_id`.
    pub async fn train(&self, device_id: &str) -> Result<TrainingReport, ForecastError> {
        self.train_at(device_id, Utc::now()).await
    }

    pub async fn train_at(
        &self,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TrainingReport, ForecastError> {
        self.fit_model(device_id, now, None).await
    }

    /// Refits the predictor for `device_id` against a persisted scaler, e.g.
    /// one written by `save_json` after an earlier training run. The scaler
    /// itself is used as loaded.
    pub async fn restore_at(
        &self,
        device_id: &str,
        scaler: ScalerState,
        now: DateTime<Utc>,
    ) -> Result<TrainingReport, ForecastError> {
        self.check_context_columns(&scaler)?;
        self.fit_model(device_id, now, Some(scaler)).await
    }

    async fn fit_model(
        &self,
        device_id: &str,
        now: DateTime<Utc>,
        restored: Option<ScalerState>,
    ) -> Result<TrainingReport, ForecastError> {
        validate_device_id(device_id)?;
        info!(
            component = "forecast",
            event = "training.start",
            device_id,
            restored = restored.is_some()
        );

        let start = now - Duration::days(self.cfg.training_lookback_days);
        let readings = self.fetch_readings(device_id, start, now).await?;
        let data_quality = self.features.data_quality_report(&readings);

        let table = self.features.augment(&readings, None)?;
        let series = SeriesMatrix::from_table(&table);
        let required = self.cfg.sequence_length
            + max_horizon_hours(&ALL_HORIZONS)
            + min_training_windows(self.cfg.train_fraction)
            - 1;
        if series.len() < required {
            return Err(SequenceError::InsufficientData {
                required,
                available: series.len(),
            }
            .into());
        }
        let scaler = match restored {
            Some(scaler) => scaler,
            None => ScalerState::fit(self.cfg.scaler, &series)?,
        };
        let scaled = scaler.transform(&series)?;
        let sequences = build_training_sequences(&scaled, self.cfg.sequence_length, &ALL_HORIZONS)?;
        let split = sequences.split_chronological(self.cfg.train_fraction, self.cfg.validation_fraction);
        if split.train.is_empty() {
            return Err(SequenceError::InsufficientData {
                required,
                available: series.len(),
            }
            .into());
        }
        let windows = SplitSizes {
            train: split.train.len(),
            validation: split.validation.len(),
            test: split.test.len(),
        };

        let mut predictor = (self.predictor_factory)();
        let train_set = split.train;
        let (predictor, training) = tokio::task::spawn_blocking(move || {
            let summary = predictor.fit(&train_set)?;
            Ok::<_, PredictorError>((predictor, summary))
        })
        .await
        .map_err(|err| ForecastError::Worker(err.to_string()))??;

        let validation_metrics = evaluate_one_hour(predictor.as_ref(), &scaler, &split.validation)?;
        let test_metrics = evaluate_one_hour(predictor.as_ref(), &scaler, &split.test)?;

        let report = TrainingReport {
            device_id: device_id.to_string(),
            trained_at: now,
            predictor: predictor.name().to_string(),
            scaler: scaler.kind,
            feature_fingerprint: table.schema.fingerprint.clone(),
            windows,
            training,
            validation_metrics,
            test_metrics,
            data_quality,
        };

        self.put_model(device_id, DeviceModel { scaler, predictor });

        info!(
            component = "forecast",
            event = "training.finish",
            device_id,
            train_windows = windows.train,
            validation_windows = windows.validation,
            test_windows = windows.test,
            test_rmse = report.test_metrics.map(|m| m.rmse)
        );

        Ok(report)
    }

    pub async fn record_reading(
        &self,
        device_id: &str,
        timestamp: DateTime<Utc>,
        power_watts: f64,
    ) -> Result<Reading, ForecastError> {
        validate_device_id(device_id)?;
        let store = Arc::clone(&self.store);
        let device = device_id.to_string();
        let _permit = self
            .fetch_permits
            .acquire()
            .await
            .map_err(|err| ForecastError::Worker(err.to_string()))?;
        let reading = tokio::task::spawn_blocking(move || store.save(&device, timestamp, power_watts))
            .await
            .map_err(|err| ForecastError::Worker(err.to_string()))??;
        Ok(reading)
    }

    pub async fn optimize_schedule(
        &self,
        device_id: &str,
        appliances: &[Appliance],
    ) -> Result<Schedule, ForecastError> {
        self.optimize_schedule_at(device_id, appliances, Utc::now()).await
    }

    pub async fn optimize_schedule_at(
        &self,
        device_id: &str,
        appliances: &[Appliance],
        now: DateTime<Utc>,
    ) -> Result<Schedule, ForecastError> {
        let max = Horizon::H24.hours();
        if let Some(bad) = appliances
            .iter()
            .find(|a| a.duration_hours == 0 || a.duration_hours > max)
        {
            return Err(ScheduleError::InvalidDuration {
                name: bad.name.clone(),
                duration_hours: bad.duration_hours,
                max,
            }
            .into());
        }

        let horizons = BTreeSet::from([Horizon::H24]);
        let forecast = self.forecast_at(device_id, &horizons, now).await?;
        let day = forecast
            .values(Horizon::H24)
            .ok_or(PredictorError::MissingHorizon(Horizon::H24))?;
        let schedule = optimize_schedule(
            device_id,
            &day,
            appliances,
            self.cfg.insights.rate_per_kwh,
            now,
        )?;

        info!(
            component = "forecast",
            event = "schedule.finish",
            device_id,
            appliances = schedule.schedule.len(),
            total_estimated_savings = schedule.total_estimated_savings
        );
        Ok(schedule)
    }

    /// Removes expired cache entries and returns how many were dropped.
    pub fn sweep_cache(&self, now: DateTime<Utc>) -> usize {
        self.cache.sweep(now)
    }

    /// Store reads run on the blocking pool, bounded by `fetch_workers`.
    async fn fetch_readings(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reading>, ForecastError> {
        let _permit = self
            .fetch_permits
            .acquire()
            .await
            .map_err(|err| ForecastError::Worker(err.to_string()))?;
        let store = Arc::clone(&self.store);
        let device = device_id.to_string();
        let readings = tokio::task::spawn_blocking(move || store.fetch(&device, start, end))
            .await
            .map_err(|err| ForecastError::Worker(err.to_string()))??;

        if readings.is_empty() {
            return Err(ForecastError::NoData {
                device_id: device_id.to_string(),
                start,
                end,
            });
        }
        debug!(
            component = "forecast",
            event = "forecast.stage.fetch",
            device_id,
            rows = readings.len()
        );
        Ok(readings)
    }
}

#[derive(Debug, Error)]
enum AnomalyStageError {
    #[error(transparent)]
    Predictor(#[from] PredictorError),
    #[error(transparent)]
    Scoring(#[from] AnomalyError),
}

fn validate_device_id(device_id: &str) -> Result<(), ForecastError> {
    if device_id.trim().is_empty() {
        return Err(ForecastError::InvalidRequest(
            "device_id must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Fewest windows whose chronological split leaves a non-empty training part.
fn min_training_windows(train_fraction: f64) -> usize {
    let mut windows = 1;
    while ((windows as f64 * train_fraction).floor() as usize) < 1 {
        windows += 1;
    }
    windows
}

/// Hourly points starting one hour after `now`.
fn points_from(now: DateTime<Utc>, values: &[f64]) -> Vec<ForecastPoint> {
    values
        .iter()
        .enumerate()
        .map(|(i, value)| ForecastPoint {
            timestamp: now + Duration::hours(i as i64 + 1),
            value: *value,
        })
        .collect()
}

/// 1h-horizon metrics in watts; `None` for an empty split.
fn evaluate_one_hour(
    predictor: &dyn Predictor,
    scaler: &ScalerState,
    set: &TrainingSet,
) -> Result<Option<ForecastMetrics>, ForecastError> {
    let Some(targets) = set.targets.get(&Horizon::H1) else {
        return Ok(None);
    };

    let mut actual = Vec::with_capacity(set.len());
    let mut predicted = Vec::with_capacity(set.len());
    for (i, target) in targets.iter().enumerate() {
        let window = InferenceWindow {
            power: set.power_windows[i].clone(),
            context: set.context_windows[i].clone(),
            end_timestamp: set.window_ends[i],
        };
        let forecast = predictor.predict(&window)?;
        let value = forecast
            .get(&Horizon::H1)
            .and_then(|v| v.first())
            .copied()
            .ok_or(PredictorError::MissingHorizon(Horizon::H1))?;
        predicted.push(scaler.power.inverse(value));
        actual.push(scaler.power.inverse(target[0]));
    }

    Ok(evaluate(&actual, &predicted))
}
