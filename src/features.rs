//! Readings-to-features transform.
//!
//! Every reading becomes one `FeatureRow` whose `values` line up with the
//! columns of a deterministic `FeatureSchema`:
//! - calendar fields, sine/cosine encodings and peak/sleep/work flags
//! - weather fields (synthetic unless supplied) and temperature flags
//! - lagged power, rolling mean/std/min/max and exponential moving averages
//! - per-device mean/std and power relative to the device mean
//!
//! Features that need more history than is available are `None`; such rows
//! stay in the table (they still take part in outlier detection) and are
//! dropped when the table is turned into a `SeriesMatrix`.

use std::collections::HashSet;
use std::f64::consts::PI;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::outliers::{iqr_outliers, isolation_forest_outliers, IsolationForestConfig};
use crate::readings::{validate_power, Reading};
use crate::stats::{mean, min_max, sample_std_dev, std_dev};
use crate::weather::{SuppliedWeather, SyntheticWeather, WeatherProvider, WeatherSample};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;
pub const TARGET_COLUMN: &str = "power_watts";

const DEVICE_MEAN_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub lags: Vec<usize>,
    pub rolling_windows: Vec<usize>,
    pub ema_alphas: Vec<f64>,
    pub iqr_multiplier: f64,
    pub multivariate_min_rows: usize,
    pub contamination: f64,
    pub anomaly_seed: u64,
    pub schema_version: u32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            lags: vec![1, 2, 6, 12, 24],
            rolling_windows: vec![6, 12, 24],
            ema_alphas: vec![0.1, 0.3, 0.7],
            iqr_multiplier: 1.5,
            multivariate_min_rows: 50,
            contamination: 0.1,
            anomaly_seed: 42,
            schema_version: FEATURE_SCHEMA_VERSION,
        }
    }
}

impl FeatureConfig {
    /// Rows at the head of a series that cannot carry every lag/rolling feature.
    pub fn warmup_rows(&self) -> usize {
        let max_lag = self.lags.iter().copied().max().unwrap_or(0);
        let max_window = self
            .rolling_windows
            .iter()
            .copied()
            .max()
            .map(|w| w.saturating_sub(1))
            .unwrap_or(0);
        max_lag.max(max_window)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureGroup {
    Time,
    Weather,
    Lag,
    Rolling,
    Ema,
    Device,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub group: FeatureGroup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TempCategory {
    Cold,
    Cool,
    Warm,
    Hot,
}

impl TempCategory {
    pub fn from_celsius(temperature: f64) -> Self {
        if temperature < 10.0 {
            Self::Cold
        } else if temperature < 20.0 {
            Self::Cool
        } else if temperature < 30.0 {
            Self::Warm
        } else {
            Self::Hot
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub power_watts: f64,
    pub temp_category: Option<TempCategory>,
    pub is_anomaly: bool,
    pub values: Vec<Option<f64>>,
}

impl FeatureRow {
    pub fn is_complete(&self) -> bool {
        self.values.iter().all(Option::is_some)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    pub schema: FeatureSchema,
    pub rows: Vec<FeatureRow>,
}

impl FeatureTable {
    pub fn complete_rows(&self) -> impl Iterator<Item = &FeatureRow> {
        self.rows.iter().filter(|row| row.is_complete())
    }

    pub fn complete_len(&self) -> usize {
        self.complete_rows().count()
    }

    pub fn anomaly_count(&self) -> usize {
        self.rows.iter().filter(|row| row.is_anomaly).count()
    }

    pub fn value(&self, row: usize, column: &str) -> Option<f64> {
        let idx = self.schema.column_index(column)?;
        self.rows.get(row)?.values.get(idx).copied().flatten()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataQualityReport {
    pub total_records: usize,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub mean_power: Option<f64>,
    pub std_power: Option<f64>,
    pub min_power: Option<f64>,
    pub max_power: Option<f64>,
    pub zero_values: usize,
    pub anomaly_count: usize,
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("invalid feature config: {0}")]
    InvalidConfig(String),
    #[error("invalid reading at {timestamp}: {reason}")]
    InvalidReading {
        timestamp: DateTime<Utc>,
        reason: String,
    },
    #[error("readings mix devices {first} and {other}")]
    MixedDevices { first: String, other: String },
}

pub fn build_feature_schema(cfg: &FeatureConfig) -> FeatureSchema {
    let mut columns = Vec::new();
    let mut push = |name: String, group: FeatureGroup| columns.push(FeatureColumn { name, group });

    for name in TIME_COLUMNS {
        push(name.to_string(), FeatureGroup::Time);
    }
    for name in WEATHER_COLUMNS {
        push(name.to_string(), FeatureGroup::Weather);
    }
    for lag in &cfg.lags {
        push(format!("{TARGET_COLUMN}_lag_{lag}"), FeatureGroup::Lag);
    }
    for window in &cfg.rolling_windows {
        for stat in ["mean", "std", "min", "max"] {
            push(
                format!("{TARGET_COLUMN}_rolling_{stat}_{window}"),
                FeatureGroup::Rolling,
            );
        }
    }
    for alpha in &cfg.ema_alphas {
        push(format!("{TARGET_COLUMN}_ema_{alpha}"), FeatureGroup::Ema);
    }
    for name in DEVICE_COLUMNS {
        push(name.to_string(), FeatureGroup::Device);
    }

    let fingerprint = schema_fingerprint(cfg.schema_version, &columns);
    FeatureSchema {
        version: cfg.schema_version,
        fingerprint,
        columns,
    }
}

const TIME_COLUMNS: [&str; 17] = [
    "hour",
    "day_of_week",
    "day_of_month",
    "month",
    "quarter",
    "is_weekend",
    "hour_sin",
    "hour_cos",
    "day_sin",
    "day_cos",
    "month_sin",
    "month_cos",
    "is_morning_peak",
    "is_evening_peak",
    "is_peak_hour",
    "is_sleep_hour",
    "is_work_hour",
];

const WEATHER_COLUMNS: [&str; 7] = [
    "temperature",
    "humidity",
    "cloud_cover",
    "temp_cold",
    "temp_hot",
    "heating_likely",
    "cooling_likely",
];

const DEVICE_COLUMNS: [&str; 3] = [
    "device_mean_power",
    "device_std_power",
    "power_relative_to_device_mean",
];

pub fn validate_feature_config(cfg: &FeatureConfig) -> Result<(), FeatureError> {
    if cfg.schema_version != FEATURE_SCHEMA_VERSION {
        return Err(FeatureError::InvalidConfig(format!(
            "schema_version must equal FEATURE_SCHEMA_VERSION ({FEATURE_SCHEMA_VERSION})"
        )));
    }

    let mut seen = HashSet::new();
    for lag in &cfg.lags {
        if *lag == 0 {
            return Err(FeatureError::InvalidConfig("lags must be > 0".to_string()));
        }
        if !seen.insert(*lag) {
            return Err(FeatureError::InvalidConfig("lags must be unique".to_string()));
        }
    }

    let mut seen = HashSet::new();
    for window in &cfg.rolling_windows {
        if *window < 2 {
            return Err(FeatureError::InvalidConfig(
                "rolling_windows entries must be >= 2".to_string(),
            ));
        }
        if !seen.insert(*window) {
            return Err(FeatureError::InvalidConfig(
                "rolling_windows entries must be unique".to_string(),
            ));
        }
    }

    if cfg.ema_alphas.iter().any(|a| !(*a > 0.0 && *a <= 1.0)) {
        return Err(FeatureError::InvalidConfig(
            "ema_alphas must lie in (0, 1]".to_string(),
        ));
    }
    if !(cfg.contamination > 0.0 && cfg.contamination < 0.5) {
        return Err(FeatureError::InvalidConfig(
            "contamination must lie in (0, 0.5)".to_string(),
        ));
    }
    if !(cfg.iqr_multiplier > 0.0) {
        return Err(FeatureError::InvalidConfig(
            "iqr_multiplier must be > 0".to_string(),
        ));
    }

    Ok(())
}

#[derive(Clone)]
pub struct FeatureEngineer {
    cfg: FeatureConfig,
    schema: FeatureSchema,
    weather: Arc<dyn WeatherProvider>,
}

impl FeatureEngineer {
    pub fn new(cfg: FeatureConfig) -> Result<Self, FeatureError> {
        validate_feature_config(&cfg)?;
        let schema = build_feature_schema(&cfg);
        Ok(Self {
            cfg,
            schema,
            weather: Arc::new(SyntheticWeather::default()),
        })
    }

    /// Replaces the weather source used when `augment` gets no explicit samples.
    pub fn with_weather_provider(mut self, provider: Arc<dyn WeatherProvider>) -> Self {
        self.weather = provider;
        self
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.cfg
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    /// Derives the feature table. Explicit `weather` samples take precedence
    /// over the configured provider; timestamps they do not cover yield
    /// incomplete rows.
    pub fn augment(
        &self,
        readings: &[Reading],
        weather: Option<&[WeatherSample]>,
    ) -> Result<FeatureTable, FeatureError> {
        match weather {
            Some(samples) => self.augment_with(readings, &SuppliedWeather::new(samples)),
            None => self.augment_with(readings, self.weather.as_ref()),
        }
    }

    pub fn augment_with(
        &self,
        readings: &[Reading],
        provider: &dyn WeatherProvider,
    ) -> Result<FeatureTable, FeatureError> {
        let ordered = ordered_readings(readings)?;
        let power: Vec<f64> = ordered.iter().map(|r| r.power_watts).collect();
        let timestamps: Vec<DateTime<Utc>> = ordered.iter().map(|r| r.timestamp).collect();
        let weather = provider.samples_for(&timestamps);

        let device_mean = mean(&power);
        let device_std = sample_std_dev(&power);
        let ema_columns: Vec<Vec<f64>> = self
            .cfg
            .ema_alphas
            .iter()
            .map(|alpha| adjusted_ema(&power, *alpha))
            .collect();

        let mut rows = Vec::with_capacity(ordered.len());
        for (i, reading) in ordered.iter().enumerate() {
            let mut values: Vec<Option<f64>> = Vec::with_capacity(self.schema.columns.len());
            values.extend(time_features(reading.timestamp).into_iter().map(Some));

            let sample = weather.get(i).copied().flatten();
            values.extend(weather_features(sample));

            for lag in &self.cfg.lags {
                values.push(i.checked_sub(*lag).map(|j| power[j]));
            }

            for window in &self.cfg.rolling_windows {
                values.extend(rolling_features(&power, i, *window));
            }

            for ema in &ema_columns {
                values.push(Some(ema[i]));
            }

            values.push(device_mean);
            values.push(device_std);
            values.push(device_mean.map(|m| reading.power_watts / (m + DEVICE_MEAN_EPSILON)));

            rows.push(FeatureRow {
                device_id: reading.device_id.clone(),
                timestamp: reading.timestamp,
                power_watts: reading.power_watts,
                temp_category: sample.map(|s| TempCategory::from_celsius(s.temperature)),
                is_anomaly: false,
                values,
            });
        }

        let flags = self.anomaly_flags(&rows);
        for (row, flag) in rows.iter_mut().zip(flags) {
            row.is_anomaly = flag;
        }

        let table = FeatureTable {
            schema: self.schema.clone(),
            rows,
        };

        info!(
            component = "features",
            event = "features.augment.finish",
            input_rows = readings.len(),
            complete_rows = table.complete_len(),
            anomalies = table.anomaly_count(),
            column_count = table.schema.columns.len(),
            fingerprint = %table.schema.fingerprint
        );

        Ok(table)
    }

    /// IQR outliers on power, unioned with isolation-forest outliers once
    /// enough rows are available for the multivariate detector.
    fn anomaly_flags(&self, rows: &[FeatureRow]) -> Vec<bool> {
        let power: Vec<f64> = rows.iter().map(|r| r.power_watts).collect();
        let mut flags = iqr_outliers(&power, self.cfg.iqr_multiplier);

        if rows.len() >= self.cfg.multivariate_min_rows {
            let matrix: Vec<Vec<f64>> = rows
                .iter()
                .map(|row| {
                    std::iter::once(row.power_watts)
                        .chain(row.values.iter().map(|v| v.unwrap_or(0.0)))
                        .collect()
                })
                .collect();
            let forest_cfg = IsolationForestConfig {
                contamination: self.cfg.contamination,
                seed: self.cfg.anomaly_seed,
                ..IsolationForestConfig::default()
            };
            let forest = isolation_forest_outliers(&matrix, &forest_cfg);
            for (flag, forest_flag) in flags.iter_mut().zip(forest) {
                *flag |= forest_flag;
            }
        }

        flags
    }

    pub fn data_quality_report(&self, readings: &[Reading]) -> DataQualityReport {
        let power: Vec<f64> = readings.iter().map(|r| r.power_watts).collect();
        let mut flags = iqr_outliers(&power, self.cfg.iqr_multiplier);
        if power.len() >= self.cfg.multivariate_min_rows {
            let matrix: Vec<Vec<f64>> = power.iter().map(|p| vec![*p]).collect();
            let forest_cfg = IsolationForestConfig {
                contamination: self.cfg.contamination,
                seed: self.cfg.anomaly_seed,
                ..IsolationForestConfig::default()
            };
            for (flag, forest_flag) in flags
                .iter_mut()
                .zip(isolation_forest_outliers(&matrix, &forest_cfg))
            {
                *flag |= forest_flag;
            }
        }

        let bounds = min_max(&power);
        DataQualityReport {
            total_records: readings.len(),
            start: readings.iter().map(|r| r.timestamp).min(),
            end: readings.iter().map(|r| r.timestamp).max(),
            mean_power: mean(&power),
            std_power: sample_std_dev(&power).or_else(|| std_dev(&power)),
            min_power: bounds.map(|(lo, _)| lo),
            max_power: bounds.map(|(_, hi)| hi),
            zero_values: power.iter().filter(|p| **p == 0.0).count(),
            anomaly_count: flags.iter().filter(|f| **f).count(),
        }
    }
}

fn ordered_readings(readings: &[Reading]) -> Result<Vec<Reading>, FeatureError> {
    let mut ordered = readings.to_vec();
    if let Some(first) = ordered.first() {
        let first_device = first.device_id.clone();
        for reading in &ordered {
            if reading.device_id != first_device {
                return Err(FeatureError::MixedDevices {
                    first: first_device,
                    other: reading.device_id.clone(),
                });
            }
            validate_power(reading.power_watts).map_err(|reason| FeatureError::InvalidReading {
                timestamp: reading.timestamp,
                reason,
            })?;
        }
    }
    ordered.sort_by_key(|r| r.timestamp);
    Ok(ordered)
}

fn time_features(ts: DateTime<Utc>) -> [f64; 17] {
    let hour = ts.hour();
    let weekday = ts.weekday().num_days_from_monday();
    let month = ts.month();
    let quarter = (month - 1) / 3 + 1;
    let is_weekend = weekday >= 5;
    let morning_peak = (7..=9).contains(&hour);
    let evening_peak = (18..=20).contains(&hour);
    let sleep = hour >= 23 || hour <= 6;
    let work = (9..=17).contains(&hour) && !is_weekend;

    let (hour_sin, hour_cos) = cyclical(hour as f64, 24.0);
    let (day_sin, day_cos) = cyclical(weekday as f64, 7.0);
    let (month_sin, month_cos) = cyclical(month as f64, 12.0);

    [
        hour as f64,
        weekday as f64,
        ts.day() as f64,
        month as f64,
        quarter as f64,
        flag(is_weekend),
        hour_sin,
        hour_cos,
        day_sin,
        day_cos,
        month_sin,
        month_cos,
        flag(morning_peak),
        flag(evening_peak),
        flag(morning_peak || evening_peak),
        flag(sleep),
        flag(work),
    ]
}

fn cyclical(value: f64, period: f64) -> (f64, f64) {
    let angle = 2.0 * PI * value / period;
    (angle.sin(), angle.cos())
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

fn weather_features(sample: Option<WeatherSample>) -> [Option<f64>; 7] {
    let Some(sample) = sample else {
        return [None; 7];
    };
    let category = TempCategory::from_celsius(sample.temperature);
    [
        Some(sample.temperature),
        Some(sample.humidity),
        Some(sample.cloud_cover),
        Some(flag(category == TempCategory::Cold)),
        Some(flag(category == TempCategory::Hot)),
        Some(flag(sample.temperature <= 15.0)),
        Some(flag(sample.temperature >= 25.0)),
    ]
}

/// Mean, sample std, min and max of the `window` values ending at `i`.
fn rolling_features(power: &[f64], i: usize, window: usize) -> [Option<f64>; 4] {
    if i + 1 < window {
        return [None; 4];
    }
    let slice = &power[i + 1 - window..=i];
    let bounds = min_max(slice);
    [
        mean(slice),
        sample_std_dev(slice),
        bounds.map(|(lo, _)| lo),
        bounds.map(|(_, hi)| hi),
    ]
}

/// Bias-adjusted exponentially weighted mean, defined from the first value on.
fn adjusted_ema(values: &[f64], alpha: f64) -> Vec<f64> {
    let decay = 1.0 - alpha;
    let mut num = 0.0;
    let mut den = 0.0;
    values
        .iter()
        .map(|v| {
            num = *v + decay * num;
            den = 1.0 + decay * den;
            num / den
        })
        .collect()
}

fn schema_fingerprint(version: u32, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{version};columns:"));
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(":f64;");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn sleep_and_work_flags_follow_fixed_thresholds() {
        // 2025-01-06 is a Monday.
        let monday = |h| Utc.with_ymd_and_hms(2025, 1, 6, h, 0, 0).unwrap();
        let saturday_noon = Utc.with_ymd_and_hms(2025, 1, 11, 12, 0, 0).unwrap();

        let f6 = time_features(monday(6));
        let f7 = time_features(monday(7));
        let f17 = time_features(monday(17));
        let f23 = time_features(monday(23));
        let sat = time_features(saturday_noon);

        assert_eq!(f6[15], 1.0, "06:00 is still sleep");
        assert_eq!(f7[15], 0.0);
        assert_eq!(f7[12], 1.0, "07:00 opens the morning peak");
        assert_eq!(f17[16], 1.0, "17:00 is a work hour");
        assert_eq!(f23[15], 1.0);
        assert_eq!(sat[16], 0.0, "weekends have no work hours");
        assert_eq!(sat[5], 1.0);
    }

    #[test]
    fn hour_encoding_is_continuous_across_midnight() {
        let (s23, c23) = cyclical(23.0, 24.0);
        let (s0, c0) = cyclical(0.0, 24.0);
        let gap = ((s23 - s0).powi(2) + (c23 - c0).powi(2)).sqrt();
        assert!(gap < 0.3);
    }

    #[test]
    fn temperature_buckets_and_comfort_flags() {
        assert_eq!(TempCategory::from_celsius(9.9), TempCategory::Cold);
        assert_eq!(TempCategory::from_celsius(10.0), TempCategory::Cool);
        assert_eq!(TempCategory::from_celsius(20.0), TempCategory::Warm);
        assert_eq!(TempCategory::from_celsius(30.0), TempCategory::Hot);

        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let at = |t| WeatherSample {
            timestamp: ts,
            temperature: t,
            humidity: 50.0,
            cloud_cover: 0.0,
        };
        let cool = weather_features(Some(at(15.0)));
        assert_eq!(cool[5], Some(1.0));
        assert_eq!(cool[6], Some(0.0));
        let warm = weather_features(Some(at(25.0)));
        assert_eq!(warm[5], Some(0.0));
        assert_eq!(warm[6], Some(1.0));
        assert_eq!(weather_features(None), [None; 7]);
    }

    #[test]
    fn rolling_window_of_constant_values_has_zero_std() {
        let power = vec![15.0; 12];
        let stats = rolling_features(&power, 11, 6);
        assert_eq!(stats, [Some(15.0), Some(0.0), Some(15.0), Some(15.0)]);
        assert_eq!(rolling_features(&power, 4, 6), [None; 4]);
    }

    #[test]
    fn adjusted_ema_starts_at_first_value() {
        let ema = adjusted_ema(&[10.0, 20.0], 0.5);
        assert_eq!(ema[0], 10.0);
        // (20 + 0.5*10) / (1 + 0.5)
        assert!((ema[1] - 25.0 / 1.5).abs() < 1e-12);
    }

    #[test]
    fn warmup_rows_cover_largest_lag() {
        let cfg = FeatureConfig::default();
        assert_eq!(cfg.warmup_rows(), 24);

        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let readings: Vec<Reading> = (0..30)
            .map(|h| Reading::new("plug", t0 + Duration::hours(h), 10.0 + (h % 4) as f64))
            .collect();
        let table = FeatureEngineer::new(cfg).unwrap().augment(&readings, None).unwrap();
        assert_eq!(table.rows.len(), 30);
        assert_eq!(table.complete_len(), 6);
        assert!(!table.rows[23].is_complete());
        assert!(table.rows[24].is_complete());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = FeatureConfig {
            rolling_windows: vec![1],
            ..FeatureConfig::default()
        };
        assert!(matches!(
            validate_feature_config(&cfg),
            Err(FeatureError::InvalidConfig(_))
        ));

        let cfg = FeatureConfig {
            lags: vec![2, 2],
            ..FeatureConfig::default()
        };
        assert!(validate_feature_config(&cfg).is_err());
    }
}
