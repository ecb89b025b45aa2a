//! Pipeline configuration with `POWERCAST_*` environment overrides.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::features::{validate_feature_config, FeatureConfig, FeatureError};
use crate::insights::{validate_insight_config, InsightConfig, InsightError};
use crate::scaling::ScalerKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastConfig {
    pub lookback_days: i64,
    pub training_lookback_days: i64,
    pub sequence_length: usize,
    pub stochastic_draws: usize,
    pub cache_ttl_seconds: i64,
    pub fetch_workers: usize,
    pub scaler: ScalerKind,
    pub train_fraction: f64,
    pub validation_fraction: f64,
    pub predictor_seed: u64,
    pub features: FeatureConfig,
    pub insights: InsightConfig,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            lookback_days: 7,
            training_lookback_days: 30,
            sequence_length: 24,
            stochastic_draws: 100,
            cache_ttl_seconds: 600,
            fetch_workers: 4,
            scaler: ScalerKind::Robust,
            train_fraction: 0.7,
            validation_fraction: 0.15,
            predictor_seed: 42,
            features: FeatureConfig::default(),
            insights: InsightConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid forecast config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Insight(#[from] InsightError),
}

pub fn validate_forecast_config(cfg: &ForecastConfig) -> Result<(), ConfigError> {
    if cfg.lookback_days <= 0 || cfg.training_lookback_days <= 0 {
        return Err(ConfigError::InvalidConfig(
            "lookback windows must be > 0 days".to_string(),
        ));
    }
    if cfg.sequence_length == 0 {
        return Err(ConfigError::InvalidConfig(
            "sequence_length must be > 0".to_string(),
        ));
    }
    if cfg.stochastic_draws == 0 {
        return Err(ConfigError::InvalidConfig(
            "stochastic_draws must be > 0".to_string(),
        ));
    }
    if cfg.cache_ttl_seconds < 0 {
        return Err(ConfigError::InvalidConfig(
            "cache_ttl_seconds must be >= 0".to_string(),
        ));
    }
    if cfg.fetch_workers == 0 {
        return Err(ConfigError::InvalidConfig(
            "fetch_workers must be > 0".to_string(),
        ));
    }
    let fractions_ok = cfg.train_fraction > 0.0
        && cfg.validation_fraction >= 0.0
        && cfg.train_fraction + cfg.validation_fraction < 1.0;
    if !fractions_ok {
        return Err(ConfigError::InvalidConfig(
            "train/validation fractions must be positive and leave room for a test split"
                .to_string(),
        ));
    }

    validate_feature_config(&cfg.features)?;
    validate_insight_config(&cfg.insights)?;
    Ok(())
}

pub fn forecast_config_from_env() -> ForecastConfig {
    let mut config = ForecastConfig::default();

    override_from_env("POWERCAST_LOOKBACK_DAYS", &mut config.lookback_days);
    override_from_env(
        "POWERCAST_TRAINING_LOOKBACK_DAYS",
        &mut config.training_lookback_days,
    );
    override_from_env("POWERCAST_SEQUENCE_LENGTH", &mut config.sequence_length);
    override_from_env("POWERCAST_STOCHASTIC_DRAWS", &mut config.stochastic_draws);
    override_from_env("POWERCAST_CACHE_TTL_SECONDS", &mut config.cache_ttl_seconds);
    override_from_env("POWERCAST_FETCH_WORKERS", &mut config.fetch_workers);
    override_from_env("POWERCAST_SCALER", &mut config.scaler);
    override_from_env("POWERCAST_RATE_PER_KWH", &mut config.insights.rate_per_kwh);
    override_from_env(
        "POWERCAST_COST_ALERT_THRESHOLD",
        &mut config.insights.cost_alert_threshold,
    );

    config
}

/// Where the binaries listen and keep their files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    pub addr: String,
    pub store_path: PathBuf,
    /// Holds one `<device>.scaler.json` per trained device.
    pub model_dir: PathBuf,
}

impl Default for RuntimePaths {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
            store_path: PathBuf::from("powercast.sqlite"),
            model_dir: PathBuf::from("models"),
        }
    }
}

pub fn runtime_paths_from_env() -> RuntimePaths {
    let mut paths = RuntimePaths::default();
    override_from_env("POWERCAST_ADDR", &mut paths.addr);
    override_from_env("POWERCAST_STORE_PATH", &mut paths.store_path);
    override_from_env("POWERCAST_MODEL_DIR", &mut paths.model_dir);
    paths
}

/// Unset, blank or unparseable values keep the current setting.
pub(crate) fn override_from_env<T: FromStr>(key: &str, target: &mut T) {
    let Ok(raw) = env::var(key) else {
        return;
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return;
    }
    if let Ok(parsed) = trimmed.parse::<T>() {
        *target = parsed;
    }
}

/// Like `override_from_env`, also accepting `1/0`, `yes/no` and `on/off`.
pub(crate) fn flag_from_env(key: &str, target: &mut bool) {
    let Ok(raw) = env::var(key) else {
        return;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => *target = true,
        "0" | "false" | "no" | "off" => *target = false,
        _ => {}
    }
}

#[cfg(test)]
pub(crate) mod test_env {
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    /// Runs `f` with `vars` applied, restoring the previous values afterwards.
    /// Serialized so tests touching the process environment do not interleave.
    pub(crate) fn with_env_vars<R>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> R) -> R {
        let _guard = env_lock().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, _)| ((*key).to_string(), env::var(key).ok()))
            .collect();

        for (key, value) in vars {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
        let output = f();
        for (key, value) in previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
        output
    }
}
