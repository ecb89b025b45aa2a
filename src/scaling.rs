//! Per-group normalization: the power column and the context columns are fit
//! independently on training rows, and the resulting `ScalerState` is the only
//! thing inference is allowed to transform with.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::sequences::SeriesMatrix;
use crate::stats::{mean, min_max, quantile, std_dev};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalerKind {
    #[default]
    Robust,
    MinMax,
    Standard,
}

impl FromStr for ScalerKind {
    type Err = ScalerError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "robust" => Ok(Self::Robust),
            "minmax" | "min_max" => Ok(Self::MinMax),
            "standard" => Ok(Self::Standard),
            other => Err(ScalerError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ScalerError {
    #[error("cannot fit a scaler on an empty series")]
    Empty,
    #[error("no training-fit scaler state for device {0}")]
    NotFitted(String),
    #[error("context columns do not match the fitted state (expected {expected}, found {found})")]
    ContextMismatch { expected: String, found: String },
    #[error("unknown scaler kind: {0}")]
    UnknownKind(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// `scaled = (x - center) / scale`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColumnScaler {
    pub center: f64,
    pub scale: f64,
}

impl ColumnScaler {
    pub fn fit(kind: ScalerKind, values: &[f64]) -> Result<Self, ScalerError> {
        let (center, spread) = match kind {
            ScalerKind::Robust => {
                let median = quantile(values, 0.5).ok_or(ScalerError::Empty)?;
                let q1 = quantile(values, 0.25).ok_or(ScalerError::Empty)?;
                let q3 = quantile(values, 0.75).ok_or(ScalerError::Empty)?;
                (median, q3 - q1)
            }
            ScalerKind::MinMax => {
                let (lo, hi) = min_max(values).ok_or(ScalerError::Empty)?;
                (lo, hi - lo)
            }
            ScalerKind::Standard => {
                let mu = mean(values).ok_or(ScalerError::Empty)?;
                (mu, std_dev(values).ok_or(ScalerError::Empty)?)
            }
        };
        // Constant columns pass through shifted but unscaled.
        let scale = if spread.abs() > f64::EPSILON { spread } else { 1.0 };
        Ok(Self { center, scale })
    }

    pub fn transform(&self, value: f64) -> f64 {
        (value - self.center) / self.scale
    }

    pub fn inverse(&self, value: f64) -> f64 {
        value * self.scale + self.center
    }
}

/// Power values of any rank: a single forecast, per-horizon rows, or a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PowerTensor {
    Vector(Vec<f64>),
    Matrix(Vec<Vec<f64>>),
    Cube(Vec<Vec<Vec<f64>>>),
}

impl PowerTensor {
    pub fn rank(&self) -> usize {
        match self {
            Self::Vector(_) => 1,
            Self::Matrix(_) => 2,
            Self::Cube(_) => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    pub kind: ScalerKind,
    pub power: ColumnScaler,
    pub context: Vec<ColumnScaler>,
    pub context_columns: Vec<String>,
    pub context_fingerprint: String,
    pub fitted_rows: usize,
}

impl ScalerState {
    pub fn fit(kind: ScalerKind, series: &SeriesMatrix) -> Result<Self, ScalerError> {
        if series.is_empty() {
            return Err(ScalerError::Empty);
        }

        let power = ColumnScaler::fit(kind, &series.power)?;
        let context = (0..series.context_width())
            .map(|col| {
                let column: Vec<f64> = series.context.iter().map(|row| row[col]).collect();
                ColumnScaler::fit(kind, &column)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let state = Self {
            kind,
            power,
            context,
            context_columns: series.context_columns.clone(),
            context_fingerprint: context_fingerprint(&series.context_columns),
            fitted_rows: series.len(),
        };

        info!(
            component = "scaling",
            event = "scaling.fit.finish",
            kind = ?kind,
            rows = state.fitted_rows,
            context_width = state.context.len()
        );

        Ok(state)
    }

    pub fn transform(&self, series: &SeriesMatrix) -> Result<SeriesMatrix, ScalerError> {
        let found = context_fingerprint(&series.context_columns);
        if found != self.context_fingerprint || series.context_width() != self.context.len() {
            return Err(ScalerError::ContextMismatch {
                expected: self.context_fingerprint.clone(),
                found,
            });
        }

        Ok(SeriesMatrix {
            timestamps: series.timestamps.clone(),
            power: self.transform_power(&series.power),
            context: series
                .context
                .iter()
                .map(|row| {
                    row.iter()
                        .zip(&self.context)
                        .map(|(value, scaler)| scaler.transform(*value))
                        .collect()
                })
                .collect(),
            context_columns: series.context_columns.clone(),
        })
    }

    pub fn transform_power(&self, values: &[f64]) -> Vec<f64> {
        values.iter().map(|v| self.power.transform(*v)).collect()
    }

    /// Maps scaled power values back to watts, keeping the input's shape.
    pub fn inverse_transform(&self, values: PowerTensor) -> PowerTensor {
        match values {
            PowerTensor::Vector(v) => PowerTensor::Vector(self.inverse_power(&v)),
            PowerTensor::Matrix(rows) => PowerTensor::Matrix(self.inverse_rows(&rows)),
            PowerTensor::Cube(batch) => {
                // Flatten to rows, invert, then restore the original nesting.
                let shape: Vec<usize> = batch.iter().map(Vec::len).collect();
                let flat: Vec<Vec<f64>> = batch.into_iter().flatten().collect();
                let mut rows = self.inverse_rows(&flat).into_iter();
                PowerTensor::Cube(
                    shape
                        .iter()
                        .map(|len| rows.by_ref().take(*len).collect())
                        .collect(),
                )
            }
        }
    }

    fn inverse_rows(&self, rows: &[Vec<f64>]) -> Vec<Vec<f64>> {
        rows.iter().map(|row| self.inverse_power(row)).collect()
    }

    pub fn inverse_power(&self, values: &[f64]) -> Vec<f64> {
        values.iter().map(|v| self.power.inverse(*v)).collect()
    }

    pub fn save_json(&self, path: &Path) -> Result<(), ScalerError> {
        let body = serde_json::to_string_pretty(self)?;
        fs::write(path, body)?;
        Ok(())
    }

    pub fn load_json(path: &Path) -> Result<Self, ScalerError> {
        let body = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&body)?)
    }
}

pub const SCALER_FILE_SUFFIX: &str = ".scaler.json";

/// `<dir>/<device_id>.scaler.json`
pub fn scaler_path(dir: &Path, device_id: &str) -> PathBuf {
    dir.join(format!("{device_id}{SCALER_FILE_SUFFIX}"))
}

/// Device ids and paths of every persisted scaler in `dir`, sorted by device.
/// A missing directory holds no scalers.
pub fn saved_scalers(dir: &Path) -> Result<Vec<(String, PathBuf)>, ScalerError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut out = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let device_id = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_suffix(SCALER_FILE_SUFFIX))
            .filter(|device_id| !device_id.is_empty())
            .map(str::to_string);
        if let Some(device_id) = device_id {
            out.push((device_id, path));
        }
    }
    out.sort();
    Ok(out)
}

fn context_fingerprint(columns: &[String]) -> String {
    let mut hasher = Sha256::new();
    for column in columns {
        hasher.update(column.as_bytes());
        hasher.update(b";");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn matrix() -> SeriesMatrix {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let power = vec![10.0, 12.0, 11.0, 40.0, 13.0, 12.5];
        let timestamps = (0..power.len()).map(|h| t0 + Duration::hours(h as i64)).collect();
        let context = power.iter().map(|p| vec![p / 2.0, 5.0]).collect();
        SeriesMatrix::new(
            timestamps,
            power,
            context,
            vec!["half".to_string(), "constant".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn robust_scaler_uses_median_and_iqr() {
        let scaler = ColumnScaler::fit(ScalerKind::Robust, &[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(scaler.center, 3.0);
        assert_eq!(scaler.scale, 2.0);
    }

    #[test]
    fn constant_column_keeps_unit_scale() {
        for kind in [ScalerKind::Robust, ScalerKind::MinMax, ScalerKind::Standard] {
            let scaler = ColumnScaler::fit(kind, &[5.0; 4]).unwrap();
            assert_eq!(scaler.scale, 1.0);
            assert_eq!(scaler.transform(5.0), 0.0);
        }
    }

    #[test]
    fn inverse_restores_every_rank() {
        for kind in [ScalerKind::Robust, ScalerKind::MinMax, ScalerKind::Standard] {
            let state = ScalerState::fit(kind, &matrix()).unwrap();
            let raw = vec![
                vec![vec![10.0, 20.0], vec![30.0]],
                vec![vec![0.5, 7.25, 100.0]],
            ];
            let scaled = PowerTensor::Cube(
                raw.iter()
                    .map(|m| m.iter().map(|r| state.transform_power(r)).collect())
                    .collect(),
            );
            let PowerTensor::Cube(back) = state.inverse_transform(scaled) else {
                panic!("rank changed");
            };
            for (a, b) in raw.iter().flatten().flatten().zip(back.iter().flatten().flatten()) {
                assert!((a - b).abs() < 1e-9);
            }
            assert_eq!(back[0].len(), 2);
            assert_eq!(back[1][0].len(), 3);

            let single = state.inverse_transform(PowerTensor::Vector(state.transform_power(&[15.0])));
            assert_eq!(single.rank(), 1);
        }
    }

    #[test]
    fn transform_rejects_other_context_columns() {
        let state = ScalerState::fit(ScalerKind::Robust, &matrix()).unwrap();
        let mut other = matrix();
        other.context_columns = vec!["half".to_string(), "renamed".to_string()];
        assert!(matches!(
            state.transform(&other),
            Err(ScalerError::ContextMismatch { .. })
        ));
    }

    #[test]
    fn state_survives_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scaler.json");
        let state = ScalerState::fit(ScalerKind::MinMax, &matrix()).unwrap();
        state.save_json(&path).unwrap();
        let loaded = ScalerState::load_json(&path).unwrap();
        assert_eq!(loaded.kind, state.kind);
        assert_eq!(loaded.context_fingerprint, state.context_fingerprint);
        assert_eq!(loaded.context.len(), 2);
        assert!((loaded.power.center - state.power.center).abs() < 1e-12);
        assert!((loaded.power.scale - state.power.scale).abs() < 1e-12);
    }

    #[test]
    fn saved_scalers_lists_devices_by_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let state = ScalerState::fit(ScalerKind::Robust, &matrix()).unwrap();
        state.save_json(&scaler_path(dir.path(), "plug")).unwrap();
        state.save_json(&scaler_path(dir.path(), "fridge")).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let found = saved_scalers(dir.path()).unwrap();
        let devices: Vec<&str> = found.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(devices, vec!["fridge", "plug"]);
        assert_eq!(found[1].1, dir.path().join("plug.scaler.json"));

        assert!(saved_scalers(&dir.path().join("absent")).unwrap().is_empty());
    }

    #[test]
    fn kind_parses_from_config_strings() {
        assert_eq!("MinMax".parse::<ScalerKind>().unwrap(), ScalerKind::MinMax);
        assert!("zscore".parse::<ScalerKind>().is_err());
    }
}
