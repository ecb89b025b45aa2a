//! Fixed-length window construction over complete feature rows.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::features::{FeatureSchema, FeatureTable, TARGET_COLUMN};
use crate::horizon::{max_horizon_hours, Horizon};

/// Columns that never enter the context group.
pub const EXCLUDED_CONTEXT_COLUMNS: [&str; 5] = [
    "timestamp",
    "device_id",
    TARGET_COLUMN,
    "is_anomaly",
    "temp_category",
];

/// Width of the zero-filled context used when no context columns survive.
pub const FALLBACK_CONTEXT_WIDTH: usize = 7;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SequenceError {
    #[error("insufficient data: need ≥ {required}, got {available}")]
    InsufficientData { required: usize, available: usize },
    #[error("sequence_length must be > 0")]
    ZeroSequenceLength,
    #[error("at least one horizon is required")]
    NoHorizons,
    #[error("series columns disagree: {0}")]
    Ragged(String),
}

/// Names of the schema columns that make up the context group.
pub fn context_columns(schema: &FeatureSchema) -> Vec<String> {
    schema
        .columns
        .iter()
        .filter(|col| !EXCLUDED_CONTEXT_COLUMNS.contains(&col.name.as_str()))
        .map(|col| col.name.clone())
        .collect()
}

/// Complete rows split into the target column and the numeric context columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesMatrix {
    pub timestamps: Vec<DateTime<Utc>>,
    pub power: Vec<f64>,
    pub context: Vec<Vec<f64>>,
    pub context_columns: Vec<String>,
}

impl SeriesMatrix {
    pub fn new(
        timestamps: Vec<DateTime<Utc>>,
        power: Vec<f64>,
        context: Vec<Vec<f64>>,
        context_columns: Vec<String>,
    ) -> Result<Self, SequenceError> {
        if timestamps.len() != power.len() || context.len() != power.len() {
            return Err(SequenceError::Ragged(format!(
                "{} timestamps, {} power values, {} context rows",
                timestamps.len(),
                power.len(),
                context.len()
            )));
        }
        let width = if context_columns.is_empty() {
            FALLBACK_CONTEXT_WIDTH
        } else {
            context_columns.len()
        };
        if let Some(row) = context.iter().find(|row| row.len() != width) {
            return Err(SequenceError::Ragged(format!(
                "context row has {} values, expected {width}",
                row.len()
            )));
        }
        Ok(Self {
            timestamps,
            power,
            context,
            context_columns,
        })
    }

    /// Power-only series with the zero-filled fallback context.
    pub fn from_power(timestamps: Vec<DateTime<Utc>>, power: Vec<f64>) -> Result<Self, SequenceError> {
        let context = vec![vec![0.0; FALLBACK_CONTEXT_WIDTH]; power.len()];
        Self::new(timestamps, power, context, Vec::new())
    }

    /// Keeps only rows without null features; anomalous rows are kept.
    pub fn from_table(table: &FeatureTable) -> Self {
        let selected: Vec<(usize, String)> = table
            .schema
            .columns
            .iter()
            .enumerate()
            .filter(|(_, col)| !EXCLUDED_CONTEXT_COLUMNS.contains(&col.name.as_str()))
            .map(|(idx, col)| (idx, col.name.clone()))
            .collect();

        let mut timestamps = Vec::new();
        let mut power = Vec::new();
        let mut context = Vec::new();
        for row in table.complete_rows() {
            timestamps.push(row.timestamp);
            power.push(row.power_watts);
            if selected.is_empty() {
                context.push(vec![0.0; FALLBACK_CONTEXT_WIDTH]);
            } else {
                context.push(
                    selected
                        .iter()
                        .map(|(idx, _)| row.values[*idx].unwrap_or(0.0))
                        .collect(),
                );
            }
        }

        Self {
            timestamps,
            power,
            context,
            context_columns: selected.into_iter().map(|(_, name)| name).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.power.len()
    }

    pub fn is_empty(&self) -> bool {
        self.power.is_empty()
    }

    pub fn context_width(&self) -> usize {
        if self.context_columns.is_empty() {
            FALLBACK_CONTEXT_WIDTH
        } else {
            self.context_columns.len()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingSet {
    pub power_windows: Vec<Vec<f64>>,
    pub context_windows: Vec<Vec<Vec<f64>>>,
    /// Per horizon, one target vector per window (length 1 for the 1h horizon).
    pub targets: BTreeMap<Horizon, Vec<Vec<f64>>>,
    pub window_ends: Vec<DateTime<Utc>>,
}

impl TrainingSet {
    pub fn len(&self) -> usize {
        self.power_windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.power_windows.is_empty()
    }

    pub fn horizons(&self) -> Vec<Horizon> {
        self.targets.keys().copied().collect()
    }

    fn slice(&self, start: usize, end: usize) -> Self {
        Self {
            power_windows: self.power_windows[start..end].to_vec(),
            context_windows: self.context_windows[start..end].to_vec(),
            targets: self
                .targets
                .iter()
                .map(|(h, t)| (*h, t[start..end].to_vec()))
                .collect(),
            window_ends: self.window_ends[start..end].to_vec(),
        }
    }

    /// Chronological split; the test part takes whatever the first two leave.
    pub fn split_chronological(&self, train_fraction: f64, validation_fraction: f64) -> SplitSets {
        let n = self.len();
        let train_len = ((n as f64 * train_fraction).floor() as usize).min(n);
        let val_len = ((n as f64 * validation_fraction).floor() as usize).min(n - train_len);
        SplitSets {
            train: self.slice(0, train_len),
            validation: self.slice(train_len, train_len + val_len),
            test: self.slice(train_len + val_len, n),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SplitSets {
    pub train: TrainingSet,
    pub validation: TrainingSet,
    pub test: TrainingSet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceWindow {
    pub power: Vec<f64>,
    pub context: Vec<Vec<f64>>,
    pub end_timestamp: DateTime<Utc>,
}

/// Slides a `sequence_length` frame one row at a time. With `N` rows and
/// longest horizon `H` this yields `N - sequence_length - H + 1` windows, so
/// exactly `sequence_length + H` rows give one window (200 rows, length 24,
/// horizon 24 give 153). A count of `N - sequence_length - H` would leave the
/// exact boundary with no window at all.
pub fn build_training_sequences(
    series: &SeriesMatrix,
    sequence_length: usize,
    horizons: &[Horizon],
) -> Result<TrainingSet, SequenceError> {
    if sequence_length == 0 {
        return Err(SequenceError::ZeroSequenceLength);
    }
    if horizons.is_empty() {
        return Err(SequenceError::NoHorizons);
    }

    let required = sequence_length + max_horizon_hours(horizons);
    let available = series.len();
    if available < required {
        return Err(SequenceError::InsufficientData {
            required,
            available,
        });
    }

    let count = available - required + 1;
    let mut set = TrainingSet {
        power_windows: Vec::with_capacity(count),
        context_windows: Vec::with_capacity(count),
        targets: horizons.iter().map(|h| (*h, Vec::with_capacity(count))).collect(),
        window_ends: Vec::with_capacity(count),
    };

    for i in 0..count {
        let end = i + sequence_length;
        set.power_windows.push(series.power[i..end].to_vec());
        set.context_windows.push(series.context[i..end].to_vec());
        set.window_ends.push(series.timestamps[end - 1]);
        for (horizon, targets) in set.targets.iter_mut() {
            targets.push(series.power[end..end + horizon.hours()].to_vec());
        }
    }

    debug!(
        component = "sequences",
        event = "sequences.training.built",
        rows = available,
        sequence_length,
        windows = count
    );

    Ok(set)
}

/// Tail window of the most recent `sequence_length` rows.
pub fn build_inference_window(
    series: &SeriesMatrix,
    sequence_length: usize,
) -> Result<InferenceWindow, SequenceError> {
    if sequence_length == 0 {
        return Err(SequenceError::ZeroSequenceLength);
    }
    let available = series.len();
    if available < sequence_length {
        return Err(SequenceError::InsufficientData {
            required: sequence_length,
            available,
        });
    }

    let start = available - sequence_length;
    Ok(InferenceWindow {
        power: series.power[start..].to_vec(),
        context: series.context[start..].to_vec(),
        end_timestamp: series.timestamps[available - 1],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn series(n: usize) -> SeriesMatrix {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let timestamps = (0..n).map(|h| t0 + Duration::hours(h as i64)).collect();
        let power = (0..n).map(|i| i as f64).collect();
        SeriesMatrix::from_power(timestamps, power).unwrap()
    }

    #[test]
    fn exact_row_count_yields_one_window() {
        let set = build_training_sequences(&series(30), 6, &[Horizon::H1, Horizon::H24]).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.targets[&Horizon::H1][0], vec![6.0]);
        assert_eq!(set.targets[&Horizon::H24][0].len(), 24);
        assert_eq!(set.targets[&Horizon::H24][0][23], 29.0);
    }

    #[test]
    fn one_row_short_fails_with_counts() {
        let err = build_training_sequences(&series(29), 6, &[Horizon::H24]).unwrap_err();
        assert_eq!(
            err,
            SequenceError::InsufficientData {
                required: 30,
                available: 29
            }
        );
    }

    #[test]
    fn targets_follow_each_window() {
        let set = build_training_sequences(&series(40), 4, &[Horizon::H6]).unwrap();
        assert_eq!(set.len(), 31);
        assert_eq!(set.power_windows[3], vec![3.0, 4.0, 5.0, 6.0]);
        assert_eq!(set.targets[&Horizon::H6][3], vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
        assert_eq!(set.context_windows[3][0].len(), FALLBACK_CONTEXT_WIDTH);
    }

    #[test]
    fn inference_uses_tail_rows() {
        let window = build_inference_window(&series(10), 3).unwrap();
        assert_eq!(window.power, vec![7.0, 8.0, 9.0]);
        assert!(build_inference_window(&series(2), 3).is_err());
    }

    #[test]
    fn chronological_split_keeps_order() {
        let set = build_training_sequences(&series(125), 1, &[Horizon::H24]).unwrap();
        assert_eq!(set.len(), 101);
        let split = set.split_chronological(0.7, 0.15);
        assert_eq!(split.train.len(), 70);
        assert_eq!(split.validation.len(), 15);
        assert_eq!(split.test.len(), 16);
        assert!(split.train.window_ends.last() < split.validation.window_ends.first());
    }

    #[test]
    fn ragged_matrix_is_rejected() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let err = SeriesMatrix::new(vec![t0], vec![1.0], vec![vec![0.0; 2]], vec!["a".into()])
            .unwrap_err();
        assert!(matches!(err, SequenceError::Ragged(_)));
    }
}
