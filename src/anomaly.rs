//! Anomaly scoring of forecasts.
//!
//! The interval scorer works from a population of stochastic draws: per step
//! `mean ± 1.96·std` is the 95% interval and a forecast strictly outside it is
//! anomalous. The baseline scorer needs no stochastic predictor and compares
//! forecasts with the mean/std of recent readings instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::horizon::Horizon;
use crate::stats::{mean, quantile, std_dev};

pub const INTERVAL_Z: f64 = 1.96;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    OutsidePredictionInterval,
    HighDeviation,
    LowDeviation,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExpectedRange {
    pub lower: f64,
    pub upper: f64,
}

/// Distance from the baseline mean; absolute when the baseline mean is zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "unit", content = "value", rename_all = "snake_case")]
pub enum Deviation {
    Percentage(f64),
    Absolute(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub timestamp: DateTime<Utc>,
    pub horizon: Horizon,
    pub predicted_value: f64,
    pub expected_range: ExpectedRange,
    pub uncertainty: f64,
    pub severity: Severity,
    pub confidence: f64,
    pub kind: AnomalyKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deviation: Option<Deviation>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnomalyError {
    #[error("stochastic population is empty")]
    EmptyPopulation,
    #[error("draw {draw} has {got} steps, expected {expected}")]
    RaggedDraw {
        draw: usize,
        expected: usize,
        got: usize,
    },
    #[error("{values} values but {timestamps} timestamps")]
    LengthMismatch { values: usize, timestamps: usize },
}

/// Per-step summary of a stochastic population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalSummary {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl IntervalSummary {
    pub fn from_draws(draws: &[Vec<f64>]) -> Result<Self, AnomalyError> {
        let steps = draws.first().ok_or(AnomalyError::EmptyPopulation)?.len();
        for (draw, values) in draws.iter().enumerate() {
            if values.len() != steps {
                return Err(AnomalyError::RaggedDraw {
                    draw,
                    expected: steps,
                    got: values.len(),
                });
            }
        }

        let mut summary = Self {
            mean: Vec::with_capacity(steps),
            std: Vec::with_capacity(steps),
        };
        for step in 0..steps {
            let column: Vec<f64> = draws.iter().map(|d| d[step]).collect();
            summary.mean.push(mean(&column).unwrap_or(0.0));
            summary.std.push(std_dev(&column).unwrap_or(0.0));
        }
        Ok(summary)
    }

    pub fn range(&self, step: usize) -> ExpectedRange {
        ExpectedRange {
            lower: self.mean[step] - INTERVAL_Z * self.std[step],
            upper: self.mean[step] + INTERVAL_Z * self.std[step],
        }
    }
}

/// Flags each `values[i]` lying strictly outside the interval built from
/// `draws` (K draws × steps). Severity is high when the step's std exceeds
/// the batch's 75th percentile; confidence is `1 - std / max_std`, or 0 when
/// every std is 0.
pub fn score_interval(
    horizon: Horizon,
    draws: &[Vec<f64>],
    values: &[f64],
    timestamps: &[DateTime<Utc>],
) -> Result<Vec<AnomalyRecord>, AnomalyError> {
    if values.len() != timestamps.len() {
        return Err(AnomalyError::LengthMismatch {
            values: values.len(),
            timestamps: timestamps.len(),
        });
    }
    let summary = IntervalSummary::from_draws(draws)?;
    if summary.mean.len() != values.len() {
        return Err(AnomalyError::RaggedDraw {
            draw: 0,
            expected: values.len(),
            got: summary.mean.len(),
        });
    }

    let p75 = quantile(&summary.std, 0.75).unwrap_or(0.0);
    let max_std = summary.std.iter().copied().fold(0.0, f64::max);

    let mut out = Vec::new();
    for (step, value) in values.iter().enumerate() {
        let range = summary.range(step);
        if !(*value < range.lower || *value > range.upper) {
            continue;
        }
        let std = summary.std[step];
        let confidence = if max_std > 0.0 {
            (1.0 - std / max_std).clamp(0.0, 1.0)
        } else {
            0.0
        };
        out.push(AnomalyRecord {
            timestamp: timestamps[step],
            horizon,
            predicted_value: *value,
            expected_range: range,
            uncertainty: std,
            severity: if std > p75 {
                Severity::High
            } else {
                Severity::Medium
            },
            confidence,
            kind: AnomalyKind::OutsidePredictionInterval,
            deviation: None,
        });
    }
    Ok(out)
}

/// Flags forecasts more than 2σ (medium) or 3σ (high) from the recent mean.
pub fn score_baseline(
    horizon: Horizon,
    recent: &[f64],
    values: &[f64],
    timestamps: &[DateTime<Utc>],
) -> Result<Vec<AnomalyRecord>, AnomalyError> {
    if values.len() != timestamps.len() {
        return Err(AnomalyError::LengthMismatch {
            values: values.len(),
            timestamps: timestamps.len(),
        });
    }
    let (Some(baseline), Some(sigma)) = (mean(recent), std_dev(recent)) else {
        return Err(AnomalyError::EmptyPopulation);
    };

    let range = ExpectedRange {
        lower: baseline - 2.0 * sigma,
        upper: baseline + 2.0 * sigma,
    };

    let mut out = Vec::new();
    for (value, timestamp) in values.iter().zip(timestamps) {
        let distance = (value - baseline).abs();
        if distance <= 2.0 * sigma {
            continue;
        }
        let deviation = if baseline == 0.0 {
            Deviation::Absolute(distance)
        } else {
            Deviation::Percentage(distance / baseline.abs() * 100.0)
        };
        out.push(AnomalyRecord {
            timestamp: *timestamp,
            horizon,
            predicted_value: *value,
            expected_range: range,
            uncertainty: sigma,
            severity: if distance > 3.0 * sigma {
                Severity::High
            } else {
                Severity::Medium
            },
            confidence: (1.0 - 2.0 * sigma / distance).clamp(0.0, 1.0),
            kind: if *value > baseline {
                AnomalyKind::HighDeviation
            } else {
                AnomalyKind::LowDeviation
            },
            deviation: Some(deviation),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn stamps(n: usize) -> Vec<DateTime<Utc>> {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        (1..=n).map(|h| t0 + Duration::hours(h as i64)).collect()
    }

    #[test]
    fn identical_draws_collapse_interval_to_a_point() {
        let draws = vec![vec![10.0, 12.0, 14.0]; 100];
        let records =
            score_interval(Horizon::H6, &draws, &[10.0, 12.5, 14.0], &stamps(3)).unwrap();

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.expected_range.lower, 12.0);
        assert_eq!(record.expected_range.upper, 12.0);
        assert_eq!(record.uncertainty, 0.0);
        // Every std equals the batch max of 0: not above p75, zero confidence.
        assert_eq!(record.severity, Severity::Medium);
        assert_eq!(record.confidence, 0.0);
    }

    #[test]
    fn wide_step_is_high_severity_with_low_confidence() {
        let mut draws = Vec::new();
        for k in 0..100 {
            let jitter = if k % 2 == 0 { 1.0 } else { -1.0 };
            draws.push(vec![10.0 + 0.1 * jitter, 10.0 + 0.1 * jitter, 10.0 + 5.0 * jitter]);
        }
        let records =
            score_interval(Horizon::H6, &draws, &[20.0, 10.0, 30.0], &stamps(3)).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].severity, Severity::Medium);
        assert!((records[0].confidence - 0.98).abs() < 1e-9);
        assert_eq!(records[1].severity, Severity::High);
        assert_eq!(records[1].confidence, 0.0);
    }

    #[test]
    fn ragged_population_is_rejected() {
        let draws = vec![vec![1.0, 2.0], vec![1.0]];
        assert!(matches!(
            score_interval(Horizon::H6, &draws, &[1.0, 2.0], &stamps(2)),
            Err(AnomalyError::RaggedDraw { .. })
        ));
        assert_eq!(
            score_interval(Horizon::H1, &[], &[1.0], &stamps(1)),
            Err(AnomalyError::EmptyPopulation)
        );
    }

    #[test]
    fn baseline_uses_two_and_three_sigma() {
        // mean 10, population std 2
        let recent = [8.0, 12.0, 8.0, 12.0];
        let records =
            score_baseline(Horizon::H6, &recent, &[15.0, 17.0, 13.0, 5.0], &stamps(4)).unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].severity, Severity::Medium);
        assert_eq!(records[0].kind, AnomalyKind::HighDeviation);
        assert_eq!(records[0].deviation, Some(Deviation::Percentage(50.0)));
        assert_eq!(records[1].severity, Severity::High);
        assert_eq!(records[2].kind, AnomalyKind::LowDeviation);
    }

    #[test]
    fn zero_baseline_reports_absolute_deviation() {
        let recent = [0.0, 0.0, 0.0];
        let records = score_baseline(Horizon::H1, &recent, &[4.0], &stamps(1)).unwrap();
        assert_eq!(records[0].deviation, Some(Deviation::Absolute(4.0)));
        assert_eq!(records[0].severity, Severity::High);
    }
}
