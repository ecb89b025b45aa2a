//! Forecast accuracy metrics in original units.

use serde::{Deserialize, Serialize};

use crate::stats::{mean, min_max};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastMetrics {
    pub mse: f64,
    pub rmse: f64,
    pub mae: f64,
    /// `max(0, 1 - rmse / (max - min))` over the actual values.
    pub accuracy: f64,
    /// Mean absolute percentage error over non-zero actuals.
    pub mape: f64,
    pub samples: usize,
}

/// `None` when the slices are empty or of different lengths.
pub fn evaluate(actual: &[f64], predicted: &[f64]) -> Option<ForecastMetrics> {
    if actual.is_empty() || actual.len() != predicted.len() {
        return None;
    }

    let errors: Vec<f64> = actual.iter().zip(predicted).map(|(a, p)| a - p).collect();
    let mse = mean(&errors.iter().map(|e| e * e).collect::<Vec<_>>())?;
    let rmse = mse.sqrt();
    let mae = mean(&errors.iter().map(|e| e.abs()).collect::<Vec<_>>())?;

    let (lo, hi) = min_max(actual)?;
    let range = hi - lo;
    let normalized_rmse = if range > 0.0 { rmse / range } else { 0.0 };
    let accuracy = (1.0 - normalized_rmse).max(0.0);

    let ratios: Vec<f64> = actual
        .iter()
        .zip(&errors)
        .filter(|(a, _)| **a != 0.0)
        .map(|(a, e)| (e / a).abs())
        .collect();
    let mape = mean(&ratios).map(|m| m * 100.0).unwrap_or(0.0);

    Some(ForecastMetrics {
        mse,
        rmse,
        mae,
        accuracy,
        mape,
        samples: actual.len(),
    })
}
