//! The forecasting capability consumed by the pipeline, plus a seasonal
//! statistical baseline that satisfies it.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::horizon::Horizon;
use crate::sequences::{InferenceWindow, TrainingSet};
use crate::stats::{mean, std_dev};

/// Forecast values keyed by horizon; each vector has `horizon.hours()` entries.
pub type HorizonValues = BTreeMap<Horizon, Vec<f64>>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PredictorError {
    #[error("predictor has not been fit")]
    NotFitted,
    #[error("stochastic prediction unsupported by {0}")]
    Unsupported(String),
    #[error("predictor returned no values for horizon {0}")]
    MissingHorizon(Horizon),
    #[error("predictor returned {got} values for horizon {horizon}, expected {expected}")]
    ShapeMismatch {
        horizon: Horizon,
        expected: usize,
        got: usize,
    },
    #[error("invalid predictor input: {0}")]
    InvalidInput(String),
    #[error("predictor failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub loss: BTreeMap<Horizon, f64>,
    pub samples: usize,
}

pub trait Predictor: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn fit(&mut self, training: &TrainingSet) -> Result<TrainingSummary, PredictorError>;

    fn predict(&self, window: &InferenceWindow) -> Result<HorizonValues, PredictorError>;

    /// `draws` independent forecasts with injected randomness.
    fn predict_stochastic(
        &self,
        _window: &InferenceWindow,
        _draws: usize,
    ) -> Result<Vec<HorizonValues>, PredictorError> {
        Err(PredictorError::Unsupported(self.name().to_string()))
    }
}

/// Checks that every requested horizon is present with the right length.
pub fn validate_horizon_values(
    values: &HorizonValues,
    horizons: &[Horizon],
) -> Result<(), PredictorError> {
    for horizon in horizons {
        let got = values
            .get(horizon)
            .ok_or(PredictorError::MissingHorizon(*horizon))?;
        if got.len() != horizon.hours() {
            return Err(PredictorError::ShapeMismatch {
                horizon: *horizon,
                expected: horizon.hours(),
                got: got.len(),
            });
        }
        if got.iter().any(|v| !v.is_finite()) {
            return Err(PredictorError::Failed(format!(
                "non-finite forecast for horizon {horizon}"
            )));
        }
    }
    Ok(())
}

const SEASONAL_PERIOD: usize = 24;
const BLEND_GRID_STEPS: usize = 10;

/// Blends the same-hour-yesterday value with the window mean; the blend weight
/// per horizon is grid-searched on the training set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonalBaselinePredictor {
    pub seed: u64,
    weights: BTreeMap<Horizon, f64>,
    residual_std: BTreeMap<Horizon, f64>,
}

impl SeasonalBaselinePredictor {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            weights: BTreeMap::new(),
            residual_std: BTreeMap::new(),
        }
    }

    pub fn weight(&self, horizon: Horizon) -> Option<f64> {
        self.weights.get(&horizon).copied()
    }

    fn forecast_steps(power: &[f64], steps: usize, weight: f64) -> Vec<f64> {
        let level = mean(power).unwrap_or(0.0);
        let last = power.last().copied().unwrap_or(level);
        (1..=steps)
            .map(|step| {
                let seasonal = if power.len() >= SEASONAL_PERIOD {
                    power[power.len() - SEASONAL_PERIOD + (step - 1) % SEASONAL_PERIOD]
                } else {
                    last
                };
                weight * seasonal + (1.0 - weight) * level
            })
            .collect()
    }

    fn point_forecast(&self, power: &[f64]) -> Result<HorizonValues, PredictorError> {
        if self.weights.is_empty() {
            return Err(PredictorError::NotFitted);
        }
        if power.is_empty() {
            return Err(PredictorError::InvalidInput("empty power window".to_string()));
        }
        Ok(self
            .weights
            .iter()
            .map(|(h, w)| (*h, Self::forecast_steps(power, h.hours(), *w)))
            .collect())
    }
}

impl Default for SeasonalBaselinePredictor {
    fn default() -> Self {
        Self::new(42)
    }
}

impl Predictor for SeasonalBaselinePredictor {
    fn name(&self) -> &'static str {
        "seasonal_baseline"
    }

    fn fit(&mut self, training: &TrainingSet) -> Result<TrainingSummary, PredictorError> {
        if training.is_empty() {
            return Err(PredictorError::InvalidInput("empty training set".to_string()));
        }

        let mut weights = BTreeMap::new();
        let mut residual_std = BTreeMap::new();
        let mut loss = BTreeMap::new();

        for (horizon, targets) in &training.targets {
            let mut best: Option<(f64, f64, Vec<f64>)> = None;
            for step in 0..=BLEND_GRID_STEPS {
                let weight = step as f64 / BLEND_GRID_STEPS as f64;
                let residuals: Vec<f64> = training
                    .power_windows
                    .iter()
                    .zip(targets)
                    .flat_map(|(window, target)| {
                        Self::forecast_steps(window, target.len(), weight)
                            .into_iter()
                            .zip(target.iter().copied())
                            .map(|(pred, actual)| actual - pred)
                            .collect::<Vec<_>>()
                    })
                    .collect();
                let mse = mean(&residuals.iter().map(|r| r * r).collect::<Vec<_>>()).unwrap_or(0.0);
                let improves = match &best {
                    Some((best_mse, _, _)) => mse < *best_mse,
                    None => true,
                };
                if improves {
                    best = Some((mse, weight, residuals));
                }
            }

            if let Some((mse, weight, residuals)) = best {
                weights.insert(*horizon, weight);
                residual_std.insert(*horizon, std_dev(&residuals).unwrap_or(0.0));
                loss.insert(*horizon, mse);
            }
        }

        self.weights = weights;
        self.residual_std = residual_std;

        info!(
            component = "predictor",
            event = "predictor.fit.finish",
            predictor = self.name(),
            samples = training.len(),
            horizons = self.weights.len()
        );

        Ok(TrainingSummary {
            loss,
            samples: training.len(),
        })
    }

    fn predict(&self, window: &InferenceWindow) -> Result<HorizonValues, PredictorError> {
        self.point_forecast(&window.power)
    }

    fn predict_stochastic(
        &self,
        window: &InferenceWindow,
        draws: usize,
    ) -> Result<Vec<HorizonValues>, PredictorError> {
        if draws == 0 {
            return Err(PredictorError::InvalidInput("draws must be > 0".to_string()));
        }
        let point = self.point_forecast(&window.power)?;
        let mut rng = StdRng::seed_from_u64(self.seed);

        Ok((0..draws)
            .map(|_| {
                point
                    .iter()
                    .map(|(h, values)| {
                        let sigma = self.residual_std.get(h).copied().unwrap_or(0.0);
                        let noisy = values
                            .iter()
                            .map(|v| v + gaussian_noise(&mut rng, sigma))
                            .collect();
                        (*h, noisy)
                    })
                    .collect()
            })
            .collect())
    }
}

/// Zero-mean Gaussian sample via the Box-Muller transform.
fn gaussian_noise(rng: &mut StdRng, std_dev: f64) -> f64 {
    if std_dev <= 0.0 {
        return 0.0;
    }
    let u1: f64 = rng.random::<f64>().clamp(1e-12, 1.0);
    let u2: f64 = rng.random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos() * std_dev
}
