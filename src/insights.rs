//! Rule-based interpretation of forecasts against the recent baseline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::anomaly::Severity;
use crate::horizon::Horizon;
use crate::predictor::HorizonValues;
use crate::stats::{mean, variance};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightConfig {
    pub rate_per_kwh: f64,
    pub cost_alert_threshold: f64,
    pub spike_ratio: f64,
    pub peak_ratio: f64,
    pub high_energy_ratio: f64,
    pub pattern_variance_ratio: f64,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            rate_per_kwh: 0.12,
            cost_alert_threshold: 5.0,
            spike_ratio: 1.5,
            peak_ratio: 2.0,
            high_energy_ratio: 1.2,
            pattern_variance_ratio: 2.0,
        }
    }
}

pub fn validate_insight_config(cfg: &InsightConfig) -> Result<(), InsightError> {
    let fields = [
        ("rate_per_kwh", cfg.rate_per_kwh),
        ("cost_alert_threshold", cfg.cost_alert_threshold),
        ("spike_ratio", cfg.spike_ratio),
        ("peak_ratio", cfg.peak_ratio),
        ("high_energy_ratio", cfg.high_energy_ratio),
        ("pattern_variance_ratio", cfg.pattern_variance_ratio),
    ];
    for (name, value) in fields {
        if !value.is_finite() || value < 0.0 {
            return Err(InsightError::InvalidConfig(format!(
                "{name} must be finite and >= 0"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Error, PartialEq)]
pub enum InsightError {
    #[error("invalid insight config: {0}")]
    InvalidConfig(String),
    #[error("no recent readings to compare against")]
    EmptyBaseline,
    #[error("non-finite forecast value for horizon {0}")]
    NonFinite(Horizon),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightKind {
    ImmediateSpike,
    PeakLoad,
    Efficiency,
    CostOptimization,
    PatternAnomaly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightRecord {
    #[serde(rename = "type")]
    pub kind: InsightKind,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub recommendation: String,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default)]
pub struct InsightGenerator {
    cfg: InsightConfig,
}

impl InsightGenerator {
    pub fn new(cfg: InsightConfig) -> Result<Self, InsightError> {
        validate_insight_config(&cfg)?;
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &InsightConfig {
        &self.cfg
    }

    /// Evaluates every rule independently; rules whose horizon was not
    /// forecast are skipped.
    pub fn generate(
        &self,
        forecasts: &HorizonValues,
        recent: &[f64],
        now: DateTime<Utc>,
    ) -> Result<Vec<InsightRecord>, InsightError> {
        for (horizon, values) in forecasts {
            if values.iter().any(|v| !v.is_finite()) {
                return Err(InsightError::NonFinite(*horizon));
            }
        }
        let (Some(current), Some(average), Some(recent_variance)) =
            (recent.last().copied(), mean(recent), variance(recent))
        else {
            return Err(InsightError::EmptyBaseline);
        };

        let record = |kind, severity, title: &str, description: String, recommendation: &str, confidence| {
            InsightRecord {
                kind,
                severity,
                title: title.to_string(),
                description,
                recommendation: recommendation.to_string(),
                confidence,
                timestamp: now,
                details: BTreeMap::new(),
            }
        };

        let mut out = Vec::new();

        if let Some(next_hour) = first_value(forecasts, Horizon::H1) {
            if next_hour > current * self.cfg.spike_ratio {
                let mut insight = if current > 0.0 {
                    let increase = (next_hour / current - 1.0) * 100.0;
                    let mut r = record(
                        InsightKind::ImmediateSpike,
                        Severity::High,
                        "Power Spike Predicted",
                        format!(
                            "Power consumption expected to increase by {increase:.1}% in the next hour."
                        ),
                        "Monitor device usage and check for any unusual activity.",
                        0.85,
                    );
                    r.details.insert("increase_percent".to_string(), increase);
                    r
                } else {
                    record(
                        InsightKind::ImmediateSpike,
                        Severity::High,
                        "Power Spike Predicted",
                        format!(
                            "Power consumption expected to rise from 0.0W to {next_hour:.1}W in the next hour."
                        ),
                        "Monitor device usage and check for any unusual activity.",
                        0.85,
                    )
                };
                insight.details.insert("predicted_watts".to_string(), next_hour);
                out.push(insight);
            }
        }

        if let Some(six_hours) = forecasts.get(&Horizon::H6).filter(|v| !v.is_empty()) {
            let (offset, peak) = six_hours
                .iter()
                .copied()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |best, (i, v)| if v > best.1 { (i, v) } else { best });
            if peak > average * self.cfg.peak_ratio {
                let hours_ahead = offset + 1;
                let mut insight = record(
                    InsightKind::PeakLoad,
                    Severity::Medium,
                    "Peak Load Expected",
                    format!("Peak consumption of {peak:.1}W expected in {hours_ahead} hours."),
                    "Consider deferring non-essential energy usage to reduce peak load.",
                    0.78,
                );
                insight.details.insert("peak_watts".to_string(), peak);
                insight
                    .details
                    .insert("hours_ahead".to_string(), hours_ahead as f64);
                out.push(insight);
            }
        }

        if let Some(day) = forecasts.get(&Horizon::H24).filter(|v| !v.is_empty()) {
            let daily_wh: f64 = day.iter().sum();
            let typical_wh = average * 24.0;

            if daily_wh > typical_wh * self.cfg.high_energy_ratio {
                let above = if typical_wh > 0.0 {
                    format!(
                        "Tomorrow's consumption predicted to be {:.1}% above average.",
                        (daily_wh / typical_wh - 1.0) * 100.0
                    )
                } else {
                    format!("Tomorrow's consumption predicted at {daily_wh:.1}Wh against an idle baseline.")
                };
                let mut insight = record(
                    InsightKind::Efficiency,
                    Severity::Low,
                    "High Energy Day Predicted",
                    above,
                    "Review energy-intensive activities and optimize usage patterns.",
                    0.72,
                );
                insight.details.insert("daily_wh".to_string(), daily_wh);
                out.push(insight);
            }

            let daily_cost = daily_wh * self.cfg.rate_per_kwh / 1000.0;
            if daily_cost > self.cfg.cost_alert_threshold {
                let mut insight = record(
                    InsightKind::CostOptimization,
                    Severity::Medium,
                    "Cost Alert",
                    format!("Predicted daily cost: ${daily_cost:.2}"),
                    "Consider using energy-efficient settings or timing usage during off-peak hours.",
                    0.80,
                );
                insight.details.insert("daily_cost".to_string(), daily_cost);
                out.push(insight);
            }

            let forecast_variance = variance(day).unwrap_or(0.0);
            if forecast_variance > recent_variance * self.cfg.pattern_variance_ratio {
                out.push(record(
                    InsightKind::PatternAnomaly,
                    Severity::Medium,
                    "Unusual Pattern Detected",
                    "Unusual consumption pattern forecast for the next 24 hours.".to_string(),
                    "Review scheduled activities and device operations.",
                    0.65,
                ));
            }
        }

        Ok(out)
    }
}

fn first_value(forecasts: &HorizonValues, horizon: Horizon) -> Option<f64> {
    forecasts.get(&horizon).and_then(|v| v.first().copied())
}
