//! Greedy placement of deferrable loads into low-forecast hours.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const OPTIMIZATION_CONFIDENCE: f64 = 0.75;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appliance {
    pub name: String,
    pub power_watts: f64,
    pub duration_hours: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledAppliance {
    pub appliance: String,
    pub recommended_start: DateTime<Utc>,
    pub start_offset_hours: usize,
    pub duration_hours: usize,
    pub expected_power_watts: f64,
    pub estimated_savings: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub device_id: String,
    pub schedule: Vec<ScheduledAppliance>,
    pub total_estimated_savings: f64,
    pub optimization_confidence: f64,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ScheduleError {
    #[error("appliance {name}: duration_hours must lie in 1..={max}, got {duration_hours}")]
    InvalidDuration {
        name: String,
        duration_hours: usize,
        max: usize,
    },
    #[error("appliance {name}: power_watts must be finite and >= 0")]
    InvalidPower { name: String },
    #[error("forecast is empty")]
    EmptyForecast,
}

/// Start hour `s` minimizing `Σ (forecast[s+i] + power)` over the run;
/// ties go to the earliest start.
pub fn best_start_hour(forecast: &[f64], power_watts: f64, duration_hours: usize) -> Option<usize> {
    if duration_hours == 0 || duration_hours > forecast.len() {
        return None;
    }
    let mut best: Option<(usize, f64)> = None;
    for start in 0..=forecast.len() - duration_hours {
        let impact: f64 = forecast[start..start + duration_hours]
            .iter()
            .map(|v| v + power_watts)
            .sum();
        let better = match best {
            Some((_, lowest)) => impact < lowest,
            None => true,
        };
        if better {
            best = Some((start, impact));
        }
    }
    best.map(|(start, _)| start)
}

/// Savings of the chosen slot against running at the peak forecast hour, in
/// currency units, floored at 0.
pub fn estimated_savings(
    forecast: &[f64],
    start: usize,
    power_watts: f64,
    duration_hours: usize,
    rate_per_kwh: f64,
) -> f64 {
    let peak = forecast.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let chosen: f64 = forecast[start..start + duration_hours].iter().sum();
    let peak_cost = peak * power_watts * duration_hours as f64 * rate_per_kwh / 1000.0;
    let chosen_cost = chosen * power_watts * rate_per_kwh / 1000.0;
    (peak_cost - chosen_cost).max(0.0)
}

pub fn optimize_schedule(
    device_id: &str,
    forecast: &[f64],
    appliances: &[Appliance],
    rate_per_kwh: f64,
    now: DateTime<Utc>,
) -> Result<Schedule, ScheduleError> {
    if forecast.is_empty() {
        return Err(ScheduleError::EmptyForecast);
    }

    let mut schedule = Vec::with_capacity(appliances.len());
    for appliance in appliances {
        if !appliance.power_watts.is_finite() || appliance.power_watts < 0.0 {
            return Err(ScheduleError::InvalidPower {
                name: appliance.name.clone(),
            });
        }
        let start = best_start_hour(forecast, appliance.power_watts, appliance.duration_hours)
            .ok_or_else(|| ScheduleError::InvalidDuration {
                name: appliance.name.clone(),
                duration_hours: appliance.duration_hours,
                max: forecast.len(),
            })?;

        schedule.push(ScheduledAppliance {
            appliance: appliance.name.clone(),
            recommended_start: now + Duration::hours(start as i64),
            start_offset_hours: start,
            duration_hours: appliance.duration_hours,
            expected_power_watts: appliance.power_watts,
            estimated_savings: estimated_savings(
                forecast,
                start,
                appliance.power_watts,
                appliance.duration_hours,
                rate_per_kwh,
            ),
        });
    }

    Ok(Schedule {
        device_id: device_id.to_string(),
        total_estimated_savings: schedule.iter().map(|s| s.estimated_savings).sum(),
        schedule,
        optimization_confidence: OPTIMIZATION_CONFIDENCE,
        generated_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn valley_at_two_and_three() -> Vec<f64> {
        (0..24)
            .map(|h| if h == 2 || h == 3 { 5.0 } else { 50.0 })
            .collect()
    }

    #[test]
    fn picks_the_clear_minimum() {
        assert_eq!(best_start_hour(&valley_at_two_and_three(), 500.0, 2), Some(2));
    }

    #[test]
    fn ties_break_to_the_earliest_start() {
        assert_eq!(best_start_hour(&[1.0; 24], 100.0, 3), Some(0));
        assert_eq!(best_start_hour(&[1.0; 24], 100.0, 25), None);
        assert_eq!(best_start_hour(&[1.0; 24], 100.0, 0), None);
    }

    #[test]
    fn schedule_reports_start_and_savings() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap();
        let appliances = vec![Appliance {
            name: "dishwasher".to_string(),
            power_watts: 500.0,
            duration_hours: 2,
        }];
        let schedule =
            optimize_schedule("plug", &valley_at_two_and_three(), &appliances, 0.12, now).unwrap();

        let item = &schedule.schedule[0];
        assert_eq!(item.start_offset_hours, 2);
        assert_eq!(item.recommended_start, now + Duration::hours(2));
        // peak: 50 * 500 * 2 * 0.12 / 1000 = 6.0, chosen: 10 * 500 * 0.12 / 1000 = 0.6
        assert!((item.estimated_savings - 5.4).abs() < 1e-9);
        assert_eq!(schedule.optimization_confidence, 0.75);
        assert!((schedule.total_estimated_savings - 5.4).abs() < 1e-9);
    }

    #[test]
    fn out_of_range_duration_is_rejected() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let appliances = vec![Appliance {
            name: "kiln".to_string(),
            power_watts: 3000.0,
            duration_hours: 30,
        }];
        let err = optimize_schedule("plug", &[1.0; 24], &appliances, 0.12, now).unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidDuration { duration_hours: 30, .. }));
    }
}
