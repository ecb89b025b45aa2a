//! Weather inputs for feature engineering.
//!
//! `SyntheticWeather` stands in when no real weather is available: temperature
//! follows a fixed diurnal curve and humidity/cloud cover are drawn from a
//! generator seeded by `(seed, timestamp)`, so an hour gets the same sample
//! whatever else is requested alongside it.
//! `SuppliedWeather` serves externally sourced samples by exact timestamp.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use chrono::{DateTime, Timelike, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

pub const DEFAULT_WEATHER_SEED: u64 = 42;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeatherSample {
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: f64,
    pub cloud_cover: f64,
}

pub trait WeatherProvider: Send + Sync + 'static {
    /// One entry per requested timestamp; `None` when no sample is known.
    fn samples_for(&self, timestamps: &[DateTime<Utc>]) -> Vec<Option<WeatherSample>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticWeather {
    pub seed: u64,
}

impl Default for SyntheticWeather {
    fn default() -> Self {
        Self {
            seed: DEFAULT_WEATHER_SEED,
        }
    }
}

impl SyntheticWeather {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn diurnal_temperature(hour: u32) -> f64 {
        20.0 + 10.0 * (2.0 * PI * hour as f64 / 24.0).sin()
    }
}

impl WeatherProvider for SyntheticWeather {
    fn samples_for(&self, timestamps: &[DateTime<Utc>]) -> Vec<Option<WeatherSample>> {
        timestamps
            .iter()
            .map(|ts| {
                let mut rng = StdRng::seed_from_u64(self.seed ^ ts.timestamp() as u64);
                let humidity = 50.0 + 20.0 * rng.random::<f64>();
                let cloud_cover = 100.0 * rng.random::<f64>();
                Some(WeatherSample {
                    timestamp: *ts,
                    temperature: Self::diurnal_temperature(ts.hour()),
                    humidity,
                    cloud_cover,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SuppliedWeather {
    samples: BTreeMap<DateTime<Utc>, WeatherSample>,
}

impl SuppliedWeather {
    pub fn new(samples: &[WeatherSample]) -> Self {
        Self {
            samples: samples.iter().map(|s| (s.timestamp, *s)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl WeatherProvider for SuppliedWeather {
    fn samples_for(&self, timestamps: &[DateTime<Utc>]) -> Vec<Option<WeatherSample>> {
        timestamps
            .iter()
            .map(|ts| self.samples.get(ts).copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn hours(n: i64) -> Vec<DateTime<Utc>> {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        (0..n).map(|h| t0 + Duration::hours(h)).collect()
    }

    #[test]
    fn synthetic_weather_is_reproducible_and_bounded() {
        let ts = hours(48);
        let a = SyntheticWeather::default().samples_for(&ts);
        let b = SyntheticWeather::default().samples_for(&ts);
        assert_eq!(a, b);

        for sample in a.iter().flatten() {
            assert!((50.0..70.0).contains(&sample.humidity));
            assert!((0.0..100.0).contains(&sample.cloud_cover));
            assert!((10.0..=30.0).contains(&sample.temperature));
        }

        let other = SyntheticWeather::new(7).samples_for(&ts);
        assert_ne!(a, other);
    }

    #[test]
    fn synthetic_sample_depends_only_on_its_timestamp() {
        let ts = hours(30);
        let provider = SyntheticWeather::default();
        let alone = provider.samples_for(&ts[29..]);
        let week = provider.samples_for(&ts[6..]);
        let month = provider.samples_for(&ts);

        assert_eq!(alone[0], week[23]);
        assert_eq!(alone[0], month[29]);
        assert_ne!(month[0], month[1]);
    }

    #[test]
    fn diurnal_curve_peaks_at_six() {
        assert!((SyntheticWeather::diurnal_temperature(6) - 30.0).abs() < 1e-9);
        assert!((SyntheticWeather::diurnal_temperature(0) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn supplied_weather_misses_unknown_timestamps() {
        let ts = hours(3);
        let provider = SuppliedWeather::new(&[WeatherSample {
            timestamp: ts[1],
            temperature: 5.0,
            humidity: 80.0,
            cloud_cover: 10.0,
        }]);
        let out = provider.samples_for(&ts);
        assert!(out[0].is_none());
        assert_eq!(out[1].map(|s| s.temperature), Some(5.0));
        assert!(out[2].is_none());
    }
}
