//! Forecast horizons and their parsing rules.
//!
//! - `1h`: a single value one hour past the last observation
//! - `6h` / `24h`: one value per hour out to the horizon length

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Horizon {
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "24h")]
    H24,
}

pub const ALL_HORIZONS: [Horizon; 3] = [Horizon::H1, Horizon::H6, Horizon::H24];

impl Horizon {
    pub fn hours(self) -> usize {
        match self {
            Self::H1 => 1,
            Self::H6 => 6,
            Self::H24 => 24,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::H1 => "1h",
            Self::H6 => "6h",
            Self::H24 => "24h",
        }
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HorizonError {
    #[error("unsupported horizon: {0}")]
    Unsupported(String),
    #[error("at least one horizon is required")]
    Empty,
}

pub fn parse_horizon(input: &str) -> Result<Horizon, HorizonError> {
    match input.trim().to_ascii_lowercase().as_str() {
        "1h" | "1" => Ok(Horizon::H1),
        "6h" | "6" => Ok(Horizon::H6),
        "24h" | "24" => Ok(Horizon::H24),
        other => Err(HorizonError::Unsupported(other.to_string())),
    }
}

/// Parses a comma separated list such as `"24h,1h"` into a sorted, de-duplicated set.
pub fn parse_horizon_list(input: &str) -> Result<BTreeSet<Horizon>, HorizonError> {
    let mut out = BTreeSet::new();
    for part in input.split(',').filter(|part| !part.trim().is_empty()) {
        out.insert(parse_horizon(part)?);
    }
    if out.is_empty() {
        return Err(HorizonError::Empty);
    }
    Ok(out)
}

pub fn max_horizon_hours(horizons: &[Horizon]) -> usize {
    horizons.iter().map(|h| h.hours()).max().unwrap_or(0)
}
