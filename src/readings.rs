//! Raw power readings and CSV import.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub power_watts: f64,
}

impl Reading {
    pub fn new(device_id: impl Into<String>, timestamp: DateTime<Utc>, power_watts: f64) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            power_watts,
        }
    }
}

pub(crate) fn validate_power(power_watts: f64) -> Result<(), String> {
    if !power_watts.is_finite() {
        return Err(format!("power_watts must be finite, got {power_watts}"));
    }
    if power_watts < 0.0 {
        return Err(format!("power_watts must be >= 0, got {power_watts}"));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct CsvReading {
    device_id: String,
    timestamp: String,
    power_watts: f64,
}

/// Loads `device_id,timestamp,power_watts` rows; timestamps are RFC 3339.
pub fn load_readings_csv(path: &Path) -> Result<Vec<Reading>, StoreError> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
    let mut out = Vec::new();

    for (idx, record) in reader.deserialize::<CsvReading>().enumerate() {
        let record = record?;
        let timestamp = DateTime::parse_from_rfc3339(&record.timestamp)
            .map_err(|err| StoreError::InvalidReading(format!("row {}: {err}", idx + 1)))?
            .with_timezone(&Utc);
        validate_power(record.power_watts)
            .map_err(|reason| StoreError::InvalidReading(format!("row {}: {reason}", idx + 1)))?;
        out.push(Reading {
            device_id: record.device_id,
            timestamp,
            power_watts: record.power_watts,
        });
    }

    out.sort_by(|a, b| {
        a.device_id
            .cmp(&b.device_id)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
    });

    info!(
        component = "readings",
        event = "readings.csv.loaded",
        path = %path.display(),
        rows = out.len()
    );

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn csv_rows_are_parsed_and_sorted() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "device_id,timestamp,power_watts").unwrap();
        writeln!(file, "plug-1,2025-01-01T01:00:00Z,12.5").unwrap();
        writeln!(file, "plug-1,2025-01-01T00:00:00+00:00, 10").unwrap();
        file.flush().unwrap();

        let rows = load_readings_csv(file.path()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].power_watts, 10.0);
        assert_eq!(rows[1].timestamp.to_rfc3339(), "2025-01-01T01:00:00+00:00");
    }

    #[test]
    fn negative_power_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "device_id,timestamp,power_watts").unwrap();
        writeln!(file, "plug-1,2025-01-01T00:00:00Z,-3").unwrap();
        file.flush().unwrap();

        let err = load_readings_csv(file.path()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidReading(_)));
    }
}
