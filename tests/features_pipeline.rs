use std::io::Write;

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use powercast::{
    build_feature_schema, load_readings_csv, FeatureConfig, FeatureEngineer, FeatureError,
    FeatureGroup, ReadingStore, Reading, SqliteReadingStore, StoreError, TempCategory,
    WeatherSample, FEATURE_SCHEMA_VERSION,
};
use tempfile::NamedTempFile;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 6, 0, 0, 0).unwrap() // a Monday
}

fn readings(n: i64) -> Vec<Reading> {
    (0..n)
        .map(|h| Reading::new("plug", t0() + Duration::hours(h), 10.0 + h as f64))
        .collect()
}

#[test]
fn schema_order_and_fingerprint_are_deterministic() {
    let cfg = FeatureConfig::default();
    let schema_a = build_feature_schema(&cfg);
    let schema_b = build_feature_schema(&cfg);

    assert_eq!(schema_a.version, FEATURE_SCHEMA_VERSION);
    assert_eq!(schema_a.columns.len(), 47);
    assert_eq!(schema_a.columns[0].name, "hour");
    assert_eq!(schema_a.columns[17].name, "temperature");
    assert_eq!(schema_a.columns[24].name, "power_watts_lag_1");
    assert_eq!(schema_a.columns[24].group, FeatureGroup::Lag);
    assert_eq!(schema_a.columns[29].name, "power_watts_rolling_mean_6");
    assert_eq!(schema_a.columns[41].name, "power_watts_ema_0.1");
    assert_eq!(schema_a.columns[46].name, "power_relative_to_device_mean");
    assert_eq!(schema_a.fingerprint.len(), 64);
    assert_eq!(schema_a, schema_b);

    let trimmed = build_feature_schema(&FeatureConfig {
        lags: vec![1],
        ..FeatureConfig::default()
    });
    assert_ne!(trimmed.fingerprint, schema_a.fingerprint);
}

#[test]
fn warmup_rows_are_incomplete_and_later_rows_carry_lags() {
    let engineer = FeatureEngineer::new(FeatureConfig::default()).unwrap();
    let table = engineer.augment(&readings(48), None).unwrap();

    assert_eq!(table.rows.len(), 48);
    assert_eq!(table.complete_len(), 24);
    assert!(!table.rows[23].is_complete());
    assert!(table.rows[24].is_complete());

    assert_eq!(table.value(24, "power_watts_lag_1"), Some(33.0));
    assert_eq!(table.value(24, "power_watts_lag_24"), Some(10.0));
    assert_eq!(table.value(5, "power_watts_rolling_mean_6"), Some(12.5));
    assert_eq!(table.value(4, "power_watts_rolling_mean_6"), None);
    assert_eq!(table.value(30, "hour"), Some(6.0));
    assert_eq!(table.value(30, "is_weekend"), Some(0.0));
    assert_eq!(table.value(30, "is_morning_peak"), Some(0.0));
    assert_eq!(table.value(31, "is_morning_peak"), Some(1.0));
}

#[test]
fn supplied_weather_drives_categories_and_comfort_flags() {
    let engineer = FeatureEngineer::new(FeatureConfig::default()).unwrap();
    let input = readings(2);
    let weather = vec![
        WeatherSample {
            timestamp: input[0].timestamp,
            temperature: 5.0,
            humidity: 70.0,
            cloud_cover: 80.0,
        },
        WeatherSample {
            timestamp: input[1].timestamp,
            temperature: 31.0,
            humidity: 30.0,
            cloud_cover: 10.0,
        },
    ];
    let table = engineer.augment(&input, Some(&weather)).unwrap();

    assert_eq!(table.rows[0].temp_category, Some(TempCategory::Cold));
    assert_eq!(table.value(0, "heating_likely"), Some(1.0));
    assert_eq!(table.value(0, "temp_cold"), Some(1.0));
    assert_eq!(table.rows[1].temp_category, Some(TempCategory::Hot));
    assert_eq!(table.value(1, "cooling_likely"), Some(1.0));
    assert_eq!(table.value(1, "temp_hot"), Some(1.0));
}

#[test]
fn mixed_devices_are_rejected() {
    let engineer = FeatureEngineer::new(FeatureConfig::default()).unwrap();
    let mut input = readings(3);
    input.push(Reading::new("fridge", t0() + Duration::hours(10), 1.0));

    let err = engineer.augment(&input, None).unwrap_err();
    assert!(matches!(err, FeatureError::MixedDevices { .. }));
}

#[test]
fn invalid_config_is_rejected() {
    let err = FeatureEngineer::new(FeatureConfig {
        rolling_windows: vec![1],
        ..FeatureConfig::default()
    })
    .err()
    .expect("window of one should be rejected");
    assert!(matches!(err, FeatureError::InvalidConfig(_)));
}

#[test]
fn csv_import_lands_in_sqlite_and_reads_back_in_order() {
    let mut csv_file = NamedTempFile::new().unwrap();
    writeln!(csv_file, "device_id,timestamp,power_watts").unwrap();
    writeln!(csv_file, "plug,2025-01-06T02:00:00Z,12.5").unwrap();
    writeln!(csv_file, "plug,2025-01-06T00:00:00Z,10.0").unwrap();
    writeln!(csv_file, "fridge,2025-01-06T01:00:00+00:00,80.0").unwrap();
    writeln!(csv_file, "plug,2025-01-06T01:00:00Z,11.0").unwrap();
    csv_file.flush().unwrap();

    let loaded = load_readings_csv(csv_file.path()).unwrap();
    assert_eq!(loaded.len(), 4);
    assert_eq!(loaded[0].device_id, "fridge");

    let db = NamedTempFile::new().unwrap();
    let store = SqliteReadingStore::open(db.path()).unwrap();
    assert_eq!(store.save_batch(&loaded).unwrap(), 4);
    assert_eq!(store.count_device("plug").unwrap(), 3);

    let plug = store
        .fetch("plug", t0(), t0() + Duration::hours(2))
        .unwrap();
    let hours: Vec<u32> = plug.iter().map(|r| r.timestamp.hour()).collect();
    assert_eq!(hours, vec![0, 1, 2]);

    // Saving the same timestamp again replaces the value.
    store.save("plug", t0(), 99.0).unwrap();
    let first = store.fetch("plug", t0(), t0()).unwrap();
    assert_eq!(first, vec![Reading::new("plug", t0(), 99.0)]);
}

#[test]
fn csv_rows_with_negative_power_are_rejected() {
    let mut csv_file = NamedTempFile::new().unwrap();
    writeln!(csv_file, "device_id,timestamp,power_watts").unwrap();
    writeln!(csv_file, "plug,2025-01-06T00:00:00Z,-3.0").unwrap();
    csv_file.flush().unwrap();

    let err = load_readings_csv(csv_file.path()).unwrap_err();
    assert!(matches!(err, StoreError::InvalidReading(_)));
}
