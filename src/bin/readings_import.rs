use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use powercast::{
    forecast_config_from_env, init_logging, load_readings_csv, log_app_start, log_store_opened,
    logging_config_from_env, runtime_paths_from_env, scaler_path, ForecastService,
    SqliteReadingStore,
};

const COMPONENT: &str = "readings_import";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(COMPONENT, &logging_cfg);

    let mut csv_path: Option<PathBuf> = None;
    let mut train = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--train" => train = true,
            other if csv_path.is_none() => csv_path = Some(PathBuf::from(other)),
            other => return Err(format!("unexpected argument: {other}").into()),
        }
    }
    let csv_path = csv_path.ok_or("usage: readings_import <readings.csv> [--train]")?;
    let paths = runtime_paths_from_env();

    let readings = load_readings_csv(&csv_path)?;
    let store = Arc::new(SqliteReadingStore::open(&paths.store_path)?);
    let written = store.save_batch(&readings)?;
    log_store_opened(COMPONENT, &paths.store_path, Some(written));

    let mut latest: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
    for reading in &readings {
        let entry = latest
            .entry(reading.device_id.clone())
            .or_insert(reading.timestamp);
        if reading.timestamp > *entry {
            *entry = reading.timestamp;
        }
    }

    println!(
        "Imported {} readings for {} devices into {}",
        written,
        latest.len(),
        paths.store_path.display()
    );

    if !train {
        return Ok(());
    }

    std::fs::create_dir_all(&paths.model_dir)?;
    let service = ForecastService::with_seasonal_baseline(store, forecast_config_from_env())?;
    for (device_id, last_seen) in latest {
        let as_of = last_seen + Duration::hours(1);
        match service.train_at(&device_id, as_of).await {
            Ok(report) => {
                println!("{}", serde_json::to_string_pretty(&report)?);
                if let Some(scaler) = service.scaler_state(&device_id) {
                    let path = scaler_path(&paths.model_dir, &device_id);
                    scaler.save_json(&path)?;
                    println!("Saved scaler for {device_id} to {}", path.display());
                }
            }
            Err(err) => eprintln!("training skipped for {device_id}: {err}"),
        }
    }

    Ok(())
}
