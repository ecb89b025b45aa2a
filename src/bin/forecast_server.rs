use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use chrono::Utc;
use powercast::{
    forecast_config_from_env, forecast_router, init_logging, log_app_bind, log_app_start,
    log_models_restored, log_store_opened, logging_config_from_env, runtime_paths_from_env,
    saved_scalers, ForecastService, ScalerState, SqliteReadingStore,
};
use tracing::{debug, warn};

const COMPONENT: &str = "forecast_server";
const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(COMPONENT, &logging_cfg);

    let paths = runtime_paths_from_env();
    let addr: SocketAddr = paths.addr.parse()?;

    let store = Arc::new(SqliteReadingStore::open(&paths.store_path)?);
    log_store_opened(COMPONENT, &paths.store_path, None);

    let service = Arc::new(ForecastService::with_seasonal_baseline(
        store,
        forecast_config_from_env(),
    )?);
    restore_saved_models(&service, &paths.model_dir).await?;
    spawn_cache_sweeper(Arc::clone(&service));

    let app = forecast_router(service);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(bound_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Reinstalls every device whose scaler was saved by `readings_import --train`.
async fn restore_saved_models(
    service: &ForecastService,
    model_dir: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut restored = 0;
    let mut failed = 0;
    for (device_id, path) in saved_scalers(model_dir)? {
        let outcome = match ScalerState::load_json(&path) {
            Ok(scaler) => service
                .restore_at(&device_id, scaler, Utc::now())
                .await
                .map(|_| ())
                .map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };
        match outcome {
            Ok(()) => restored += 1,
            Err(error) => {
                failed += 1;
                warn!(
                    component = COMPONENT,
                    event = "model.restore.failed",
                    device_id = %device_id,
                    path = %path.display(),
                    error = %error
                );
            }
        }
    }
    log_models_restored(model_dir, restored, failed);
    Ok(())
}

fn spawn_cache_sweeper(service: Arc<ForecastService>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CACHE_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let removed = service.sweep_cache(Utc::now());
            debug!(component = COMPONENT, event = "cache.sweep.tick", removed);
        }
    });
}
