//! Logging setup and the lifecycle events shared by the binaries.
//!
//! Every event carries `component` (the binary or module emitting it) and a
//! dotted `event` name, so JSON output can be filtered per stage.

use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{flag_from_env, override_from_env};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `powercast=debug,axum=warn`.
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Reads `POWERCAST_LOG_LEVEL`, `POWERCAST_LOG_FORMAT` and `POWERCAST_LOG_TARGET`.
pub fn logging_config_from_env() -> LoggingConfig {
    let mut config = LoggingConfig::default();
    override_from_env("POWERCAST_LOG_LEVEL", &mut config.level);
    override_from_env("POWERCAST_LOG_FORMAT", &mut config.format);
    flag_from_env("POWERCAST_LOG_TARGET", &mut config.include_target);
    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(config.format == LogFormat::Pretty);

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }
    Ok(())
}

pub fn log_app_start(component: &'static str, config: &LoggingConfig) {
    info!(
        component,
        event = "app.start",
        version = env!("CARGO_PKG_VERSION"),
        log_level = %config.level,
        log_format = ?config.format
    );
}

pub fn log_app_bind(bound_addr: SocketAddr) {
    info!(
        component = "forecast_server",
        event = "app.bind",
        bind_addr = %bound_addr,
        route = "/api"
    );
}

/// `rows` is the number of readings written when the store was just filled.
pub fn log_store_opened(component: &'static str, path: &Path, rows: Option<usize>) {
    info!(
        component,
        event = "store.opened",
        path = %path.display(),
        rows_written = rows.unwrap_or(0)
    );
}

pub fn log_models_restored(model_dir: &Path, restored: usize, failed: usize) {
    if failed > 0 {
        warn!(
            component = "forecast_server",
            event = "models.restored",
            model_dir = %model_dir.display(),
            restored,
            failed
        );
    } else {
        info!(
            component = "forecast_server",
            event = "models.restored",
            model_dir = %model_dir.display(),
            restored
        );
    }
}
