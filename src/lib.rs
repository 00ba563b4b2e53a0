pub mod config;
pub mod credentials;
pub mod dashboard;
pub mod db;
pub mod errors;
pub mod kpi_status;
pub mod lockout;
pub mod models;
pub mod policy;
pub mod security_countries;
pub mod session;
pub mod tracker;

pub use crate::errors::{AppError, AppResult};
pub use crate::lockout::{Clock, ManualClock, SystemClock};
pub use crate::tracker::TrackerCore;

use crate::config::{settings_overrides, BootstrapConfig};
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Opens the database, applies environment overrides and seeds the admin account.
pub fn run() -> anyhow::Result<()> {
    let config = BootstrapConfig::from_env();
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data directory {}", config.data_dir.display()))?;
    init_tracing(&config.data_dir).map_err(anyhow::Error::msg)?;

    let tracker = TrackerCore::open(&config.db_path, Arc::new(SystemClock))?;
    let overrides = settings_overrides(|key| std::env::var(key).ok())?;
    let settings = tracker.apply_settings_patch(overrides)?;
    tracker.ensure_admin(&config.admin_username, config.admin_password.as_deref())?;

    tracing::info!(
        db_path = %config.db_path.display(),
        threshold_green = settings.threshold_green,
        threshold_yellow = settings.threshold_yellow,
        max_failed_attempts = settings.max_failed_attempts,
        "agency tracker bootstrapped"
    );
    Ok(())
}

fn init_tracing(data_dir: &Path) -> Result<(), String> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "tracker.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}
