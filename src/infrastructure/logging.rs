//! Logging initialization.
//!
//! Console output is always enabled, filtered through `RUST_LOG` with a sane
//! default. An optional daily-rolling file layer can be added for long
//! unattended syncs.

use anyhow::Result;
use std::path::Path;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// Keeps the non-blocking file writer alive for the process lifetime.
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("steam_sales_sync=info"))
}

/// Console-only logging.
pub fn init_logging() -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer())
        .try_init()?;
    Ok(())
}

/// Console plus a daily-rolling log file under `log_dir`.
pub fn init_logging_with_file(log_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(log_dir)?;
    let appender = tracing_appender::rolling::daily(log_dir, "steam-sales-sync.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()?;
    Ok(())
}
