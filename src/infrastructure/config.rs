//! Sync engine configuration.
//!
//! Settings are serde-backed with sensible defaults and can be loaded from an
//! optional JSON file under the platform config directory. A missing file is
//! created with defaults on first load so users have something to edit.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tracing::info;

/// Tunables for one sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Number of concurrent populate workers claiming tasks.
    pub worker_count: usize,

    /// Maximum concurrent HTTP page requests, independent of `worker_count`
    /// (a worker may be blocked on write backpressure rather than on the
    /// network).
    pub http_concurrency: usize,

    /// Backpressure ceiling: maximum fetched-but-unwritten records buffered
    /// for the writer before fetch workers block.
    pub write_queue_max_records: usize,

    /// The writer flushes once this many records have accumulated; anything
    /// below waits for more unless the channel closes.
    pub write_flush_threshold: usize,

    /// Per-request timeout in seconds.
    pub request_timeout_seconds: u64,

    /// Base URL of the partner web API.
    pub api_base_url: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            http_concurrency: 3,
            write_queue_max_records: 20_000,
            write_flush_threshold: 2_000,
            request_timeout_seconds: 30,
            api_base_url: "https://partner.steamgames.com/webapi".to_string(),
        }
    }
}

impl SyncConfig {
    /// Default config file location, e.g. `~/.config/steam-sales-sync/config.json`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("steam-sales-sync")
            .join("config.json")
    }

    /// Loads the config from `path`, writing defaults there first if the file
    /// does not exist yet.
    pub async fn load_or_init(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            let config = Self::default();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let json = serde_json::to_string_pretty(&config)?;
            fs::write(path, json)
                .await
                .with_context(|| format!("failed to write default config to {}", path.display()))?;
            info!("Created default config at {}", path.display());
            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }
}
