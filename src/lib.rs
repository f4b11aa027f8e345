//! Crash-recoverable sync engine for Steam partner sales data.
//!
//! The engine pulls transactional sales data for any number of partner API
//! keys, persists it to a local SQLite database, and recomputes derived
//! summary tables. A run moves through three phases: discovery of changed
//! dates per key, a bounded worker pool populating one (key, date) task at a
//! time, and aggregate recomputation. The task queue is persistent, so an
//! interrupted run resumes where it stopped, and per-key highwatermark
//! cursors are committed only after a run fully succeeds.

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::{SummaryAggregator, SyncError, SyncOrchestrator};
pub use domain::events::{ProgressCallback, SyncProgress, SyncReport, SyncStatus};
pub use domain::models::{ApiKeyInfo, KeySegment, SalesRecord, SyncTask, TaskStatus};
pub use infrastructure::{
    DatabaseConnection, InMemorySecretStore, PartnerFinancialsApi, RecordStore, SalesRepository,
    SecretStore, SteamApiError, SteamClient, SyncConfig, SyncTaskRepository,
};
