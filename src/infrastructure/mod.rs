//! Infrastructure layer - storage, HTTP client, configuration, logging.

pub mod config;
pub mod database_connection;
pub mod logging;
pub mod sales_repository;
pub mod secret_store;
pub mod steam_client;
pub mod sync_task_repository;

pub use config::SyncConfig;
pub use database_connection::DatabaseConnection;
pub use sales_repository::{RecordStore, SalesRepository};
pub use secret_store::{InMemorySecretStore, SecretStore};
pub use steam_client::{ChangedDates, PartnerFinancialsApi, SteamApiError, SteamClient};
pub use sync_task_repository::SyncTaskRepository;
