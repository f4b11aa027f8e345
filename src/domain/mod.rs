//! Domain module - core data model and progress events.

pub mod events;
pub mod models;

pub use events::{ProgressCallback, SyncProgress, SyncReport, SyncStatus};
pub use models::{ApiKeyInfo, KeySegment, SalesRecord, SyncTask, TaskStatus, task_id};
