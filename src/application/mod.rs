//! Application layer - orchestration of the sync pipeline.

pub mod aggregate_service;
pub mod record_writer;
pub mod sync_orchestrator;

pub use aggregate_service::{AggregateRecomputer, SummaryAggregator};
pub use record_writer::{RecordQueue, WriterError, WriterTask, spawn_writer};
pub use sync_orchestrator::{SyncError, SyncOrchestrator};
