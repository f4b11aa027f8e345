//! Progress events emitted by the sync orchestrator.
//!
//! `SyncProgress` is the sole output contract to the caller: a closed tagged
//! union with one variant per phase, each carrying only that phase's
//! counters. Counters never regress within a phase.

use crate::domain::models::KeySegment;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Caller-supplied progress sink. Invoked once per discovery step, once per
/// fetch completion during populate, and on aggregate progress ticks, so it
/// must stay cheap.
pub type ProgressCallback = Arc<dyn Fn(SyncProgress) + Send + Sync>;

/// Live progress of one sync run, tagged by phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum SyncProgress {
    /// Phase 1: querying each key's changed dates.
    #[serde(rename_all = "camelCase")]
    Discovery {
        keys_checked: u32,
        total_keys: u32,
        dates_discovered: u32,
    },
    /// Phase 2: fetching and persisting one task per (key, date).
    /// `tasks_completed` counts fetch completions (success or tolerated
    /// failure), not durable writes.
    #[serde(rename_all = "camelCase")]
    Populate {
        tasks_completed: u32,
        total_tasks: u32,
        records_fetched: u64,
        segments: Vec<KeySegment>,
    },
    /// Phase 3: recomputing derived summaries, 0–100.
    #[serde(rename_all = "camelCase")]
    Aggregates { percent: u8 },
    #[serde(rename_all = "camelCase")]
    Complete {
        tasks_completed: u32,
        records_fetched: u64,
    },
    #[serde(rename_all = "camelCase")]
    Cancelled {
        tasks_completed: u32,
        total_tasks: u32,
    },
    #[serde(rename_all = "camelCase")]
    Error { message: String },
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    Completed,
    Cancelled,
}

/// Final totals returned by `run_sync` / `resume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub status: SyncStatus,
    pub tasks_total: u32,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub records_fetched: u64,
    pub records_written: u64,
}

impl SyncReport {
    pub fn empty(status: SyncStatus) -> Self {
        Self {
            status,
            tasks_total: 0,
            tasks_completed: 0,
            tasks_failed: 0,
            records_fetched: 0,
            records_written: 0,
        }
    }
}
