//! Three-phase sync run: discovery, populate, aggregate recomputation.
//!
//! Discovery asks each credential's API for the dates changed since its
//! stored highwatermark and turns them into persistent tasks. Populate drains
//! the task queue with a bounded worker pool, streaming fetched records
//! through the backpressured writer. Aggregates rebuild the summary tables
//! once the raw data settled. New highwatermarks are held in memory for the
//! whole run and committed only after populate and aggregates both succeed;
//! an interrupted run therefore re-discovers from the old cursor and the
//! task queue carries the remaining work across the crash.

use crate::application::aggregate_service::AggregateRecomputer;
use crate::application::record_writer::{RecordQueue, WriterError, spawn_writer};
use crate::domain::events::{ProgressCallback, SyncProgress, SyncReport, SyncStatus};
use crate::domain::models::{ApiKeyInfo, KeySegment, SyncTask};
use crate::infrastructure::sales_repository::{RecordStore, SalesRepository};
use crate::infrastructure::secret_store::SecretStore;
use crate::infrastructure::steam_client::{PartnerFinancialsApi, SteamApiError};
use crate::infrastructure::sync_task_repository::SyncTaskRepository;
use crate::infrastructure::SyncConfig;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage failure: {0}")]
    Store(#[source] anyhow::Error),
    #[error("discovery failed for key {api_key_id}: {source}")]
    Discovery {
        api_key_id: String,
        #[source]
        source: SteamApiError,
    },
    #[error(transparent)]
    Writer(#[from] WriterError),
    #[error("aggregate recomputation failed: {0}")]
    Aggregate(#[source] anyhow::Error),
}

pub struct SyncOrchestrator {
    config: SyncConfig,
    api: Arc<dyn PartnerFinancialsApi>,
    secrets: Arc<dyn SecretStore>,
    tasks: SyncTaskRepository,
    sales: SalesRepository,
    /// Write target for fetched records. Usually the same repository as
    /// `sales`, injected separately so tests can interpose.
    store: Arc<dyn RecordStore>,
    aggregates: Arc<dyn AggregateRecomputer>,
}

impl SyncOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SyncConfig,
        api: Arc<dyn PartnerFinancialsApi>,
        secrets: Arc<dyn SecretStore>,
        tasks: SyncTaskRepository,
        sales: SalesRepository,
        store: Arc<dyn RecordStore>,
        aggregates: Arc<dyn AggregateRecomputer>,
    ) -> Self {
        Self {
            config,
            api,
            secrets,
            tasks,
            sales,
            store,
            aggregates,
        }
    }

    /// Full sync: discovery across all credentials, then populate and
    /// aggregates. Tasks left pending by an earlier interrupted run are
    /// folded into this run's populate phase.
    pub async fn run_sync(
        &self,
        credentials: &[ApiKeyInfo],
        on_progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let result = self.run_sync_inner(credentials, on_progress.clone(), cancel).await;
        report_failure(&on_progress, result)
    }

    async fn run_sync_inner(
        &self,
        credentials: &[ApiKeyInfo],
        on_progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let reset = self.tasks.reset_in_progress_tasks().await.map_err(SyncError::Store)?;
        if reset > 0 {
            info!(reset, "reverted interrupted tasks to todo");
        }

        let total_keys = credentials.len() as u32;
        let mut keys_checked = 0u32;
        let mut dates_discovered = 0u32;
        let mut pending_hwms: Vec<(String, i64)> = Vec::new();

        for cred in credentials {
            if cancel.is_cancelled() {
                info!("sync cancelled during discovery");
                on_progress(SyncProgress::Cancelled {
                    tasks_completed: 0,
                    total_tasks: 0,
                });
                return Ok(SyncReport::empty(SyncStatus::Cancelled));
            }

            let secret = self
                .secrets
                .get_secret(&cred.id)
                .await
                .map_err(SyncError::Store)?;
            let Some(secret) = secret else {
                warn!(key = cred.label(), "no secret stored for key, skipping");
                keys_checked += 1;
                on_progress(SyncProgress::Discovery {
                    keys_checked,
                    total_keys,
                    dates_discovered,
                });
                continue;
            };

            let since = self
                .sales
                .get_highwatermark(&cred.id)
                .await
                .map_err(SyncError::Store)?;
            // A discovery failure is fatal for the whole run: without a
            // trustworthy date list we cannot know what to fetch.
            let changed = self
                .api
                .discover_changed_dates(&secret, since)
                .await
                .map_err(|source| SyncError::Discovery {
                    api_key_id: cred.id.clone(),
                    source,
                })?;

            info!(
                key = cred.label(),
                dates = changed.dates.len(),
                highwatermark = changed.new_highwatermark,
                "discovery complete for key"
            );
            if !changed.dates.is_empty() {
                self.tasks
                    .create_tasks(&cred.id, &changed.dates)
                    .await
                    .map_err(SyncError::Store)?;
            }

            dates_discovered += changed.dates.len() as u32;
            pending_hwms.push((cred.id.clone(), changed.new_highwatermark));
            keys_checked += 1;
            on_progress(SyncProgress::Discovery {
                keys_checked,
                total_keys,
                dates_discovered,
            });
        }

        self.populate_and_finish(credentials, pending_hwms, on_progress, cancel)
            .await
    }

    /// Continues from whatever the task queue holds, skipping discovery and
    /// leaving stored highwatermarks untouched. Entry point after a crash or
    /// cancellation.
    pub async fn resume(
        &self,
        credentials: &[ApiKeyInfo],
        on_progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let result = self.resume_inner(credentials, on_progress.clone(), cancel).await;
        report_failure(&on_progress, result)
    }

    async fn resume_inner(
        &self,
        credentials: &[ApiKeyInfo],
        on_progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let reset = self.tasks.reset_in_progress_tasks().await.map_err(SyncError::Store)?;
        info!(reset, "resuming from persistent task queue");

        self.populate_and_finish(credentials, Vec::new(), on_progress, cancel)
            .await
    }

    async fn populate_and_finish(
        &self,
        credentials: &[ApiKeyInfo],
        pending_hwms: Vec<(String, i64)>,
        on_progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let mut pending = self.tasks.get_pending_tasks().await.map_err(SyncError::Store)?;
        sort_tasks(&mut pending);

        if pending.is_empty() {
            // Nothing changed anywhere. The cursors still advance: an empty
            // populate phase completed trivially.
            self.commit_highwatermarks(&pending_hwms).await?;
            info!("no pending tasks, sync complete");
            on_progress(SyncProgress::Complete {
                tasks_completed: 0,
                records_fetched: 0,
            });
            return Ok(SyncReport::empty(SyncStatus::Completed));
        }

        let total_tasks = pending.len() as u32;
        let labels: HashMap<String, String> = credentials
            .iter()
            .map(|c| (c.id.clone(), c.label().to_string()))
            .collect();

        // Resolve each distinct key's secret up front; tasks whose key has no
        // secret fail individually instead of poisoning the run.
        let mut secrets: HashMap<String, Option<String>> = HashMap::new();
        for task in &pending {
            if !secrets.contains_key(&task.api_key_id) {
                let secret = self
                    .secrets
                    .get_secret(&task.api_key_id)
                    .await
                    .map_err(SyncError::Store)?;
                if secret.is_none() {
                    warn!(key = %task.api_key_id, "pending tasks reference a key with no secret");
                }
                secrets.insert(task.api_key_id.clone(), secret);
            }
        }

        let mut pending_per_key: BTreeMap<String, u32> = BTreeMap::new();
        for task in &pending {
            *pending_per_key.entry(task.api_key_id.clone()).or_default() += 1;
        }

        let (queue, writer) = spawn_writer(
            self.store.clone(),
            self.config.write_queue_max_records,
            self.config.write_flush_threshold,
        );

        let worker_count = self.config.worker_count.min(pending.len()).max(1);
        let shared = Arc::new(PopulateShared {
            tasks: pending,
            next_index: Mutex::new(0),
            stats: Mutex::new(PopulateStats {
                completed: 0,
                fetched: 0,
                failed: Vec::new(),
                pending_per_key,
            }),
            total_tasks,
            labels,
            secrets,
            on_progress: on_progress.clone(),
        });

        info!(total_tasks, worker_count, "populate phase starting");
        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            handles.push(tokio::spawn(populate_worker(
                worker_id,
                shared.clone(),
                self.tasks.clone(),
                self.api.clone(),
                queue.clone(),
                cancel.clone(),
            )));
        }
        drop(queue);

        let mut fatal: Option<SyncError> = None;
        for outcome in futures::future::join_all(handles).await {
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                }
                Err(e) => {
                    if fatal.is_none() {
                        fatal = Some(SyncError::Store(anyhow::anyhow!(
                            "populate worker panicked: {e}"
                        )));
                    }
                }
            }
        }

        // The writer drains and flushes everything already fetched before it
        // exits, so a cancelled run loses no fetched data.
        let written = match writer.join().await {
            Ok(written) => written,
            Err(writer_err) => {
                // Workers that merely saw the queue close died downstream of
                // the writer's own failure; surface the root cause.
                return Err(match fatal {
                    Some(SyncError::Writer(WriterError::Closed)) | None => {
                        SyncError::Writer(writer_err)
                    }
                    Some(other) => other,
                });
            }
        };

        if let Some(e) = fatal {
            return Err(e);
        }

        let (completed, fetched, failed) = {
            let stats = shared.stats.lock().await;
            (stats.completed, stats.fetched, stats.failed.clone())
        };

        if cancel.is_cancelled() {
            info!(completed, total_tasks, written, "sync cancelled; pending tasks preserved");
            on_progress(SyncProgress::Cancelled {
                tasks_completed: completed,
                total_tasks,
            });
            return Ok(SyncReport {
                status: SyncStatus::Cancelled,
                tasks_total: total_tasks,
                tasks_completed: completed,
                tasks_failed: failed.len() as u32,
                records_fetched: fetched,
                records_written: written,
            });
        }

        if written > 0 {
            self.aggregates
                .recompute_all(&|percent| on_progress(SyncProgress::Aggregates { percent }))
                .await
                .map_err(SyncError::Aggregate)?;
        }

        self.tasks.clear_completed_tasks().await.map_err(SyncError::Store)?;

        // Failed dates go back into the queue as fresh tasks so the next run
        // (or an explicit resume) retries them from scratch.
        let mut failed_by_key: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (key, date) in &failed {
            failed_by_key.entry(key.clone()).or_default().push(date.clone());
        }
        for (key, dates) in &failed_by_key {
            warn!(key = %key, dates = dates.len(), "re-queueing failed dates");
            self.tasks.create_tasks(key, dates).await.map_err(SyncError::Store)?;
        }

        self.commit_highwatermarks(&pending_hwms).await?;

        info!(completed, fetched, written, failed = failed.len(), "sync complete");
        on_progress(SyncProgress::Complete {
            tasks_completed: completed,
            records_fetched: fetched,
        });
        Ok(SyncReport {
            status: SyncStatus::Completed,
            tasks_total: total_tasks,
            tasks_completed: completed,
            tasks_failed: failed.len() as u32,
            records_fetched: fetched,
            records_written: written,
        })
    }

    async fn commit_highwatermarks(&self, hwms: &[(String, i64)]) -> Result<(), SyncError> {
        for (api_key_id, value) in hwms {
            self.sales
                .set_highwatermark(api_key_id, *value)
                .await
                .map_err(SyncError::Store)?;
            debug!(key = %api_key_id, value, "highwatermark committed");
        }
        Ok(())
    }
}

/// A run that dies must say so through the progress channel too, not only
/// through the returned error; callers driving a UI see only the frames.
fn report_failure(
    on_progress: &ProgressCallback,
    result: Result<SyncReport, SyncError>,
) -> Result<SyncReport, SyncError> {
    if let Err(e) = &result {
        on_progress(SyncProgress::Error { message: e.to_string() });
    }
    result
}

/// Deterministic claim order: by key, then by date.
fn sort_tasks(tasks: &mut [SyncTask]) {
    tasks.sort_unstable_by(|a, b| {
        (a.api_key_id.as_str(), a.date.as_str()).cmp(&(b.api_key_id.as_str(), b.date.as_str()))
    });
}

struct PopulateShared {
    tasks: Vec<SyncTask>,
    next_index: Mutex<usize>,
    stats: Mutex<PopulateStats>,
    total_tasks: u32,
    labels: HashMap<String, String>,
    secrets: HashMap<String, Option<String>>,
    on_progress: ProgressCallback,
}

struct PopulateStats {
    completed: u32,
    fetched: u64,
    failed: Vec<(String, String)>,
    pending_per_key: BTreeMap<String, u32>,
}

async fn populate_worker(
    worker_id: usize,
    shared: Arc<PopulateShared>,
    tasks: SyncTaskRepository,
    api: Arc<dyn PartnerFinancialsApi>,
    queue: RecordQueue,
    cancel: CancellationToken,
) -> Result<(), SyncError> {
    loop {
        if cancel.is_cancelled() {
            debug!(worker_id, "worker stopping on cancellation");
            return Ok(());
        }

        let index = {
            let mut next = shared.next_index.lock().await;
            if *next >= shared.tasks.len() {
                return Ok(());
            }
            let index = *next;
            *next += 1;
            index
        };
        let task = &shared.tasks[index];
        debug!(worker_id, task = %task.id, "claimed task");

        if let Err(e) = tasks.mark_in_progress(&task.id).await {
            cancel.cancel();
            return Err(SyncError::Store(e));
        }

        let fetch = match shared.secrets.get(&task.api_key_id).and_then(Clone::clone) {
            Some(secret) => api.fetch_date(&secret, &task.api_key_id, &task.date, &cancel).await,
            None => Err(SteamApiError::Api("no secret stored for key".into())),
        };

        match fetch {
            Ok(records) => {
                let fetched = records.len() as u64;
                if let Err(e) = queue.push(records).await {
                    cancel.cancel();
                    return Err(SyncError::Writer(e));
                }
                if let Err(e) = tasks.mark_done(&task.id).await {
                    cancel.cancel();
                    return Err(SyncError::Store(e));
                }
                record_completion(&shared, task, fetched, false).await;
            }
            Err(SteamApiError::Cancelled) => {
                // The task stays in_progress; the next run's reset reclaims it.
                debug!(worker_id, task = %task.id, "fetch cancelled mid-task");
                return Ok(());
            }
            Err(e) => {
                // One broken date must not sink the run. Mark it done so the
                // queue drains; it is re-queued for retry at completion.
                warn!(task = %task.id, error = %e, "date fetch failed");
                if let Err(e) = tasks.mark_done(&task.id).await {
                    cancel.cancel();
                    return Err(SyncError::Store(e));
                }
                record_completion(&shared, task, 0, true).await;
            }
        }
    }
}

async fn record_completion(shared: &PopulateShared, task: &SyncTask, fetched: u64, failed: bool) {
    let mut stats = shared.stats.lock().await;
    stats.completed += 1;
    stats.fetched += fetched;
    if failed {
        stats.failed.push((task.api_key_id.clone(), task.date.clone()));
    }
    if let Some(count) = stats.pending_per_key.get_mut(&task.api_key_id) {
        *count = count.saturating_sub(1);
    }

    let segments: Vec<KeySegment> = stats
        .pending_per_key
        .iter()
        .map(|(id, &pending_task_count)| KeySegment {
            id: id.clone(),
            display_name: shared.labels.get(id).cloned().unwrap_or_else(|| id.clone()),
            pending_task_count,
        })
        .collect();

    // Emitted while holding the stats lock so frames cannot interleave and
    // counters never appear to regress.
    (shared.on_progress)(SyncProgress::Populate {
        tasks_completed: stats.completed,
        total_tasks: shared.total_tasks,
        records_fetched: stats.fetched,
        segments,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{TaskStatus, task_id};
    use rstest::rstest;

    fn task(key: &str, date: &str) -> SyncTask {
        SyncTask {
            id: task_id(key, date),
            api_key_id: key.into(),
            date: date.into(),
            status: TaskStatus::Todo,
            created_at: 0,
            completed_at: None,
        }
    }

    #[rstest]
    #[case(vec![("b", "2024-01-01"), ("a", "2024-01-02"), ("a", "2024-01-01")],
           vec!["a|2024-01-01", "a|2024-01-02", "b|2024-01-01"])]
    #[case(vec![("a", "2024-02-10"), ("a", "2024-01-30")],
           vec!["a|2024-01-30", "a|2024-02-10"])]
    fn tasks_sort_by_key_then_date(
        #[case] input: Vec<(&str, &str)>,
        #[case] expected: Vec<&str>,
    ) {
        let mut tasks: Vec<SyncTask> = input.iter().map(|(k, d)| task(k, d)).collect();
        sort_tasks(&mut tasks);
        let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, expected);
    }
}
