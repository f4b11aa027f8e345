//! End-to-end sync runs against a real temp-file SQLite database, driven by a
//! deterministic fake of the partner API.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use steam_sales_sync::application::{AggregateRecomputer, SummaryAggregator, WriterError};
use steam_sales_sync::infrastructure::steam_client::ChangedDates;
use steam_sales_sync::{
    ApiKeyInfo, DatabaseConnection, InMemorySecretStore, PartnerFinancialsApi, RecordStore,
    SalesRecord, SalesRepository, SteamApiError, SyncConfig, SyncError, SyncOrchestrator,
    SyncProgress, SyncReport, SyncStatus, SyncTaskRepository,
};
use tempfile::{TempDir, tempdir};
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeApi {
    /// Discovery response per secret.
    discoveries: Mutex<HashMap<String, ChangedDates>>,
    /// Records per (api_key_id, date).
    data: Mutex<HashMap<(String, String), Vec<SalesRecord>>>,
    /// (api_key_id, date) pairs whose fetch fails.
    failing: Mutex<HashSet<(String, String)>>,
    /// Secrets whose discovery call fails.
    failing_discovery: Mutex<HashSet<String>>,
    /// Cancels the run's token when this many fetches have started. One-shot.
    cancel_at_fetch: Option<usize>,
    cancel_fired: AtomicBool,
    fetch_count: AtomicUsize,
    /// (secret, highwatermark) of every discovery call, in order.
    discovery_calls: Mutex<Vec<(String, i64)>>,
}

impl FakeApi {
    fn set_discovery(&self, secret: &str, dates: &[&str], new_highwatermark: i64) {
        self.discoveries.lock().unwrap().insert(
            secret.to_string(),
            ChangedDates {
                dates: dates.iter().map(|d| d.to_string()).collect(),
                new_highwatermark,
            },
        );
    }

    fn set_records(&self, api_key_id: &str, date: &str, records: Vec<SalesRecord>) {
        self.data
            .lock()
            .unwrap()
            .insert((api_key_id.to_string(), date.to_string()), records);
    }

    fn fail_date(&self, api_key_id: &str, date: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert((api_key_id.to_string(), date.to_string()));
    }

    fn fail_discovery_for(&self, secret: &str) {
        self.failing_discovery.lock().unwrap().insert(secret.to_string());
    }
}

#[async_trait]
impl PartnerFinancialsApi for FakeApi {
    async fn discover_changed_dates(
        &self,
        api_key: &str,
        highwatermark: i64,
    ) -> Result<ChangedDates, SteamApiError> {
        self.discovery_calls
            .lock()
            .unwrap()
            .push((api_key.to_string(), highwatermark));

        if self.failing_discovery.lock().unwrap().contains(api_key) {
            return Err(SteamApiError::Api("synthetic discovery failure".into()));
        }

        Ok(self
            .discoveries
            .lock()
            .unwrap()
            .get(api_key)
            .cloned()
            .unwrap_or(ChangedDates {
                dates: vec![],
                new_highwatermark: highwatermark,
            }))
    }

    async fn fetch_date(
        &self,
        _api_key: &str,
        api_key_id: &str,
        date: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<SalesRecord>, SteamApiError> {
        if cancel.is_cancelled() {
            return Err(SteamApiError::Cancelled);
        }

        let n = self.fetch_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(limit) = self.cancel_at_fetch {
            if n == limit && !self.cancel_fired.swap(true, Ordering::SeqCst) {
                cancel.cancel();
            }
        }

        let pair = (api_key_id.to_string(), date.to_string());
        if self.failing.lock().unwrap().contains(&pair) {
            return Err(SteamApiError::Api("synthetic fetch failure".into()));
        }
        Ok(self.data.lock().unwrap().get(&pair).cloned().unwrap_or_default())
    }
}

struct FailingAggregator;

#[async_trait]
impl AggregateRecomputer for FailingAggregator {
    async fn recompute_all(&self, _on_progress: &(dyn Fn(u8) + Send + Sync)) -> Result<()> {
        Err(anyhow::anyhow!("synthetic aggregate failure"))
    }
}

/// Store whose writes always fail.
struct BrokenStore;

#[async_trait]
impl RecordStore for BrokenStore {
    async fn store_records(&self, _records: &[SalesRecord]) -> Result<()> {
        Err(anyhow::anyhow!("disk full"))
    }

    async fn delete_records_for(&self, _api_key_id: &str, _date: &str) -> Result<()> {
        Ok(())
    }
}

/// Slow store that records the largest single flush it ever saw.
struct SlowStore {
    inner: SalesRepository,
    delay: Duration,
    max_batch: AtomicUsize,
}

#[async_trait]
impl RecordStore for SlowStore {
    async fn store_records(&self, records: &[SalesRecord]) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.max_batch.fetch_max(records.len(), Ordering::SeqCst);
        self.inner.store_records(records).await
    }

    async fn delete_records_for(&self, api_key_id: &str, date: &str) -> Result<()> {
        self.inner.delete_records_for(api_key_id, date).await
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    _dir: TempDir,
    db: DatabaseConnection,
    tasks: SyncTaskRepository,
    sales: SalesRepository,
    secrets: Arc<InMemorySecretStore>,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("sync.db").display());
        let db = DatabaseConnection::new(&url).await.unwrap();
        db.migrate().await.unwrap();

        let tasks = SyncTaskRepository::new(db.pool().clone());
        let sales = SalesRepository::new(db.pool().clone());
        Self {
            _dir: dir,
            db,
            tasks,
            sales,
            secrets: InMemorySecretStore::new(),
        }
    }

    fn orchestrator(&self, api: Arc<FakeApi>) -> SyncOrchestrator {
        self.orchestrator_with(api, Arc::new(self.sales.clone()), test_config())
    }

    fn orchestrator_with(
        &self,
        api: Arc<FakeApi>,
        store: Arc<dyn RecordStore>,
        config: SyncConfig,
    ) -> SyncOrchestrator {
        SyncOrchestrator::new(
            config,
            api,
            self.secrets.clone(),
            self.tasks.clone(),
            self.sales.clone(),
            store,
            Arc::new(SummaryAggregator::new(self.db.pool().clone())),
        )
    }

    async fn credential(&self, secret: &str, name: &str) -> ApiKeyInfo {
        let cred = ApiKeyInfo::new(secret, Some(name.to_string()));
        self.secrets.insert(&cred.id, secret).await;
        cred
    }

    async fn total_sales_rows(&self) -> i64 {
        sqlx::query("SELECT COUNT(*) FROM sales")
            .fetch_one(self.db.pool())
            .await
            .unwrap()
            .get(0)
    }
}

fn test_config() -> SyncConfig {
    SyncConfig {
        worker_count: 2,
        http_concurrency: 2,
        write_queue_max_records: 1_000,
        write_flush_threshold: 10,
        ..SyncConfig::default()
    }
}

fn records_for(api_key_id: &str, date: &str, count: usize) -> Vec<SalesRecord> {
    (0..count)
        .map(|i| {
            let mut r = SalesRecord {
                api_key_id: api_key_id.into(),
                date: date.into(),
                line_item_type: "Package".into(),
                packageid: Some(i as i64),
                primary_appid: Some(10 + (i % 3) as i64),
                app_name: Some(format!("App {}", 10 + (i % 3))),
                country_code: "US".into(),
                currency: Some("USD".into()),
                net_units_sold: Some(1),
                units_sold: 1,
                gross_sales_usd: 4.99,
                net_sales_usd: 4.99,
                ..Default::default()
            };
            r.assign_unique_key();
            r
        })
        .collect()
}

fn capture_progress() -> (steam_sales_sync::ProgressCallback, Arc<Mutex<Vec<SyncProgress>>>) {
    let frames: Arc<Mutex<Vec<SyncProgress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = frames.clone();
    let callback: steam_sales_sync::ProgressCallback =
        Arc::new(move |frame| sink.lock().unwrap().push(frame));
    (callback, frames)
}

async fn run(
    orchestrator: &SyncOrchestrator,
    credentials: &[ApiKeyInfo],
) -> (Result<SyncReport, SyncError>, Vec<SyncProgress>) {
    let (callback, frames) = capture_progress();
    let result = orchestrator
        .run_sync(credentials, callback, CancellationToken::new())
        .await;
    let frames = frames.lock().unwrap().clone();
    (result, frames)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_run_syncs_two_keys_and_commits_highwatermarks() {
    let h = Harness::new().await;
    let k1 = h.credential("SECRET-AAAA", "Studio A").await;
    let k2 = h.credential("SECRET-BBBB", "Studio B").await;

    let api = Arc::new(FakeApi::default());
    api.set_discovery("SECRET-AAAA", &["2024-01-01", "2024-01-02"], 120);
    api.set_discovery("SECRET-BBBB", &[], 205);
    api.set_records(&k1.id, "2024-01-01", records_for(&k1.id, "2024-01-01", 25));
    api.set_records(&k1.id, "2024-01-02", records_for(&k1.id, "2024-01-02", 15));

    let orchestrator = h.orchestrator(api);
    let (result, frames) = run(&orchestrator, &[k1.clone(), k2.clone()]).await;

    let report = result.unwrap();
    assert_eq!(report.status, SyncStatus::Completed);
    assert_eq!(report.tasks_total, 2);
    assert_eq!(report.tasks_completed, 2);
    assert_eq!(report.tasks_failed, 0);
    assert_eq!(report.records_fetched, 40);
    assert_eq!(report.records_written, 40);

    assert_eq!(h.total_sales_rows().await, 40);
    assert_eq!(h.tasks.count_all_pending_tasks().await.unwrap(), 0);

    // Both cursors committed, including the key that had nothing to fetch.
    assert_eq!(h.sales.get_highwatermark(&k1.id).await.unwrap(), 120);
    assert_eq!(h.sales.get_highwatermark(&k2.id).await.unwrap(), 205);

    // Aggregates rebuilt from the stored records.
    let day: i64 = sqlx::query("SELECT total_units FROM daily_summaries WHERE date = '2024-01-01'")
        .fetch_one(h.db.pool())
        .await
        .unwrap()
        .get(0);
    assert_eq!(day, 25);

    // Progress: discovery frames, monotonic populate counters, Complete last.
    assert!(frames.iter().any(|f| matches!(f, SyncProgress::Discovery { .. })));
    let populate: Vec<u32> = frames
        .iter()
        .filter_map(|f| match f {
            SyncProgress::Populate { tasks_completed, .. } => Some(*tasks_completed),
            _ => None,
        })
        .collect();
    assert!(populate.windows(2).all(|w| w[0] <= w[1]));
    assert!(matches!(frames.last(), Some(SyncProgress::Complete { .. })));
}

#[tokio::test]
async fn cancelled_run_keeps_fetched_data_and_pending_tasks() {
    let h = Harness::new().await;
    let k1 = h.credential("SECRET-AAAA", "Studio A").await;

    let dates = ["2024-01-01", "2024-01-02", "2024-01-03", "2024-01-04", "2024-01-05", "2024-01-06"];
    let mut api = FakeApi::default();
    api.cancel_at_fetch = Some(2);
    let api = Arc::new(api);
    api.set_discovery("SECRET-AAAA", &dates, 300);
    for date in &dates {
        api.set_records(&k1.id, date, records_for(&k1.id, date, 10));
    }

    // Single worker makes the cancellation point deterministic: the first
    // two dates complete, the rest are never claimed.
    let config = SyncConfig { worker_count: 1, ..test_config() };
    let orchestrator = h.orchestrator_with(api, Arc::new(h.sales.clone()), config);
    let (callback, frames) = capture_progress();
    let report = orchestrator
        .run_sync(&[k1.clone()], callback, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, SyncStatus::Cancelled);
    assert_eq!(report.tasks_completed, 2);
    assert_eq!(report.records_written, 20, "fetched data must survive cancellation");

    assert_eq!(h.total_sales_rows().await, 20);
    assert_eq!(h.tasks.count_all_pending_tasks().await.unwrap(), 4);
    // An interrupted run never moves the cursor.
    assert_eq!(h.sales.get_highwatermark(&k1.id).await.unwrap(), 0);

    let frames = frames.lock().unwrap();
    assert!(matches!(frames.last(), Some(SyncProgress::Cancelled { .. })));
}

#[tokio::test]
async fn resume_finishes_what_a_cancelled_run_left_behind() {
    let h = Harness::new().await;
    let k1 = h.credential("SECRET-AAAA", "Studio A").await;

    let dates = ["2024-01-01", "2024-01-02", "2024-01-03", "2024-01-04"];
    let mut api = FakeApi::default();
    api.cancel_at_fetch = Some(1);
    let api = Arc::new(api);
    api.set_discovery("SECRET-AAAA", &dates, 300);
    for date in &dates {
        api.set_records(&k1.id, date, records_for(&k1.id, date, 5));
    }

    let config = SyncConfig { worker_count: 1, ..test_config() };
    let orchestrator = h.orchestrator_with(api.clone(), Arc::new(h.sales.clone()), config);

    let (callback, _) = capture_progress();
    let first = orchestrator
        .run_sync(&[k1.clone()], callback.clone(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.status, SyncStatus::Cancelled);
    assert!(h.tasks.count_all_pending_tasks().await.unwrap() > 0);

    // Resume skips discovery entirely and drains the queue.
    let calls_before = api.discovery_calls.lock().unwrap().len();
    let resumed = assert_ok!(
        orchestrator
            .resume(&[k1.clone()], callback, CancellationToken::new())
            .await
    );
    assert_eq!(api.discovery_calls.lock().unwrap().len(), calls_before);

    assert_eq!(resumed.status, SyncStatus::Completed);
    assert_eq!(h.tasks.count_all_pending_tasks().await.unwrap(), 0);
    // Final state matches an uninterrupted run over the same four dates.
    assert_eq!(h.total_sales_rows().await, 20);
    // Resume commits no highwatermark; only a fresh discovery may do that.
    assert_eq!(h.sales.get_highwatermark(&k1.id).await.unwrap(), 0);
}

#[tokio::test]
async fn highwatermark_survives_aggregate_failure() {
    let h = Harness::new().await;
    let k1 = h.credential("SECRET-AAAA", "Studio A").await;

    let api = Arc::new(FakeApi::default());
    api.set_discovery("SECRET-AAAA", &["2024-01-01"], 500);
    api.set_records(&k1.id, "2024-01-01", records_for(&k1.id, "2024-01-01", 5));

    let orchestrator = SyncOrchestrator::new(
        test_config(),
        api,
        h.secrets.clone(),
        h.tasks.clone(),
        h.sales.clone(),
        Arc::new(h.sales.clone()),
        Arc::new(FailingAggregator),
    );

    let (callback, frames) = capture_progress();
    let result = orchestrator
        .run_sync(&[k1.clone()], callback, CancellationToken::new())
        .await;
    assert!(matches!(result, Err(SyncError::Aggregate(_))));
    // A fatal exit is also reported through the progress channel.
    let frames = frames.lock().unwrap();
    assert!(matches!(frames.last(), Some(SyncProgress::Error { .. })));

    // The cursor is only committed after aggregates succeed, so the next
    // discovery re-covers this window.
    assert_eq!(h.sales.get_highwatermark(&k1.id).await.unwrap(), 0);
    // The fetched raw data itself is durable.
    assert_eq!(h.total_sales_rows().await, 5);
}

#[tokio::test]
async fn one_broken_date_does_not_sink_the_run() {
    let h = Harness::new().await;
    let k1 = h.credential("SECRET-AAAA", "Studio A").await;

    let api = Arc::new(FakeApi::default());
    api.set_discovery("SECRET-AAAA", &["2024-01-01", "2024-01-02", "2024-01-03"], 77);
    api.set_records(&k1.id, "2024-01-01", records_for(&k1.id, "2024-01-01", 4));
    api.set_records(&k1.id, "2024-01-03", records_for(&k1.id, "2024-01-03", 6));
    api.fail_date(&k1.id, "2024-01-02");

    let orchestrator = h.orchestrator(api);
    let (result, _) = run(&orchestrator, &[k1.clone()]).await;

    let report = result.unwrap();
    assert_eq!(report.status, SyncStatus::Completed);
    assert_eq!(report.tasks_completed, 3);
    assert_eq!(report.tasks_failed, 1);
    assert_eq!(report.records_written, 10);

    // The failed date is queued again for the next run.
    let pending = h.tasks.get_pending_tasks().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].date, "2024-01-02");

    // A tolerated failure does not block the cursor; the re-queued task
    // carries the retry.
    assert_eq!(h.sales.get_highwatermark(&k1.id).await.unwrap(), 77);
}

#[tokio::test]
async fn credential_without_secret_is_skipped() {
    let h = Harness::new().await;
    let k1 = h.credential("SECRET-AAAA", "Studio A").await;
    // Created but never inserted into the secret store.
    let orphan = ApiKeyInfo::new("SECRET-GONE", Some("Orphan".into()));

    let api = Arc::new(FakeApi::default());
    api.set_discovery("SECRET-AAAA", &["2024-01-01"], 10);
    api.set_records(&k1.id, "2024-01-01", records_for(&k1.id, "2024-01-01", 3));

    let orchestrator = h.orchestrator(api.clone());
    let (result, _) = run(&orchestrator, &[orphan.clone(), k1.clone()]).await;

    assert_eq!(result.unwrap().status, SyncStatus::Completed);
    // Only the key with a secret was asked for changed dates.
    let calls = api.discovery_calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "SECRET-AAAA");
    assert_eq!(h.sales.get_highwatermark(&orphan.id).await.unwrap(), 0);
}

#[tokio::test]
async fn refetching_the_same_window_does_not_duplicate_records() {
    let h = Harness::new().await;
    let k1 = h.credential("SECRET-AAAA", "Studio A").await;

    let api = Arc::new(FakeApi::default());
    api.set_discovery("SECRET-AAAA", &["2024-01-01"], 100);
    api.set_records(&k1.id, "2024-01-01", records_for(&k1.id, "2024-01-01", 8));

    let orchestrator = h.orchestrator(api.clone());
    let (first, _) = run(&orchestrator, &[k1.clone()]).await;
    assert_eq!(first.unwrap().records_written, 8);

    // The partner reports the same date again under a later cursor.
    api.set_discovery("SECRET-AAAA", &["2024-01-01"], 140);
    let (second, _) = run(&orchestrator, &[k1.clone()]).await;
    assert_eq!(second.unwrap().records_written, 8);

    assert_eq!(h.total_sales_rows().await, 8);
    assert_eq!(h.sales.get_highwatermark(&k1.id).await.unwrap(), 140);

    // The second discovery started from the committed cursor.
    let calls = api.discovery_calls.lock().unwrap();
    assert_eq!(calls[1].1, 100);
}

#[tokio::test]
async fn slow_writer_backpressure_loses_nothing() {
    let h = Harness::new().await;
    let k1 = h.credential("SECRET-AAAA", "Studio A").await;

    let dates: Vec<String> = (1..=8).map(|d| format!("2024-02-{d:02}")).collect();
    let date_refs: Vec<&str> = dates.iter().map(String::as_str).collect();

    let api = Arc::new(FakeApi::default());
    api.set_discovery("SECRET-AAAA", &date_refs, 9000);
    for date in &dates {
        api.set_records(&k1.id, date, records_for(&k1.id, date, 25));
    }

    let store = Arc::new(SlowStore {
        inner: h.sales.clone(),
        delay: Duration::from_millis(5),
        max_batch: AtomicUsize::new(0),
    });
    let config = SyncConfig {
        worker_count: 4,
        write_queue_max_records: 40,
        write_flush_threshold: 10,
        ..test_config()
    };
    let orchestrator = h.orchestrator_with(api, store.clone(), config);

    let (callback, _) = capture_progress();
    let report = orchestrator
        .run_sync(&[k1.clone()], callback, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.records_fetched, 200);
    assert_eq!(report.records_written, 200);
    assert_eq!(h.total_sales_rows().await, 200);
    // No flush ever exceeds the buffered-record ceiling.
    assert!(store.max_batch.load(Ordering::SeqCst) <= 40);
}

#[tokio::test]
async fn storage_failure_during_populate_aborts_instead_of_hanging() {
    let h = Harness::new().await;
    let k1 = h.credential("SECRET-AAAA", "Studio A").await;

    let dates: Vec<String> = (1..=6).map(|d| format!("2024-03-{d:02}")).collect();
    let date_refs: Vec<&str> = dates.iter().map(String::as_str).collect();

    let api = Arc::new(FakeApi::default());
    api.set_discovery("SECRET-AAAA", &date_refs, 600);
    for date in &dates {
        api.set_records(&k1.id, date, records_for(&k1.id, date, 25));
    }

    // Tight ceiling so workers are parked at the backpressure point when the
    // writer dies; the run must still come down, not wedge.
    let config = SyncConfig {
        worker_count: 2,
        write_queue_max_records: 10,
        write_flush_threshold: 5,
        ..test_config()
    };
    let orchestrator = h.orchestrator_with(api, Arc::new(BrokenStore), config);

    let (callback, frames) = capture_progress();
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        orchestrator.run_sync(&[k1.clone()], callback, CancellationToken::new()),
    )
    .await
    .expect("a storage failure must abort the run, not hang it");

    // The surfaced error is the writer's root cause, not the downstream
    // queue-closed error the blocked workers saw.
    match result {
        Err(SyncError::Writer(WriterError::Store(_))) => {}
        other => panic!("expected the writer's store error, got {other:?}"),
    }

    let frames = frames.lock().unwrap();
    assert!(matches!(frames.last(), Some(SyncProgress::Error { .. })));
    // The cursor never moved.
    assert_eq!(h.sales.get_highwatermark(&k1.id).await.unwrap(), 0);
}

#[tokio::test]
async fn discovery_failure_is_reported_through_progress() {
    let h = Harness::new().await;
    let k1 = h.credential("SECRET-AAAA", "Studio A").await;

    let api = Arc::new(FakeApi::default());
    api.fail_discovery_for("SECRET-AAAA");

    let orchestrator = h.orchestrator(api);
    let (result, frames) = run(&orchestrator, &[k1.clone()]).await;

    assert!(matches!(result, Err(SyncError::Discovery { .. })));
    assert!(matches!(frames.last(), Some(SyncProgress::Error { .. })));
    assert_eq!(h.sales.get_highwatermark(&k1.id).await.unwrap(), 0);
}
