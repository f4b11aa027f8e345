//! Backpressured write path between fetch workers and storage.
//!
//! Fetched records flow over a channel into a single writer task, decoupling
//! fetch completion from durable persistence. A record-count semaphore caps
//! how much fetched-but-unwritten data may accumulate: producers acquire one
//! permit per record before sending and the writer returns permits only after
//! a flush commits, so a slow writer blocks fetch workers instead of growing
//! memory without bound. Progress therefore runs ahead of durability, but the
//! final flush on channel close blocks until everything is stored.

use crate::domain::models::SalesRecord;
use crate::infrastructure::sales_repository::RecordStore;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("record writer is no longer accepting batches")]
    Closed,
    #[error("storage write failed: {0}")]
    Store(#[source] anyhow::Error),
}

struct Batch {
    records: Vec<SalesRecord>,
    permits: usize,
}

/// Producer handle shared by the fetch workers. Cloneable; the writer task
/// flushes its remainder and exits once every clone has been dropped.
#[derive(Clone)]
pub struct RecordQueue {
    tx: mpsc::Sender<Batch>,
    capacity: Arc<Semaphore>,
    ceiling: usize,
}

impl RecordQueue {
    /// Enqueues one fetch result. Blocks while the unwritten-record count is
    /// at the ceiling, which is the backpressure point for workers.
    pub async fn push(&self, records: Vec<SalesRecord>) -> Result<(), WriterError> {
        if records.is_empty() {
            return Ok(());
        }

        // A batch larger than the whole ceiling is clamped so it can still
        // make it through rather than deadlocking.
        let permits = records.len().min(self.ceiling);
        let acquired = self
            .capacity
            .acquire_many(permits as u32)
            .await
            .map_err(|_| WriterError::Closed)?;
        acquired.forget();

        self.tx
            .send(Batch { records, permits })
            .await
            .map_err(|_| WriterError::Closed)
    }
}

/// Handle to the spawned writer task.
pub struct WriterTask {
    handle: JoinHandle<Result<u64, WriterError>>,
}

impl WriterTask {
    /// Waits for the writer to drain and flush. All [`RecordQueue`] clones
    /// must be dropped first or this waits forever. Returns the total number
    /// of records written.
    pub async fn join(self) -> Result<u64, WriterError> {
        self.handle
            .await
            .map_err(|e| WriterError::Store(anyhow::anyhow!("writer task panicked: {e}")))?
    }
}

/// Spawns the writer task.
///
/// `ceiling` bounds unwritten records in memory; `flush_threshold` is the
/// batch size the writer waits for before committing (the final flush on
/// close ignores it).
pub fn spawn_writer(
    store: Arc<dyn RecordStore>,
    ceiling: usize,
    flush_threshold: usize,
) -> (RecordQueue, WriterTask) {
    // The semaphore does the real bounding; the channel just needs to never
    // be the blocking edge, so give it room for many small batches.
    let (tx, rx) = mpsc::channel::<Batch>(1024);
    let capacity = Arc::new(Semaphore::new(ceiling));

    let queue = RecordQueue {
        tx,
        capacity: capacity.clone(),
        ceiling,
    };
    let handle = tokio::spawn(writer_loop(store, rx, capacity, flush_threshold));

    (queue, WriterTask { handle })
}

async fn writer_loop(
    store: Arc<dyn RecordStore>,
    mut rx: mpsc::Receiver<Batch>,
    capacity: Arc<Semaphore>,
    flush_threshold: usize,
) -> Result<u64, WriterError> {
    let mut pending: Vec<SalesRecord> = Vec::new();
    let mut pending_permits: usize = 0;
    let mut total_written: u64 = 0;

    while let Some(batch) = rx.recv().await {
        pending.extend(batch.records);
        pending_permits += batch.permits;

        // Drain whatever else accumulated while we were waiting, then decide
        // whether the batch is big enough to commit.
        while let Ok(more) = rx.try_recv() {
            pending.extend(more.records);
            pending_permits += more.permits;
        }

        if pending.len() >= flush_threshold {
            if let Err(e) =
                flush(&*store, &capacity, &mut pending, &mut pending_permits, &mut total_written)
                    .await
            {
                // Forgotten permits are never coming back. Close the semaphore
                // so producers blocked at the ceiling fail with Closed instead
                // of waiting forever.
                capacity.close();
                return Err(e);
            }
        }
    }

    // Channel closed: flush the remainder before reporting back.
    if let Err(e) =
        flush(&*store, &capacity, &mut pending, &mut pending_permits, &mut total_written).await
    {
        capacity.close();
        return Err(e);
    }
    Ok(total_written)
}

async fn flush(
    store: &dyn RecordStore,
    capacity: &Semaphore,
    pending: &mut Vec<SalesRecord>,
    pending_permits: &mut usize,
    total_written: &mut u64,
) -> Result<(), WriterError> {
    if pending.is_empty() {
        return Ok(());
    }

    store.store_records(pending).await.map_err(WriterError::Store)?;
    *total_written += pending.len() as u64;
    debug!(flushed = pending.len(), total = *total_written, "writer flushed batch");

    // Only after the write is durable does queue capacity open up again.
    capacity.add_permits(*pending_permits);
    *pending_permits = 0;
    pending.clear();
    Ok(())
}
