//! Persistent task queue backing the populate phase.
//!
//! Task identity is the (api_key_id, date) pair; recreating a task overwrites
//! the previous one and clears any sales rows already stored for that pair,
//! so a date is never a mix of old and new data.

use crate::domain::models::{SyncTask, TaskStatus, task_id};
use anyhow::Result;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

#[derive(Clone)]
pub struct SyncTaskRepository {
    pool: Arc<SqlitePool>,
}

impl SyncTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Creates a `todo` task for each date, deleting previously stored sales
    /// rows for the same (key, date) first. Runs in a single transaction so a
    /// crash cannot leave a date half-deleted, half-queued.
    pub async fn create_tasks(&self, api_key_id: &str, dates: &[String]) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        for date in dates {
            sqlx::query("DELETE FROM sales WHERE api_key_id = ? AND date = ?")
                .bind(api_key_id)
                .bind(date)
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                "INSERT OR REPLACE INTO sync_tasks (id, api_key_id, date, status, created_at, completed_at)
                 VALUES (?, ?, ?, 'todo', ?, NULL)",
            )
            .bind(task_id(api_key_id, date))
            .bind(api_key_id)
            .bind(date)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// All `todo` and `in_progress` tasks. Ordering is an orchestrator
    /// concern; none is guaranteed here.
    pub async fn get_pending_tasks(&self) -> Result<Vec<SyncTask>> {
        let rows = sqlx::query(
            "SELECT id, api_key_id, date, status, created_at, completed_at
             FROM sync_tasks
             WHERE status IN ('todo', 'in_progress')",
        )
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(row_to_task).collect())
    }

    pub async fn get_pending_tasks_for_key(&self, api_key_id: &str) -> Result<Vec<SyncTask>> {
        let rows = sqlx::query(
            "SELECT id, api_key_id, date, status, created_at, completed_at
             FROM sync_tasks
             WHERE api_key_id = ? AND status IN ('todo', 'in_progress')",
        )
        .bind(api_key_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(row_to_task).collect())
    }

    /// Idempotent `todo`/`done` -> `in_progress` transition.
    pub async fn mark_in_progress(&self, task_id: &str) -> Result<()> {
        sqlx::query("UPDATE sync_tasks SET status = 'in_progress' WHERE id = ?")
            .bind(task_id)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    /// Idempotent transition to `done`, stamping completion time.
    pub async fn mark_done(&self, task_id: &str) -> Result<()> {
        sqlx::query("UPDATE sync_tasks SET status = 'done', completed_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp_millis())
            .bind(task_id)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    /// Pending task counts grouped by API key.
    pub async fn count_pending_tasks(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT api_key_id, COUNT(*) FROM sync_tasks
             WHERE status IN ('todo', 'in_progress')
             GROUP BY api_key_id",
        )
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>(0), row.get::<i64, _>(1)))
            .collect())
    }

    pub async fn count_all_pending_tasks(&self) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) FROM sync_tasks WHERE status IN ('todo', 'in_progress')",
        )
        .fetch_one(&*self.pool)
        .await?;
        Ok(row.get(0))
    }

    /// Crash recovery: reverts every `in_progress` task back to `todo` in one
    /// statement. Must run before any populate phase. Returns the number of
    /// tasks reset.
    pub async fn reset_in_progress_tasks(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sync_tasks SET status = 'todo' WHERE status = 'in_progress'",
        )
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn clear_completed_tasks(&self) -> Result<()> {
        sqlx::query("DELETE FROM sync_tasks WHERE status = 'done'")
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear_all(&self) -> Result<()> {
        sqlx::query("DELETE FROM sync_tasks").execute(&*self.pool).await?;
        Ok(())
    }
}

fn row_to_task(row: sqlx::sqlite::SqliteRow) -> Option<SyncTask> {
    let status = TaskStatus::parse(row.get::<String, _>("status").as_str())?;
    Some(SyncTask {
        id: row.get("id"),
        api_key_id: row.get("api_key_id"),
        date: row.get("date"),
        status,
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
    })
}
