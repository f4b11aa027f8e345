//! Derived summary tables rebuilt from the sales table.
//!
//! Aggregates are a pure function of the raw records, so recomputation
//! replaces them wholesale inside one transaction instead of patching them
//! incrementally. Readers either see the old summaries or the new ones.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

/// Recomputation seam so the orchestrator can run with a fake (or a failing
/// one) in tests.
#[async_trait]
pub trait AggregateRecomputer: Send + Sync {
    /// Rebuilds all summary tables. `on_progress` receives a monotonically
    /// non-decreasing percentage ending at 100.
    async fn recompute_all(&self, on_progress: &(dyn Fn(u8) + Send + Sync)) -> Result<()>;
}

#[derive(Clone)]
pub struct SummaryAggregator {
    pool: Arc<SqlitePool>,
}

impl SummaryAggregator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

#[async_trait]
impl AggregateRecomputer for SummaryAggregator {
    async fn recompute_all(&self, on_progress: &(dyn Fn(u8) + Send + Sync)) -> Result<()> {
        on_progress(0);
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM daily_summaries").execute(&mut *tx).await?;
        sqlx::query(
            r#"
            INSERT INTO daily_summaries (date, total_revenue, total_units, record_count)
            SELECT
                date,
                COALESCE(SUM(net_sales_usd), 0),
                COALESCE(SUM(units_sold), 0),
                COUNT(*)
            FROM sales
            GROUP BY date
            "#,
        )
        .execute(&mut *tx)
        .await?;
        on_progress(50);

        sqlx::query("DELETE FROM app_summaries").execute(&mut *tx).await?;
        sqlx::query(
            r#"
            INSERT INTO app_summaries
                (app_id, app_name, total_revenue, total_units, record_count, first_sale, last_sale)
            SELECT
                primary_appid,
                MAX(app_name),
                COALESCE(SUM(net_sales_usd), 0),
                COALESCE(SUM(units_sold), 0),
                COUNT(*),
                MIN(date),
                MAX(date)
            FROM sales
            WHERE primary_appid IS NOT NULL
            GROUP BY primary_appid
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        on_progress(100);
        info!("summary tables recomputed");
        Ok(())
    }
}
