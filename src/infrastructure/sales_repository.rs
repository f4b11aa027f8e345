//! Persistence for fetched sales records and per-key highwatermarks.

use crate::domain::models::SalesRecord;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

/// Storage seam used by the record writer. Upsert semantics keyed by each
/// record's deterministic unique key.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn store_records(&self, records: &[SalesRecord]) -> Result<()>;
    async fn delete_records_for(&self, api_key_id: &str, date: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct SalesRepository {
    pool: Arc<SqlitePool>,
}

impl SalesRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Stored highwatermark for a key; 0 when the key has never synced.
    pub async fn get_highwatermark(&self, api_key_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT value FROM sync_meta WHERE key = ?")
            .bind(hwm_key(api_key_id))
            .fetch_optional(&*self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>(0)).unwrap_or(0))
    }

    /// Commits a highwatermark. The cursor never regresses: a smaller value
    /// than the stored one is ignored, which also makes redundant commits
    /// after a crash harmless.
    pub async fn set_highwatermark(&self, api_key_id: &str, value: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_meta (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)",
        )
        .bind(hwm_key(api_key_id))
        .bind(value)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    pub async fn count_records_for(&self, api_key_id: &str, date: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM sales WHERE api_key_id = ? AND date = ?")
            .bind(api_key_id)
            .bind(date)
            .fetch_one(&*self.pool)
            .await?;
        Ok(row.get(0))
    }
}

fn hwm_key(api_key_id: &str) -> String {
    format!("highwatermark:{}", api_key_id)
}

#[async_trait]
impl RecordStore for SalesRepository {
    async fn store_records(&self, records: &[SalesRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for record in records {
            if record.id.is_empty() {
                return Err(anyhow!(
                    "sales record for ({}, {}) has no unique key",
                    record.api_key_id,
                    record.date
                ));
            }

            sqlx::query(
                r#"
                INSERT INTO sales (
                    id, api_key_id, date, line_item_type,
                    partnerid, primary_appid, packageid, bundleid, appid, game_item_id,
                    country_code, platform, currency,
                    base_price, sale_price, package_sale_type,
                    gross_units_sold, gross_units_returned, gross_units_activated, net_units_sold,
                    gross_sales_usd, gross_returns_usd, net_sales_usd, net_tax_usd,
                    combined_discount_id, key_request_id,
                    app_name, package_name, bundle_name, partner_name, country_name, region,
                    units_sold
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    line_item_type = excluded.line_item_type,
                    gross_units_sold = excluded.gross_units_sold,
                    gross_units_returned = excluded.gross_units_returned,
                    gross_units_activated = excluded.gross_units_activated,
                    net_units_sold = excluded.net_units_sold,
                    gross_sales_usd = excluded.gross_sales_usd,
                    gross_returns_usd = excluded.gross_returns_usd,
                    net_sales_usd = excluded.net_sales_usd,
                    net_tax_usd = excluded.net_tax_usd,
                    app_name = excluded.app_name,
                    package_name = excluded.package_name,
                    bundle_name = excluded.bundle_name,
                    partner_name = excluded.partner_name,
                    country_name = excluded.country_name,
                    region = excluded.region,
                    units_sold = excluded.units_sold
                "#,
            )
            .bind(&record.id)
            .bind(&record.api_key_id)
            .bind(&record.date)
            .bind(&record.line_item_type)
            .bind(record.partnerid)
            .bind(record.primary_appid)
            .bind(record.packageid)
            .bind(record.bundleid)
            .bind(record.appid)
            .bind(record.game_item_id)
            .bind(&record.country_code)
            .bind(&record.platform)
            .bind(&record.currency)
            .bind(&record.base_price)
            .bind(&record.sale_price)
            .bind(&record.package_sale_type)
            .bind(record.gross_units_sold)
            .bind(record.gross_units_returned)
            .bind(record.gross_units_activated)
            .bind(record.net_units_sold)
            .bind(record.gross_sales_usd)
            .bind(record.gross_returns_usd)
            .bind(record.net_sales_usd)
            .bind(record.net_tax_usd)
            .bind(record.combined_discount_id)
            .bind(record.key_request_id)
            .bind(&record.app_name)
            .bind(&record.package_name)
            .bind(&record.bundle_name)
            .bind(&record.partner_name)
            .bind(&record.country_name)
            .bind(&record.region)
            .bind(record.units_sold)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_records_for(&self, api_key_id: &str, date: &str) -> Result<()> {
        sqlx::query("DELETE FROM sales WHERE api_key_id = ? AND date = ?")
            .bind(api_key_id)
            .bind(date)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }
}
