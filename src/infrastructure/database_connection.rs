//! SQLite connection pool and schema setup.

use anyhow::Result;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::path::Path;

pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    pub async fn new(database_url: &str) -> Result<Self> {
        let db_path = database_url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:");

        if !Path::new(db_path).exists() {
            if let Some(parent) = Path::new(db_path).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            std::fs::File::create(db_path)?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates the schema. Idempotent; runs on every startup.
    pub async fn migrate(&self) -> Result<()> {
        let create_sales_sql = r#"
            CREATE TABLE IF NOT EXISTS sales (
                id TEXT PRIMARY KEY,
                api_key_id TEXT NOT NULL,
                date TEXT NOT NULL,
                line_item_type TEXT NOT NULL,
                partnerid INTEGER,
                primary_appid INTEGER,
                packageid INTEGER,
                bundleid INTEGER,
                appid INTEGER,
                game_item_id INTEGER,
                country_code TEXT NOT NULL,
                platform TEXT,
                currency TEXT,
                base_price TEXT,
                sale_price TEXT,
                package_sale_type TEXT,
                gross_units_sold INTEGER,
                gross_units_returned INTEGER,
                gross_units_activated INTEGER,
                net_units_sold INTEGER,
                gross_sales_usd REAL NOT NULL DEFAULT 0,
                gross_returns_usd REAL NOT NULL DEFAULT 0,
                net_sales_usd REAL NOT NULL DEFAULT 0,
                net_tax_usd REAL NOT NULL DEFAULT 0,
                combined_discount_id INTEGER,
                key_request_id INTEGER,
                app_name TEXT,
                package_name TEXT,
                bundle_name TEXT,
                partner_name TEXT,
                country_name TEXT,
                region TEXT,
                units_sold INTEGER NOT NULL DEFAULT 0
            )
        "#;

        let create_sync_tasks_sql = r#"
            CREATE TABLE IF NOT EXISTS sync_tasks (
                id TEXT PRIMARY KEY,
                api_key_id TEXT NOT NULL,
                date TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'todo',
                created_at INTEGER NOT NULL,
                completed_at INTEGER
            )
        "#;

        let create_sync_meta_sql = r#"
            CREATE TABLE IF NOT EXISTS sync_meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )
        "#;

        let create_daily_summaries_sql = r#"
            CREATE TABLE IF NOT EXISTS daily_summaries (
                date TEXT PRIMARY KEY,
                total_revenue REAL NOT NULL,
                total_units INTEGER NOT NULL,
                record_count INTEGER NOT NULL
            )
        "#;

        let create_app_summaries_sql = r#"
            CREATE TABLE IF NOT EXISTS app_summaries (
                app_id INTEGER PRIMARY KEY,
                app_name TEXT,
                total_revenue REAL NOT NULL,
                total_units INTEGER NOT NULL,
                record_count INTEGER NOT NULL,
                first_sale TEXT NOT NULL,
                last_sale TEXT NOT NULL
            )
        "#;

        let create_indexes_sql = r#"
            CREATE INDEX IF NOT EXISTS idx_sales_key_date ON sales (api_key_id, date);
            CREATE INDEX IF NOT EXISTS idx_sales_date ON sales (date);
            CREATE INDEX IF NOT EXISTS idx_sync_tasks_status ON sync_tasks (status);
            CREATE INDEX IF NOT EXISTS idx_sync_tasks_key ON sync_tasks (api_key_id);
        "#;

        sqlx::query(create_sales_sql).execute(&self.pool).await?;
        sqlx::query(create_sync_tasks_sql).execute(&self.pool).await?;
        sqlx::query(create_sync_meta_sql).execute(&self.pool).await?;
        sqlx::query(create_daily_summaries_sql).execute(&self.pool).await?;
        sqlx::query(create_app_summaries_sql).execute(&self.pool).await?;
        sqlx::query(create_indexes_sql).execute(&self.pool).await?;

        Ok(())
    }
}
