//! Core data model for the sales sync engine.
//!
//! Everything the pipeline moves around lives here: API key metadata, the
//! normalized sales record, and the persistent sync task that drives the
//! populate phase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Metadata for one partner API key. The secret itself lives in the
/// [`SecretStore`](crate::infrastructure::SecretStore); the engine only ever
/// reads this descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Last four characters of the secret, for display only.
    pub key_hash: String,
    pub created_at: DateTime<Utc>,
}

impl ApiKeyInfo {
    pub fn new(secret: &str, display_name: Option<String>) -> Self {
        let key_hash = if secret.len() >= 4 {
            secret[secret.len() - 4..].to_string()
        } else {
            secret.to_string()
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            display_name,
            key_hash,
            created_at: Utc::now(),
        }
    }

    /// Name shown in progress frames and logs.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

/// One normalized sales line item, enriched with names resolved from the
/// lookup side tables of the same API response page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalesRecord {
    /// Deterministic unique key over the identifying fields, set by
    /// [`SalesRecord::assign_unique_key`]. Primary key in storage; refetching
    /// the same logical record upserts instead of duplicating.
    pub id: String,

    pub api_key_id: String,
    pub date: String,
    pub line_item_type: String,

    pub partnerid: Option<i64>,
    pub primary_appid: Option<i64>,
    pub packageid: Option<i64>,
    pub bundleid: Option<i64>,
    pub appid: Option<i64>,
    pub game_item_id: Option<i64>,

    pub country_code: String,
    pub platform: Option<String>,
    pub currency: Option<String>,

    pub base_price: Option<String>,
    pub sale_price: Option<String>,
    pub package_sale_type: Option<String>,

    pub gross_units_sold: Option<i64>,
    pub gross_units_returned: Option<i64>,
    pub gross_units_activated: Option<i64>,
    pub net_units_sold: Option<i64>,

    pub gross_sales_usd: f64,
    pub gross_returns_usd: f64,
    pub net_sales_usd: f64,
    pub net_tax_usd: f64,

    pub combined_discount_id: Option<i64>,
    pub key_request_id: Option<i64>,

    // Friendly names resolved from the response's lookup tables.
    pub app_name: Option<String>,
    pub package_name: Option<String>,
    pub bundle_name: Option<String>,
    pub partner_name: Option<String>,
    pub country_name: Option<String>,
    pub region: Option<String>,

    /// Denormalized unit count used by the aggregate tables. Fallback chain:
    /// net sold, gross sold, gross activated.
    pub units_sold: i64,
}

impl SalesRecord {
    /// Computes and stores the deterministic unique key. Must be called after
    /// all identifying fields are populated and before the record is handed
    /// to the writer.
    pub fn assign_unique_key(&mut self) {
        self.id = unique_record_key(self);
    }
}

/// Hash of the pipe-joined identifying fields. Two fetches of the same
/// logical line item always produce the same key.
fn unique_record_key(record: &SalesRecord) -> String {
    fn opt(v: Option<i64>) -> String {
        v.map(|v| v.to_string()).unwrap_or_default()
    }

    let mut key = String::new();
    let _ = write!(key, "{}|", opt(record.partnerid));
    let _ = write!(key, "{}|", record.date);
    let _ = write!(key, "{}|", record.line_item_type);
    let _ = write!(key, "{}|", record.platform.as_deref().unwrap_or(""));
    let _ = write!(key, "{}|", record.country_code);
    let _ = write!(key, "{}|", record.currency.as_deref().unwrap_or(""));
    let _ = write!(key, "{}|", record.api_key_id);
    let _ = write!(key, "{}|", opt(record.packageid));
    let _ = write!(key, "{}|", opt(record.bundleid));
    let _ = write!(key, "{}|", record.package_sale_type.as_deref().unwrap_or(""));
    let _ = write!(key, "{}|", opt(record.key_request_id));
    let _ = write!(key, "{}|", record.base_price.as_deref().unwrap_or(""));
    let _ = write!(key, "{}|", record.sale_price.as_deref().unwrap_or(""));
    let _ = write!(key, "{}|", opt(record.appid));
    let _ = write!(key, "{}|", opt(record.game_item_id));
    let _ = write!(key, "{}", opt(record.combined_discount_id));

    blake3::hash(key.as_bytes()).to_hex().to_string()
}

/// Lifecycle status of a [`SyncTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Done,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "todo" => Some(Self::Todo),
            "in_progress" => Some(Self::InProgress),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

/// The unit of sync work: one (API key, date) pair. Identity is the pair;
/// recreating a task for the same pair overwrites the prior one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTask {
    pub id: String,
    pub api_key_id: String,
    pub date: String,
    pub status: TaskStatus,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

/// Task id from its identity pair.
pub fn task_id(api_key_id: &str, date: &str) -> String {
    format!("{}|{}", api_key_id, date)
}

/// Ephemeral per-key pending count for progress display. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySegment {
    pub id: String,
    pub display_name: String,
    pub pending_task_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> SalesRecord {
        SalesRecord {
            api_key_id: "key-1".into(),
            date: "2024-01-01".into(),
            line_item_type: "Package".into(),
            packageid: Some(42),
            country_code: "US".into(),
            currency: Some("USD".into()),
            units_sold: 3,
            ..Default::default()
        }
    }

    #[test]
    fn unique_key_is_deterministic() {
        let mut a = sample_record();
        let mut b = sample_record();
        a.assign_unique_key();
        b.assign_unique_key();
        assert_eq!(a.id, b.id);
        assert!(!a.id.is_empty());
    }

    #[test]
    fn unique_key_distinguishes_identifying_fields() {
        let mut a = sample_record();
        let mut b = sample_record();
        b.country_code = "DE".into();
        a.assign_unique_key();
        b.assign_unique_key();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn unique_key_ignores_non_identifying_fields() {
        let mut a = sample_record();
        let mut b = sample_record();
        b.gross_sales_usd = 99.0;
        b.app_name = Some("Some App".into());
        a.assign_unique_key();
        b.assign_unique_key();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn task_id_joins_pair_with_pipe() {
        assert_eq!(task_id("abc", "2024-01-01"), "abc|2024-01-01");
    }

    #[test]
    fn key_hash_uses_last_four_chars() {
        let info = ApiKeyInfo::new("SECRET1234", Some("Main".into()));
        assert_eq!(info.key_hash, "1234");
        assert_eq!(info.label(), "Main");
    }
}
