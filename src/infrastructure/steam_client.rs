//! Client for the Steam partner financials web API.
//!
//! Two endpoints matter to the pipeline: `GetChangedDatesForPartner` returns
//! the date keys changed since a highwatermark cursor, and `GetDetailedSales`
//! returns one date's line items in pages bounded by a `max_id` cursor that
//! stops advancing when the date is exhausted. The client normalizes pages
//! into flat [`SalesRecord`]s, resolving friendly names from the lookup side
//! tables carried on each page.

use crate::domain::models::SalesRecord;
use crate::infrastructure::config::SyncConfig;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

#[derive(Error, Debug)]
pub enum SteamApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {0}")]
    Api(String),
    /// Cooperative cancellation, checked before each page request. Not a
    /// failure: the orchestrator uses this variant to tell "user cancelled"
    /// apart from a broken date.
    #[error("operation cancelled")]
    Cancelled,
}

/// Result of one discovery call.
#[derive(Debug, Clone)]
pub struct ChangedDates {
    pub dates: Vec<String>,
    pub new_highwatermark: i64,
}

/// Seam over the partner API so the orchestrator can be driven by
/// deterministic fakes in tests.
#[async_trait]
pub trait PartnerFinancialsApi: Send + Sync {
    /// Dates whose data changed since `highwatermark`, plus the new cursor.
    async fn discover_changed_dates(
        &self,
        api_key: &str,
        highwatermark: i64,
    ) -> Result<ChangedDates, SteamApiError>;

    /// All line items for one date, across every page. Checks `cancel`
    /// before each page request.
    async fn fetch_date(
        &self,
        api_key: &str,
        api_key_id: &str,
        date: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<SalesRecord>, SteamApiError>;
}

pub struct SteamClient {
    client: reqwest::Client,
    base_url: Url,
    /// Bounds concurrent page requests across all workers; independent of
    /// the worker pool size.
    http_permits: Arc<Semaphore>,
}

impl SteamClient {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .gzip(true)
            .build()?;
        let base_url = Url::parse(&config.api_base_url)?;

        Ok(Self {
            client,
            base_url,
            http_permits: Arc::new(Semaphore::new(config.http_concurrency)),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<T, SteamApiError> {
        // One permit per request keeps the HTTP fan-out bounded even when
        // many workers are runnable.
        let _permit = self
            .http_permits
            .acquire()
            .await
            .map_err(|_| SteamApiError::Api("HTTP semaphore closed".into()))?;

        let mut url = self
            .base_url
            .join(endpoint)
            .map_err(|e| SteamApiError::Api(format!("invalid endpoint: {e}")))?;
        url.query_pairs_mut().extend_pairs(params);

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(SteamApiError::Api(format!(
                "Steam API error: {} {}",
                response.status(),
                response.status().canonical_reason().unwrap_or("Unknown"),
            )));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl PartnerFinancialsApi for SteamClient {
    async fn discover_changed_dates(
        &self,
        api_key: &str,
        highwatermark: i64,
    ) -> Result<ChangedDates, SteamApiError> {
        let hwm = highwatermark.to_string();
        let response: ChangedDatesResponse = self
            .get_json(
                "IPartnerFinancialsService/GetChangedDatesForPartner/v1",
                &[("key", api_key), ("highwatermark", &hwm)],
            )
            .await?;

        let inner = response.response;
        let new_highwatermark = parse_highwatermark(inner.result_highwatermark.as_ref())
            .unwrap_or(highwatermark);

        debug!(dates = inner.dates.len(), new_highwatermark, "discovery response");

        Ok(ChangedDates {
            dates: inner.dates,
            new_highwatermark,
        })
    }

    async fn fetch_date(
        &self,
        api_key: &str,
        api_key_id: &str,
        date: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<SalesRecord>, SteamApiError> {
        let mut records = Vec::new();
        let mut page_cursor: i64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(SteamApiError::Cancelled);
            }

            let cursor = page_cursor.to_string();
            let response: DetailedSalesResponse = self
                .get_json(
                    "IPartnerFinancialsService/GetDetailedSales/v1",
                    &[("key", api_key), ("date", date), ("highwatermark_id", &cursor)],
                )
                .await?;

            let page = response.response;
            let max_id: i64 = page
                .max_id
                .as_deref()
                .unwrap_or("0")
                .parse()
                .unwrap_or(0);

            records.extend(normalize_page(&page, api_key_id));

            // The cursor stopping (or an empty page) signals exhaustion.
            if max_id <= page_cursor || page.results.is_empty() {
                break;
            }
            page_cursor = max_id;
        }

        debug!(date, count = records.len(), "fetched date");
        Ok(records)
    }
}

/// The API has returned the cursor as either a JSON string or a number.
fn parse_highwatermark(value: Option<&serde_json::Value>) -> Option<i64> {
    match value {
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        _ => None,
    }
}

fn parse_usd(value: Option<&String>) -> f64 {
    value.and_then(|s| s.trim().parse().ok()).unwrap_or(0.0)
}

/// Flattens one page into enriched records: lookup tables joined, money
/// strings parsed, unique key assigned.
fn normalize_page(page: &DetailedSalesPage, api_key_id: &str) -> Vec<SalesRecord> {
    let app_names: HashMap<i64, &str> = page
        .app_info
        .iter()
        .map(|a| (a.appid, a.app_name.as_str()))
        .collect();
    let package_names: HashMap<i64, &str> = page
        .package_info
        .iter()
        .map(|p| (p.packageid, p.package_name.as_str()))
        .collect();
    let bundle_names: HashMap<i64, &str> = page
        .bundle_info
        .iter()
        .map(|b| (b.bundleid, b.bundle_name.as_str()))
        .collect();
    let partner_names: HashMap<i64, &str> = page
        .partner_info
        .iter()
        .map(|p| (p.partnerid, p.partner_name.as_str()))
        .collect();
    let countries: HashMap<&str, (&str, &str)> = page
        .country_info
        .iter()
        .map(|c| (c.country_code.as_str(), (c.country_name.as_str(), c.region.as_str())))
        .collect();

    page.results
        .iter()
        .map(|item| {
            let primary_appid = item.primary_appid.or(item.appid);
            let units_sold = item
                .net_units_sold
                .or(item.gross_units_sold)
                .or(item.gross_units_activated)
                .unwrap_or(0);
            let country = countries.get(item.country_code.as_str());

            let mut record = SalesRecord {
                id: String::new(),
                api_key_id: api_key_id.to_string(),
                date: item.date.clone(),
                line_item_type: item.line_item_type.clone(),
                partnerid: item.partnerid,
                primary_appid,
                packageid: item.packageid,
                bundleid: item.bundleid,
                appid: item.appid,
                game_item_id: item.game_item_id,
                country_code: item.country_code.clone(),
                platform: item.platform.clone(),
                currency: item.currency.clone(),
                base_price: item.base_price.clone(),
                sale_price: item.sale_price.clone(),
                package_sale_type: item.package_sale_type.clone(),
                gross_units_sold: item.gross_units_sold,
                gross_units_returned: item.gross_units_returned,
                gross_units_activated: item.gross_units_activated,
                net_units_sold: item.net_units_sold,
                gross_sales_usd: parse_usd(item.gross_sales_usd.as_ref()),
                gross_returns_usd: parse_usd(item.gross_returns_usd.as_ref()),
                net_sales_usd: parse_usd(item.net_sales_usd.as_ref()),
                net_tax_usd: parse_usd(item.net_tax_usd.as_ref()),
                combined_discount_id: item.combined_discount_id,
                key_request_id: item.key_request_id,
                app_name: primary_appid
                    .and_then(|id| app_names.get(&id).map(|s| s.to_string())),
                package_name: item
                    .packageid
                    .and_then(|id| package_names.get(&id).map(|s| s.to_string())),
                bundle_name: item
                    .bundleid
                    .and_then(|id| bundle_names.get(&id).map(|s| s.to_string())),
                partner_name: item
                    .partnerid
                    .and_then(|id| partner_names.get(&id).map(|s| s.to_string())),
                country_name: country.map(|(name, _)| name.to_string()),
                region: country.map(|(_, region)| region.to_string()),
                units_sold,
            };
            record.assign_unique_key();
            record
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChangedDatesResponse {
    response: ChangedDatesInner,
}

#[derive(Debug, Deserialize)]
struct ChangedDatesInner {
    #[serde(default)]
    dates: Vec<String>,
    result_highwatermark: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct DetailedSalesResponse {
    response: DetailedSalesPage,
}

#[derive(Debug, Deserialize)]
struct DetailedSalesPage {
    #[serde(default)]
    results: Vec<SaleItem>,
    max_id: Option<String>,
    #[serde(default)]
    app_info: Vec<AppInfo>,
    #[serde(default)]
    package_info: Vec<PackageInfo>,
    #[serde(default)]
    bundle_info: Vec<BundleInfo>,
    #[serde(default)]
    partner_info: Vec<PartnerInfo>,
    #[serde(default)]
    country_info: Vec<CountryInfo>,
}

#[derive(Debug, Deserialize)]
struct SaleItem {
    date: String,
    line_item_type: String,
    partnerid: Option<i64>,
    primary_appid: Option<i64>,
    packageid: Option<i64>,
    bundleid: Option<i64>,
    appid: Option<i64>,
    game_item_id: Option<i64>,
    country_code: String,
    platform: Option<String>,
    currency: Option<String>,
    base_price: Option<String>,
    sale_price: Option<String>,
    package_sale_type: Option<String>,
    gross_units_sold: Option<i64>,
    gross_units_returned: Option<i64>,
    gross_units_activated: Option<i64>,
    net_units_sold: Option<i64>,
    gross_sales_usd: Option<String>,
    gross_returns_usd: Option<String>,
    net_sales_usd: Option<String>,
    net_tax_usd: Option<String>,
    combined_discount_id: Option<i64>,
    key_request_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct AppInfo {
    appid: i64,
    app_name: String,
}

#[derive(Debug, Deserialize)]
struct PackageInfo {
    packageid: i64,
    package_name: String,
}

#[derive(Debug, Deserialize)]
struct BundleInfo {
    bundleid: i64,
    bundle_name: String,
}

#[derive(Debug, Deserialize)]
struct PartnerInfo {
    partnerid: i64,
    partner_name: String,
}

#[derive(Debug, Deserialize)]
struct CountryInfo {
    country_code: String,
    country_name: String,
    region: String,
}
