//! Marketplace adapter contracts, the eBay Browse adapter and the listing normalizer.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use mpw_core::{utc_now_naive, ListingRecord, SearchQuery};
use mpw_storage::{FetchError, GetRequest, HttpFetcher};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "mpw-adapters";

pub const EBAY_API_BASE: &str = "https://api.ebay.com";
pub const EBAY_OAUTH_SCOPE: &str = "https://api.ebay.com/oauth/api_scope";
const SEARCH_PATH: &str = "/buy/browse/v1/item_summary/search";
const TOKEN_PATH: &str = "/identity/v1/oauth2/token";
const MARKETPLACE_HEADER: &str = "X-EBAY-C-MARKETPLACE-ID";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("token response has no access_token field")]
    MissingAccessToken,
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Search surface of a marketplace: one token per run, one call per saved query.
#[async_trait]
pub trait MarketplaceAdapter: Send + Sync {
    fn marketplace_id(&self) -> &str;

    async fn access_token(&self) -> Result<String, AdapterError>;

    /// Raw listing objects for one query. An absent result list is an empty result.
    async fn search(
        &self,
        access_token: &str,
        query: &SearchQuery,
    ) -> Result<Vec<JsonValue>, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct MarketplaceCredentials {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone)]
pub struct EbayBrowseAdapter {
    http: HttpFetcher,
    api_base: String,
    marketplace_id: String,
    credentials: MarketplaceCredentials,
}

impl EbayBrowseAdapter {
    pub fn new(
        http: HttpFetcher,
        api_base: impl Into<String>,
        marketplace_id: impl Into<String>,
        credentials: MarketplaceCredentials,
    ) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            marketplace_id: marketplace_id.into(),
            credentials,
        }
    }
}

#[async_trait]
impl MarketplaceAdapter for EbayBrowseAdapter {
    fn marketplace_id(&self) -> &str {
        &self.marketplace_id
    }

    async fn access_token(&self) -> Result<String, AdapterError> {
        let url = format!("{}{TOKEN_PATH}", self.api_base);
        let body = self
            .http
            .post_form_basic_auth(
                &url,
                &self.credentials.client_id,
                &self.credentials.client_secret,
                &[
                    ("grant_type", "client_credentials"),
                    ("scope", EBAY_OAUTH_SCOPE),
                ],
            )
            .await?;
        body.get("access_token")
            .and_then(JsonValue::as_str)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .ok_or(AdapterError::MissingAccessToken)
    }

    async fn search(
        &self,
        access_token: &str,
        query: &SearchQuery,
    ) -> Result<Vec<JsonValue>, AdapterError> {
        let url = format!("{}{SEARCH_PATH}", self.api_base);
        let body = self
            .http
            .get_json(
                &url,
                GetRequest {
                    bearer_token: Some(access_token),
                    headers: vec![(MARKETPLACE_HEADER, self.marketplace_id.clone())],
                    query: query_params(query),
                },
            )
            .await?;
        let items = item_summaries(body);
        debug!(items = items.len(), "search returned");
        Ok(items)
    }
}

/// Serves listings from a saved search response; no network, no credentials.
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    marketplace_id: String,
    items: Vec<JsonValue>,
}

impl FixtureAdapter {
    pub fn new(marketplace_id: impl Into<String>, items: Vec<JsonValue>) -> Self {
        Self {
            marketplace_id: marketplace_id.into(),
            items,
        }
    }

    /// Accepts either a bare JSON array of item summaries or a full search response.
    pub fn from_file(
        marketplace_id: impl Into<String>,
        path: impl AsRef<Path>,
    ) -> Result<Self, AdapterError> {
        let value: JsonValue = read_json_file(path)?;
        let items = match value {
            JsonValue::Array(items) => items,
            other => item_summaries(other),
        };
        Ok(Self::new(marketplace_id, items))
    }

    pub fn items(&self) -> &[JsonValue] {
        &self.items
    }
}

#[async_trait]
impl MarketplaceAdapter for FixtureAdapter {
    fn marketplace_id(&self) -> &str {
        &self.marketplace_id
    }

    async fn access_token(&self) -> Result<String, AdapterError> {
        Ok("fixture".to_string())
    }

    async fn search(
        &self,
        _access_token: &str,
        _query: &SearchQuery,
    ) -> Result<Vec<JsonValue>, AdapterError> {
        Ok(self.items.clone())
    }
}

/// Loads the saved queries file: a JSON array of parameter objects.
pub fn load_queries(path: impl AsRef<Path>) -> Result<Vec<SearchQuery>, AdapterError> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, AdapterError> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).map_err(|source| AdapterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&data).map_err(|source| AdapterError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Flattens query values into URL parameters; nested arrays/objects and nulls are skipped.
pub fn query_params(query: &SearchQuery) -> Vec<(String, String)> {
    query
        .iter()
        .filter_map(|(key, value)| {
            let text = match value {
                JsonValue::String(s) => s.clone(),
                JsonValue::Number(n) => n.to_string(),
                JsonValue::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((key.clone(), text))
        })
        .collect()
}

fn item_summaries(body: JsonValue) -> Vec<JsonValue> {
    match body {
        JsonValue::Object(mut map) => match map.remove("itemSummaries") {
            Some(JsonValue::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for key in path {
        cur = cur.get(*key)?;
    }
    cur.as_str()
}

fn json_decimal(value: &JsonValue, path: &[&str]) -> Option<Decimal> {
    let mut cur = value;
    for key in path {
        cur = cur.get(*key)?;
    }
    match cur {
        JsonValue::String(s) => Decimal::from_str(s.trim()).ok(),
        JsonValue::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        _ => None,
    }
}

fn owned(value: Option<&str>) -> Option<String> {
    value.map(str::to_string)
}

/// Null, `false`, zero, and empty strings, arrays or objects.
fn is_empty_value(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Bool(flag) => !flag,
        JsonValue::Number(n) => n.as_f64() == Some(0.0),
        JsonValue::String(text) => text.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(fields) => fields.is_empty(),
    }
}

/// Upstream identifier of a listing, when it has a usable one.
pub fn listing_item_id(listing: &JsonValue) -> Option<&str> {
    json_str(listing, &["itemId"]).filter(|id| !id.trim().is_empty())
}

/// Normalizes one listing stamped with the current UTC instant.
pub fn normalize_listing(listing: &JsonValue) -> Option<ListingRecord> {
    normalize_listing_at(listing, utc_now_naive())
}

/// Maps one loosely-typed listing to a flat record. `None` only when it has no item id;
/// every other missing or mistyped leaf degrades to `None` on the record.
pub fn normalize_listing_at(listing: &JsonValue, seen_at: NaiveDateTime) -> Option<ListingRecord> {
    let item_id = listing_item_id(listing)?;
    let first_category = listing
        .get("categories")
        .and_then(JsonValue::as_array)
        .and_then(|cats| cats.first());
    let condition = listing
        .get("conditionDisplayName")
        .filter(|value| !is_empty_value(value))
        .or_else(|| listing.get("condition"))
        .and_then(JsonValue::as_str);

    Some(ListingRecord {
        item_id: item_id.to_string(),
        title: owned(json_str(listing, &["title"])),
        price_value: json_decimal(listing, &["price", "value"]),
        price_currency: owned(json_str(listing, &["price", "currency"])),
        item_href: owned(json_str(listing, &["itemHref"])),
        seller_username: owned(json_str(listing, &["seller", "username"])),
        condition_display_name: owned(condition),
        category_id: first_category.and_then(|c| owned(json_str(c, &["categoryId"]))),
        category_name: first_category.and_then(|c| owned(json_str(c, &["categoryName"]))),
        brand: owned(json_str(listing, &["brand"])),
        last_seen_utc: seen_at,
        ai_price_estimate: None,
    })
}

/// Normalizes a search page, dropping listings without an item id.
pub fn normalize_listings(listings: &[JsonValue], seen_at: NaiveDateTime) -> Vec<ListingRecord> {
    listings
        .iter()
        .filter_map(|listing| normalize_listing_at(listing, seen_at))
        .collect()
}
