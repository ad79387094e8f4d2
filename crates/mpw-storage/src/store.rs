use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use mpw_core::ListingRecord;
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use tracing::{debug, info};

pub const CREATE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS ebay_items (
    item_id TEXT PRIMARY KEY,
    title TEXT,
    price_value NUMERIC,
    price_currency TEXT,
    item_href TEXT,
    seller_username TEXT,
    condition_display_name TEXT,
    category_id TEXT,
    category_name TEXT,
    brand TEXT,
    last_seen_utc TIMESTAMP,
    ai_price_estimate NUMERIC
)
"#;

const UPSERT_SQL: &str = r#"
INSERT INTO ebay_items (
    item_id, title, price_value, price_currency, item_href, seller_username,
    condition_display_name, category_id, category_name, brand, last_seen_utc,
    ai_price_estimate
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
ON CONFLICT (item_id) DO UPDATE SET
    title = EXCLUDED.title,
    price_value = EXCLUDED.price_value,
    price_currency = EXCLUDED.price_currency,
    item_href = EXCLUDED.item_href,
    seller_username = EXCLUDED.seller_username,
    condition_display_name = EXCLUDED.condition_display_name,
    category_id = EXCLUDED.category_id,
    category_name = EXCLUDED.category_name,
    brand = EXCLUDED.brand,
    last_seen_utc = EXCLUDED.last_seen_utc,
    ai_price_estimate = EXCLUDED.ai_price_estimate
"#;

const SELECT_COLUMNS: &str = "item_id, title, price_value, price_currency, item_href, \
     seller_username, condition_display_name, category_id, category_name, brand, \
     last_seen_utc, ai_price_estimate";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence contract for the single listings table.
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Creates the table when absent. Safe to call on every start.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Insert-or-replace-all-columns by `item_id`, committed as one unit.
    /// An empty slice is a no-op.
    async fn upsert_listings(&self, rows: &[ListingRecord]) -> Result<usize, StoreError>;

    /// Missing-estimate rows first, then most recently seen, at most `limit` rows.
    async fn select_enrichment_candidates(
        &self,
        limit: usize,
    ) -> Result<Vec<ListingRecord>, StoreError>;

    async fn count_listings(&self) -> Result<u64, StoreError>;

    async fn get_listing(&self, item_id: &str) -> Result<Option<ListingRecord>, StoreError>;
}

#[derive(Debug, FromRow)]
struct ListingRow {
    item_id: String,
    title: Option<String>,
    price_value: Option<Decimal>,
    price_currency: Option<String>,
    item_href: Option<String>,
    seller_username: Option<String>,
    condition_display_name: Option<String>,
    category_id: Option<String>,
    category_name: Option<String>,
    brand: Option<String>,
    last_seen_utc: Option<NaiveDateTime>,
    ai_price_estimate: Option<Decimal>,
}

impl From<ListingRow> for ListingRecord {
    fn from(row: ListingRow) -> Self {
        Self {
            item_id: row.item_id,
            title: row.title,
            price_value: row.price_value,
            price_currency: row.price_currency,
            item_href: row.item_href,
            seller_username: row.seller_username,
            condition_display_name: row.condition_display_name,
            category_id: row.category_id,
            category_name: row.category_name,
            brand: row.brand,
            last_seen_utc: row.last_seen_utc.unwrap_or_default(),
            ai_price_estimate: row.ai_price_estimate,
        }
    }
}

/// PostgreSQL-backed store. A pooled connection is held only for one call.
#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
}

impl PgListingStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE_SQL).execute(&self.pool).await?;
        info!("ebay_items schema ensured");
        Ok(())
    }

    async fn upsert_listings(&self, rows: &[ListingRecord]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        // One statement per row: a multi-row VALUES list cannot carry the same key twice.
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(UPSERT_SQL)
                .bind(&row.item_id)
                .bind(&row.title)
                .bind(row.price_value)
                .bind(&row.price_currency)
                .bind(&row.item_href)
                .bind(&row.seller_username)
                .bind(&row.condition_display_name)
                .bind(&row.category_id)
                .bind(&row.category_name)
                .bind(&row.brand)
                .bind(row.last_seen_utc)
                .bind(row.ai_price_estimate)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!(rows = rows.len(), "upserted listings");
        Ok(rows.len())
    }

    async fn select_enrichment_candidates(
        &self,
        limit: usize,
    ) -> Result<Vec<ListingRecord>, StoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM ebay_items \
             ORDER BY (ai_price_estimate IS NULL) DESC, last_seen_utc DESC NULLS LAST, item_id \
             LIMIT $1"
        );
        let rows = sqlx::query_as::<_, ListingRow>(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(ListingRecord::from).collect())
    }

    async fn count_listings(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ebay_items")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn get_listing(&self, item_id: &str) -> Result<Option<ListingRecord>, StoreError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM ebay_items WHERE item_id = $1");
        let row = sqlx::query_as::<_, ListingRow>(&sql)
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(ListingRecord::from))
    }
}

/// In-process store with the same ordering and overwrite semantics as the SQL one.
#[derive(Debug, Default)]
pub struct MemoryListingStore {
    rows: Mutex<BTreeMap<String, ListingRecord>>,
    unavailable: AtomicBool,
    upsert_calls: AtomicUsize,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of non-empty upsert batches that reached the table.
    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Vec<ListingRecord> {
        self.lock().values().cloned().collect()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, ListingRecord>> {
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn upsert_listings(&self, rows: &[ListingRecord]) -> Result<usize, StoreError> {
        self.check_available()?;
        if rows.is_empty() {
            return Ok(0);
        }
        let mut table = self.lock();
        for row in rows {
            table.insert(row.item_id.clone(), row.clone());
        }
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        Ok(rows.len())
    }

    async fn select_enrichment_candidates(
        &self,
        limit: usize,
    ) -> Result<Vec<ListingRecord>, StoreError> {
        self.check_available()?;
        let mut rows = self.snapshot();
        rows.sort_by(|a, b| {
            a.ai_price_estimate
                .is_some()
                .cmp(&b.ai_price_estimate.is_some())
                .then_with(|| b.last_seen_utc.cmp(&a.last_seen_utc))
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn count_listings(&self) -> Result<u64, StoreError> {
        self.check_available()?;
        Ok(self.lock().len() as u64)
    }

    async fn get_listing(&self, item_id: &str) -> Result<Option<ListingRecord>, StoreError> {
        self.check_available()?;
        Ok(self.lock().get(item_id).cloned())
    }
}
