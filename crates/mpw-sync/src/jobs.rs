use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mpw_adapters::{load_queries, normalize_listings, AdapterError, MarketplaceAdapter};
use mpw_core::{evaluate_alert, utc_now_naive, AlertRule, ListingRecord, SearchQuery};
use mpw_storage::ListingStore;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::estimator::{ParsedEstimate, PriceEstimator};
use crate::notifier::Notifier;
use crate::scheduler::{Clock, ScheduledTask};

pub const DEFAULT_BATCH_SIZE: usize = 20;
pub const DEFAULT_CANDIDATE_CAP: usize = 200;
pub const DEFAULT_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    LoadQueries,
    AccessToken,
    Search,
    Upsert,
    Select,
    Estimate,
    Notify,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::LoadQueries => "load_queries",
            Self::AccessToken => "access_token",
            Self::Search => "search",
            Self::Upsert => "upsert",
            Self::Select => "select",
            Self::Estimate => "estimate",
            Self::Notify => "notify",
        };
        f.write_str(label)
    }
}

/// One skipped unit of work (a query, a batch or a single notification).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    pub stage: FailureStage,
    pub unit: String,
    pub message: String,
}

fn record_failure(
    failures: &mut Vec<UnitFailure>,
    stage: FailureStage,
    unit: impl Into<String>,
    error: &dyn fmt::Display,
) {
    let failure = UnitFailure {
        stage,
        unit: unit.into(),
        message: error.to_string(),
    };
    warn!(
        stage = %failure.stage,
        unit = %failure.unit,
        error = %failure.message,
        "unit failed; skipping"
    );
    failures.push(failure);
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub run_id: Uuid,
    pub queries_total: usize,
    pub queries_failed: usize,
    pub fetched_items: usize,
    pub upserted: usize,
    pub failures: Vec<UnitFailure>,
}

impl IngestionReport {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            queries_total: 0,
            queries_failed: 0,
            fetched_items: 0,
            upserted: 0,
            failures: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentReport {
    pub run_id: Uuid,
    pub candidates: usize,
    pub batches: usize,
    pub estimated: usize,
    pub upserted: usize,
    pub alerts_sent: usize,
    pub failures: Vec<UnitFailure>,
}

impl EnrichmentReport {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            candidates: 0,
            batches: 0,
            estimated: 0,
            upserted: 0,
            alerts_sent: 0,
            failures: Vec::new(),
        }
    }
}

/// Where an ingestion run gets its saved searches from.
#[derive(Debug, Clone)]
pub enum QuerySource {
    /// Re-read on every run so edits apply without a restart.
    File(PathBuf),
    Inline(Vec<SearchQuery>),
}

impl QuerySource {
    fn load(&self) -> Result<Vec<SearchQuery>, AdapterError> {
        match self {
            Self::File(path) => load_queries(path),
            Self::Inline(queries) => Ok(queries.clone()),
        }
    }

    fn label(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Inline(_) => "inline".to_string(),
        }
    }
}

fn query_label(query: &SearchQuery) -> String {
    query
        .get("q")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| JsonValue::Object(query.clone()).to_string())
}

/// Fetch → normalize → upsert, one saved query at a time.
pub struct IngestionJob {
    adapter: Arc<dyn MarketplaceAdapter>,
    store: Arc<dyn ListingStore>,
    queries: QuerySource,
    pause: Duration,
    clock: Arc<dyn Clock>,
}

impl IngestionJob {
    pub fn new(
        adapter: Arc<dyn MarketplaceAdapter>,
        store: Arc<dyn ListingStore>,
        queries: QuerySource,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            adapter,
            store,
            queries,
            pause: DEFAULT_PAUSE,
            clock,
        }
    }

    /// Fixed wait between consecutive queries.
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub async fn run_once(&self) -> IngestionReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingestion", %run_id, marketplace = %self.adapter.marketplace_id());
        async {
            let report = self.ingest(run_id).await;
            info!(
                queries_total = report.queries_total,
                queries_failed = report.queries_failed,
                fetched_items = report.fetched_items,
                upserted = report.upserted,
                "ingestion run finished"
            );
            report
        }
        .instrument(span)
        .await
    }

    async fn ingest(&self, run_id: Uuid) -> IngestionReport {
        let mut report = IngestionReport::new(run_id);

        let queries = match self.queries.load() {
            Ok(queries) => queries,
            Err(err) => {
                record_failure(
                    &mut report.failures,
                    FailureStage::LoadQueries,
                    self.queries.label(),
                    &err,
                );
                return report;
            }
        };
        report.queries_total = queries.len();
        if queries.is_empty() {
            info!("no saved queries to run");
            return report;
        }

        let token = match self.adapter.access_token().await {
            Ok(token) => token,
            Err(err) => {
                record_failure(
                    &mut report.failures,
                    FailureStage::AccessToken,
                    self.adapter.marketplace_id(),
                    &err,
                );
                report.queries_failed = queries.len();
                return report;
            }
        };

        for (index, query) in queries.iter().enumerate() {
            if index > 0 && !self.pause.is_zero() {
                self.clock.sleep(self.pause).await;
            }
            let unit = query_label(query);

            let items = match self.adapter.search(&token, query).await {
                Ok(items) => items,
                Err(err) => {
                    record_failure(&mut report.failures, FailureStage::Search, unit, &err);
                    report.queries_failed += 1;
                    continue;
                }
            };
            report.fetched_items += items.len();

            let records = normalize_listings(&items, utc_now_naive());
            let dropped = items.len() - records.len();
            if dropped > 0 {
                debug!(query = %unit, dropped, "listings without an item id dropped");
            }
            if records.is_empty() {
                continue;
            }

            match self.store.upsert_listings(&records).await {
                Ok(written) => {
                    debug!(query = %unit, written, "listings upserted");
                    report.upserted += written;
                }
                Err(err) => {
                    record_failure(&mut report.failures, FailureStage::Upsert, unit, &err);
                    report.queries_failed += 1;
                }
            }
        }

        report
    }
}

#[async_trait]
impl ScheduledTask for IngestionJob {
    fn name(&self) -> &str {
        "ingestion"
    }

    async fn run(&self) {
        self.run_once().await;
    }
}

/// Estimate → re-upsert → alert, over batches of stored listings.
pub struct EnrichmentJob {
    store: Arc<dyn ListingStore>,
    estimator: PriceEstimator,
    notifier: Option<Arc<dyn Notifier>>,
    rule: AlertRule,
    batch_size: usize,
    candidate_cap: usize,
    pause: Duration,
    clock: Arc<dyn Clock>,
}

impl EnrichmentJob {
    pub fn new(
        store: Arc<dyn ListingStore>,
        estimator: PriceEstimator,
        rule: AlertRule,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            estimator,
            notifier: None,
            rule,
            batch_size: DEFAULT_BATCH_SIZE,
            candidate_cap: DEFAULT_CANDIDATE_CAP,
            pause: DEFAULT_PAUSE,
            clock,
        }
    }

    pub fn with_notifier(mut self, notifier: Option<Arc<dyn Notifier>>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_batching(mut self, batch_size: usize, candidate_cap: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self.candidate_cap = candidate_cap;
        self
    }

    /// Fixed wait after every batch.
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub async fn run_once(&self) -> EnrichmentReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("enrichment", %run_id);
        async {
            let report = self.enrich(run_id).await;
            info!(
                candidates = report.candidates,
                batches = report.batches,
                estimated = report.estimated,
                upserted = report.upserted,
                alerts_sent = report.alerts_sent,
                failures = report.failures.len(),
                "enrichment run finished"
            );
            report
        }
        .instrument(span)
        .await
    }

    async fn enrich(&self, run_id: Uuid) -> EnrichmentReport {
        let mut report = EnrichmentReport::new(run_id);

        // Without a model every estimate would be null; re-upserting would wipe stored ones.
        if !self.estimator.is_enabled() {
            info!("price estimation disabled; skipping enrichment");
            return report;
        }

        let candidates = match self.store.select_enrichment_candidates(self.candidate_cap).await {
            Ok(candidates) => candidates,
            Err(err) => {
                record_failure(&mut report.failures, FailureStage::Select, "candidates", &err);
                return report;
            }
        };
        report.candidates = candidates.len();

        for (index, batch) in candidates.chunks(self.batch_size).enumerate() {
            report.batches += 1;
            let unit = format!("batch {}", index + 1);
            self.enrich_batch(&unit, batch, &mut report).await;
            if !self.pause.is_zero() {
                self.clock.sleep(self.pause).await;
            }
        }

        report
    }

    async fn enrich_batch(
        &self,
        unit: &str,
        batch: &[ListingRecord],
        report: &mut EnrichmentReport,
    ) {
        let estimates = match self.estimator.estimate(batch).await {
            Ok(estimates) => estimates,
            Err(err) => {
                record_failure(&mut report.failures, FailureStage::Estimate, unit, &err);
                return;
            }
        };

        let updated: Vec<ListingRecord> = batch
            .iter()
            .zip(&estimates)
            .map(|(record, estimate)| {
                if let ParsedEstimate::Unparseable(token) = estimate {
                    debug!(item_id = %record.item_id, token = %token, "unparseable estimate");
                }
                record.clone().with_estimate(estimate.value())
            })
            .collect();
        let estimated = updated.iter().filter(|r| r.ai_price_estimate.is_some()).count();
        report.estimated += estimated;
        debug!(batch = unit, size = batch.len(), estimated, "batch estimated");

        match self.store.upsert_listings(&updated).await {
            Ok(written) => report.upserted += written,
            Err(err) => {
                record_failure(&mut report.failures, FailureStage::Upsert, unit, &err);
                return;
            }
        }

        for record in &updated {
            let Some(alert) = evaluate_alert(record, &self.rule) else {
                continue;
            };
            let Some(notifier) = &self.notifier else {
                debug!(
                    item_id = %alert.item_id,
                    uplift = %alert.uplift_percent,
                    "alert matched; notifier disabled"
                );
                continue;
            };
            match notifier.notify(&alert).await {
                Ok(()) => {
                    info!(
                        item_id = %alert.item_id,
                        uplift = %alert.uplift_percent,
                        "price alert sent"
                    );
                    report.alerts_sent += 1;
                }
                Err(err) => {
                    record_failure(
                        &mut report.failures,
                        FailureStage::Notify,
                        alert.item_id.clone(),
                        &err,
                    );
                }
            }
        }
    }
}

#[async_trait]
impl ScheduledTask for EnrichmentJob {
    fn name(&self) -> &str {
        "enrichment"
    }

    async fn run(&self) {
        self.run_once().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::{EstimateError, PriceModel};
    use crate::notifier::NotifyError;
    use crate::scheduler::ManualClock;
    use mpw_core::PriceAlert;
    use mpw_storage::{FetchError, MemoryListingStore, StoreError};
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn summary(id: &str, price: &str) -> JsonValue {
        json!({
            "itemId": id,
            "title": format!("listing {id}"),
            "price": {"value": price, "currency": "GBP"},
            "itemHref": format!("https://api.ebay.com/buy/browse/v1/item/{id}"),
        })
    }

    fn query(q: &str) -> SearchQuery {
        match json!({"q": q, "limit": 50}) {
            JsonValue::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[derive(Default)]
    struct StubAdapter {
        results: HashMap<String, Vec<JsonValue>>,
        token_fails: bool,
        searches: AtomicUsize,
    }

    #[async_trait]
    impl MarketplaceAdapter for StubAdapter {
        fn marketplace_id(&self) -> &str {
            "EBAY_GB"
        }

        async fn access_token(&self) -> Result<String, AdapterError> {
            if self.token_fails {
                return Err(AdapterError::MissingAccessToken);
            }
            Ok("token".into())
        }

        async fn search(
            &self,
            _token: &str,
            query: &SearchQuery,
        ) -> Result<Vec<JsonValue>, AdapterError> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            let q = query.get("q").and_then(JsonValue::as_str).unwrap_or_default();
            self.results.get(q).cloned().ok_or_else(|| {
                AdapterError::Fetch(FetchError::HttpStatus {
                    status: 500,
                    url: "https://api.ebay.test/search".into(),
                    body: "internal error".into(),
                })
            })
        }
    }

    fn ingestion(
        adapter: StubAdapter,
        store: &Arc<MemoryListingStore>,
        queries: QuerySource,
        clock: &Arc<ManualClock>,
    ) -> IngestionJob {
        IngestionJob::new(Arc::new(adapter), store.clone(), queries, clock.clone())
    }

    #[tokio::test]
    async fn ingestion_continues_past_a_failed_query() {
        let adapter = StubAdapter {
            results: HashMap::from([
                ("switch".to_string(), vec![summary("1", "100.00"), summary("2", "120.00")]),
                ("ps5".to_string(), vec![summary("3", "300.00"), json!({"title": "no id"})]),
            ]),
            ..Default::default()
        };
        let store = Arc::new(MemoryListingStore::new());
        let clock = Arc::new(ManualClock::new());
        let queries = QuerySource::Inline(vec![query("switch"), query("broken"), query("ps5")]);

        let report = ingestion(adapter, &store, queries, &clock).run_once().await;

        assert_eq!(report.queries_total, 3);
        assert_eq!(report.queries_failed, 1);
        assert_eq!(report.fetched_items, 4);
        assert_eq!(report.upserted, 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].stage, FailureStage::Search);
        assert_eq!(report.failures[0].unit, "broken");
        assert_eq!(store.snapshot().len(), 3);
        assert_eq!(clock.sleeps(), vec![DEFAULT_PAUSE, DEFAULT_PAUSE]);
    }

    #[tokio::test]
    async fn ingestion_without_token_attempts_no_search() {
        let adapter = Arc::new(StubAdapter {
            token_fails: true,
            ..Default::default()
        });
        let store = Arc::new(MemoryListingStore::new());
        let clock = Arc::new(ManualClock::new());
        let job = IngestionJob::new(
            adapter.clone(),
            store.clone(),
            QuerySource::Inline(vec![query("switch"), query("ps5")]),
            clock.clone(),
        );

        let report = job.run_once().await;

        assert_eq!(report.queries_failed, 2);
        assert_eq!(report.failures[0].stage, FailureStage::AccessToken);
        assert_eq!(adapter.searches.load(Ordering::SeqCst), 0);
        assert_eq!(store.upsert_calls(), 0);
    }

    #[tokio::test]
    async fn missing_query_file_ends_the_run_without_upserts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryListingStore::new());
        let clock = Arc::new(ManualClock::new());
        let queries = QuerySource::File(dir.path().join("queries.json"));

        let report = ingestion(StubAdapter::default(), &store, queries, &clock).run_once().await;

        assert_eq!(report.queries_total, 0);
        assert_eq!(report.failures[0].stage, FailureStage::LoadQueries);
        assert_eq!(store.upsert_calls(), 0);
    }

    #[tokio::test]
    async fn query_file_is_read_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("queries.json");
        std::fs::write(&path, r#"[{"q": "switch", "category_ids": "139971"}]"#).expect("write");
        let adapter = StubAdapter {
            results: HashMap::from([("switch".to_string(), vec![summary("1", "99.99")])]),
            ..Default::default()
        };
        let store = Arc::new(MemoryListingStore::new());
        let clock = Arc::new(ManualClock::new());

        let report = ingestion(adapter, &store, QuerySource::File(path), &clock).run_once().await;

        assert_eq!(report.upserted, 1);
        assert_eq!(store.snapshot()[0].price_value, Some(dec!(99.99)));
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn unavailable_store_fails_each_query_but_run_completes() {
        let adapter = StubAdapter {
            results: HashMap::from([
                ("a".to_string(), vec![summary("1", "1.00")]),
                ("b".to_string(), vec![summary("2", "2.00")]),
            ]),
            ..Default::default()
        };
        let store = Arc::new(MemoryListingStore::new());
        store.set_unavailable(true);
        let clock = Arc::new(ManualClock::new());

        let queries = QuerySource::Inline(vec![query("a"), query("b")]);
        let report = ingestion(adapter, &store, queries, &clock).run_once().await;

        assert_eq!(report.queries_failed, 2);
        assert!(report.failures.iter().all(|f| f.stage == FailureStage::Upsert));
        assert_eq!(report.upserted, 0);
    }

    /// Answers with one fixed estimate per listing line; optionally fails the first call.
    struct StubModel {
        estimate: &'static str,
        fail_first: bool,
        calls: AtomicUsize,
    }

    impl StubModel {
        fn answering(estimate: &'static str) -> Self {
            Self {
                estimate,
                fail_first: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PriceModel for StubModel {
        async fn generate(&self, prompt: &str) -> Result<String, EstimateError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                return Err(EstimateError::Fetch(FetchError::HttpStatus {
                    status: 503,
                    url: "https://model.test/generate".into(),
                    body: "overloaded".into(),
                }));
            }
            let listings = prompt.lines().filter(|line| line.starts_with("- ")).count();
            Ok(vec![self.estimate; listings].join("||"))
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<PriceAlert>>,
        fails: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, alert: &PriceAlert) -> Result<(), NotifyError> {
            if self.fails {
                return Err(NotifyError::Rejected("chat not found".into()));
            }
            self.sent.lock().expect("sent").push(alert.clone());
            Ok(())
        }
    }

    fn listing(id: &str, price: Option<rust_decimal::Decimal>) -> ListingRecord {
        let mut record = ListingRecord::new(id);
        record.title = Some(format!("listing {id}"));
        record.price_value = price;
        record.price_currency = Some("GBP".into());
        record
    }

    async fn seeded(records: Vec<ListingRecord>) -> Arc<MemoryListingStore> {
        let store = Arc::new(MemoryListingStore::new());
        store.upsert_listings(&records).await.expect("seed");
        store
    }

    fn enrichment(
        store: &Arc<MemoryListingStore>,
        model: StubModel,
        multiple: rust_decimal::Decimal,
        clock: &Arc<ManualClock>,
    ) -> EnrichmentJob {
        EnrichmentJob::new(
            store.clone(),
            PriceEstimator::new(Arc::new(model)),
            AlertRule::new(multiple),
            clock.clone(),
        )
    }

    #[tokio::test]
    async fn estimate_is_stored_and_alert_sent() {
        let store = seeded(vec![listing("item-1", Some(dec!(100)))]).await;
        let clock = Arc::new(ManualClock::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let job = enrichment(&store, StubModel::answering("150"), dec!(0.2), &clock)
            .with_notifier(Some(notifier.clone()));

        let report = job.run_once().await;

        assert_eq!(report.candidates, 1);
        assert_eq!(report.batches, 1);
        assert_eq!(report.estimated, 1);
        assert_eq!(report.upserted, 1);
        assert_eq!(report.alerts_sent, 1);
        assert!(report.failures.is_empty());

        let stored = store.get_listing("item-1").await.expect("get").expect("row");
        assert_eq!(stored.ai_price_estimate, Some(dec!(150)));
        assert_eq!(stored.title.as_deref(), Some("listing item-1"));

        let sent = notifier.sent.lock().expect("sent");
        assert_eq!(sent[0].uplift_percent, dec!(50));
        assert_eq!(clock.sleeps(), vec![DEFAULT_PAUSE]);
    }

    #[tokio::test]
    async fn no_alert_below_multiple_or_without_price() {
        let store =
            seeded(vec![listing("cheap", Some(dec!(100))), listing("unpriced", None)]).await;
        let clock = Arc::new(ManualClock::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let job = enrichment(&store, StubModel::answering("110"), dec!(1.5), &clock)
            .with_notifier(Some(notifier.clone()));

        let report = job.run_once().await;

        assert_eq!(report.estimated, 2);
        assert_eq!(report.alerts_sent, 0);
        assert!(notifier.sent.lock().expect("sent").is_empty());
    }

    #[tokio::test]
    async fn candidates_are_batched_with_a_pause_after_each() {
        let records = (0..45).map(|i| listing(&format!("item-{i:02}"), Some(dec!(10)))).collect();
        let store = seeded(records).await;
        let clock = Arc::new(ManualClock::new());
        let job =
            enrichment(&store, StubModel::answering("12"), dec!(2), &clock).with_batching(20, 200);

        let report = job.run_once().await;

        assert_eq!(report.batches, 3);
        assert_eq!(report.estimated, 45);
        assert_eq!(report.upserted, 45);
        // one seeding call plus one per batch
        assert_eq!(store.upsert_calls(), 4);
        assert_eq!(clock.sleeps(), vec![DEFAULT_PAUSE; 3]);
    }

    #[tokio::test]
    async fn candidate_cap_limits_work() {
        let records = (0..30).map(|i| listing(&format!("item-{i:02}"), Some(dec!(10)))).collect();
        let store = seeded(records).await;
        let clock = Arc::new(ManualClock::new());
        let job = enrichment(&store, StubModel::answering("12"), dec!(2), &clock)
            .with_batching(20, 25)
            .with_pause(Duration::ZERO);

        let report = job.run_once().await;

        assert_eq!(report.candidates, 25);
        assert_eq!(report.batches, 2);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn failed_estimate_skips_only_that_batch() {
        let records = (0..4).map(|i| listing(&format!("item-{i}"), Some(dec!(10)))).collect();
        let store = seeded(records).await;
        let clock = Arc::new(ManualClock::new());
        let model = StubModel {
            estimate: "11",
            fail_first: true,
            calls: AtomicUsize::new(0),
        };
        let job = enrichment(&store, model, dec!(5), &clock).with_batching(2, 200);

        let report = job.run_once().await;

        assert_eq!(report.batches, 2);
        assert_eq!(report.upserted, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].stage, FailureStage::Estimate);
        assert_eq!(report.failures[0].unit, "batch 1");
        let estimated = store
            .snapshot()
            .into_iter()
            .filter(|r| r.ai_price_estimate.is_some())
            .count();
        assert_eq!(estimated, 2);
        assert_eq!(clock.sleeps().len(), 2);
    }

    #[tokio::test]
    async fn notification_failure_keeps_the_upsert() {
        let store = seeded(vec![listing("item-1", Some(dec!(100)))]).await;
        let clock = Arc::new(ManualClock::new());
        let notifier = Arc::new(RecordingNotifier {
            fails: true,
            ..Default::default()
        });
        let job = enrichment(&store, StubModel::answering("400"), dec!(1.2), &clock)
            .with_notifier(Some(notifier));

        let report = job.run_once().await;

        assert_eq!(report.upserted, 1);
        assert_eq!(report.alerts_sent, 0);
        assert_eq!(report.failures[0].stage, FailureStage::Notify);
        assert_eq!(report.failures[0].unit, "item-1");
        let stored = store.get_listing("item-1").await.expect("get").expect("row");
        assert_eq!(stored.ai_price_estimate, Some(dec!(400)));
    }

    #[tokio::test]
    async fn disabled_estimator_leaves_stored_estimates_alone() {
        let existing = listing("item-1", Some(dec!(100))).with_estimate(Some(dec!(130)));
        let store = seeded(vec![existing]).await;
        let clock = Arc::new(ManualClock::new());
        let job = EnrichmentJob::new(
            store.clone(),
            PriceEstimator::disabled(),
            AlertRule::new(dec!(1)),
            clock.clone(),
        );

        let report = job.run_once().await;

        assert_eq!(report.candidates, 0);
        assert_eq!(store.upsert_calls(), 1);
        let stored = store.get_listing("item-1").await.expect("get").expect("row");
        assert_eq!(stored.ai_price_estimate, Some(dec!(130)));
    }

    #[tokio::test]
    async fn unavailable_store_is_reported_not_raised() {
        let store = seeded(vec![listing("item-1", Some(dec!(100)))]).await;
        store.set_unavailable(true);
        let clock = Arc::new(ManualClock::new());
        let job = enrichment(&store, StubModel::answering("150"), dec!(1), &clock);

        let report = job.run_once().await;

        assert_eq!(report.candidates, 0);
        assert_eq!(report.failures[0].stage, FailureStage::Select);
    }

    /// Returns the same reply for every prompt.
    struct FixedReply(&'static str);

    #[async_trait]
    impl PriceModel for FixedReply {
        async fn generate(&self, _prompt: &str) -> Result<String, EstimateError> {
            Ok(self.0.to_string())
        }
    }

    fn enrichment_with_reply(
        store: &Arc<MemoryListingStore>,
        reply: &'static str,
    ) -> EnrichmentJob {
        EnrichmentJob::new(
            store.clone(),
            PriceEstimator::new(Arc::new(FixedReply(reply))),
            AlertRule::new(dec!(1)),
            Arc::new(ManualClock::new()),
        )
        .with_pause(Duration::ZERO)
    }

    async fn stored_estimate(
        store: &MemoryListingStore,
        id: &str,
    ) -> Option<rust_decimal::Decimal> {
        store.get_listing(id).await.expect("get").expect("row").ai_price_estimate
    }

    #[tokio::test]
    async fn short_reply_clears_stale_estimates_past_its_end() {
        let store = seeded(vec![
            listing("a", Some(dec!(100))).with_estimate(Some(dec!(90))),
            listing("b", Some(dec!(100))).with_estimate(Some(dec!(95))),
        ])
        .await;

        let report = enrichment_with_reply(&store, "150").run_once().await;

        assert_eq!(report.candidates, 2);
        assert_eq!(report.estimated, 1);
        assert_eq!(report.upserted, 2);
        assert_eq!(stored_estimate(&store, "a").await, Some(dec!(150)));
        assert_eq!(stored_estimate(&store, "b").await, None);
    }

    #[tokio::test]
    async fn garbled_reply_clears_stale_estimates() {
        let store = seeded(vec![
            listing("a", Some(dec!(100))).with_estimate(Some(dec!(90))),
            listing("b", Some(dec!(100))).with_estimate(Some(dec!(95))),
        ])
        .await;

        let report = enrichment_with_reply(&store, "no idea||n/a").run_once().await;

        assert_eq!(report.estimated, 0);
        assert_eq!(report.upserted, 2);
        assert!(report.failures.is_empty());
        assert_eq!(stored_estimate(&store, "a").await, None);
        assert_eq!(stored_estimate(&store, "b").await, None);

        let single = seeded(vec![listing("c", Some(dec!(10))).with_estimate(Some(dec!(12)))]).await;
        enrichment_with_reply(&single, "I cannot price this listing.").run_once().await;
        assert_eq!(stored_estimate(&single, "c").await, None);
    }

    /// Reads from memory but rejects every write.
    struct ReadOnlyStore(Arc<MemoryListingStore>);

    #[async_trait]
    impl ListingStore for ReadOnlyStore {
        async fn ensure_schema(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn upsert_listings(&self, _rows: &[ListingRecord]) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable("read-only replica".into()))
        }

        async fn select_enrichment_candidates(
            &self,
            limit: usize,
        ) -> Result<Vec<ListingRecord>, StoreError> {
            self.0.select_enrichment_candidates(limit).await
        }

        async fn count_listings(&self) -> Result<u64, StoreError> {
            self.0.count_listings().await
        }

        async fn get_listing(&self, item_id: &str) -> Result<Option<ListingRecord>, StoreError> {
            self.0.get_listing(item_id).await
        }
    }

    #[tokio::test]
    async fn failed_upsert_sends_no_alerts_for_that_batch() {
        let inner = seeded(vec![
            listing("item-1", Some(dec!(100))),
            listing("item-2", Some(dec!(50))),
        ])
        .await;
        let notifier = Arc::new(RecordingNotifier::default());
        let job = EnrichmentJob::new(
            Arc::new(ReadOnlyStore(inner.clone())),
            PriceEstimator::new(Arc::new(StubModel::answering("400"))),
            AlertRule::new(dec!(1.2)),
            Arc::new(ManualClock::new()),
        )
        .with_notifier(Some(notifier.clone()))
        .with_pause(Duration::ZERO);

        let report = job.run_once().await;

        assert_eq!(report.candidates, 2);
        assert_eq!(report.estimated, 2);
        assert_eq!(report.upserted, 0);
        assert_eq!(report.alerts_sent, 0);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].stage, FailureStage::Upsert);
        assert_eq!(report.failures[0].unit, "batch 1");
        assert!(notifier.sent.lock().expect("sent").is_empty());
        assert_eq!(stored_estimate(&inner, "item-1").await, None);
    }

    #[tokio::test]
    async fn jobs_run_as_scheduled_tasks() {
        let store = Arc::new(MemoryListingStore::new());
        let clock = Arc::new(ManualClock::new());
        let adapter = StubAdapter {
            results: HashMap::from([("switch".to_string(), vec![summary("1", "100.00")])]),
            ..Default::default()
        };
        let queries = QuerySource::Inline(vec![query("switch")]);
        let ingest: Arc<dyn ScheduledTask> =
            Arc::new(ingestion(adapter, &store, queries, &clock));
        let enrich: Arc<dyn ScheduledTask> =
            Arc::new(enrichment(&store, StubModel::answering("200"), dec!(1.5), &clock));
        let mut scheduler = crate::scheduler::Scheduler::new(clock.clone())
            .every(Duration::from_secs(3600), ingest)
            .every(Duration::from_secs(3600), enrich);

        assert_eq!(scheduler.step().await.as_deref(), Some("ingestion"));
        assert_eq!(scheduler.step().await.as_deref(), Some("enrichment"));

        let stored = store.get_listing("1").await.expect("get").expect("row");
        assert_eq!(stored.ai_price_estimate, Some(dec!(200)));
    }
}
