//! Scheduled ingestion + enrichment pipeline for MPW.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mpw_adapters::{EbayBrowseAdapter, FixtureAdapter};
use mpw_core::SearchQuery;
use mpw_storage::{HttpClientConfig, HttpFetcher, ListingStore, PgListingStore};
use tracing::{debug, info};

pub mod config;
pub mod estimator;
pub mod jobs;
pub mod notifier;
pub mod scheduler;

pub use config::{database_url_from_env, ConfigError, SyncConfig};
pub use estimator::{EstimateError, GeminiModel, ParsedEstimate, PriceEstimator, PriceModel};
pub use jobs::{
    EnrichmentJob, EnrichmentReport, FailureStage, IngestionJob, IngestionReport, QuerySource,
    UnitFailure,
};
pub use notifier::{Notifier, NotifyError, TelegramNotifier};
pub use scheduler::{Clock, ManualClock, ScheduledTask, Scheduler, TokioClock};

pub const CRATE_NAME: &str = "mpw-sync";

/// Wires config into concrete clients and jobs. Built once per process.
pub struct SyncPipeline {
    config: SyncConfig,
    http: HttpFetcher,
    store: Arc<dyn ListingStore>,
    clock: Arc<TokioClock>,
}

impl SyncPipeline {
    /// Connects to PostgreSQL and makes sure the listings table exists.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let store = PgListingStore::connect(&config.database_url)
            .await
            .context("connecting to postgres")?;
        store.ensure_schema().await.context("creating listings table")?;
        Self::with_store(config, Arc::new(store))
    }

    pub fn with_store(config: SyncConfig, store: Arc<dyn ListingStore>) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
        })
        .context("building http client")?;
        if config.model.is_none() {
            debug!("GEMINI_API_KEY not set; price estimation disabled");
        }
        if config.telegram.is_none() {
            debug!("telegram bot token or chat id not set; notifications disabled");
        }
        Ok(Self {
            config,
            http,
            store,
            clock: Arc::new(TokioClock),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn ListingStore> {
        Arc::clone(&self.store)
    }

    pub fn ingestion_job(&self) -> IngestionJob {
        let marketplace = &self.config.marketplace;
        let adapter = EbayBrowseAdapter::new(
            self.http.clone(),
            marketplace.api_base.clone(),
            marketplace.marketplace_id.clone(),
            marketplace.credentials.clone(),
        );
        IngestionJob::new(
            Arc::new(adapter),
            self.store(),
            QuerySource::File(self.config.queries_path.clone()),
            self.clock.clone(),
        )
        .with_pause(self.config.pause)
    }

    pub fn enrichment_job(&self) -> EnrichmentJob {
        let estimator = match &self.config.model {
            Some(settings) => {
                PriceEstimator::new(Arc::new(GeminiModel::new(self.http.clone(), settings.clone())))
            }
            None => PriceEstimator::disabled(),
        };
        let notifier = self.config.telegram.as_ref().map(|settings| {
            let notifier = TelegramNotifier::new(self.http.clone(), settings.clone());
            Arc::new(notifier) as Arc<dyn Notifier>
        });
        EnrichmentJob::new(self.store(), estimator, self.config.alert_rule, self.clock.clone())
            .with_notifier(notifier)
            .with_batching(self.config.estimate_batch_size, self.config.candidate_cap)
            .with_pause(self.config.pause)
    }

    /// Ingestion first, enrichment second, each on its own interval.
    pub fn scheduler(&self) -> Scheduler<TokioClock> {
        Scheduler::new(self.clock.clone())
            .every(self.config.ingest_interval, Arc::new(self.ingestion_job()))
            .every(self.config.enrich_interval, Arc::new(self.enrichment_job()))
    }

    pub async fn run_forever(&self) {
        info!(
            ingest_interval_secs = self.config.ingest_interval.as_secs(),
            enrich_interval_secs = self.config.enrich_interval.as_secs(),
            "scheduler started"
        );
        self.scheduler().run_forever().await;
    }
}

/// Ingests a saved search response (or bare item list) through the normal upsert path.
pub async fn ingest_sample(store: Arc<dyn ListingStore>, path: &Path) -> Result<IngestionReport> {
    let adapter = FixtureAdapter::from_file("sample", path)
        .with_context(|| format!("loading sample listings from {}", path.display()))?;
    info!(items = adapter.items().len(), path = %path.display(), "ingesting sample listings");
    let job = IngestionJob::new(
        Arc::new(adapter),
        store,
        QuerySource::Inline(vec![SearchQuery::new()]),
        Arc::new(TokioClock),
    )
    .with_pause(Duration::ZERO);
    Ok(job.run_once().await)
}
