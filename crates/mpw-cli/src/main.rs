use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mpw_storage::{ListingStore, PgListingStore};
use mpw_sync::{database_url_from_env, ingest_sample, SyncConfig, SyncPipeline, UnitFailure};
use tracing::info;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "mpw")]
#[command(about = "Marketplace Price Watch: listing ingestion, price estimation and alerts")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run ingestion and enrichment forever on their configured intervals.
    Run,
    /// Run one ingestion pass and exit.
    Ingest,
    /// Run one enrichment pass and exit.
    Enrich,
    /// Create the listings table if it does not exist.
    Migrate,
    /// Load listings from a saved search response file.
    IngestSample {
        #[arg(long)]
        path: PathBuf,
    },
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

fn print_failures(failures: &[UnitFailure]) {
    for failure in failures {
        eprintln!("  {} {}: {}", failure.stage, failure.unit, failure.message);
    }
}

async fn connect_store() -> Result<PgListingStore> {
    let database_url = database_url_from_env()?;
    let store = PgListingStore::connect(&database_url)
        .await
        .context("connecting to postgres")?;
    store.ensure_schema().await.context("creating listings table")?;
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info")?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let config = SyncConfig::from_env()?;
            info!(queries = %config.queries_path.display(), "starting price watch");
            let pipeline = SyncPipeline::connect(config).await?;
            pipeline.run_forever().await;
        }
        Commands::Ingest => {
            let pipeline = SyncPipeline::connect(SyncConfig::from_env()?).await?;
            let report = pipeline.ingestion_job().run_once().await;
            println!(
                "ingestion complete: run_id={} queries={} failed={} fetched={} upserted={}",
                report.run_id,
                report.queries_total,
                report.queries_failed,
                report.fetched_items,
                report.upserted
            );
            print_failures(&report.failures);
        }
        Commands::Enrich => {
            let pipeline = SyncPipeline::connect(SyncConfig::from_env()?).await?;
            let report = pipeline.enrichment_job().run_once().await;
            println!(
                "enrichment complete: run_id={} candidates={} batches={} estimated={} \
                 upserted={} alerts={}",
                report.run_id,
                report.candidates,
                report.batches,
                report.estimated,
                report.upserted,
                report.alerts_sent
            );
            print_failures(&report.failures);
        }
        Commands::Migrate => {
            let store = connect_store().await?;
            println!("schema ready: {} listings stored", store.count_listings().await?);
        }
        Commands::IngestSample { path } => {
            let store = Arc::new(connect_store().await?);
            let report = ingest_sample(store.clone(), &path).await?;
            println!(
                "sample ingested: run_id={} items={} upserted={} total_listings={}",
                report.run_id,
                report.fetched_items,
                report.upserted,
                store.count_listings().await?
            );
            print_failures(&report.failures);
        }
    }

    Ok(())
}
