use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gosradar_analytics::{AnalyticsEngine, Outcome};
use gosradar_store::ProcurementStore;
use gosradar_sync::{maybe_build_scheduler, pipeline_from_env, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "gosradar")]
#[command(about = "Goszakup procurement mirror and analytics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Full first-time load for the configured customers.
    Historical,
    /// Incremental sync over the look-back window, then a repair sweep.
    Sync,
    /// Re-fetch announcements for dangling contract references.
    Backfill,
    /// Fill in subject names and item-code descriptions.
    Enrich,
    /// Run the cron scheduler until interrupted.
    ServeSchedule,
    /// Weighted-average deviation check for a target price.
    PriceCheck {
        /// Nomenclature (ENSTRU) code.
        code: String,
        /// Proposed price per unit.
        target: f64,
    },
    /// IQR fair-price bounds for an item code.
    FairPrice {
        code: String,
        /// Restrict to one region (KATO code).
        #[arg(long)]
        kato: Option<String>,
        /// Restrict to one contract year.
        #[arg(long)]
        year: Option<i32>,
    },
    /// Year-over-year purchase-volume anomaly check.
    Volume {
        /// Customer BIN.
        bin: String,
        code: String,
    },
    /// Monthly average-price timeline for an item code.
    Dynamics { code: String },
    /// Highest-value contracts for a customer.
    Top {
        /// Customer BIN.
        bin: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Historical => {
            let pipeline = pipeline_from_env(&config).await?;
            let summary = pipeline.load_historical(&config.target_bins).await?;
            println!(
                "historical load complete: bins={} plans={} contracts={} units={} refs={}",
                summary.bins_processed,
                summary.plans_added,
                summary.contracts_added,
                summary.contract_units_added,
                summary.refs_added,
            );
        }
        Commands::Sync => {
            let pipeline = pipeline_from_env(&config).await?;
            let summary = pipeline
                .run_daily(&config.target_bins, config.cutoff())
                .await?;
            let repaired = pipeline.backfill_missing_announcements().await?;
            println!(
                "sync complete: bins={} plans={} contracts={} skipped={} units={} repaired={}",
                summary.bins_processed,
                summary.plans_added,
                summary.contracts_added,
                summary.contracts_skipped,
                summary.contract_units_added,
                repaired,
            );
        }
        Commands::Backfill => {
            let pipeline = pipeline_from_env(&config).await?;
            let repaired = pipeline.backfill_missing_announcements().await?;
            println!("backfill complete: announcements_repaired={repaired}");
        }
        Commands::Enrich => {
            let pipeline = pipeline_from_env(&config).await?;
            let subjects = pipeline.enrich_subjects().await?;
            let codes = pipeline.enrich_enstru_descriptions().await?;
            println!("enrich complete: subjects={subjects} enstru_codes={codes}");
        }
        Commands::ServeSchedule => {
            let Some(mut scheduler) = maybe_build_scheduler(&config).await? else {
                anyhow::bail!("scheduler disabled; set GOSRADAR_SCHEDULER_ENABLED=1");
            };
            scheduler.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running, ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
        Commands::PriceCheck { code, target } => {
            let store = open_store(&config).await?;
            let engine = AnalyticsEngine::new(&store);
            print_outcome(engine.check_price_deviation(&code, target).await?)?;
        }
        Commands::FairPrice { code, kato, year } => {
            let store = open_store(&config).await?;
            let engine = AnalyticsEngine::new(&store);
            print_outcome(
                engine
                    .get_fair_price_bounds(&code, kato.as_deref(), year)
                    .await?,
            )?;
        }
        Commands::Volume { bin, code } => {
            let store = open_store(&config).await?;
            let engine = AnalyticsEngine::new(&store);
            print_outcome(engine.detect_volume_anomaly(&bin, &code).await?)?;
        }
        Commands::Dynamics { code } => {
            let store = open_store(&config).await?;
            let engine = AnalyticsEngine::new(&store);
            print_outcome(engine.analyze_price_dynamics(&code).await?)?;
        }
        Commands::Top { bin, limit } => {
            let store = open_store(&config).await?;
            let engine = AnalyticsEngine::new(&store);
            print_outcome(engine.get_top_contracts(&bin, limit).await?)?;
        }
    }

    Ok(())
}

async fn open_store(config: &SyncConfig) -> Result<ProcurementStore> {
    ProcurementStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening store at {}", config.db_path.display()))
}

fn print_outcome<T: Serialize>(outcome: Outcome<T>) -> Result<()> {
    let rendered = serde_json::to_string_pretty(&outcome).context("rendering report")?;
    println!("{rendered}");
    Ok(())
}
