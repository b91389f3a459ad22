use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use civ_core::{DataSource, PeriodType};
use civ_storage::RecordStore;
use civ_sync::{
    compute_period_rollups, compute_rollups, job_table, status, summary, top_owners,
    violation_summary, violation_trend, Orchestrator, Pipeline, SummaryWindow, SyncConfig,
    TrendRequest,
};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "civ-cli")]
#[command(about = "Civic open-data ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Backfill if the store is empty, then run every scheduled job until Ctrl-C.
    Serve,
    /// Run one source now.
    Fetch {
        source_id: String,
        /// Defaults to the source's scheduled lookback.
        #[arg(long)]
        lookback_hours: Option<i64>,
    },
    /// Run every source once over the backfill window.
    Backfill {
        #[arg(long)]
        months: Option<i64>,
    },
    /// Recompute stored rollups.
    Aggregate {
        /// All data sources when omitted.
        #[arg(long)]
        source: Option<DataSource>,
        #[arg(long, default_value = "daily")]
        period: PeriodType,
        /// Days for daily rollups, periods otherwise.
        #[arg(long, default_value_t = 30)]
        window: u32,
    },
    /// Live current-versus-previous comparison for one data source.
    Summary {
        source: DataSource,
        #[arg(long, default_value = "weekly")]
        period: PeriodType,
    },
    /// Landlords ranked by open HPD violations.
    Owners {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// HPD violations by class: period summary and daily trend.
    Violations {
        #[arg(long, default_value = "monthly")]
        period: PeriodType,
        #[arg(long, default_value_t = 6)]
        months: i64,
    },
    /// List registered sources.
    Sources,
    /// Row counts and newest record per data source.
    Status,
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let pipeline = Arc::new(Pipeline::from_config(&config).await?);
            let jobs = if config.scheduler_enabled {
                job_table(pipeline.scope(), &pipeline.source_ids())
            } else {
                info!("scheduler disabled, running backfill only");
                Vec::new()
            };
            let orchestrator = Orchestrator::new(pipeline, jobs, config.backfill_lookback());
            orchestrator.start().await?;
            tokio::signal::ctrl_c().await?;
            info!("shutdown requested");
            orchestrator.shutdown().await;
        }
        Commands::Fetch {
            source_id,
            lookback_hours,
        } => {
            let pipeline = Arc::new(Pipeline::from_config(&config).await?);
            if pipeline.adapter(&source_id).is_none() {
                bail!(
                    "unknown source {source_id}; known sources: {}",
                    pipeline.source_ids().join(", ")
                );
            }
            let lookback = lookback_hours
                .map(Duration::hours)
                .unwrap_or_else(|| pipeline.steady_lookback(&source_id));
            let run = pipeline.run_isolated(&source_id, lookback).await;
            print_json(&run)?;
        }
        Commands::Backfill { months } => {
            let pipeline = Arc::new(Pipeline::from_config(&config).await?);
            let lookback = match months {
                Some(months) => Duration::hours(months.max(1) * 30 * 24),
                None => config.backfill_lookback(),
            };
            let runs = pipeline.backfill(lookback).await;
            print_json(&runs)?;
        }
        Commands::Aggregate {
            source,
            period,
            window,
        } => {
            let store = RecordStore::connect(&config.database_url).await?;
            let sources = match source {
                Some(source) => vec![source],
                None => DataSource::ALL.to_vec(),
            };
            for source in sources {
                let written = match period {
                    PeriodType::Daily => compute_rollups(&store, source, i64::from(window)).await?,
                    _ => {
                        let today = Utc::now().date_naive();
                        compute_period_rollups(&store, source, period, window, today).await?
                    }
                };
                println!("{}: {written} buckets", source.as_str());
            }
        }
        Commands::Summary { source, period } => {
            let store = RecordStore::connect(&config.database_url).await?;
            print_json(&summary(&store, source, SummaryWindow::Period(period)).await?)?;
        }
        Commands::Owners { limit } => {
            let store = RecordStore::connect(&config.database_url).await?;
            print_json(&top_owners(&store, limit, None, None).await?)?;
        }
        Commands::Violations { period, months } => {
            let store = RecordStore::connect(&config.database_url).await?;
            let summary = violation_summary(&store, SummaryWindow::Period(period)).await?;
            let trend = violation_trend(
                &store,
                &TrendRequest {
                    months: Some(months),
                    ..TrendRequest::default()
                },
            )
            .await?;
            print_json(&serde_json::json!({ "summary": summary, "trend": trend }))?;
        }
        Commands::Sources => {
            let pipeline = Pipeline::from_config(&config).await?;
            for adapter in pipeline.adapters() {
                let lookback = pipeline.steady_lookback(adapter.source_id());
                println!(
                    "{:<16} {:<28} lookback={}h  {}",
                    adapter.source_id(),
                    serde_json::to_string(&adapter.geo_mode())?,
                    lookback.num_hours(),
                    adapter.description()
                );
            }
        }
        Commands::Status => {
            let store = RecordStore::connect(&config.database_url).await?;
            print_json(&status(&store).await?)?;
        }
        Commands::Migrate => {
            let store = RecordStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("schema applied to {}", config.database_url);
            store.close().await;
        }
    }

    Ok(())
}
