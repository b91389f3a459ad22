//! Ingestion pipeline wiring: configuration, failure-isolated source runs,
//! rollups, read-side queries, and the scheduling orchestrator.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use civ_adapters::{all_adapters, AdapterError, AdapterSettings, FetchContext, SourceAdapter};
use civ_core::ScopeConfig;
use civ_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, RecordStore};
use serde::Serialize;
use tokio::fs;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub mod aggregate;
pub mod orchestrator;
pub mod queries;

pub use aggregate::{
    breakdown, compute_period_rollups, compute_rollups, pct_change, summary, trend, Breakdown,
    Summary, SummaryWindow, Trend, TrendRequest,
};
pub use orchestrator::{job_table, JobKind, JobSpec, JobState, JobStatus, Orchestrator};
pub use queries::{
    building_detail, district_news, query_events, rollups, status, top_owners, topic_feed,
    violation_summary, violation_trend, BuildingDetail, EventFilter, FeedItem, FeedItemKind,
    StoreStatus, ViolationSummary,
};

/// Lookback used for sources with no schedule entry.
const DEFAULT_LOOKBACK_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub scope_path: PathBuf,
    pub socrata_app_token: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub backfill_months: i64,
    pub scheduler_enabled: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://data/civic.db".to_string()),
            scope_path: std::env::var("CIV_SCOPE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("scope.yaml")),
            socrata_app_token: std::env::var("SOCRATA_APP_TOKEN").ok(),
            user_agent: std::env::var("CIV_USER_AGENT")
                .unwrap_or_else(|_| "civic-pipeline/0.1".to_string()),
            http_timeout_secs: std::env::var("CIV_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            http_max_retries: std::env::var("CIV_HTTP_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            backfill_months: std::env::var("CIV_BACKFILL_MONTHS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(12),
            scheduler_enabled: std::env::var("CIV_SCHEDULER_ENABLED")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: StdDuration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..BackoffPolicy::default()
            },
            ..HttpClientConfig::default()
        }
    }

    /// Backfill window: months converted to 30-day months.
    pub fn backfill_lookback(&self) -> Duration {
        Duration::hours(self.backfill_months.max(1) * 30 * 24)
    }
}

/// Reads the scope file; a missing file yields the built-in defaults.
pub async fn load_scope(path: &Path) -> Result<ScopeConfig> {
    match fs::read_to_string(path).await {
        Ok(text) => serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no scope file, using defaults");
            Ok(ScopeConfig::default())
        }
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

/// Outcome of one adapter invocation. Failures are carried, never raised.
#[derive(Debug, Clone, Serialize)]
pub struct SourceRun {
    pub source_id: String,
    pub run_id: Uuid,
    pub count: usize,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct Pipeline {
    store: RecordStore,
    scope: Arc<ScopeConfig>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
}

impl Pipeline {
    pub fn new(store: RecordStore, scope: Arc<ScopeConfig>, adapters: Vec<Arc<dyn SourceAdapter>>) -> Self {
        Self {
            store,
            scope,
            adapters,
        }
    }

    /// Connects the store, loads the scope, and registers every adapter
    /// behind the shared HTTP transport.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let store = RecordStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening {}", config.database_url))?;
        let scope = load_scope(&config.scope_path).await?;
        let fetcher = HttpFetcher::new(config.http_client_config())?;

        let settings = AdapterSettings::new(scope, Arc::new(fetcher))
            .with_app_token(config.socrata_app_token.clone());
        let adapters = all_adapters(&settings);
        Ok(Self::new(store, settings.scope, adapters))
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn scope(&self) -> &ScopeConfig {
        &self.scope
    }

    pub fn adapters(&self) -> &[Arc<dyn SourceAdapter>] {
        &self.adapters
    }

    pub fn source_ids(&self) -> Vec<&'static str> {
        self.adapters.iter().map(|a| a.source_id()).collect()
    }

    pub fn adapter(&self, source_id: &str) -> Option<&Arc<dyn SourceAdapter>> {
        self.adapters.iter().find(|a| a.source_id() == source_id)
    }

    /// Scheduled lookback for a source.
    pub fn steady_lookback(&self, source_id: &str) -> Duration {
        Duration::hours(
            self.scope
                .schedule_for(source_id)
                .map_or(DEFAULT_LOOKBACK_HOURS, |s| s.lookback_hours),
        )
    }

    /// Runs one adapter. Every failure is logged and reported as zero records.
    pub async fn run_source(&self, source_id: &str, lookback: Duration) -> SourceRun {
        let ctx = FetchContext::new(self.store.clone(), lookback);
        let started_at = Utc::now();
        let span = info_span!("adapter_run", source_id, run_id = %ctx.run_id);

        let result = match self.adapter(source_id) {
            Some(adapter) => adapter.fetch(&ctx).instrument(span.clone()).await,
            None => Err(AdapterError::UnknownSource(source_id.to_string())),
        };

        let (count, error) = match result {
            Ok(count) => {
                span.in_scope(|| info!(count, "source run finished"));
                (count, None)
            }
            Err(err) => {
                span.in_scope(|| error!(error = %err, "source run failed"));
                (0, Some(err.to_string()))
            }
        };

        SourceRun {
            source_id: source_id.to_string(),
            run_id: ctx.run_id,
            count,
            error,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// [`Pipeline::run_source`] on its own task, so a panicking adapter only
    /// fails its own run.
    pub async fn run_isolated(self: &Arc<Self>, source_id: &str, lookback: Duration) -> SourceRun {
        let pipeline = Arc::clone(self);
        let task_source = source_id.to_string();
        let started_at = Utc::now();
        match tokio::spawn(async move { pipeline.run_source(&task_source, lookback).await }).await {
            Ok(run) => run,
            Err(err) => {
                error!(source_id, error = %err, "source run aborted");
                SourceRun {
                    source_id: source_id.to_string(),
                    run_id: Uuid::new_v4(),
                    count: 0,
                    error: Some(format!("source run aborted: {err}")),
                    started_at,
                    finished_at: Utc::now(),
                }
            }
        }
    }

    /// On-demand trigger: records written, or 0 when the source failed.
    pub async fn fetch_source(self: &Arc<Self>, source_id: &str, lookback: Duration) -> usize {
        self.run_isolated(source_id, lookback).await.count
    }

    /// Every adapter once, sequentially, each isolated from the others.
    pub async fn backfill(self: &Arc<Self>, lookback: Duration) -> Vec<SourceRun> {
        info!(hours = lookback.num_hours(), sources = self.adapters.len(), "backfill starting");
        let mut runs = Vec::with_capacity(self.adapters.len());
        for source_id in self.source_ids() {
            runs.push(self.run_isolated(source_id, lookback).await);
        }
        let failed = runs.iter().filter(|r| r.error.is_some()).count();
        info!(failed, "backfill complete");
        runs
    }
}
