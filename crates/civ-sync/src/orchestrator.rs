//! Interval scheduling of source runs and rollups, with a one-time backfill
//! when the store starts empty.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use civ_core::{DataSource, PeriodType, ScopeConfig};
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::aggregate::{compute_period_rollups, compute_rollups};
use crate::{Pipeline, SourceRun};

pub const AGGREGATE_JOB: &str = "aggregate";

/// Weekly and monthly rollups cover the current and the previous period.
const CALENDAR_ROLLUP_PERIODS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    Source(String),
    /// Daily, weekly, and monthly rollups for every data source.
    Aggregate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub name: String,
    pub kind: JobKind,
    pub interval: StdDuration,
    pub lookback: Duration,
}

/// One job per scheduled source plus the rollup job, from the scope's schedule.
/// Sources without a schedule entry are not scheduled.
pub fn job_table(scope: &ScopeConfig, source_ids: &[&str]) -> Vec<JobSpec> {
    scope
        .schedule
        .iter()
        .filter_map(|entry| {
            let kind = if entry.job == AGGREGATE_JOB {
                JobKind::Aggregate
            } else if source_ids.contains(&entry.job.as_str()) {
                JobKind::Source(entry.job.clone())
            } else {
                warn!(job = %entry.job, "schedule entry has no adapter");
                return None;
            };
            Some(JobSpec {
                name: entry.job.clone(),
                kind,
                interval: StdDuration::from_secs(entry.interval_minutes.max(1) * 60),
                lookback: Duration::hours(entry.lookback_hours),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Idle,
    Running,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub name: String,
    pub state: JobState,
    pub interval_secs: u64,
    pub runs: u64,
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    pub last_count: Option<usize>,
    pub last_error: Option<String>,
}

impl JobStatus {
    fn new(name: &str, interval: StdDuration) -> Self {
        Self {
            name: name.to_string(),
            state: JobState::Idle,
            interval_secs: interval.as_secs(),
            runs: 0,
            last_started: None,
            last_finished: None,
            last_count: None,
            last_error: None,
        }
    }
}

type Statuses = Arc<RwLock<BTreeMap<String, JobStatus>>>;

/// Owns the job table, the supervisor task, and the shutdown signal.
pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    jobs: Vec<JobSpec>,
    backfill_lookback: Duration,
    statuses: Statuses,
    backfill: Arc<Mutex<Option<Vec<SourceRun>>>>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(pipeline: Arc<Pipeline>, jobs: Vec<JobSpec>, backfill_lookback: Duration) -> Self {
        let statuses = jobs
            .iter()
            .map(|job| (job.name.clone(), JobStatus::new(&job.name, job.interval)))
            .collect();
        let (shutdown, _) = watch::channel(false);
        Self {
            pipeline,
            jobs,
            backfill_lookback,
            statuses: Arc::new(RwLock::new(statuses)),
            backfill: Arc::new(Mutex::new(None)),
            shutdown,
            supervisor: Mutex::new(None),
        }
    }

    pub fn jobs(&self) -> &[JobSpec] {
        &self.jobs
    }

    /// Spawns the supervisor: backfill if the store is empty, then one
    /// interval loop per job. The first tick of each job fires one interval
    /// after the loops start.
    pub async fn start(&self) -> Result<()> {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.is_some() {
            bail!("orchestrator already started");
        }
        if *self.shutdown.borrow() {
            bail!("orchestrator has been shut down");
        }

        let pipeline = self.pipeline.clone();
        let jobs = self.jobs.clone();
        let statuses = self.statuses.clone();
        let backfill = self.backfill.clone();
        let lookback = self.backfill_lookback;
        let shutdown = self.shutdown.subscribe();

        *supervisor = Some(tokio::spawn(async move {
            supervise(pipeline, jobs, statuses, backfill, lookback, shutdown).await;
        }));
        info!(jobs = self.jobs.len(), "orchestrator started");
        Ok(())
    }

    /// Stops new ticks and backfill steps, then waits for in-flight runs.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let handle = self.supervisor.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(error = %err, "orchestrator supervisor ended abnormally");
            }
        }
        info!("orchestrator stopped");
    }

    pub async fn statuses(&self) -> Vec<JobStatus> {
        self.statuses.read().await.values().cloned().collect()
    }

    /// Runs of the startup backfill, if one happened.
    pub async fn backfill_report(&self) -> Option<Vec<SourceRun>> {
        self.backfill.lock().await.clone()
    }
}

async fn supervise(
    pipeline: Arc<Pipeline>,
    jobs: Vec<JobSpec>,
    statuses: Statuses,
    backfill: Arc<Mutex<Option<Vec<SourceRun>>>>,
    backfill_lookback: Duration,
    shutdown: watch::Receiver<bool>,
) {
    match pipeline.store().count_primary().await {
        Ok(0) => {
            let runs = run_backfill(&pipeline, backfill_lookback, &shutdown).await;
            *backfill.lock().await = Some(runs);
        }
        Ok(existing) => info!(existing, "store populated, skipping backfill"),
        Err(err) => error!(error = %err, "could not inspect store, skipping backfill"),
    }

    if *shutdown.borrow() {
        return;
    }

    let handles: Vec<JoinHandle<()>> = jobs
        .into_iter()
        .map(|job| {
            tokio::spawn(job_loop(
                pipeline.clone(),
                job,
                statuses.clone(),
                shutdown.clone(),
            ))
        })
        .collect();

    for handle in handles {
        if let Err(err) = handle.await {
            error!(error = %err, "job loop ended abnormally");
        }
    }
}

async fn run_backfill(
    pipeline: &Arc<Pipeline>,
    lookback: Duration,
    shutdown: &watch::Receiver<bool>,
) -> Vec<SourceRun> {
    info!(hours = lookback.num_hours(), "empty store, backfilling");
    let mut runs = Vec::new();
    for source_id in pipeline.source_ids() {
        if *shutdown.borrow() {
            warn!(completed = runs.len(), "backfill interrupted by shutdown");
            return runs;
        }
        runs.push(pipeline.run_isolated(source_id, lookback).await);
    }
    let failed = runs.iter().filter(|r| r.error.is_some()).count();
    info!(steps = runs.len(), failed, "backfill complete");
    runs
}

async fn job_loop(
    pipeline: Arc<Pipeline>,
    job: JobSpec,
    statuses: Statuses,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + job.interval, job.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                run_job(&pipeline, &job, &statuses).await;
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn run_job(pipeline: &Arc<Pipeline>, job: &JobSpec, statuses: &Statuses) {
    if let Some(status) = statuses.write().await.get_mut(&job.name) {
        status.state = JobState::Running;
        status.last_started = Some(Utc::now());
    }

    let outcome = match &job.kind {
        JobKind::Source(source_id) => {
            let run = pipeline.run_isolated(source_id, job.lookback).await;
            match run.error {
                Some(err) => Err(err),
                None => Ok(run.count),
            }
        }
        JobKind::Aggregate => aggregate_all(pipeline, job.lookback).await,
    };

    if let Some(status) = statuses.write().await.get_mut(&job.name) {
        status.state = JobState::Idle;
        status.runs += 1;
        status.last_finished = Some(Utc::now());
        match outcome {
            Ok(count) => {
                status.last_count = Some(count);
                status.last_error = None;
            }
            Err(message) => {
                status.last_count = Some(0);
                status.last_error = Some(message);
            }
        }
    }
}

async fn aggregate_all(pipeline: &Pipeline, lookback: Duration) -> Result<usize, String> {
    let store = pipeline.store();
    let window_days = lookback.num_days().max(1);
    let today = Utc::now().date_naive();
    let mut written = 0;
    let mut failures = Vec::new();
    for source in DataSource::ALL {
        let mut results = vec![(
            PeriodType::Daily,
            compute_rollups(store, source, window_days).await,
        )];
        for period in [PeriodType::Weekly, PeriodType::Monthly] {
            let result =
                compute_period_rollups(store, source, period, CALENDAR_ROLLUP_PERIODS, today).await;
            results.push((period, result));
        }

        for (period, result) in results {
            match result {
                Ok(n) => written += n,
                Err(err) => {
                    error!(
                        data_source = source.as_str(),
                        period = period.as_str(),
                        error = %err,
                        "rollup failed"
                    );
                    failures.push(format!("{} {}: {err}", source.as_str(), period.as_str()));
                }
            }
        }
    }
    if failures.is_empty() {
        Ok(written)
    } else {
        Err(failures.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_table_follows_the_schedule() {
        let scope = ScopeConfig::default();
        let jobs = job_table(&scope, &["fdny", "311", "hpd_violations"]);
        let names: Vec<_> = jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, ["fdny", "311", "hpd_violations", "aggregate"]);

        let fdny = &jobs[0];
        assert_eq!(fdny.kind, JobKind::Source("fdny".into()));
        assert_eq!(fdny.interval, StdDuration::from_secs(15 * 60));
        assert_eq!(fdny.lookback, Duration::hours(1));
        assert_eq!(jobs[3].kind, JobKind::Aggregate);
        assert_eq!(jobs[3].lookback.num_days(), 30);
    }
}
