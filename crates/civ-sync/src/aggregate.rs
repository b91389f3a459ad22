//! Rollup computation and live period comparisons.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use civ_core::{whole_seconds, AggregationBucket, DataSource, PeriodType};
use civ_storage::{CategoryCount, DailyCount, RecordStore, StoreError};
use serde::Serialize;
use tracing::{debug, info};

/// Top categories reported alongside a summary.
const SUMMARY_TOP_CATEGORIES: i64 = 10;
pub(crate) const DEFAULT_TREND_MONTHS: i64 = 6;

/// `(current - previous) / previous * 100` to one decimal, ties to even, or 0
/// when there is no previous activity.
pub fn pct_change(current: i64, previous: i64) -> f64 {
    if previous <= 0 {
        return 0.0;
    }
    let pct = (current - previous) as f64 / previous as f64 * 100.0;
    (pct * 10.0).round_ties_even() / 10.0
}

fn day_start(day: NaiveDate) -> DateTime<Utc> {
    day.and_hms_opt(0, 0, 0)
        .map(|n| n.and_utc())
        .unwrap_or_else(|| DateTime::<Utc>::MIN_UTC)
}

/// Recomputes daily buckets for the last `window_days` days, today included.
/// Returns the number of buckets written.
pub async fn compute_rollups(
    store: &RecordStore,
    source: DataSource,
    window_days: i64,
) -> Result<usize, StoreError> {
    let today = Utc::now().date_naive();
    let periods: Vec<(NaiveDate, NaiveDate)> = (0..window_days.max(1))
        .rev()
        .map(|offset| PeriodType::Daily.bounds(today - Duration::days(offset)))
        .collect();
    rollup(store, source, PeriodType::Daily, &periods).await
}

/// Recomputes the calendar period containing `as_of` and the `periods - 1`
/// periods before it.
pub async fn compute_period_rollups(
    store: &RecordStore,
    source: DataSource,
    period_type: PeriodType,
    periods: u32,
    as_of: NaiveDate,
) -> Result<usize, StoreError> {
    let mut bounds = Vec::new();
    let mut cursor = as_of;
    for _ in 0..periods.max(1) {
        let period = period_type.bounds(cursor);
        bounds.push(period);
        cursor = period.0 - Duration::days(1);
    }
    bounds.reverse();
    rollup(store, source, period_type, &bounds).await
}

async fn rollup(
    store: &RecordStore,
    source: DataSource,
    period_type: PeriodType,
    periods: &[(NaiveDate, NaiveDate)],
) -> Result<usize, StoreError> {
    let (Some(first), Some(last)) = (periods.first(), periods.last()) else {
        return Ok(0);
    };
    let daily = store
        .daily_category_counts(source, day_start(first.0), day_start(last.1))
        .await?;

    let mut counts: BTreeMap<(NaiveDate, String), i64> = BTreeMap::new();
    for (day, category, n) in daily {
        let start = period_type.bounds(day).0;
        *counts.entry((start, category)).or_default() += n;
    }

    let computed_at = whole_seconds(Utc::now());
    let buckets: Vec<AggregationBucket> = periods
        .iter()
        .flat_map(|&(start, end)| {
            counts
                .range((start, String::new())..)
                .take_while(move |((s, _), _)| *s == start)
                .map(move |((_, category), count)| AggregationBucket {
                    data_source: source.as_str().to_string(),
                    period_type,
                    period_start: start,
                    period_end: end,
                    category: category.clone(),
                    count: *count,
                    computed_at,
                })
        })
        .collect();

    let starts: Vec<NaiveDate> = periods.iter().map(|&(start, _)| start).collect();
    let (written, pruned) = store
        .replace_buckets(source.as_str(), period_type, &starts, &buckets)
        .await?;

    info!(
        data_source = source.as_str(),
        period_type = period_type.as_str(),
        periods = periods.len(),
        written,
        pruned,
        "rollups recomputed"
    );
    Ok(written)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryWindow {
    Period(PeriodType),
    /// Explicit range. No comparison window is computed.
    Custom {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub data_source: &'static str,
    pub period: &'static str,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub current_total: i64,
    pub previous_total: i64,
    pub pct_change: f64,
    pub top_categories: Vec<CategoryCount>,
}

/// Live comparison of the current window against the preceding window of
/// equal length, read straight from the primary table.
pub async fn summary(
    store: &RecordStore,
    source: DataSource,
    window: SummaryWindow,
) -> Result<Summary, StoreError> {
    let now = whole_seconds(Utc::now());
    let (period, from, to, previous_from) = match window {
        SummaryWindow::Period(period) => {
            let from = now - period.window();
            (period.as_str(), from, now, Some(from - period.window()))
        }
        SummaryWindow::Custom { from, to } => ("custom", from, to, None),
    };

    let current_total = store.count_between(source, from, to).await?;
    let previous_total = match previous_from {
        Some(previous_from) => store.count_between(source, previous_from, from).await?,
        None => 0,
    };
    let top_categories = store
        .category_counts(source, from, to, SUMMARY_TOP_CATEGORIES)
        .await?;

    Ok(Summary {
        data_source: source.as_str(),
        period,
        window_start: from,
        window_end: to,
        current_total,
        previous_total,
        pct_change: pct_change(current_total, previous_total),
        top_categories,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrendRequest {
    pub months: Option<i64>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trend {
    pub data_source: &'static str,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// The window was moved back to end at the latest stored record.
    pub anchored_to_latest: bool,
    pub points: Vec<DailyCount>,
}

/// Window of `span` ending the day after the latest record of `source`.
async fn latest_window(
    store: &RecordStore,
    source: DataSource,
    span: Duration,
) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, StoreError> {
    Ok(store.latest_timestamp(source).await?.map(|latest| {
        let to = day_start(latest.date_naive() + Duration::days(1));
        (to - span, to)
    }))
}

/// Per-day counts. When the caller gave no explicit range and the window is
/// empty, the window is re-anchored at the latest stored record.
pub async fn trend(
    store: &RecordStore,
    source: DataSource,
    request: &TrendRequest,
) -> Result<Trend, StoreError> {
    let now = whole_seconds(Utc::now());
    let span = Duration::days(30 * request.months.unwrap_or(DEFAULT_TREND_MONTHS).max(1));
    let explicit = request.from.is_some() || request.to.is_some();
    let to = request.to.unwrap_or(now);
    let from = request.from.unwrap_or(to - span);
    let category = request.category.as_deref();

    let points = store.daily_counts(source, from, to, category).await?;
    if !points.is_empty() || explicit {
        return Ok(Trend {
            data_source: source.as_str(),
            from,
            to,
            anchored_to_latest: false,
            points,
        });
    }

    match latest_window(store, source, span).await? {
        Some((from, to)) => {
            debug!(data_source = source.as_str(), %from, %to, "trend re-anchored at latest data");
            Ok(Trend {
                data_source: source.as_str(),
                from,
                to,
                anchored_to_latest: true,
                points: store.daily_counts(source, from, to, category).await?,
            })
        }
        None => Ok(Trend {
            data_source: source.as_str(),
            from,
            to,
            anchored_to_latest: false,
            points,
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Breakdown {
    pub data_source: &'static str,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub anchored_to_latest: bool,
    pub total: i64,
    pub categories: Vec<CategoryCount>,
}

/// Category distribution over the last `period` window, with the same
/// latest-data fallback as [`trend`].
pub async fn breakdown(
    store: &RecordStore,
    source: DataSource,
    period: PeriodType,
    limit: i64,
) -> Result<Breakdown, StoreError> {
    let to = whole_seconds(Utc::now());
    let from = to - period.window();
    let mut result = Breakdown {
        data_source: source.as_str(),
        from,
        to,
        anchored_to_latest: false,
        total: 0,
        categories: store.category_counts(source, from, to, limit).await?,
    };

    if result.categories.is_empty() {
        if let Some((from, to)) = latest_window(store, source, period.window()).await? {
            result.from = from;
            result.to = to;
            result.anchored_to_latest = true;
            result.categories = store.category_counts(source, from, to, limit).await?;
        }
    }

    result.total = store.count_between(source, result.from, result.to).await?;
    Ok(result)
}
