use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use civ_core::{whole_seconds, Complaint311, DataSource, PeriodType};
use civ_storage::RecordStore;
use civ_sync::{
    breakdown, compute_period_rollups, compute_rollups, rollups, summary, trend, SummaryWindow,
    TrendRequest,
};

fn complaint(key: &str, created_date: DateTime<Utc>, complaint_type: Option<&str>) -> Complaint311 {
    Complaint311 {
        unique_key: key.to_string(),
        created_date: whole_seconds(created_date),
        closed_date: None,
        agency: None,
        complaint_type: complaint_type.map(str::to_string),
        descriptor: None,
        location_type: None,
        incident_zip: None,
        address: None,
        city: None,
        status: None,
        resolution_description: None,
        latitude: None,
        longitude: None,
        fetched_at: whole_seconds(Utc::now()),
        raw_data: None,
    }
}

fn midnight(day: NaiveDate) -> DateTime<Utc> {
    day.and_hms_opt(0, 0, 0).unwrap().and_utc()
}

#[tokio::test]
async fn rollups_overwrite_and_prune_stale_categories() {
    let store = RecordStore::in_memory().await.unwrap();
    let today = Utc::now().date_naive();
    let yesterday = today - Duration::days(1);
    let early_today = midnight(today) + Duration::minutes(1);
    let noon_yesterday = midnight(yesterday) + Duration::hours(12);

    store
        .upsert_many(&[
            complaint("1", early_today, Some("Noise")),
            complaint("2", early_today, Some("Noise")),
            complaint("3", early_today, None),
            complaint("4", noon_yesterday, Some("Heat")),
        ])
        .await
        .unwrap();

    let written = compute_rollups(&store, DataSource::Complaints311, 2).await.unwrap();
    assert_eq!(written, 3);

    let buckets = rollups(&store, DataSource::Complaints311, PeriodType::Daily, None, None, None)
        .await
        .unwrap();
    let rows: Vec<_> = buckets
        .iter()
        .map(|b| (b.period_start, b.category.as_str(), b.count))
        .collect();
    assert_eq!(
        rows,
        [
            (yesterday, "Heat", 1),
            (today, "Noise", 2),
            (today, "Unspecified", 1),
        ]
    );
    assert!(buckets.iter().all(|b| b.period_end == b.period_start + Duration::days(1)));

    // Reclassify yesterday's complaint and recompute: the old bucket disappears.
    store
        .upsert_many(&[complaint("4", noon_yesterday, Some("Water Leak"))])
        .await
        .unwrap();
    compute_rollups(&store, DataSource::Complaints311, 2).await.unwrap();
    compute_rollups(&store, DataSource::Complaints311, 2).await.unwrap();

    let yesterday_rows = rollups(
        &store,
        DataSource::Complaints311,
        PeriodType::Daily,
        None,
        Some(yesterday),
        Some(today),
    )
    .await
    .unwrap();
    assert_eq!(yesterday_rows.len(), 1);
    assert_eq!(yesterday_rows[0].category, "Water Leak");
    assert_eq!(store.count("aggregations").await.unwrap(), 3);
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[tokio::test]
async fn weekly_and_monthly_buckets_follow_the_calendar() {
    let store = RecordStore::in_memory().await.unwrap();
    store
        .upsert_many(&[
            complaint("nov", midnight(date(2025, 11, 30)) + Duration::hours(20), Some("Heat")),
            complaint("dec-1", midnight(date(2025, 12, 30)) + Duration::hours(9), Some("Heat")),
            complaint("dec-2", midnight(date(2025, 12, 31)) + Duration::hours(23), Some("Heat")),
            complaint("jan-1", midnight(date(2026, 1, 1)) + Duration::hours(1), Some("Heat")),
            complaint("jan-2", midnight(date(2026, 1, 4)) + Duration::hours(12), Some("Noise")),
        ])
        .await
        .unwrap();
    let as_of = date(2026, 1, 4);

    for _ in 0..2 {
        compute_period_rollups(&store, DataSource::Complaints311, PeriodType::Weekly, 1, as_of)
            .await
            .unwrap();
    }
    let weekly = rollups(&store, DataSource::Complaints311, PeriodType::Weekly, None, None, None)
        .await
        .unwrap();
    let rows: Vec<_> = weekly
        .iter()
        .map(|b| (b.period_start, b.period_end, b.category.as_str(), b.count))
        .collect();
    assert_eq!(
        rows,
        [
            (date(2025, 12, 29), date(2026, 1, 5), "Heat", 3),
            (date(2025, 12, 29), date(2026, 1, 5), "Noise", 1),
        ]
    );
    assert!(weekly.iter().all(|b| b.period_start.weekday() == Weekday::Mon));

    compute_period_rollups(&store, DataSource::Complaints311, PeriodType::Monthly, 2, as_of)
        .await
        .unwrap();
    compute_period_rollups(&store, DataSource::Complaints311, PeriodType::Monthly, 2, as_of)
        .await
        .unwrap();
    let monthly = rollups(&store, DataSource::Complaints311, PeriodType::Monthly, None, None, None)
        .await
        .unwrap();
    let rows: Vec<_> = monthly
        .iter()
        .map(|b| (b.period_start, b.period_end, b.category.as_str(), b.count))
        .collect();
    assert_eq!(
        rows,
        [
            (date(2025, 12, 1), date(2026, 1, 1), "Heat", 2),
            (date(2026, 1, 1), date(2026, 2, 1), "Heat", 1),
            (date(2026, 1, 1), date(2026, 2, 1), "Noise", 1),
        ]
    );
    assert_eq!(store.count("aggregations").await.unwrap(), 5);
}

#[tokio::test]
async fn summary_compares_against_the_preceding_window() {
    let store = RecordStore::in_memory().await.unwrap();
    let now = Utc::now();
    store
        .upsert_many(&[
            complaint("a", now - Duration::hours(1), Some("Noise")),
            complaint("b", now - Duration::hours(2), Some("Noise")),
            complaint("c", now - Duration::hours(3), Some("Heat")),
            complaint("d", now - Duration::hours(30), Some("Noise")),
            complaint("e", now - Duration::hours(40), Some("Heat")),
        ])
        .await
        .unwrap();

    let daily = summary(&store, DataSource::Complaints311, SummaryWindow::Period(PeriodType::Daily))
        .await
        .unwrap();
    assert_eq!(daily.period, "daily");
    assert_eq!((daily.current_total, daily.previous_total), (3, 2));
    assert_eq!(daily.pct_change, 50.0);
    assert_eq!(daily.top_categories[0].category, "Noise");
    assert_eq!(daily.top_categories[0].count, 2);

    let custom = summary(
        &store,
        DataSource::Complaints311,
        SummaryWindow::Custom {
            from: now - Duration::hours(48),
            to: now,
        },
    )
    .await
    .unwrap();
    assert_eq!(custom.current_total, 5);
    assert_eq!(custom.previous_total, 0);
    assert_eq!(custom.pct_change, 0.0);
}

#[tokio::test]
async fn stale_data_reanchors_trend_and_breakdown_unless_range_is_explicit() {
    let store = RecordStore::in_memory().await.unwrap();
    let latest = Utc::now() - Duration::days(400);
    store
        .upsert_many(&[
            complaint("old-1", latest, Some("Noise")),
            complaint("old-2", latest - Duration::days(3), Some("Heat")),
        ])
        .await
        .unwrap();

    let anchored = trend(&store, DataSource::Complaints311, &TrendRequest::default())
        .await
        .unwrap();
    assert!(anchored.anchored_to_latest);
    assert_eq!(anchored.points.iter().map(|p| p.count).sum::<i64>(), 2);
    assert_eq!(anchored.to, midnight(latest.date_naive() + Duration::days(1)));

    let explicit = trend(
        &store,
        DataSource::Complaints311,
        &TrendRequest {
            from: Some(Utc::now() - Duration::days(30)),
            ..TrendRequest::default()
        },
    )
    .await
    .unwrap();
    assert!(!explicit.anchored_to_latest);
    assert!(explicit.points.is_empty());

    let by_category = breakdown(&store, DataSource::Complaints311, PeriodType::Weekly, 10)
        .await
        .unwrap();
    assert!(by_category.anchored_to_latest);
    assert_eq!(by_category.total, 2);
    assert_eq!(by_category.categories.len(), 2);

    let empty = RecordStore::in_memory().await.unwrap();
    let nothing = trend(&empty, DataSource::Calls911, &TrendRequest::default())
        .await
        .unwrap();
    assert!(!nothing.anchored_to_latest);
    assert!(nothing.points.is_empty());
}
