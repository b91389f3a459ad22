//! Read-side queries consumed by the HTTP layer.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use civ_core::{
    AggregationBucket, DataSource, Event, EventType, HpdComplaint, HpdViolation, LegislationItem,
    NewsArticle, OwnerContacts, PeriodType,
};
use civ_storage::{
    ClassCounts, Condition, DailyClassCounts, Order, OwnerRanking, RecordStore, Select, SqlValue,
    StoreError,
};
use serde::Serialize;

use crate::aggregate::{pct_change, SummaryWindow, TrendRequest, DEFAULT_TREND_MONTHS};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Empty means every type.
    pub types: Vec<EventType>,
    /// Only events within this long of now.
    pub since: Option<Duration>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl EventFilter {
    pub fn within(since: Duration) -> Self {
        Self {
            since: Some(since),
            ..Self::default()
        }
    }

    pub fn with_types(mut self, types: &[EventType]) -> Self {
        self.types = types.to_vec();
        self
    }
}

/// Events newest first.
pub async fn query_events(
    store: &RecordStore,
    filter: &EventFilter,
    limit: i64,
    offset: i64,
) -> Result<Vec<Event>, StoreError> {
    let mut select = Select::new();
    if !filter.types.is_empty() {
        select = select.filter(Condition::In(
            "event_type",
            filter.types.iter().map(|t| SqlValue::from(t.as_str())).collect(),
        ));
    }
    if let Some(since) = filter.since {
        select = select.gte("occurred_at", Utc::now() - since);
    }
    if let Some(from) = filter.from {
        select = select.gte("occurred_at", from);
    }
    if let Some(to) = filter.to {
        select = select.filter(Condition::Lte("occurred_at", to.into()));
    }
    store
        .select(
            &select
                .order_by("occurred_at", Order::Desc)
                .order_by("id", Order::Asc)
                .limit(limit)
                .offset(offset),
        )
        .await
}

/// Landlords ranked by open violations.
pub async fn top_owners(
    store: &RecordStore,
    limit: i64,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> Result<Vec<OwnerRanking>, StoreError> {
    store.owner_rankings(from, to, limit).await
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViolationSummary {
    pub period: &'static str,
    #[serde(flatten)]
    pub current: ClassCounts,
    pub previous_total: i64,
    pub pct_change: f64,
}

/// Violations inspected in the current window, split by class, against the
/// total of the preceding window. Custom ranges have no comparison.
pub async fn violation_summary(
    store: &RecordStore,
    window: SummaryWindow,
) -> Result<ViolationSummary, StoreError> {
    match window {
        SummaryWindow::Period(period) => {
            let now = civ_core::whole_seconds(Utc::now());
            let from = now - period.window();
            let current = store.violation_class_totals(Some(from), Some(now)).await?;
            let previous = store
                .violation_class_totals(
                    Some(from - period.window()),
                    Some(from - Duration::seconds(1)),
                )
                .await?;
            Ok(ViolationSummary {
                period: period.as_str(),
                current,
                previous_total: previous.total,
                pct_change: pct_change(current.total, previous.total),
            })
        }
        SummaryWindow::Custom { from, to } => Ok(ViolationSummary {
            period: "custom",
            current: store.violation_class_totals(Some(from), Some(to)).await?,
            previous_total: 0,
            pct_change: 0.0,
        }),
    }
}

/// Daily violation counts split by class. Without explicit bounds the window
/// is the last `months` 30-day months.
pub async fn violation_trend(
    store: &RecordStore,
    request: &TrendRequest,
) -> Result<Vec<DailyClassCounts>, StoreError> {
    let from = match (request.from, request.to) {
        (None, None) => {
            let months = request.months.unwrap_or(DEFAULT_TREND_MONTHS).max(1);
            Some(civ_core::whole_seconds(Utc::now()) - Duration::days(30 * months))
        }
        (from, _) => from,
    };
    store.violation_class_daily(from, request.to).await
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildingDetail {
    pub building_id: String,
    pub owner: Option<OwnerContacts>,
    pub violations: Vec<HpdViolation>,
    pub complaints: Vec<HpdComplaint>,
}

/// A building with its violations and complaints, newest first. `None` when
/// nothing references the building.
pub async fn building_detail(
    store: &RecordStore,
    building_id: &str,
) -> Result<Option<BuildingDetail>, StoreError> {
    let violations: Vec<HpdViolation> = store
        .select(
            &Select::new()
                .eq("building_id", building_id)
                .order_by("inspection_date", Order::Desc),
        )
        .await?;
    let complaints: Vec<HpdComplaint> = store
        .select(
            &Select::new()
                .eq("building_id", building_id)
                .order_by("received_date", Order::Desc),
        )
        .await?;

    if violations.is_empty() && complaints.is_empty() {
        return Ok(None);
    }
    let owner = violations
        .iter()
        .find(|v| v.owner.owner_name.is_some())
        .map(|v| v.owner.clone());

    Ok(Some(BuildingDetail {
        building_id: building_id.to_string(),
        owner,
        violations,
        complaints,
    }))
}

/// Stored buckets, oldest period first.
pub async fn rollups(
    store: &RecordStore,
    source: DataSource,
    period_type: PeriodType,
    category: Option<&str>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<Vec<AggregationBucket>, StoreError> {
    let mut select = Select::new()
        .eq("data_source", source.as_str())
        .eq("period_type", period_type.as_str());
    if let Some(category) = category {
        select = select.eq("category", category);
    }
    if let Some(from) = from {
        select = select.gte("period_start", from);
    }
    if let Some(to) = to {
        select = select.lt("period_start", to);
    }
    store
        .select(
            &select
                .order_by("period_start", Order::Asc)
                .order_by("category", Order::Asc),
        )
        .await
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStatus {
    pub tables: Vec<(&'static str, i64)>,
    pub latest: Vec<(&'static str, Option<DateTime<Utc>>)>,
}

/// Row counts per table and the newest record per data source.
pub async fn status(store: &RecordStore) -> Result<StoreStatus, StoreError> {
    let tables = store.table_counts().await?;
    let mut latest = Vec::with_capacity(DataSource::ALL.len());
    for source in DataSource::ALL {
        latest.push((source.as_str(), store.latest_timestamp(source).await?));
    }
    Ok(StoreStatus { tables, latest })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedItemKind {
    News,
    Legislation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedItem {
    pub kind: FeedItemKind,
    pub title: String,
    pub description: Option<String>,
    pub url: Option<String>,
    pub source: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub feed_name: Option<String>,
}

impl From<NewsArticle> for FeedItem {
    fn from(article: NewsArticle) -> Self {
        Self {
            kind: FeedItemKind::News,
            title: article.title,
            description: article.summary,
            url: article.url,
            source: article.source,
            date: article.published_at,
            feed_name: Some(article.feed_name),
        }
    }
}

impl From<LegislationItem> for FeedItem {
    fn from(item: LegislationItem) -> Self {
        Self {
            kind: FeedItemKind::Legislation,
            title: item
                .title
                .or_else(|| item.file_number.clone())
                .unwrap_or_else(|| item.id.clone()),
            description: item.name,
            url: item.url,
            source: Some("NYC Council".to_string()),
            date: item.intro_date,
            feed_name: item.matter_type,
        }
    }
}

/// Topic-related news merged with legislation, newest first.
pub async fn topic_feed(store: &RecordStore, limit: i64) -> Result<Vec<FeedItem>, StoreError> {
    let news: Vec<NewsArticle> = store
        .select(
            &Select::new()
                .eq("is_topic_related", true)
                .order_by("published_at", Order::Desc)
                .limit(limit),
        )
        .await?;
    let legislation: Vec<LegislationItem> = store
        .select(
            &Select::new()
                .order_by("intro_date", Order::Desc)
                .limit(limit),
        )
        .await?;

    let mut items: Vec<FeedItem> = news
        .into_iter()
        .map(FeedItem::from)
        .chain(legislation.into_iter().map(FeedItem::from))
        .collect();
    items.sort_by(|a, b| b.date.cmp(&a.date));
    items.truncate(usize::try_from(limit).unwrap_or(0));
    Ok(items)
}

/// District and hyperlocal news, newest first.
pub async fn district_news(store: &RecordStore, limit: i64) -> Result<Vec<NewsArticle>, StoreError> {
    store
        .select(
            &Select::new()
                .eq("is_district", true)
                .order_by("published_at", Order::Desc)
                .limit(limit),
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use civ_core::Severity;

    fn event(id: &str, event_type: EventType, hours_ago: i64) -> Event {
        let now = civ_core::whole_seconds(Utc::now());
        Event {
            id: id.to_string(),
            event_type,
            title: id.to_string(),
            description: None,
            latitude: None,
            longitude: None,
            address: None,
            occurred_at: now - Duration::hours(hours_ago),
            fetched_at: now,
            source_url: None,
            category: None,
            severity: Severity::Medium,
            raw_data: None,
        }
    }

    #[tokio::test]
    async fn events_filter_by_type_and_window_newest_first() {
        let store = RecordStore::in_memory().await.unwrap();
        store
            .upsert_many(&[
                event("fdny_1", EventType::Fire, 30),
                event("fdny_2", EventType::Fire, 2),
                event("nypd_1", EventType::Crime, 1),
                event("311_1", EventType::Complaint311, 3),
            ])
            .await
            .unwrap();

        let recent = query_events(&store, &EventFilter::within(Duration::hours(24)), 50, 0)
            .await
            .unwrap();
        let ids: Vec<_> = recent.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["nypd_1", "fdny_2", "311_1"]);

        let fires = query_events(
            &store,
            &EventFilter::default().with_types(&[EventType::Fire]),
            1,
            1,
        )
        .await
        .unwrap();
        assert_eq!(fires.len(), 1);
        assert_eq!(fires[0].id, "fdny_1");
    }

    fn violation(id: &str, class: &str, days_ago: i64) -> HpdViolation {
        let now = civ_core::whole_seconds(Utc::now());
        HpdViolation {
            violation_id: id.into(),
            building_id: Some("b1".into()),
            registration_id: None,
            borough: None,
            house_number: Some("12".into()),
            street_name: Some("AVENUE C".into()),
            zip: None,
            apartment: None,
            story: None,
            block: None,
            lot: None,
            class: Some(class.into()),
            inspection_date: Some(now - Duration::days(days_ago) - Duration::hours(1)),
            approved_date: None,
            nov_description: None,
            nov_issued_date: None,
            current_status: Some("OPEN".into()),
            current_status_date: None,
            latitude: None,
            longitude: None,
            owner: OwnerContacts {
                owner_name: Some("AVE C HOLDINGS".into()),
                head_officer: Some("PAT LEE".into()),
                ..OwnerContacts::default()
            },
            fetched_at: now,
            raw_data: None,
        }
    }

    #[tokio::test]
    async fn violation_views_split_by_class() {
        let store = RecordStore::in_memory().await.unwrap();
        store
            .upsert_many(&[
                violation("1", "C", 0),
                violation("2", "C", 2),
                violation("3", "B", 3),
                violation("4", "A", 9),
                violation("5", "B", 200),
            ])
            .await
            .unwrap();

        let weekly = violation_summary(&store, SummaryWindow::Period(PeriodType::Weekly))
            .await
            .unwrap();
        assert_eq!(weekly.period, "weekly");
        assert_eq!(
            (weekly.current.total, weekly.current.class_b, weekly.current.class_c),
            (3, 1, 2)
        );
        assert_eq!(weekly.previous_total, 1);
        assert_eq!(weekly.pct_change, 200.0);

        let trend = violation_trend(&store, &TrendRequest::default()).await.unwrap();
        assert_eq!(trend.len(), 4);
        assert_eq!(trend.iter().map(|d| d.counts.total).sum::<i64>(), 4);
        assert!(trend.windows(2).all(|w| w[0].date < w[1].date));

        let everything = violation_trend(
            &store,
            &TrendRequest {
                from: Some(Utc::now() - Duration::days(365)),
                ..TrendRequest::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(everything.iter().map(|d| d.counts.class_b).sum::<i64>(), 2);

        let owners = top_owners(&store, 5, None, None).await.unwrap();
        assert_eq!(owners[0].head_officer.as_deref(), Some("PAT LEE"));
        assert_eq!(owners[0].addresses, vec!["12 AVENUE C".to_string()]);
    }

    #[tokio::test]
    async fn topic_feed_interleaves_news_and_legislation_by_date() {
        let store = RecordStore::in_memory().await.unwrap();
        let at = |d: u32| Utc.with_ymd_and_hms(2026, 3, d, 12, 0, 0).single();
        let fetched_at = Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).single().unwrap();
        let article = |id: &str, day: u32, topic: bool| NewsArticle {
            id: id.into(),
            title: id.into(),
            summary: None,
            url: None,
            source: None,
            published_at: at(day),
            feed_name: "member_news".into(),
            is_topic_related: topic,
            is_district: !topic,
            is_hyperlocal: false,
            fetched_at,
        };
        store
            .upsert_many(&[article("a1", 1, true), article("a3", 3, true), article("d2", 2, false)])
            .await
            .unwrap();
        store
            .upsert_many(&[LegislationItem {
                id: "leg_9".into(),
                file_number: Some("Int 0009-2026".into()),
                name: None,
                title: None,
                matter_type: Some("Introduction".into()),
                status: None,
                intro_date: at(2),
                agenda_date: None,
                passed_date: None,
                enactment_date: None,
                url: None,
                sponsors: vec![],
                fetched_at,
            }])
            .await
            .unwrap();

        let feed = topic_feed(&store, 10).await.unwrap();
        let titles: Vec<_> = feed.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, ["a3", "Int 0009-2026", "a1"]);
        assert_eq!(feed[1].kind, FeedItemKind::Legislation);

        let district = district_news(&store, 10).await.unwrap();
        assert_eq!(district.len(), 1);
        assert_eq!(district[0].id, "d2");
    }
}
