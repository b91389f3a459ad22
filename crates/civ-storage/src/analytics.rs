//! Grouped counts over the primary tables, used by rollups and read-side queries.

use chrono::{DateTime, NaiveDate, Utc};
use civ_core::{
    parse_timestamp, whole_seconds, AggregationBucket, DataSource, PeriodType,
    UNSPECIFIED_CATEGORY,
};
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite};

use crate::records::Record;
use crate::store::{upsert_rows, RecordStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryCount {
    pub category: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub count: i64,
}

/// Landlord ranking row over open (non-dismissed) violations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnerRanking {
    pub owner_name: String,
    pub owner_type: Option<String>,
    pub corporation_name: Option<String>,
    pub head_officer: Option<String>,
    pub officer: Option<String>,
    pub managing_agent: Option<String>,
    pub total_violations: i64,
    pub class_a: i64,
    pub class_b: i64,
    pub class_c: i64,
    pub buildings: i64,
    /// Distinct `house_number street_name` pairs, sorted.
    pub addresses: Vec<String>,
}

#[derive(sqlx::FromRow)]
struct OwnerRankingRow {
    owner_name: String,
    owner_type: Option<String>,
    corporation_name: Option<String>,
    head_officer: Option<String>,
    officer: Option<String>,
    managing_agent: Option<String>,
    total: i64,
    class_a: i64,
    class_b: i64,
    class_c: i64,
    buildings: i64,
    addresses: Option<String>,
}

impl From<OwnerRankingRow> for OwnerRanking {
    fn from(row: OwnerRankingRow) -> Self {
        let mut addresses: Vec<String> = row
            .addresses
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect();
        addresses.sort();
        addresses.dedup();
        Self {
            owner_name: row.owner_name,
            owner_type: row.owner_type,
            corporation_name: row.corporation_name,
            head_officer: row.head_officer,
            officer: row.officer,
            managing_agent: row.managing_agent,
            total_violations: row.total,
            class_a: row.class_a,
            class_b: row.class_b,
            class_c: row.class_c,
            buildings: row.buildings,
            addresses,
        }
    }
}

/// Violation counts split by HPD class (A non-hazardous, B hazardous,
/// C immediately hazardous).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct ClassCounts {
    pub total: i64,
    pub class_a: i64,
    pub class_b: i64,
    pub class_c: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyClassCounts {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub counts: ClassCounts,
}

const CLASS_COLUMNS: &str = "COUNT(*) AS total, \
     COALESCE(SUM(CASE WHEN class = 'A' THEN 1 ELSE 0 END), 0) AS class_a, \
     COALESCE(SUM(CASE WHEN class = 'B' THEN 1 ELSE 0 END), 0) AS class_b, \
     COALESCE(SUM(CASE WHEN class = 'C' THEN 1 ELSE 0 END), 0) AS class_c";

fn category_expr(source: DataSource) -> String {
    format!(
        "COALESCE(NULLIF(TRIM({}), ''), '{}')",
        source.category_column(),
        UNSPECIFIED_CATEGORY
    )
}

/// Deletes buckets of one period whose category is not in `keep`.
fn prune_query(
    data_source: &str,
    period_type: PeriodType,
    period_start: NaiveDate,
    keep: Vec<String>,
) -> QueryBuilder<'static, Sqlite> {
    let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM aggregations WHERE data_source = ");
    builder.push_bind(data_source.to_string());
    builder
        .push(" AND period_type = ")
        .push_bind(period_type.as_str());
    builder.push(" AND period_start = ").push_bind(period_start);
    if !keep.is_empty() {
        builder.push(" AND category NOT IN (");
        let mut separated = builder.separated(", ");
        for category in keep {
            separated.push_bind(category);
        }
        separated.push_unseparated(")");
    }
    builder
}

/// Appends inclusive inspection-date bounds to a query that already has a WHERE clause.
fn push_inspection_range(
    builder: &mut QueryBuilder<'_, Sqlite>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) {
    if let Some(from) = from {
        builder
            .push(" AND inspection_date >= ")
            .push_bind(whole_seconds(from));
    }
    if let Some(to) = to {
        builder
            .push(" AND inspection_date <= ")
            .push_bind(whole_seconds(to));
    }
}

fn parse_day(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

impl RecordStore {
    /// Rows of `source` dated within `[from, to)`.
    pub async fn count_between(
        &self,
        source: DataSource,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let date = source.date_column();
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {date} >= ? AND {date} < ?",
            source.table()
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(whole_seconds(from))
            .bind(whole_seconds(to))
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }

    /// Per-category counts within `[from, to)`, largest first.
    pub async fn category_counts(
        &self,
        source: DataSource,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<CategoryCount>, StoreError> {
        let date = source.date_column();
        let sql = format!(
            "SELECT {} AS category, COUNT(*) AS n FROM {} \
             WHERE {date} >= ? AND {date} < ? \
             GROUP BY category ORDER BY n DESC, category ASC LIMIT ?",
            category_expr(source),
            source.table()
        );
        let rows: Vec<(String, i64)> = sqlx::query_as(&sql)
            .bind(whole_seconds(from))
            .bind(whole_seconds(to))
            .bind(limit)
            .fetch_all(self.pool())
            .await?;
        Ok(rows
            .into_iter()
            .map(|(category, count)| CategoryCount { category, count })
            .collect())
    }

    /// Per-day counts within `[from, to)`, optionally for one category, oldest first.
    pub async fn daily_counts(
        &self,
        source: DataSource,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        category: Option<&str>,
    ) -> Result<Vec<DailyCount>, StoreError> {
        let date = source.date_column();
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT date({date}) AS day, COUNT(*) AS n FROM {} WHERE {date} >= ",
            source.table()
        ));
        builder.push_bind(whole_seconds(from));
        builder.push(format!(" AND {date} < ")).push_bind(whole_seconds(to));
        if let Some(category) = category {
            builder
                .push(format!(" AND {} = ", category_expr(source)))
                .push_bind(category.to_string());
        }
        builder.push(" GROUP BY day ORDER BY day ASC");

        let rows: Vec<(Option<String>, i64)> =
            builder.build_query_as().fetch_all(self.pool()).await?;
        Ok(rows
            .into_iter()
            .filter_map(|(day, count)| {
                day.as_deref()
                    .and_then(parse_day)
                    .map(|date| DailyCount { date, count })
            })
            .collect())
    }

    /// Per-day, per-category counts within `[from, to)`.
    pub async fn daily_category_counts(
        &self,
        source: DataSource,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<(NaiveDate, String, i64)>, StoreError> {
        let date = source.date_column();
        let sql = format!(
            "SELECT date({date}) AS day, {} AS category, COUNT(*) AS n FROM {} \
             WHERE {date} >= ? AND {date} < ? \
             GROUP BY day, category ORDER BY day ASC, category ASC",
            category_expr(source),
            source.table()
        );
        let rows: Vec<(Option<String>, String, i64)> = sqlx::query_as(&sql)
            .bind(whole_seconds(from))
            .bind(whole_seconds(to))
            .fetch_all(self.pool())
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(day, category, count)| {
                day.as_deref()
                    .and_then(parse_day)
                    .map(|day| (day, category, count))
            })
            .collect())
    }

    /// Newest record timestamp of `source`, if any rows are dated.
    pub async fn latest_timestamp(
        &self,
        source: DataSource,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let sql = format!(
            "SELECT MAX({}) FROM {}",
            source.date_column(),
            source.table()
        );
        let latest: Option<String> = sqlx::query_scalar(&sql).fetch_one(self.pool()).await?;
        Ok(latest.as_deref().and_then(parse_timestamp))
    }

    /// Writes freshly computed buckets and deletes every other category of
    /// the periods starting at `period_starts`, in one transaction. Returns
    /// `(written, pruned)`.
    pub async fn replace_buckets(
        &self,
        data_source: &str,
        period_type: PeriodType,
        period_starts: &[NaiveDate],
        buckets: &[AggregationBucket],
    ) -> Result<(usize, u64), StoreError> {
        let lock = self.table_lock(AggregationBucket::TABLE).await;
        let _guard = lock.lock().await;

        let write_err = |source| StoreError::Write {
            table: AggregationBucket::TABLE,
            source,
        };
        let mut tx = self.pool().begin().await.map_err(write_err)?;
        let written = upsert_rows(&mut *tx, buckets).await.map_err(write_err)?;

        let mut pruned = 0;
        for &start in period_starts {
            let keep: Vec<String> = buckets
                .iter()
                .filter(|b| {
                    b.data_source == data_source
                        && b.period_type == period_type
                        && b.period_start == start
                })
                .map(|b| b.category.clone())
                .collect();
            pruned += prune_query(data_source, period_type, start, keep)
                .build()
                .execute(&mut *tx)
                .await
                .map_err(write_err)?
                .rows_affected();
        }

        tx.commit().await.map_err(write_err)?;
        Ok((written, pruned))
    }

    /// Owners ranked by open violations, optionally bounded by inspection date.
    pub async fn owner_rankings(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<OwnerRanking>, StoreError> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT owner_name, MAX(owner_type) AS owner_type, \
             MAX(corporation_name) AS corporation_name, MAX(head_officer) AS head_officer, \
             MAX(officer) AS officer, MAX(managing_agent) AS managing_agent, {CLASS_COLUMNS}, \
             COUNT(DISTINCT building_id) AS buildings, \
             GROUP_CONCAT(DISTINCT house_number || ' ' || street_name) AS addresses \
             FROM hpd_violations \
             WHERE owner_name IS NOT NULL \
             AND COALESCE(current_status, '') <> 'VIOLATION DISMISSED'"
        ));
        push_inspection_range(&mut builder, from, to);
        builder
            .push(" GROUP BY owner_name ORDER BY total DESC, owner_name ASC LIMIT ")
            .push_bind(limit);

        let rows: Vec<OwnerRankingRow> = builder.build_query_as().fetch_all(self.pool()).await?;
        Ok(rows.into_iter().map(OwnerRanking::from).collect())
    }

    /// Violations inspected within the optional bounds, split by class.
    pub async fn violation_class_totals(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<ClassCounts, StoreError> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {CLASS_COLUMNS} FROM hpd_violations WHERE inspection_date IS NOT NULL"
        ));
        push_inspection_range(&mut builder, from, to);
        let counts: ClassCounts = builder.build_query_as().fetch_one(self.pool()).await?;
        Ok(counts)
    }

    /// Per-day violation counts split by class, oldest first.
    pub async fn violation_class_daily(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<DailyClassCounts>, StoreError> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT date(inspection_date) AS day, {CLASS_COLUMNS} \
             FROM hpd_violations WHERE inspection_date IS NOT NULL"
        ));
        push_inspection_range(&mut builder, from, to);
        builder.push(" GROUP BY day ORDER BY day ASC");

        let rows: Vec<(Option<String>, i64, i64, i64, i64)> =
            builder.build_query_as().fetch_all(self.pool()).await?;
        Ok(rows
            .into_iter()
            .filter_map(|(day, total, class_a, class_b, class_c)| {
                let date = day.as_deref().and_then(parse_day)?;
                Some(DailyClassCounts {
                    date,
                    counts: ClassCounts {
                        total,
                        class_a,
                        class_b,
                        class_c,
                    },
                })
            })
            .collect())
    }

    /// Row count of every table, for status reporting.
    pub async fn table_counts(&self) -> Result<Vec<(&'static str, i64)>, StoreError> {
        let mut counts = Vec::new();
        for table in [
            "events",
            "complaints_311",
            "calls_911",
            "hpd_violations",
            "hpd_complaints",
            "news_articles",
            "legislation",
            "aggregations",
        ] {
            counts.push((table, self.count(table).await?));
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Duration, TimeZone};
    use civ_core::{Complaint311, HpdViolation, OwnerContacts};

    use crate::store::Select;

    fn complaint(key: &str, day: u32, hour: u32, kind: Option<&str>) -> Complaint311 {
        let created = Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).single().unwrap();
        Complaint311 {
            unique_key: key.into(),
            created_date: created,
            closed_date: None,
            agency: Some("NYPD".into()),
            complaint_type: kind.map(String::from),
            descriptor: None,
            location_type: None,
            incident_zip: Some("10009".into()),
            address: None,
            city: None,
            status: Some("Open".into()),
            resolution_description: None,
            latitude: None,
            longitude: None,
            fetched_at: created,
            raw_data: None,
        }
    }

    fn violation(id: &str, owner: Option<&str>, class: &str, building: &str, status: &str) -> HpdViolation {
        let inspected = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().unwrap();
        HpdViolation {
            violation_id: id.into(),
            building_id: Some(building.into()),
            registration_id: None,
            borough: Some("MANHATTAN".into()),
            house_number: Some(building.trim_start_matches('b').into()),
            street_name: Some("AVENUE B".into()),
            zip: Some("10009".into()),
            apartment: None,
            story: None,
            block: None,
            lot: None,
            class: Some(class.into()),
            inspection_date: Some(inspected),
            approved_date: None,
            nov_description: None,
            nov_issued_date: None,
            current_status: Some(status.into()),
            current_status_date: None,
            latitude: None,
            longitude: None,
            owner: OwnerContacts {
                owner_name: owner.map(String::from),
                ..OwnerContacts::default()
            },
            fetched_at: inspected,
            raw_data: None,
        }
    }

    #[tokio::test]
    async fn grouped_counts_bucket_missing_categories() {
        let store = RecordStore::in_memory().await.expect("store");
        store
            .upsert_many(&[
                complaint("1", 3, 10, Some("Noise")),
                complaint("2", 3, 23, Some("Noise")),
                complaint("3", 4, 1, None),
                complaint("4", 4, 2, Some("Heat")),
                complaint("5", 9, 2, Some("Heat")),
            ])
            .await
            .expect("upsert");

        let from = Utc.with_ymd_and_hms(2026, 3, 3, 0, 0, 0).single().unwrap();
        let to = from + Duration::days(2);

        assert_eq!(
            store.count_between(DataSource::Complaints311, from, to).await.expect("count"),
            4
        );

        let categories = store
            .category_counts(DataSource::Complaints311, from, to, 10)
            .await
            .expect("categories");
        assert_eq!(
            categories,
            vec![
                CategoryCount { category: "Noise".into(), count: 2 },
                CategoryCount { category: "Heat".into(), count: 1 },
                CategoryCount { category: UNSPECIFIED_CATEGORY.into(), count: 1 },
            ]
        );

        let daily = store
            .daily_counts(DataSource::Complaints311, from, to, None)
            .await
            .expect("daily");
        assert_eq!(
            daily,
            vec![
                DailyCount { date: NaiveDate::from_ymd_opt(2026, 3, 3).unwrap(), count: 2 },
                DailyCount { date: NaiveDate::from_ymd_opt(2026, 3, 4).unwrap(), count: 2 },
            ]
        );

        let heat_only = store
            .daily_counts(DataSource::Complaints311, from, to, Some("Heat"))
            .await
            .expect("daily heat");
        assert_eq!(heat_only.len(), 1);

        let latest = store
            .latest_timestamp(DataSource::Complaints311)
            .await
            .expect("latest");
        assert_eq!(latest, Utc.with_ymd_and_hms(2026, 3, 9, 2, 0, 0).single());
    }

    fn bucket(day: NaiveDate, category: &str, count: i64) -> AggregationBucket {
        AggregationBucket {
            data_source: "311".into(),
            period_type: PeriodType::Daily,
            period_start: day,
            period_end: day + Duration::days(1),
            category: category.into(),
            count,
            computed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn replacing_buckets_prunes_only_stale_categories() {
        let store = RecordStore::in_memory().await.expect("store");
        let day = NaiveDate::from_ymd_opt(2026, 3, 4).unwrap();
        let other_day = day + Duration::days(1);
        store
            .upsert_many(&[bucket(day, "Noise", 1), bucket(day, "Heat", 1), bucket(other_day, "Heat", 4)])
            .await
            .expect("upsert");

        let (written, pruned) = store
            .replace_buckets("311", PeriodType::Daily, &[day], &[bucket(day, "Noise", 6)])
            .await
            .expect("replace");
        assert_eq!((written, pruned), (1, 1));

        let left: Vec<AggregationBucket> = store
            .select(&Select::new().order_by("period_start", crate::store::Order::Asc))
            .await
            .expect("select");
        let rows: Vec<_> = left
            .iter()
            .map(|b| (b.period_start, b.category.as_str(), b.count))
            .collect();
        assert_eq!(rows, [(day, "Noise", 6), (other_day, "Heat", 4)]);

        // A period with no fresh buckets is emptied.
        let (_, pruned) = store
            .replace_buckets("311", PeriodType::Daily, &[other_day], &[])
            .await
            .expect("replace empty");
        assert_eq!(pruned, 1);
    }

    #[tokio::test]
    async fn failed_prune_rolls_back_the_fresh_buckets() {
        let store = RecordStore::in_memory().await.expect("store");
        let day = NaiveDate::from_ymd_opt(2026, 3, 4).unwrap();
        store
            .upsert_many(&[bucket(day, "Heat", 2)])
            .await
            .expect("upsert");
        sqlx::query(
            "CREATE TRIGGER block_prune BEFORE DELETE ON aggregations \
             BEGIN SELECT RAISE(ABORT, 'prune blocked'); END",
        )
        .execute(store.pool())
        .await
        .expect("trigger");

        let err = store
            .replace_buckets("311", PeriodType::Daily, &[day], &[bucket(day, "Noise", 5)])
            .await
            .expect_err("prune must fail");
        assert!(matches!(err, StoreError::Write { table: "aggregations", .. }));

        let left: Vec<AggregationBucket> = store.select(&Select::new()).await.expect("select");
        assert_eq!(left.len(), 1);
        assert_eq!((left[0].category.as_str(), left[0].count), ("Heat", 2));
    }

    #[tokio::test]
    async fn owner_rankings_skip_dismissed_and_unowned() {
        let store = RecordStore::in_memory().await.expect("store");
        let mut officered = violation("1", Some("ACME LLC"), "C", "b1", "OPEN");
        officered.owner.head_officer = Some("JOHN ROE".into());
        officered.owner.officer = Some("MARY POE".into());
        store
            .upsert_many(&[
                officered,
                violation("2", Some("ACME LLC"), "B", "b2", "OPEN"),
                violation("6", Some("ACME LLC"), "B", "b2", "OPEN"),
                violation("3", Some("ACME LLC"), "A", "b7", "VIOLATION DISMISSED"),
                violation("4", Some("JANE DOE"), "A", "b3", "OPEN"),
                violation("5", None, "C", "b4", "OPEN"),
            ])
            .await
            .expect("upsert");

        let ranked = store.owner_rankings(None, None, 10).await.expect("rank");
        assert_eq!(ranked.len(), 2);
        let acme = &ranked[0];
        assert_eq!(acme.owner_name, "ACME LLC");
        assert_eq!(acme.total_violations, 3);
        assert_eq!((acme.class_a, acme.class_b, acme.class_c), (0, 2, 1));
        assert_eq!(acme.buildings, 2);
        assert_eq!(acme.head_officer.as_deref(), Some("JOHN ROE"));
        assert_eq!(acme.officer.as_deref(), Some("MARY POE"));
        assert_eq!(acme.addresses, vec!["1 AVENUE B".to_string(), "2 AVENUE B".to_string()]);
        assert_eq!(ranked[1].owner_name, "JANE DOE");
        assert_eq!(ranked[1].head_officer, None);
        assert_eq!(ranked[1].addresses, vec!["3 AVENUE B".to_string()]);
    }

    #[tokio::test]
    async fn violations_split_by_class_per_day() {
        let store = RecordStore::in_memory().await.expect("store");
        let on = |mut v: HpdViolation, day: u32| {
            v.inspection_date = Utc.with_ymd_and_hms(2026, 3, day, 9, 0, 0).single();
            v
        };
        let mut undated = violation("9", Some("ACME LLC"), "C", "b1", "OPEN");
        undated.inspection_date = None;
        store
            .upsert_many(&[
                on(violation("1", Some("ACME LLC"), "C", "b1", "OPEN"), 2),
                on(violation("2", Some("ACME LLC"), "B", "b1", "OPEN"), 2),
                on(violation("3", None, "C", "b2", "VIOLATION DISMISSED"), 2),
                on(violation("4", Some("JANE DOE"), "A", "b3", "OPEN"), 5),
                on(violation("5", Some("JANE DOE"), "I", "b3", "OPEN"), 9),
                undated,
            ])
            .await
            .expect("upsert");

        let from = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single();
        let to = Utc.with_ymd_and_hms(2026, 3, 6, 0, 0, 0).single();
        let daily = store.violation_class_daily(from, to).await.expect("daily");
        let rows: Vec<_> = daily
            .iter()
            .map(|d| (d.date.day(), d.counts.total, d.counts.class_a, d.counts.class_b, d.counts.class_c))
            .collect();
        assert_eq!(rows, [(2, 3, 0, 1, 2), (5, 1, 1, 0, 0)]);

        let totals = store.violation_class_totals(None, None).await.expect("totals");
        assert_eq!(
            totals,
            ClassCounts {
                total: 5,
                class_a: 1,
                class_b: 1,
                class_c: 2,
            }
        );

        let empty = RecordStore::in_memory().await.expect("store");
        assert_eq!(
            empty.violation_class_totals(None, None).await.expect("empty"),
            ClassCounts::default()
        );
    }
}
