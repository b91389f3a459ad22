//! Row mapping between canonical record types and their tables.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use civ_core::{
    AggregationBucket, Call911, Complaint311, Event, HpdComplaint, HpdViolation, LegislationItem,
    NewsArticle, OwnerContacts, ParseEnumError,
};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::store::SqlValue;

/// Idempotent schema, applied on every connect.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    event_type TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT,
    latitude REAL,
    longitude REAL,
    address TEXT,
    occurred_at TEXT NOT NULL,
    fetched_at TEXT NOT NULL,
    source_url TEXT,
    category TEXT,
    severity TEXT NOT NULL DEFAULT 'medium',
    raw_data TEXT
);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);
CREATE INDEX IF NOT EXISTS idx_events_occurred ON events(occurred_at);

CREATE TABLE IF NOT EXISTS complaints_311 (
    unique_key TEXT PRIMARY KEY,
    created_date TEXT NOT NULL,
    closed_date TEXT,
    agency TEXT,
    complaint_type TEXT,
    descriptor TEXT,
    location_type TEXT,
    incident_zip TEXT,
    address TEXT,
    city TEXT,
    status TEXT,
    resolution_description TEXT,
    latitude REAL,
    longitude REAL,
    fetched_at TEXT NOT NULL,
    raw_data TEXT
);
CREATE INDEX IF NOT EXISTS idx_311_created ON complaints_311(created_date);
CREATE INDEX IF NOT EXISTS idx_311_type ON complaints_311(complaint_type);

CREATE TABLE IF NOT EXISTS calls_911 (
    id TEXT PRIMARY KEY,
    incident_date TEXT,
    incident_time TEXT,
    call_type TEXT,
    borough TEXT,
    precinct TEXT,
    latitude REAL,
    longitude REAL,
    dispatch_ts TEXT,
    arrival_ts TEXT,
    closing_ts TEXT,
    fetched_at TEXT NOT NULL,
    raw_data TEXT
);
CREATE INDEX IF NOT EXISTS idx_911_date ON calls_911(incident_date);
CREATE INDEX IF NOT EXISTS idx_911_type ON calls_911(call_type);

CREATE TABLE IF NOT EXISTS hpd_violations (
    violation_id TEXT PRIMARY KEY,
    building_id TEXT,
    registration_id TEXT,
    borough TEXT,
    house_number TEXT,
    street_name TEXT,
    zip TEXT,
    apartment TEXT,
    story TEXT,
    block TEXT,
    lot TEXT,
    class TEXT,
    inspection_date TEXT,
    approved_date TEXT,
    nov_description TEXT,
    nov_issued_date TEXT,
    current_status TEXT,
    current_status_date TEXT,
    latitude REAL,
    longitude REAL,
    owner_name TEXT,
    owner_type TEXT,
    corporation_name TEXT,
    head_officer TEXT,
    officer TEXT,
    managing_agent TEXT,
    fetched_at TEXT NOT NULL,
    raw_data TEXT
);
CREATE INDEX IF NOT EXISTS idx_hpdv_inspection ON hpd_violations(inspection_date);
CREATE INDEX IF NOT EXISTS idx_hpdv_building ON hpd_violations(building_id);
CREATE INDEX IF NOT EXISTS idx_hpdv_owner ON hpd_violations(owner_name);

CREATE TABLE IF NOT EXISTS hpd_complaints (
    problem_id TEXT PRIMARY KEY,
    complaint_id TEXT,
    building_id TEXT,
    borough TEXT,
    house_number TEXT,
    street_name TEXT,
    zip TEXT,
    major_category TEXT,
    minor_category TEXT,
    complaint_status TEXT,
    complaint_status_date TEXT,
    problem_status TEXT,
    problem_status_date TEXT,
    status_description TEXT,
    latitude REAL,
    longitude REAL,
    received_date TEXT,
    fetched_at TEXT NOT NULL,
    raw_data TEXT
);
CREATE INDEX IF NOT EXISTS idx_hpdc_received ON hpd_complaints(received_date);
CREATE INDEX IF NOT EXISTS idx_hpdc_building ON hpd_complaints(building_id);

CREATE TABLE IF NOT EXISTS news_articles (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    summary TEXT,
    url TEXT,
    source TEXT,
    published_at TEXT,
    feed_name TEXT NOT NULL,
    is_topic_related INTEGER NOT NULL DEFAULT 0,
    is_district INTEGER NOT NULL DEFAULT 0,
    is_hyperlocal INTEGER NOT NULL DEFAULT 0,
    fetched_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_news_published ON news_articles(published_at);

CREATE TABLE IF NOT EXISTS legislation (
    id TEXT PRIMARY KEY,
    file_number TEXT,
    name TEXT,
    title TEXT,
    matter_type TEXT,
    status TEXT,
    intro_date TEXT,
    agenda_date TEXT,
    passed_date TEXT,
    enactment_date TEXT,
    url TEXT,
    sponsors TEXT,
    fetched_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_legislation_intro ON legislation(intro_date);

CREATE TABLE IF NOT EXISTS aggregations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    data_source TEXT NOT NULL,
    period_type TEXT NOT NULL,
    period_start TEXT NOT NULL,
    period_end TEXT NOT NULL,
    category TEXT NOT NULL,
    count INTEGER NOT NULL,
    computed_at TEXT NOT NULL,
    UNIQUE(data_source, period_type, period_start, category)
);
CREATE INDEX IF NOT EXISTS idx_agg_lookup ON aggregations(data_source, period_type, period_start);
"#;

/// A canonical type persisted as one row per natural key.
///
/// `values()` must yield one value per entry of `COLUMNS`, in order. Rows whose
/// `CONFLICT_KEY` columns are null or blank are dropped by the store.
pub trait Record: Sized + Send + Sync + Unpin {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];
    const CONFLICT_KEY: &'static [&'static str];

    fn values(&self) -> Vec<SqlValue>;

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error>;
}

fn text(value: &str) -> SqlValue {
    SqlValue::Text(Some(value.to_string()))
}

fn opt_text(value: &Option<String>) -> SqlValue {
    SqlValue::Text(value.clone())
}

fn real(value: Option<f64>) -> SqlValue {
    SqlValue::Real(value)
}

fn ts(value: DateTime<Utc>) -> SqlValue {
    SqlValue::Timestamp(Some(value))
}

fn opt_ts(value: Option<DateTime<Utc>>) -> SqlValue {
    SqlValue::Timestamp(value)
}

fn parse_column<T>(row: &SqliteRow, column: &str) -> Result<T, sqlx::Error>
where
    T: FromStr<Err = ParseEnumError>,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|err: ParseEnumError| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(err),
    })
}

impl Record for Event {
    const TABLE: &'static str = "events";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "event_type",
        "title",
        "description",
        "latitude",
        "longitude",
        "address",
        "occurred_at",
        "fetched_at",
        "source_url",
        "category",
        "severity",
        "raw_data",
    ];
    const CONFLICT_KEY: &'static [&'static str] = &["id"];

    fn values(&self) -> Vec<SqlValue> {
        vec![
            text(&self.id),
            text(self.event_type.as_str()),
            text(&self.title),
            opt_text(&self.description),
            real(self.latitude),
            real(self.longitude),
            opt_text(&self.address),
            ts(self.occurred_at),
            ts(self.fetched_at),
            opt_text(&self.source_url),
            opt_text(&self.category),
            text(self.severity.as_str()),
            opt_text(&self.raw_data),
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            event_type: parse_column(row, "event_type")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            address: row.try_get("address")?,
            occurred_at: row.try_get("occurred_at")?,
            fetched_at: row.try_get("fetched_at")?,
            source_url: row.try_get("source_url")?,
            category: row.try_get("category")?,
            severity: parse_column(row, "severity")?,
            raw_data: row.try_get("raw_data")?,
        })
    }
}

impl Record for Complaint311 {
    const TABLE: &'static str = "complaints_311";
    const COLUMNS: &'static [&'static str] = &[
        "unique_key",
        "created_date",
        "closed_date",
        "agency",
        "complaint_type",
        "descriptor",
        "location_type",
        "incident_zip",
        "address",
        "city",
        "status",
        "resolution_description",
        "latitude",
        "longitude",
        "fetched_at",
        "raw_data",
    ];
    const CONFLICT_KEY: &'static [&'static str] = &["unique_key"];

    fn values(&self) -> Vec<SqlValue> {
        vec![
            text(&self.unique_key),
            ts(self.created_date),
            opt_ts(self.closed_date),
            opt_text(&self.agency),
            opt_text(&self.complaint_type),
            opt_text(&self.descriptor),
            opt_text(&self.location_type),
            opt_text(&self.incident_zip),
            opt_text(&self.address),
            opt_text(&self.city),
            opt_text(&self.status),
            opt_text(&self.resolution_description),
            real(self.latitude),
            real(self.longitude),
            ts(self.fetched_at),
            opt_text(&self.raw_data),
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            unique_key: row.try_get("unique_key")?,
            created_date: row.try_get("created_date")?,
            closed_date: row.try_get("closed_date")?,
            agency: row.try_get("agency")?,
            complaint_type: row.try_get("complaint_type")?,
            descriptor: row.try_get("descriptor")?,
            location_type: row.try_get("location_type")?,
            incident_zip: row.try_get("incident_zip")?,
            address: row.try_get("address")?,
            city: row.try_get("city")?,
            status: row.try_get("status")?,
            resolution_description: row.try_get("resolution_description")?,
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            fetched_at: row.try_get("fetched_at")?,
            raw_data: row.try_get("raw_data")?,
        })
    }
}

impl Record for Call911 {
    const TABLE: &'static str = "calls_911";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "incident_date",
        "incident_time",
        "call_type",
        "borough",
        "precinct",
        "latitude",
        "longitude",
        "dispatch_ts",
        "arrival_ts",
        "closing_ts",
        "fetched_at",
        "raw_data",
    ];
    const CONFLICT_KEY: &'static [&'static str] = &["id"];

    fn values(&self) -> Vec<SqlValue> {
        vec![
            text(&self.id),
            opt_ts(self.incident_date),
            opt_text(&self.incident_time),
            opt_text(&self.call_type),
            opt_text(&self.borough),
            opt_text(&self.precinct),
            real(self.latitude),
            real(self.longitude),
            opt_ts(self.dispatch_ts),
            opt_ts(self.arrival_ts),
            opt_ts(self.closing_ts),
            ts(self.fetched_at),
            opt_text(&self.raw_data),
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            incident_date: row.try_get("incident_date")?,
            incident_time: row.try_get("incident_time")?,
            call_type: row.try_get("call_type")?,
            borough: row.try_get("borough")?,
            precinct: row.try_get("precinct")?,
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            dispatch_ts: row.try_get("dispatch_ts")?,
            arrival_ts: row.try_get("arrival_ts")?,
            closing_ts: row.try_get("closing_ts")?,
            fetched_at: row.try_get("fetched_at")?,
            raw_data: row.try_get("raw_data")?,
        })
    }
}

impl Record for HpdViolation {
    const TABLE: &'static str = "hpd_violations";
    const COLUMNS: &'static [&'static str] = &[
        "violation_id",
        "building_id",
        "registration_id",
        "borough",
        "house_number",
        "street_name",
        "zip",
        "apartment",
        "story",
        "block",
        "lot",
        "class",
        "inspection_date",
        "approved_date",
        "nov_description",
        "nov_issued_date",
        "current_status",
        "current_status_date",
        "latitude",
        "longitude",
        "owner_name",
        "owner_type",
        "corporation_name",
        "head_officer",
        "officer",
        "managing_agent",
        "fetched_at",
        "raw_data",
    ];
    const CONFLICT_KEY: &'static [&'static str] = &["violation_id"];

    fn values(&self) -> Vec<SqlValue> {
        vec![
            text(&self.violation_id),
            opt_text(&self.building_id),
            opt_text(&self.registration_id),
            opt_text(&self.borough),
            opt_text(&self.house_number),
            opt_text(&self.street_name),
            opt_text(&self.zip),
            opt_text(&self.apartment),
            opt_text(&self.story),
            opt_text(&self.block),
            opt_text(&self.lot),
            opt_text(&self.class),
            opt_ts(self.inspection_date),
            opt_ts(self.approved_date),
            opt_text(&self.nov_description),
            opt_ts(self.nov_issued_date),
            opt_text(&self.current_status),
            opt_ts(self.current_status_date),
            real(self.latitude),
            real(self.longitude),
            opt_text(&self.owner.owner_name),
            opt_text(&self.owner.owner_type),
            opt_text(&self.owner.corporation_name),
            opt_text(&self.owner.head_officer),
            opt_text(&self.owner.officer),
            opt_text(&self.owner.managing_agent),
            ts(self.fetched_at),
            opt_text(&self.raw_data),
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            violation_id: row.try_get("violation_id")?,
            building_id: row.try_get("building_id")?,
            registration_id: row.try_get("registration_id")?,
            borough: row.try_get("borough")?,
            house_number: row.try_get("house_number")?,
            street_name: row.try_get("street_name")?,
            zip: row.try_get("zip")?,
            apartment: row.try_get("apartment")?,
            story: row.try_get("story")?,
            block: row.try_get("block")?,
            lot: row.try_get("lot")?,
            class: row.try_get("class")?,
            inspection_date: row.try_get("inspection_date")?,
            approved_date: row.try_get("approved_date")?,
            nov_description: row.try_get("nov_description")?,
            nov_issued_date: row.try_get("nov_issued_date")?,
            current_status: row.try_get("current_status")?,
            current_status_date: row.try_get("current_status_date")?,
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            owner: OwnerContacts {
                owner_name: row.try_get("owner_name")?,
                owner_type: row.try_get("owner_type")?,
                corporation_name: row.try_get("corporation_name")?,
                head_officer: row.try_get("head_officer")?,
                officer: row.try_get("officer")?,
                managing_agent: row.try_get("managing_agent")?,
            },
            fetched_at: row.try_get("fetched_at")?,
            raw_data: row.try_get("raw_data")?,
        })
    }
}

impl Record for HpdComplaint {
    const TABLE: &'static str = "hpd_complaints";
    const COLUMNS: &'static [&'static str] = &[
        "problem_id",
        "complaint_id",
        "building_id",
        "borough",
        "house_number",
        "street_name",
        "zip",
        "major_category",
        "minor_category",
        "complaint_status",
        "complaint_status_date",
        "problem_status",
        "problem_status_date",
        "status_description",
        "latitude",
        "longitude",
        "received_date",
        "fetched_at",
        "raw_data",
    ];
    const CONFLICT_KEY: &'static [&'static str] = &["problem_id"];

    fn values(&self) -> Vec<SqlValue> {
        vec![
            text(&self.problem_id),
            opt_text(&self.complaint_id),
            opt_text(&self.building_id),
            opt_text(&self.borough),
            opt_text(&self.house_number),
            opt_text(&self.street_name),
            opt_text(&self.zip),
            opt_text(&self.major_category),
            opt_text(&self.minor_category),
            opt_text(&self.complaint_status),
            opt_ts(self.complaint_status_date),
            opt_text(&self.problem_status),
            opt_ts(self.problem_status_date),
            opt_text(&self.status_description),
            real(self.latitude),
            real(self.longitude),
            opt_ts(self.received_date),
            ts(self.fetched_at),
            opt_text(&self.raw_data),
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            problem_id: row.try_get("problem_id")?,
            complaint_id: row.try_get("complaint_id")?,
            building_id: row.try_get("building_id")?,
            borough: row.try_get("borough")?,
            house_number: row.try_get("house_number")?,
            street_name: row.try_get("street_name")?,
            zip: row.try_get("zip")?,
            major_category: row.try_get("major_category")?,
            minor_category: row.try_get("minor_category")?,
            complaint_status: row.try_get("complaint_status")?,
            complaint_status_date: row.try_get("complaint_status_date")?,
            problem_status: row.try_get("problem_status")?,
            problem_status_date: row.try_get("problem_status_date")?,
            status_description: row.try_get("status_description")?,
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            received_date: row.try_get("received_date")?,
            fetched_at: row.try_get("fetched_at")?,
            raw_data: row.try_get("raw_data")?,
        })
    }
}

impl Record for NewsArticle {
    const TABLE: &'static str = "news_articles";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "title",
        "summary",
        "url",
        "source",
        "published_at",
        "feed_name",
        "is_topic_related",
        "is_district",
        "is_hyperlocal",
        "fetched_at",
    ];
    const CONFLICT_KEY: &'static [&'static str] = &["id"];

    fn values(&self) -> Vec<SqlValue> {
        vec![
            text(&self.id),
            text(&self.title),
            opt_text(&self.summary),
            opt_text(&self.url),
            opt_text(&self.source),
            opt_ts(self.published_at),
            text(&self.feed_name),
            SqlValue::Bool(Some(self.is_topic_related)),
            SqlValue::Bool(Some(self.is_district)),
            SqlValue::Bool(Some(self.is_hyperlocal)),
            ts(self.fetched_at),
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            summary: row.try_get("summary")?,
            url: row.try_get("url")?,
            source: row.try_get("source")?,
            published_at: row.try_get("published_at")?,
            feed_name: row.try_get("feed_name")?,
            is_topic_related: row.try_get("is_topic_related")?,
            is_district: row.try_get("is_district")?,
            is_hyperlocal: row.try_get("is_hyperlocal")?,
            fetched_at: row.try_get("fetched_at")?,
        })
    }
}

impl Record for LegislationItem {
    const TABLE: &'static str = "legislation";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "file_number",
        "name",
        "title",
        "matter_type",
        "status",
        "intro_date",
        "agenda_date",
        "passed_date",
        "enactment_date",
        "url",
        "sponsors",
        "fetched_at",
    ];
    const CONFLICT_KEY: &'static [&'static str] = &["id"];

    fn values(&self) -> Vec<SqlValue> {
        let sponsors = serde_json::to_string(&self.sponsors).ok();
        vec![
            text(&self.id),
            opt_text(&self.file_number),
            opt_text(&self.name),
            opt_text(&self.title),
            opt_text(&self.matter_type),
            opt_text(&self.status),
            opt_ts(self.intro_date),
            opt_ts(self.agenda_date),
            opt_ts(self.passed_date),
            opt_ts(self.enactment_date),
            opt_text(&self.url),
            SqlValue::Text(sponsors),
            ts(self.fetched_at),
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let sponsors: Option<String> = row.try_get("sponsors")?;
        Ok(Self {
            id: row.try_get("id")?,
            file_number: row.try_get("file_number")?,
            name: row.try_get("name")?,
            title: row.try_get("title")?,
            matter_type: row.try_get("matter_type")?,
            status: row.try_get("status")?,
            intro_date: row.try_get("intro_date")?,
            agenda_date: row.try_get("agenda_date")?,
            passed_date: row.try_get("passed_date")?,
            enactment_date: row.try_get("enactment_date")?,
            url: row.try_get("url")?,
            sponsors: match sponsors {
                Some(raw) => serde_json::from_str(&raw).map_err(|err| sqlx::Error::ColumnDecode {
                    index: "sponsors".to_string(),
                    source: Box::new(err),
                })?,
                None => Vec::new(),
            },
            fetched_at: row.try_get("fetched_at")?,
        })
    }
}

impl Record for AggregationBucket {
    const TABLE: &'static str = "aggregations";
    const COLUMNS: &'static [&'static str] = &[
        "data_source",
        "period_type",
        "period_start",
        "period_end",
        "category",
        "count",
        "computed_at",
    ];
    const CONFLICT_KEY: &'static [&'static str] =
        &["data_source", "period_type", "period_start", "category"];

    fn values(&self) -> Vec<SqlValue> {
        vec![
            text(&self.data_source),
            text(self.period_type.as_str()),
            SqlValue::Date(Some(self.period_start)),
            SqlValue::Date(Some(self.period_end)),
            text(&self.category),
            SqlValue::Int(Some(self.count)),
            ts(self.computed_at),
        ]
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            data_source: row.try_get("data_source")?,
            period_type: parse_column(row, "period_type")?,
            period_start: date_column(row, "period_start")?,
            period_end: date_column(row, "period_end")?,
            category: row.try_get("category")?,
            count: row.try_get("count")?,
            computed_at: row.try_get("computed_at")?,
        })
    }
}

fn date_column(row: &SqliteRow, column: &str) -> Result<NaiveDate, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|err| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(err),
    })
}
