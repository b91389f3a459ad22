//! Canonical civic record types, natural-key derivation, and classification rules.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod scope;

pub use scope::{BoundingBox, DistrictScope, FeedConfig, JobSchedule, ScopeConfig, SocrataConfig};

/// Category label stored for rollup buckets whose upstream category is missing.
pub const UNSPECIFIED_CATEGORY: &str = "Unspecified";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "fire")]
    Fire,
    #[serde(rename = "crime")]
    Crime,
    #[serde(rename = "311")]
    Complaint311,
    #[serde(rename = "alert")]
    Alert,
    #[serde(rename = "building_complaint")]
    BuildingComplaint,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        EventType::Fire,
        EventType::Crime,
        EventType::Complaint311,
        EventType::Alert,
        EventType::BuildingComplaint,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Fire => "fire",
            EventType::Crime => "crime",
            EventType::Complaint311 => "311",
            EventType::Alert => "alert",
            EventType::BuildingComplaint => "building_complaint",
        }
    }
}

impl FromStr for EventType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseEnumError {
                kind: "event type",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(ParseEnumError {
                kind: "severity",
                value: s.to_string(),
            }),
        }
    }
}

/// Point-in-time incident shown on the event map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub event_type: EventType,
    pub title: String,
    pub description: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub address: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub source_url: Option<String>,
    pub category: Option<String>,
    pub severity: Severity,
    pub raw_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Complaint311 {
    pub unique_key: String,
    pub created_date: DateTime<Utc>,
    pub closed_date: Option<DateTime<Utc>>,
    pub agency: Option<String>,
    pub complaint_type: Option<String>,
    pub descriptor: Option<String>,
    pub location_type: Option<String>,
    pub incident_zip: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub status: Option<String>,
    pub resolution_description: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub fetched_at: DateTime<Utc>,
    pub raw_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call911 {
    pub id: String,
    pub incident_date: Option<DateTime<Utc>>,
    pub incident_time: Option<String>,
    pub call_type: Option<String>,
    pub borough: Option<String>,
    pub precinct: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub dispatch_ts: Option<DateTime<Utc>>,
    pub arrival_ts: Option<DateTime<Utc>>,
    pub closing_ts: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    pub raw_data: Option<String>,
}

/// Registered-owner attributes resolved from building registration contacts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerContacts {
    pub owner_name: Option<String>,
    pub owner_type: Option<String>,
    pub corporation_name: Option<String>,
    pub head_officer: Option<String>,
    pub officer: Option<String>,
    pub managing_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HpdViolation {
    pub violation_id: String,
    pub building_id: Option<String>,
    pub registration_id: Option<String>,
    pub borough: Option<String>,
    pub house_number: Option<String>,
    pub street_name: Option<String>,
    pub zip: Option<String>,
    pub apartment: Option<String>,
    pub story: Option<String>,
    pub block: Option<String>,
    pub lot: Option<String>,
    /// Hazard class code: A, B, C (or I for informational orders).
    pub class: Option<String>,
    pub inspection_date: Option<DateTime<Utc>>,
    pub approved_date: Option<DateTime<Utc>>,
    pub nov_description: Option<String>,
    pub nov_issued_date: Option<DateTime<Utc>>,
    pub current_status: Option<String>,
    pub current_status_date: Option<DateTime<Utc>>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub owner: OwnerContacts,
    pub fetched_at: DateTime<Utc>,
    pub raw_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HpdComplaint {
    pub problem_id: String,
    pub complaint_id: Option<String>,
    pub building_id: Option<String>,
    pub borough: Option<String>,
    pub house_number: Option<String>,
    pub street_name: Option<String>,
    pub zip: Option<String>,
    pub major_category: Option<String>,
    pub minor_category: Option<String>,
    pub complaint_status: Option<String>,
    pub complaint_status_date: Option<DateTime<Utc>>,
    pub problem_status: Option<String>,
    pub problem_status_date: Option<DateTime<Utc>>,
    pub status_description: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub received_date: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    pub raw_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsArticle {
    pub id: String,
    pub title: String,
    pub summary: Option<String>,
    pub url: Option<String>,
    pub source: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub feed_name: String,
    pub is_topic_related: bool,
    pub is_district: bool,
    pub is_hyperlocal: bool,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegislationItem {
    pub id: String,
    pub file_number: Option<String>,
    pub name: Option<String>,
    pub title: Option<String>,
    pub matter_type: Option<String>,
    pub status: Option<String>,
    pub intro_date: Option<DateTime<Utc>>,
    pub agenda_date: Option<DateTime<Utc>>,
    pub passed_date: Option<DateTime<Utc>>,
    pub enactment_date: Option<DateTime<Utc>>,
    pub url: Option<String>,
    pub sponsors: Vec<String>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodType {
    Daily,
    Weekly,
    Monthly,
}

impl PeriodType {
    pub fn as_str(self) -> &'static str {
        match self {
            PeriodType::Daily => "daily",
            PeriodType::Weekly => "weekly",
            PeriodType::Monthly => "monthly",
        }
    }

    /// Length of the live comparison window used by summaries.
    pub fn window(self) -> Duration {
        match self {
            PeriodType::Daily => Duration::days(1),
            PeriodType::Weekly => Duration::weeks(1),
            PeriodType::Monthly => Duration::days(30),
        }
    }

    /// Half-open `[start, end)` calendar period containing `day`.
    pub fn bounds(self, day: NaiveDate) -> (NaiveDate, NaiveDate) {
        match self {
            PeriodType::Daily => (day, day + Duration::days(1)),
            PeriodType::Weekly => {
                let start = day - Duration::days(i64::from(day.weekday().num_days_from_monday()));
                (start, start + Duration::days(7))
            }
            PeriodType::Monthly => {
                let start = day.with_day(1).unwrap_or(day);
                let (y, m) = if start.month() == 12 {
                    (start.year() + 1, 1)
                } else {
                    (start.year(), start.month() + 1)
                };
                let end = NaiveDate::from_ymd_opt(y, m, 1).unwrap_or(start + Duration::days(31));
                (start, end)
            }
        }
    }
}

impl FromStr for PeriodType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(PeriodType::Daily),
            "weekly" => Ok(PeriodType::Weekly),
            "monthly" => Ok(PeriodType::Monthly),
            _ => Err(ParseEnumError {
                kind: "period type",
                value: s.to_string(),
            }),
        }
    }
}

/// Primary tables that rollups and analytics are computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataSource {
    #[serde(rename = "311")]
    Complaints311,
    #[serde(rename = "911")]
    Calls911,
    #[serde(rename = "hpd_violations")]
    HpdViolations,
    #[serde(rename = "hpd_complaints")]
    HpdComplaints,
    #[serde(rename = "events")]
    Events,
}

impl DataSource {
    pub const ALL: [DataSource; 5] = [
        DataSource::Complaints311,
        DataSource::Calls911,
        DataSource::HpdViolations,
        DataSource::HpdComplaints,
        DataSource::Events,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DataSource::Complaints311 => "311",
            DataSource::Calls911 => "911",
            DataSource::HpdViolations => "hpd_violations",
            DataSource::HpdComplaints => "hpd_complaints",
            DataSource::Events => "events",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            DataSource::Complaints311 => "complaints_311",
            DataSource::Calls911 => "calls_911",
            DataSource::HpdViolations => "hpd_violations",
            DataSource::HpdComplaints => "hpd_complaints",
            DataSource::Events => "events",
        }
    }

    pub fn date_column(self) -> &'static str {
        match self {
            DataSource::Complaints311 => "created_date",
            DataSource::Calls911 => "incident_date",
            DataSource::HpdViolations => "inspection_date",
            DataSource::HpdComplaints => "received_date",
            DataSource::Events => "occurred_at",
        }
    }

    pub fn category_column(self) -> &'static str {
        match self {
            DataSource::Complaints311 => "complaint_type",
            DataSource::Calls911 => "call_type",
            DataSource::HpdViolations => "class",
            DataSource::HpdComplaints => "major_category",
            DataSource::Events => "event_type",
        }
    }
}

impl FromStr for DataSource {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataSource::ALL
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseEnumError {
                kind: "data source",
                value: s.to_string(),
            })
    }
}

/// Precomputed count for one category within one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationBucket {
    pub data_source: String,
    pub period_type: PeriodType,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub category: String,
    pub count: i64,
    pub computed_at: DateTime<Utc>,
}

/// Stable row id for a record: `"{source}_{natural_key}"`.
pub fn natural_id(source: &str, natural_key: &str) -> String {
    format!("{}_{}", source, natural_key.trim())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Article id shared by every feed that republishes the same (url, title) pair.
pub fn article_id(url: &str, title: &str) -> String {
    sha256_hex(format!("{url}:{title}").as_bytes())
}

pub fn whole_seconds(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_nanosecond(0).unwrap_or(ts)
}

/// Parse upstream timestamps. Socrata publishes floating (zone-less) values,
/// which are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(whole_seconds(ts.with_timezone(&Utc)));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%m/%d/%Y %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(whole_seconds(naive.and_utc()));
        }
    }
    for fmt in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
        }
    }
    None
}

/// FDNY highest alarm level: 3+ critical, 2 high, anything else medium.
pub fn severity_from_alarm(level: Option<&str>) -> Severity {
    match level.map(str::trim).and_then(|l| l.parse::<i64>().ok()) {
        Some(n) if n >= 3 => Severity::Critical,
        Some(n) if n >= 2 => Severity::High,
        _ => Severity::Medium,
    }
}

/// NYPD law category code.
pub fn crime_severity(law_category: Option<&str>) -> Severity {
    let Some(cat) = law_category.map(str::trim).filter(|c| !c.is_empty()) else {
        return Severity::Medium;
    };
    let cat = cat.to_ascii_uppercase();
    if cat.contains("FELONY") {
        Severity::High
    } else if cat.contains("MISDEMEANOR") {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// HPD complaint type (`EMERGENCY`, `IMMEDIATE EMERGENCY`, `NON EMERGENCY`, ...).
pub fn building_complaint_severity(complaint_type: Option<&str>) -> Severity {
    match complaint_type.map(|t| t.trim().to_ascii_uppercase()) {
        Some(t) if t == "EMERGENCY" || t == "IMMEDIATE EMERGENCY" => Severity::High,
        _ => Severity::Medium,
    }
}

/// Emergency-alert headline keywords.
pub fn alert_severity(title: &str) -> Severity {
    let t = title.to_ascii_lowercase();
    if ["evacuat", "shelter in place", "shelter-in-place"]
        .iter()
        .any(|k| t.contains(k))
    {
        Severity::Critical
    } else if ["fire", "explosion", "water main", "power outage", "gas"]
        .iter()
        .any(|k| t.contains(k))
    {
        Severity::High
    } else {
        Severity::Medium
    }
}
