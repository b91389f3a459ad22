//! Incident and service-request datasets: FDNY, NYPD, 311, and 911.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use civ_core::{
    crime_severity, natural_id, severity_from_alarm, Call911, Complaint311, Event, EventType,
    ScopeConfig, Severity,
};
use tracing::info;

use crate::raw::{normalize_batch, RawRecord};
use crate::socrata::{SocrataClient, SoqlQuery};
use crate::{AdapterError, AdapterSettings, FetchContext, GeoMode, SourceAdapter};

pub fn normalize_fdny(raw: &RawRecord, dataset_url: &str, fetched_at: DateTime<Utc>) -> Option<Event> {
    let incident_id = raw.str("STARFIRE_INCIDENT_ID")?;
    let occurred_at = raw.timestamp("INCIDENT_DATETIME")?;
    let group = raw.str("INCIDENT_CLASSIFICATION_GROUP");
    let alarm = raw.str("HIGHEST_ALARM_LEVEL");

    Some(Event {
        id: natural_id("fdny", &incident_id),
        event_type: EventType::Fire,
        title: raw.str_or("INCIDENT_CLASSIFICATION", "Fire Incident"),
        description: Some(format!(
            "{} - Alarm Level: {} - Response: {}s",
            group.as_deref().unwrap_or_default(),
            alarm.as_deref().unwrap_or("N/A"),
            raw.str_or("DISPATCH_RESPONSE_SECONDS_QY", "N/A"),
        )),
        latitude: None,
        longitude: None,
        address: raw.str("ALARM_BOX_LOCATION"),
        occurred_at,
        fetched_at,
        source_url: Some(format!("{dataset_url}?STARFIRE_INCIDENT_ID={incident_id}")),
        category: group,
        severity: severity_from_alarm(alarm.as_deref()),
        raw_data: Some(raw.to_json()),
    })
}

pub fn normalize_nypd(raw: &RawRecord, dataset_url: &str, fetched_at: DateTime<Utc>) -> Option<Event> {
    let complaint_num = raw.str("cmplnt_num")?;
    let occurred_at = raw.timestamp("cmplnt_fr_dt")?;
    let law_category = raw.str("law_cat_cd");

    Some(Event {
        id: natural_id("nypd", &complaint_num),
        event_type: EventType::Crime,
        title: raw.str_or("ofns_desc", "Crime Incident"),
        description: Some(format!(
            "{} - {} - Precinct: {}",
            raw.str("pd_desc").unwrap_or_default(),
            law_category.as_deref().unwrap_or_default(),
            raw.str_or("addr_pct_cd", "N/A"),
        )),
        latitude: raw.f64("latitude"),
        longitude: raw.f64("longitude"),
        address: raw.str("prem_typ_desc"),
        occurred_at,
        fetched_at,
        source_url: Some(format!("{dataset_url}?cmplnt_num={complaint_num}")),
        severity: crime_severity(law_category.as_deref()),
        category: law_category,
        raw_data: Some(raw.to_json()),
    })
}

/// One 311 request yields both a map event and a complaint row.
pub fn normalize_311(raw: &RawRecord, fetched_at: DateTime<Utc>) -> Option<(Event, Complaint311)> {
    let unique_key = raw.str("unique_key")?;
    let created_date = raw.timestamp("created_date")?;
    let complaint_type = raw.str("complaint_type");
    let descriptor = raw.str("descriptor");
    let address = raw.str("incident_address");
    let (latitude, longitude) = (raw.f64("latitude"), raw.f64("longitude"));
    let raw_data = Some(raw.to_json());

    let event = Event {
        id: natural_id("311", &unique_key),
        event_type: EventType::Complaint311,
        title: complaint_type.clone().unwrap_or_else(|| "311 Complaint".to_string()),
        description: descriptor.clone(),
        latitude,
        longitude,
        address: address.clone(),
        occurred_at: created_date,
        fetched_at,
        source_url: Some(format!("https://portal.311.nyc.gov/check-status/?id={unique_key}")),
        category: complaint_type.clone(),
        severity: Severity::Low,
        raw_data: raw_data.clone(),
    };

    let complaint = Complaint311 {
        unique_key,
        created_date,
        closed_date: raw.timestamp("closed_date"),
        agency: raw.str("agency"),
        complaint_type,
        descriptor,
        location_type: raw.str("location_type"),
        incident_zip: raw.str("incident_zip"),
        address,
        city: raw.str("city"),
        status: raw.str("status"),
        resolution_description: raw.str("resolution_description"),
        latitude,
        longitude,
        fetched_at,
        raw_data,
    };

    Some((event, complaint))
}

pub fn normalize_911(raw: &RawRecord, fetched_at: DateTime<Utc>) -> Option<Call911> {
    let cad_id = raw.str("cad_evnt_id")?;
    Some(Call911 {
        id: natural_id("911", &cad_id),
        incident_date: raw.timestamp("incident_date"),
        incident_time: raw.str("incident_time"),
        call_type: raw.str("typ_desc"),
        borough: raw.str("boro_nm"),
        precinct: raw.str("nypd_pct_cd"),
        latitude: raw.f64("latitude"),
        longitude: raw.f64("longitude"),
        dispatch_ts: raw.timestamp("disp_ts"),
        arrival_ts: raw.timestamp("arrivd_ts"),
        closing_ts: raw.timestamp("closng_ts"),
        fetched_at,
        raw_data: Some(raw.to_json()),
    })
}

pub struct FdnyAdapter {
    client: SocrataClient,
    scope: Arc<ScopeConfig>,
}

impl FdnyAdapter {
    pub fn new(settings: &AdapterSettings) -> Self {
        Self {
            client: settings.socrata("fdny"),
            scope: settings.scope.clone(),
        }
    }
}

#[async_trait]
impl SourceAdapter for FdnyAdapter {
    fn source_id(&self) -> &'static str {
        "fdny"
    }

    fn description(&self) -> &'static str {
        "FDNY fire incident dispatch"
    }

    fn geo_mode(&self) -> GeoMode {
        GeoMode::ServerDistrict
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<usize, AdapterError> {
        let dataset = &self.scope.socrata.fdny_incidents;
        let query = SoqlQuery::new(format!(
            "CITYCOUNCILDISTRICT='{}' AND INCIDENT_DATETIME > '{}'",
            self.scope.district.council_district,
            ctx.since_soql()
        ))
        .order_desc("INCIDENT_DATETIME");

        let raws = self.client.fetch_all(dataset, &query).await?;
        let url = self.scope.socrata.dataset_url(dataset);
        let events = normalize_batch(self.source_id(), &raws, |r| normalize_fdny(r, &url, ctx.fetched_at));
        let count = ctx.store.upsert_many(&events).await?;
        info!(source_id = self.source_id(), count, "fdny incidents upserted");
        Ok(count)
    }
}

pub struct NypdAdapter {
    client: SocrataClient,
    scope: Arc<ScopeConfig>,
}

impl NypdAdapter {
    pub fn new(settings: &AdapterSettings) -> Self {
        Self {
            client: settings.socrata("nypd"),
            scope: settings.scope.clone(),
        }
    }
}

#[async_trait]
impl SourceAdapter for NypdAdapter {
    fn source_id(&self) -> &'static str {
        "nypd"
    }

    fn description(&self) -> &'static str {
        "NYPD complaint data (published with a lag of weeks)"
    }

    fn geo_mode(&self) -> GeoMode {
        GeoMode::ServerBoundingBox
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<usize, AdapterError> {
        let dataset = &self.scope.socrata.nypd_complaints;
        let query = SoqlQuery::new(format!(
            "cmplnt_fr_dt > '{}' AND {}",
            ctx.since_soql(),
            self.scope.district.bbox.soql("latitude", "longitude")
        ))
        .order_desc("cmplnt_fr_dt");

        let raws = self.client.fetch_all(dataset, &query).await?;
        let url = self.scope.socrata.dataset_url(dataset);
        let events = normalize_batch(self.source_id(), &raws, |r| normalize_nypd(r, &url, ctx.fetched_at));
        let count = ctx.store.upsert_many(&events).await?;
        info!(source_id = self.source_id(), count, "nypd complaints upserted");
        Ok(count)
    }
}

pub struct Requests311Adapter {
    client: SocrataClient,
    scope: Arc<ScopeConfig>,
}

impl Requests311Adapter {
    pub fn new(settings: &AdapterSettings) -> Self {
        Self {
            client: settings.socrata("311"),
            scope: settings.scope.clone(),
        }
    }
}

#[async_trait]
impl SourceAdapter for Requests311Adapter {
    fn source_id(&self) -> &'static str {
        "311"
    }

    fn description(&self) -> &'static str {
        "311 service requests"
    }

    fn geo_mode(&self) -> GeoMode {
        GeoMode::ServerDistrict
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<usize, AdapterError> {
        let query = SoqlQuery::new(format!(
            "council_district='{}' AND created_date > '{}'",
            self.scope.district.council_district,
            ctx.since_soql()
        ))
        .order_desc("created_date");

        let raws = self
            .client
            .fetch_all(&self.scope.socrata.requests_311, &query)
            .await?;
        let (events, complaints): (Vec<_>, Vec<_>) =
            normalize_batch(self.source_id(), &raws, |r| normalize_311(r, ctx.fetched_at))
                .into_iter()
                .unzip();

        let count = ctx.store.upsert_many(&events).await?;
        let complaint_count = ctx.store.upsert_many(&complaints).await?;
        info!(source_id = self.source_id(), count, complaint_count, "311 requests upserted");
        Ok(count)
    }
}

pub struct Calls911Adapter {
    client: SocrataClient,
    scope: Arc<ScopeConfig>,
}

impl Calls911Adapter {
    pub fn new(settings: &AdapterSettings) -> Self {
        Self {
            client: settings.socrata("911"),
            scope: settings.scope.clone(),
        }
    }
}

#[async_trait]
impl SourceAdapter for Calls911Adapter {
    fn source_id(&self) -> &'static str {
        "911"
    }

    fn description(&self) -> &'static str {
        "NYPD calls for service"
    }

    fn geo_mode(&self) -> GeoMode {
        GeoMode::ServerBoundingBox
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<usize, AdapterError> {
        let query = SoqlQuery::new(format!(
            "create_date > '{}' AND {}",
            ctx.since_soql(),
            self.scope.district.bbox.soql("latitude", "longitude")
        ))
        .order_desc("create_date");

        let raws = self.client.fetch_all(&self.scope.socrata.calls_911, &query).await?;
        let calls = normalize_batch(self.source_id(), &raws, |r| normalize_911(r, ctx.fetched_at));
        let count = ctx.store.upsert_many(&calls).await?;
        info!(source_id = self.source_id(), count, "911 calls upserted");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socrata::testing::Scripted;
    use chrono::TimeZone;
    use civ_storage::{RecordStore, Transport};
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawRecord {
        RawRecord::from_value(value).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 5, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn fdny_rows_read_upper_or_lower_case_fields() {
        let event = normalize_fdny(
            &raw(json!({
                "STARFIRE_INCIDENT_ID": "260301",
                "incident_datetime": "2026-03-04T22:10:00.000",
                "INCIDENT_CLASSIFICATION": "Private Dwelling Fire",
                "incident_classification_group": "Structural Fires",
                "HIGHEST_ALARM_LEVEL": "2",
                "ALARM_BOX_LOCATION": "AVE B & E 4 ST"
            })),
            "https://data.test/fdny.json",
            now(),
        )
        .expect("normalized");

        assert_eq!(event.id, "fdny_260301");
        assert_eq!(event.severity, Severity::High);
        assert_eq!(event.category.as_deref(), Some("Structural Fires"));
        assert_eq!(
            event.description.as_deref(),
            Some("Structural Fires - Alarm Level: 2 - Response: N/As")
        );
        assert_eq!(
            event.source_url.as_deref(),
            Some("https://data.test/fdny.json?STARFIRE_INCIDENT_ID=260301")
        );
        assert!(normalize_fdny(&raw(json!({"incident_datetime": "2026-03-04T22:10:00"})), "", now()).is_none());
    }

    #[test]
    fn nypd_defaults_are_explicit() {
        let event = normalize_nypd(
            &raw(json!({"cmplnt_num": "9", "cmplnt_fr_dt": "2026-02-01T00:00:00.000", "latitude": "40.72"})),
            "https://data.test/nypd.json",
            now(),
        )
        .expect("normalized");
        assert_eq!(event.title, "Crime Incident");
        assert_eq!(event.severity, Severity::Medium);
        assert_eq!(event.description.as_deref(), Some(" -  - Precinct: N/A"));
        assert_eq!(event.latitude, Some(40.72));
        assert_eq!(event.longitude, None);
    }

    #[tokio::test]
    async fn requests_311_write_events_and_complaints() {
        let body = json!([
            {"unique_key": "1001", "created_date": "2026-03-05T08:00:00.000", "complaint_type": "Noise - Residential",
             "descriptor": "Loud Music/Party", "incident_zip": "10009", "latitude": "40.726", "longitude": "-73.98"},
            {"created_date": "2026-03-05T09:00:00.000", "complaint_type": "Illegal Parking"},
            {"unique_key": "1002", "created_date": "2026-03-05T10:00:00.000"}
        ]);
        let transport = Arc::new(Scripted::new(vec![Ok(body.to_string())]));
        let settings = AdapterSettings::new(ScopeConfig::default(), transport.clone() as Arc<dyn Transport>);
        let store = RecordStore::in_memory().await.unwrap();
        let ctx = FetchContext::new(store.clone(), chrono::Duration::hours(24));

        let count = Requests311Adapter::new(&settings).fetch(&ctx).await.expect("fetch");
        assert_eq!(count, 2);
        assert_eq!(store.count("complaints_311").await.unwrap(), 2);

        let untyped: Event = store.get("311_1002").await.unwrap().expect("row");
        assert_eq!(untyped.title, "311 Complaint");
        assert_eq!(untyped.severity, Severity::Low);

        let requests = transport.requests();
        let clause = requests[0].query_value("$where").unwrap();
        assert!(clause.starts_with("council_district='2' AND created_date > '"), "{clause}");
    }

    #[tokio::test]
    async fn calls_911_use_the_bounding_box() {
        let body = json!([{"cad_evnt_id": "77", "incident_date": "2026-03-05T00:00:00.000", "typ_desc": "DISPUTE"}]);
        let transport = Arc::new(Scripted::new(vec![Ok(body.to_string())]));
        let settings = AdapterSettings::new(ScopeConfig::default(), transport.clone() as Arc<dyn Transport>);
        let store = RecordStore::in_memory().await.unwrap();
        let ctx = FetchContext::new(store.clone(), chrono::Duration::hours(2));

        assert_eq!(Calls911Adapter::new(&settings).fetch(&ctx).await.unwrap(), 1);
        let call: Call911 = store.get("911_77").await.unwrap().expect("row");
        assert_eq!(call.call_type.as_deref(), Some("DISPUTE"));

        let clause = transport.requests()[0].query_value("$where").unwrap().to_string();
        assert!(clause.contains("latitude > 40.715 AND latitude < 40.748"), "{clause}");
    }
}
