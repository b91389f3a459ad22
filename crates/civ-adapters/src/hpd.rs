//! Housing maintenance code violations and complaints, enriched with
//! registered-owner contacts and building coordinates.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use civ_core::{
    building_complaint_severity, natural_id, Event, EventType, HpdComplaint, HpdViolation,
    OwnerContacts, ScopeConfig,
};
use tracing::{debug, info};

use crate::enrich::{BuildingLookup, ContactLookup, Resolver};
use crate::raw::{normalize_batch, RawRecord};
use crate::socrata::{SocrataClient, SoqlQuery};
use crate::{AdapterError, AdapterSettings, FetchContext, GeoMode, SourceAdapter};

/// Owner and coordinates are left empty; the adapter fills them from lookups.
pub fn normalize_violation(raw: &RawRecord, fetched_at: DateTime<Utc>) -> Option<HpdViolation> {
    Some(HpdViolation {
        violation_id: raw.str("violationid")?,
        building_id: raw.str("buildingid"),
        registration_id: raw.str("registrationid"),
        borough: raw.str("boro"),
        house_number: raw.str("housenumber"),
        street_name: raw.str("streetname"),
        zip: raw.str("zip"),
        apartment: raw.str("apartment"),
        story: raw.str("story"),
        block: raw.str("block"),
        lot: raw.str("lot"),
        class: raw.str("class"),
        inspection_date: raw.timestamp("inspectiondate"),
        approved_date: raw.timestamp("approveddate"),
        nov_description: raw.str("novdescription"),
        nov_issued_date: raw.timestamp("novissueddate"),
        current_status: raw.str("currentstatus"),
        current_status_date: raw.timestamp("currentstatusdate"),
        latitude: raw.f64("latitude"),
        longitude: raw.f64("longitude"),
        owner: OwnerContacts::default(),
        fetched_at,
        raw_data: Some(raw.to_json()),
    })
}

/// A complaint row plus, when it carries a received date, its map event.
pub fn normalize_hpd_complaint(
    raw: &RawRecord,
    fetched_at: DateTime<Utc>,
) -> Option<(HpdComplaint, Option<Event>)> {
    let problem_id = raw.str("problem_id")?;
    let complaint = HpdComplaint {
        problem_id: problem_id.clone(),
        complaint_id: raw.str("complaint_id"),
        building_id: raw.str("building_id"),
        borough: raw.str("borough"),
        house_number: raw.str("house_number"),
        street_name: raw.str("street_name"),
        zip: raw.str("post_code"),
        major_category: raw.str("major_category"),
        minor_category: raw.str("minor_category"),
        complaint_status: raw.str("complaint_status"),
        complaint_status_date: raw.timestamp("complaint_status_date"),
        problem_status: raw.str("problem_status"),
        problem_status_date: raw.timestamp("problem_status_date"),
        status_description: raw.str("status_description"),
        latitude: raw.f64("latitude"),
        longitude: raw.f64("longitude"),
        received_date: raw.timestamp("received_date"),
        fetched_at,
        raw_data: Some(raw.to_json()),
    };

    let event = complaint.received_date.map(|occurred_at| Event {
        id: natural_id("hpdc", &problem_id),
        event_type: EventType::BuildingComplaint,
        title: match (&complaint.major_category, &complaint.minor_category) {
            (Some(major), Some(minor)) => format!("{major}: {minor}"),
            (Some(major), None) => major.clone(),
            _ => "Building Complaint".to_string(),
        },
        description: complaint.status_description.clone(),
        latitude: complaint.latitude,
        longitude: complaint.longitude,
        address: street_address(&complaint.house_number, &complaint.street_name),
        occurred_at,
        fetched_at,
        source_url: None,
        category: complaint.major_category.clone(),
        severity: building_complaint_severity(raw.str("type").as_deref()),
        raw_data: None,
    });

    Some((complaint, event))
}

fn street_address(house_number: &Option<String>, street_name: &Option<String>) -> Option<String> {
    match (house_number, street_name) {
        (Some(n), Some(s)) => Some(format!("{n} {s}")),
        (None, Some(s)) => Some(s.clone()),
        _ => None,
    }
}

pub struct HpdViolationsAdapter {
    client: SocrataClient,
    scope: Arc<ScopeConfig>,
}

impl HpdViolationsAdapter {
    pub fn new(settings: &AdapterSettings) -> Self {
        Self {
            client: settings.socrata("hpd_violations"),
            scope: settings.scope.clone(),
        }
    }

    fn in_district(&self, violation: &HpdViolation) -> bool {
        violation
            .zip
            .as_deref()
            .is_some_and(|zip| self.scope.district.zips.iter().any(|z| z == zip))
    }
}

#[async_trait]
impl SourceAdapter for HpdViolationsAdapter {
    fn source_id(&self) -> &'static str {
        "hpd_violations"
    }

    fn description(&self) -> &'static str {
        "HPD housing maintenance code violations with registered owners"
    }

    // ZIP codes straddle district lines.
    fn geo_mode(&self) -> GeoMode {
        GeoMode::ServerBoroughClientZip
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<usize, AdapterError> {
        let query = SoqlQuery::new(format!(
            "boroid='{}' AND inspectiondate > '{}'",
            self.scope.district.borough_id,
            ctx.since_soql()
        ))
        .order_desc("inspectiondate");

        let raws = self
            .client
            .fetch_all(&self.scope.socrata.hpd_violations, &query)
            .await?;
        let fetched = raws.len();
        let mut violations: Vec<HpdViolation> =
            normalize_batch(self.source_id(), &raws, |r| normalize_violation(r, ctx.fetched_at))
                .into_iter()
                .filter(|v| self.in_district(v))
                .collect();
        debug!(source_id = self.source_id(), fetched, in_district = violations.len(), "zip post-filter");

        let cap = self.scope.enrichment_cap;
        let concurrency = self.scope.enrichment_concurrency;

        let mut contacts = Resolver::new(ContactLookup::new(self.client.clone()), cap, concurrency);
        contacts
            .resolve_all(violations.iter().filter_map(|v| v.registration_id.as_deref()))
            .await;

        let mut buildings = Resolver::new(BuildingLookup::new(self.client.clone()), cap, concurrency);
        buildings
            .resolve_all(
                violations
                    .iter()
                    .filter(|v| v.latitude.is_none() || v.longitude.is_none())
                    .filter_map(|v| v.building_id.as_deref()),
            )
            .await;

        for violation in &mut violations {
            if let Some(owner) = violation.registration_id.as_deref().and_then(|id| contacts.get(id)) {
                violation.owner = owner.clone();
            }
            if violation.latitude.is_none() || violation.longitude.is_none() {
                if let Some(&(lat, lng)) = violation.building_id.as_deref().and_then(|id| buildings.get(id)) {
                    violation.latitude = Some(lat);
                    violation.longitude = Some(lng);
                }
            }
        }

        let count = ctx.store.upsert_many(&violations).await?;
        info!(
            source_id = self.source_id(),
            count,
            contact_lookups = contacts.lookups_issued(),
            building_lookups = buildings.lookups_issued(),
            "hpd violations upserted"
        );
        Ok(count)
    }
}

pub struct HpdComplaintsAdapter {
    client: SocrataClient,
    scope: Arc<ScopeConfig>,
}

impl HpdComplaintsAdapter {
    pub fn new(settings: &AdapterSettings) -> Self {
        Self {
            client: settings.socrata("hpd_complaints"),
            scope: settings.scope.clone(),
        }
    }
}

#[async_trait]
impl SourceAdapter for HpdComplaintsAdapter {
    fn source_id(&self) -> &'static str {
        "hpd_complaints"
    }

    fn description(&self) -> &'static str {
        "HPD complaints and problems"
    }

    fn geo_mode(&self) -> GeoMode {
        GeoMode::ServerDistrict
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<usize, AdapterError> {
        let query = SoqlQuery::new(format!(
            "council_district={} AND received_date > '{}'",
            self.scope.district.council_district,
            ctx.since_soql()
        ))
        .order_desc("received_date");

        let raws = self
            .client
            .fetch_all(&self.scope.socrata.hpd_complaints, &query)
            .await?;
        let mut rows = normalize_batch(self.source_id(), &raws, |r| normalize_hpd_complaint(r, ctx.fetched_at));

        let mut buildings = Resolver::new(
            BuildingLookup::new(self.client.clone()),
            self.scope.enrichment_cap,
            self.scope.enrichment_concurrency,
        );
        buildings
            .resolve_all(
                rows.iter()
                    .filter(|(c, _)| c.latitude.is_none() || c.longitude.is_none())
                    .filter_map(|(c, _)| c.building_id.as_deref()),
            )
            .await;

        for (complaint, event) in &mut rows {
            if complaint.latitude.is_some() && complaint.longitude.is_some() {
                continue;
            }
            let Some(&(lat, lng)) = complaint.building_id.as_deref().and_then(|id| buildings.get(id)) else {
                continue;
            };
            complaint.latitude = Some(lat);
            complaint.longitude = Some(lng);
            if let Some(event) = event {
                event.latitude = Some(lat);
                event.longitude = Some(lng);
            }
        }

        let (complaints, events): (Vec<HpdComplaint>, Vec<Option<Event>>) = rows.into_iter().unzip();
        let events: Vec<Event> = events.into_iter().flatten().collect();

        let count = ctx.store.upsert_many(&complaints).await?;
        let event_count = ctx.store.upsert_many(&events).await?;
        info!(
            source_id = self.source_id(),
            count,
            event_count,
            building_lookups = buildings.lookups_issued(),
            "hpd complaints upserted"
        );
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socrata::testing::Scripted;
    use civ_core::Severity;
    use civ_storage::{RecordStore, Transport};
    use serde_json::json;

    #[test]
    fn complaint_events_follow_the_complaint_type() {
        let raw = RawRecord::from_value(json!({
            "problem_id": "5501",
            "house_number": "200",
            "street_name": "EAST 3 STREET",
            "major_category": "HEAT/HOT WATER",
            "minor_category": "ENTIRE BUILDING",
            "type": "EMERGENCY",
            "received_date": "2026-02-10T00:00:00.000"
        }))
        .unwrap();
        let (complaint, event) = normalize_hpd_complaint(&raw, Utc::now()).expect("normalized");
        let event = event.expect("dated complaints become events");
        assert_eq!(complaint.problem_id, "5501");
        assert_eq!(event.id, "hpdc_5501");
        assert_eq!(event.title, "HEAT/HOT WATER: ENTIRE BUILDING");
        assert_eq!(event.address.as_deref(), Some("200 EAST 3 STREET"));
        assert_eq!(event.severity, Severity::High);

        let undated = RawRecord::from_value(json!({"problem_id": "5502"})).unwrap();
        let (_, event) = normalize_hpd_complaint(&undated, Utc::now()).unwrap();
        assert!(event.is_none());
    }

    #[tokio::test]
    async fn violations_are_zip_filtered_and_enriched() {
        let violations = json!([
            {"violationid": "1", "zip": "10009", "registrationid": "900", "buildingid": "50",
             "class": "C", "inspectiondate": "2026-03-01T00:00:00.000"},
            {"violationid": "2", "zip": "10027", "registrationid": "901", "buildingid": "51"},
            {"zip": "10009", "registrationid": "900"}
        ]);
        let contacts = json!([{"type": "CorporateOwner", "corporationname": "EAST 3 REALTY LLC"}]);
        let building = json!([{"buildingid": "50", "latitude": "40.7241", "longitude": "-73.9832"}]);
        let transport = Arc::new(Scripted::new(vec![
            Ok(violations.to_string()),
            Ok(contacts.to_string()),
            Ok(building.to_string()),
        ]));
        let settings = AdapterSettings::new(ScopeConfig::default(), transport.clone() as Arc<dyn Transport>);
        let store = RecordStore::in_memory().await.unwrap();
        let ctx = FetchContext::new(store.clone(), chrono::Duration::days(7));

        let count = HpdViolationsAdapter::new(&settings).fetch(&ctx).await.expect("fetch");
        assert_eq!(count, 1);

        let stored: HpdViolation = store.get("1").await.unwrap().expect("row");
        assert_eq!(stored.owner.owner_name.as_deref(), Some("EAST 3 REALTY LLC"));
        assert_eq!(stored.owner.owner_type.as_deref(), Some("CorporateOwner"));
        assert_eq!(stored.latitude, Some(40.7241));
        assert_eq!(transport.requests().len(), 3);
        assert!(store.get::<HpdViolation>("2").await.unwrap().is_none());
    }
}
