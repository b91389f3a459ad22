use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use civ_core::{natural_id, LegislationItem, ScopeConfig};
use civ_storage::{FetchRequest, Transport};
use serde_json::Value;
use tracing::{info, warn};

use crate::raw::RawRecord;
use crate::{AdapterError, AdapterSettings, FetchContext, GeoMode, SourceAdapter};

const PAGE_SIZE: usize = 50;
const MAX_PAGES: usize = 10;
/// Matters fetched individually from the sponsorship listing per run.
const SPONSORSHIP_CAP: usize = 30;

pub fn normalize_matter(raw: &RawRecord, sponsor: &str, fetched_at: DateTime<Utc>) -> Option<LegislationItem> {
    let matter_id = raw.str("MatterId")?;
    Some(LegislationItem {
        id: natural_id("leg", &matter_id),
        file_number: raw.str("MatterFile"),
        name: raw.str("MatterName"),
        title: raw.str("MatterTitle"),
        matter_type: raw.str("MatterTypeName"),
        status: raw.str("MatterStatusName"),
        intro_date: raw.timestamp("MatterIntroDate"),
        agenda_date: raw.timestamp("MatterAgendaDate"),
        passed_date: raw.timestamp("MatterPassedDate"),
        enactment_date: raw.timestamp("MatterEnactmentDate"),
        url: Some(format!(
            "https://legistar.council.nyc.gov/LegislationDetail.aspx?ID={matter_id}"
        )),
        sponsors: vec![sponsor.to_string()],
        fetched_at,
    })
}

/// Matters sponsored by one council member, from the Legistar web API.
pub struct LegislationAdapter {
    transport: Arc<dyn Transport>,
    scope: Arc<ScopeConfig>,
}

impl LegislationAdapter {
    pub fn new(settings: &AdapterSettings) -> Self {
        Self {
            transport: settings.transport.clone(),
            scope: settings.scope.clone(),
        }
    }

    fn request(&self, path: &str) -> FetchRequest {
        FetchRequest::new(
            self.source_id(),
            format!("{}/{}", self.scope.legistar_base.trim_end_matches('/'), path),
        )
    }

    async fn rows(&self, request: &FetchRequest) -> Result<Vec<RawRecord>, AdapterError> {
        match self.transport.get_json(request).await? {
            Value::Array(items) => Ok(items.into_iter().filter_map(RawRecord::from_value).collect()),
            _ => Err(AdapterError::Malformed {
                source_id: "legislation",
                message: format!("expected a JSON array from {}", request.url),
            }),
        }
    }

    async fn person_id(&self) -> Result<Option<String>, AdapterError> {
        let name = self.scope.sponsor_name.replace('\'', "''");
        let request = self
            .request("persons")
            .query("$filter", format!("PersonFullName eq '{name}'"));
        Ok(self.rows(&request).await?.first().and_then(|p| p.str("PersonId")))
    }

    async fn sponsored_matters(&self, person_id: &str) -> Result<Vec<RawRecord>, AdapterError> {
        let mut matters = Vec::new();
        for page in 0..MAX_PAGES {
            let request = self
                .request("matters")
                .query("$filter", format!("MatterSponsorNameId eq {person_id}"))
                .query("$orderby", "MatterIntroDate desc")
                .query("$top", PAGE_SIZE.to_string())
                .query("$skip", (page * PAGE_SIZE).to_string());
            let rows = self.rows(&request).await?;
            let received = rows.len();
            matters.extend(rows);
            if received < PAGE_SIZE {
                break;
            }
        }
        Ok(matters)
    }

    /// Co-sponsored matters only appear in the person's sponsorship listing.
    async fn cosponsored_matters(&self, person_id: &str, seen: &HashSet<String>) -> Vec<RawRecord> {
        let listing = match self.rows(&self.request(&format!("persons/{person_id}/sponsors"))).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(source_id = self.source_id(), error = %err, "sponsorship listing unavailable");
                return Vec::new();
            }
        };

        let mut listed = HashSet::new();
        let ids: Vec<String> = listing
            .iter()
            .filter_map(|s| s.str("MatterId"))
            .filter(|id| !seen.contains(id) && listed.insert(id.clone()))
            .collect();

        let mut matters = Vec::new();
        for id in ids.into_iter().take(SPONSORSHIP_CAP) {
            match self.transport.get_json(&self.request(&format!("matters/{id}"))).await {
                Ok(value) => matters.extend(RawRecord::from_value(value)),
                Err(err) => warn!(source_id = self.source_id(), matter_id = %id, error = %err, "matter skipped"),
            }
        }
        matters
    }
}

#[async_trait]
impl SourceAdapter for LegislationAdapter {
    fn source_id(&self) -> &'static str {
        "legislation"
    }

    fn description(&self) -> &'static str {
        "Council legislation sponsored by the district's member"
    }

    fn geo_mode(&self) -> GeoMode {
        GeoMode::Entity
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<usize, AdapterError> {
        let Some(person_id) = self.person_id().await? else {
            warn!(source_id = self.source_id(), sponsor = %self.scope.sponsor_name, "sponsor not found");
            return Ok(0);
        };

        let mut matters = self.sponsored_matters(&person_id).await?;
        let seen: HashSet<String> = matters.iter().filter_map(|m| m.str("MatterId")).collect();
        matters.extend(self.cosponsored_matters(&person_id, &seen).await);

        let mut ids = HashSet::new();
        let items: Vec<LegislationItem> = matters
            .iter()
            .filter_map(|m| normalize_matter(m, &self.scope.sponsor_name, ctx.fetched_at))
            .filter(|item| ids.insert(item.id.clone()))
            .collect();

        let count = ctx.store.upsert_many(&items).await?;
        info!(source_id = self.source_id(), count, person_id = %person_id, "legislation upserted");
        Ok(count)
    }
}
