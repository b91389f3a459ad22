//! Source adapter contract, shared upstream clients, and one adapter per feed family.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use civ_core::{whole_seconds, ScopeConfig};
use civ_storage::{FetchError, RecordStore, StoreError, Transport};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

mod civic;
mod enrich;
mod hpd;
mod legislation;
mod news;
mod raw;
mod relevance;
mod rss;
mod socrata;

pub use civic::{
    normalize_311, normalize_911, normalize_fdny, normalize_nypd, Calls911Adapter, FdnyAdapter,
    NypdAdapter, Requests311Adapter,
};
pub use enrich::{select_owner, BuildingLookup, ContactLookup, Lookup, Resolver};
pub use hpd::{normalize_hpd_complaint, normalize_violation, HpdComplaintsAdapter, HpdViolationsAdapter};
pub use legislation::{normalize_matter, LegislationAdapter};
pub use news::{HyperlocalAdapter, NewsAdapter, NotifyAdapter};
pub use raw::RawRecord;
pub use relevance::{RelevanceFilter, Verdict};
pub use rss::{html_to_text, parse_feed, FeedEntry};
pub use socrata::{SocrataClient, SoqlQuery};

/// Every registered adapter id, in backfill order.
pub const ADAPTER_IDS: [&str; 10] = [
    "fdny",
    "nypd",
    "311",
    "911",
    "notify",
    "hyperlocal",
    "news",
    "hpd_violations",
    "hpd_complaints",
    "legislation",
];

/// How an adapter restricts upstream data to the configured scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoMode {
    /// Server-side administrative district predicate.
    ServerDistrict,
    /// Server-side latitude/longitude box.
    ServerBoundingBox,
    /// Server-side borough predicate, then a client-side ZIP post-filter.
    ServerBoroughClientZip,
    /// Neighborhood/ZIP term matching on feed text.
    TextRelevance,
    /// Scoped by entity (sponsor), not by place.
    Entity,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("source unavailable: {0}")]
    Source(#[from] FetchError),
    #[error("malformed payload from {source_id}: {message}")]
    Malformed {
        source_id: &'static str,
        message: String,
    },
    #[error("store rejected batch: {0}")]
    Store(#[from] StoreError),
    #[error("unknown source: {0}")]
    UnknownSource(String),
}

/// Per-run inputs handed to an adapter.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub run_id: Uuid,
    /// Lower bound for upstream records.
    pub since: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub store: RecordStore,
}

impl FetchContext {
    pub fn new(store: RecordStore, lookback: Duration) -> Self {
        let now = whole_seconds(Utc::now());
        Self {
            run_id: Uuid::new_v4(),
            since: now - lookback,
            fetched_at: now,
            store,
        }
    }

    /// `since` in the floating timestamp format SoQL compares against.
    pub fn since_soql(&self) -> String {
        self.since.format("%Y-%m-%dT%H:%M:%S").to_string()
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn geo_mode(&self) -> GeoMode;

    /// Fetch records newer than `ctx.since`, normalize, enrich, and upsert them.
    /// Returns the number of primary rows written.
    async fn fetch(&self, ctx: &FetchContext) -> Result<usize, AdapterError>;
}

/// Shared dependencies for constructing adapters.
#[derive(Clone)]
pub struct AdapterSettings {
    pub scope: Arc<ScopeConfig>,
    pub transport: Arc<dyn Transport>,
    /// Socrata app token, sent as `X-App-Token` when present.
    pub app_token: Option<String>,
}

impl AdapterSettings {
    pub fn new(scope: ScopeConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            scope: Arc::new(scope),
            transport,
            app_token: None,
        }
    }

    pub fn with_app_token(mut self, token: Option<String>) -> Self {
        self.app_token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub(crate) fn socrata(&self, source_id: &'static str) -> SocrataClient {
        SocrataClient::new(
            source_id,
            self.transport.clone(),
            self.scope.socrata.clone(),
            self.app_token.clone(),
        )
    }
}

pub fn adapter_for_source(
    source_id: &str,
    settings: &AdapterSettings,
) -> Option<Arc<dyn SourceAdapter>> {
    let adapter: Arc<dyn SourceAdapter> = match source_id {
        "fdny" => Arc::new(FdnyAdapter::new(settings)),
        "nypd" => Arc::new(NypdAdapter::new(settings)),
        "311" => Arc::new(Requests311Adapter::new(settings)),
        "911" => Arc::new(Calls911Adapter::new(settings)),
        "notify" => Arc::new(NotifyAdapter::new(settings)),
        "hyperlocal" => Arc::new(HyperlocalAdapter::new(settings)),
        "news" => Arc::new(NewsAdapter::new(settings)),
        "hpd_violations" => Arc::new(HpdViolationsAdapter::new(settings)),
        "hpd_complaints" => Arc::new(HpdComplaintsAdapter::new(settings)),
        "legislation" => Arc::new(LegislationAdapter::new(settings)),
        _ => return None,
    };
    Some(adapter)
}

pub fn all_adapters(settings: &AdapterSettings) -> Vec<Arc<dyn SourceAdapter>> {
    ADAPTER_IDS
        .iter()
        .filter_map(|id| adapter_for_source(id, settings))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use civ_storage::FetchRequest;

    struct Offline;

    #[async_trait]
    impl Transport for Offline {
        async fn get_text(&self, request: &FetchRequest) -> Result<String, FetchError> {
            Err(FetchError::HttpStatus {
                status: 503,
                url: request.url.clone(),
            })
        }
    }

    #[test]
    fn registry_covers_every_id_once() {
        let settings = AdapterSettings::new(ScopeConfig::default(), Arc::new(Offline));
        let adapters = all_adapters(&settings);
        let ids: Vec<_> = adapters.iter().map(|a| a.source_id()).collect();
        assert_eq!(ids, ADAPTER_IDS.to_vec());
        assert!(adapter_for_source("dob", &settings).is_none());
        assert_eq!(
            adapter_for_source("hpd_violations", &settings)
                .map(|a| a.geo_mode()),
            Some(GeoMode::ServerBoroughClientZip)
        );
    }

    #[test]
    fn blank_app_tokens_are_ignored() {
        let settings = AdapterSettings::new(ScopeConfig::default(), Arc::new(Offline))
            .with_app_token(Some("  ".into()));
        assert!(settings.app_token.is_none());
    }
}
