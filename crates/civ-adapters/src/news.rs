//! RSS-backed adapters: emergency alerts, aggregated news searches, and
//! hyperlocal outlets.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use civ_core::{
    alert_severity, article_id, natural_id, sha256_hex, Event, EventType, FeedConfig, NewsArticle,
    ScopeConfig,
};
use civ_storage::{FetchRequest, Transport};
use tracing::{info, warn};

use crate::relevance::{RelevanceFilter, Verdict};
use crate::rss::{parse_feed, FeedEntry};
use crate::{AdapterError, AdapterSettings, FetchContext, GeoMode, SourceAdapter};

/// Fetches one feed and keeps the entries that pass its relevance filter and
/// are not older than `since`. Undated entries are kept.
async fn read_feed(
    transport: &dyn Transport,
    source_id: &'static str,
    feed: &FeedConfig,
    filter: &RelevanceFilter,
    since: DateTime<Utc>,
) -> Result<Vec<FeedEntry>, AdapterError> {
    let body = transport
        .get_text(&FetchRequest::new(source_id, feed.url.clone()))
        .await?;
    let entries = parse_feed(&body).map_err(|err| AdapterError::Malformed {
        source_id,
        message: format!("feed {}: {err}", feed.key),
    })?;
    let total = entries.len();

    let kept: Vec<FeedEntry> = entries
        .into_iter()
        .filter(|e| e.published_at.map_or(true, |ts| ts >= since))
        .filter(|e| filter.verdict(&e.text()) == Verdict::Keep)
        .collect();
    info!(source_id, feed = %feed.key, total, kept = kept.len(), "feed read");
    Ok(kept)
}

/// Reads every feed, isolating per-feed failures. Fails only when every
/// feed failed.
async fn read_feeds<T>(
    transport: &dyn Transport,
    source_id: &'static str,
    feeds: &[FeedConfig],
    scope: &ScopeConfig,
    since: DateTime<Utc>,
    mut convert: impl FnMut(&FeedConfig, FeedEntry) -> T,
) -> Result<Vec<T>, AdapterError> {
    let mut out = Vec::new();
    let mut last_error = None;
    let mut succeeded = 0usize;

    for feed in feeds {
        let result = match RelevanceFilter::for_feed(feed, &scope.district) {
            Ok(filter) => read_feed(transport, source_id, feed, &filter, since).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(entries) => {
                succeeded += 1;
                out.extend(entries.into_iter().map(|e| convert(feed, e)));
            }
            Err(err) => {
                warn!(source_id, feed = %feed.key, error = %err, "feed skipped");
                last_error = Some(err);
            }
        }
    }

    match last_error {
        Some(err) if succeeded == 0 => Err(err),
        _ => Ok(out),
    }
}

fn article(feed: &FeedConfig, entry: FeedEntry, hyperlocal: bool, fetched_at: DateTime<Utc>) -> NewsArticle {
    let url = entry.link.unwrap_or_default();
    NewsArticle {
        id: article_id(&url, &entry.title),
        title: entry.title,
        summary: entry.summary,
        url: (!url.is_empty()).then_some(url),
        source: if hyperlocal {
            Some(feed.name.clone())
        } else {
            entry.source.or_else(|| Some(feed.name.clone()))
        },
        published_at: entry.published_at,
        feed_name: feed.key.clone(),
        is_topic_related: feed.topic_related,
        is_district: feed.district || hyperlocal,
        is_hyperlocal: hyperlocal,
        fetched_at,
    }
}

/// Collapses articles republished by several feeds into one row whose
/// classification flags are the union of every occurrence.
fn merge_articles(articles: Vec<NewsArticle>) -> Vec<NewsArticle> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut merged: Vec<NewsArticle> = Vec::with_capacity(articles.len());
    for article in articles {
        match index.get(&article.id) {
            Some(&i) => {
                let existing = &mut merged[i];
                existing.is_topic_related |= article.is_topic_related;
                existing.is_district |= article.is_district;
                existing.is_hyperlocal |= article.is_hyperlocal;
            }
            None => {
                index.insert(article.id.clone(), merged.len());
                merged.push(article);
            }
        }
    }
    merged
}

fn alert_event(entry: FeedEntry, fetched_at: DateTime<Utc>) -> Event {
    let identity = entry
        .guid
        .as_deref()
        .or(entry.link.as_deref())
        .unwrap_or(entry.title.as_str());
    let digest = sha256_hex(identity.as_bytes());
    Event {
        id: natural_id("alert", &digest[..16]),
        event_type: EventType::Alert,
        severity: alert_severity(&entry.title),
        title: entry.title,
        description: entry.summary,
        latitude: None,
        longitude: None,
        address: None,
        occurred_at: entry.published_at.unwrap_or(fetched_at),
        fetched_at,
        source_url: entry.link,
        category: Some("Emergency Alert".to_string()),
        raw_data: None,
    }
}

pub struct NotifyAdapter {
    transport: Arc<dyn Transport>,
    scope: Arc<ScopeConfig>,
}

impl NotifyAdapter {
    pub fn new(settings: &AdapterSettings) -> Self {
        Self {
            transport: settings.transport.clone(),
            scope: settings.scope.clone(),
        }
    }
}

#[async_trait]
impl SourceAdapter for NotifyAdapter {
    fn source_id(&self) -> &'static str {
        "notify"
    }

    fn description(&self) -> &'static str {
        "Notify NYC emergency alerts"
    }

    fn geo_mode(&self) -> GeoMode {
        GeoMode::TextRelevance
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<usize, AdapterError> {
        let feeds = std::slice::from_ref(&self.scope.notify_feed);
        let events = read_feeds(
            self.transport.as_ref(),
            self.source_id(),
            feeds,
            &self.scope,
            ctx.since,
            |_, entry| alert_event(entry, ctx.fetched_at),
        )
        .await?;
        let count = ctx.store.upsert_many(&events).await?;
        info!(source_id = self.source_id(), count, "alerts upserted");
        Ok(count)
    }
}

pub struct NewsAdapter {
    transport: Arc<dyn Transport>,
    scope: Arc<ScopeConfig>,
}

impl NewsAdapter {
    pub fn new(settings: &AdapterSettings) -> Self {
        Self {
            transport: settings.transport.clone(),
            scope: settings.scope.clone(),
        }
    }
}

#[async_trait]
impl SourceAdapter for NewsAdapter {
    fn source_id(&self) -> &'static str {
        "news"
    }

    fn description(&self) -> &'static str {
        "News search feeds for the district and its council member"
    }

    fn geo_mode(&self) -> GeoMode {
        GeoMode::TextRelevance
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<usize, AdapterError> {
        let articles = read_feeds(
            self.transport.as_ref(),
            self.source_id(),
            &self.scope.news_feeds,
            &self.scope,
            ctx.since,
            |feed, entry| article(feed, entry, false, ctx.fetched_at),
        )
        .await?;
        let articles = merge_articles(articles);
        let count = ctx.store.upsert_many(&articles).await?;
        info!(source_id = self.source_id(), count, feeds = self.scope.news_feeds.len(), "news upserted");
        Ok(count)
    }
}

pub struct HyperlocalAdapter {
    transport: Arc<dyn Transport>,
    scope: Arc<ScopeConfig>,
}

impl HyperlocalAdapter {
    pub fn new(settings: &AdapterSettings) -> Self {
        Self {
            transport: settings.transport.clone(),
            scope: settings.scope.clone(),
        }
    }
}

#[async_trait]
impl SourceAdapter for HyperlocalAdapter {
    fn source_id(&self) -> &'static str {
        "hyperlocal"
    }

    fn description(&self) -> &'static str {
        "Neighborhood blogs and local outlets"
    }

    fn geo_mode(&self) -> GeoMode {
        GeoMode::TextRelevance
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<usize, AdapterError> {
        let articles = read_feeds(
            self.transport.as_ref(),
            self.source_id(),
            &self.scope.hyperlocal_feeds,
            &self.scope,
            ctx.since,
            |feed, entry| article(feed, entry, true, ctx.fetched_at),
        )
        .await?;
        let articles = merge_articles(articles);
        let count = ctx.store.upsert_many(&articles).await?;
        info!(
            source_id = self.source_id(),
            count,
            feeds = self.scope.hyperlocal_feeds.len(),
            "hyperlocal articles upserted"
        );
        Ok(count)
    }
}
