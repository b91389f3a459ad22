use chrono::{DateTime, Utc};
use civ_core::{parse_timestamp, whole_seconds};
use quick_xml::de::from_str;
use scraper::Html;
use serde::Deserialize;

/// Summaries are truncated to this many characters.
pub const SUMMARY_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    items: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    description: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    guid: Option<TextNode>,
    source: Option<TextNode>,
}

#[derive(Debug, Deserialize)]
struct TextNode {
    #[serde(rename = "$text", default)]
    text: Option<String>,
}

/// One RSS item reduced to plain text.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    pub title: String,
    pub link: Option<String>,
    pub summary: Option<String>,
    pub guid: Option<String>,
    /// Publisher named by aggregators such as Google News.
    pub source: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

impl FeedEntry {
    /// Title and summary joined, for relevance matching.
    pub fn text(&self) -> String {
        match &self.summary {
            Some(summary) => format!("{} {}", self.title, summary),
            None => self.title.clone(),
        }
    }
}

/// Parses an RSS 2.0 document. Items without a title are skipped.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedEntry>, quick_xml::DeError> {
    let rss: Rss = from_str(&scrub_html_entities(xml))?;

    Ok(rss
        .channel
        .items
        .into_iter()
        .filter_map(|item| {
            let title = item.title.map(|t| html_to_text(&t)).filter(|t| !t.is_empty())?;
            Some(FeedEntry {
                title,
                link: non_empty(item.link),
                summary: item
                    .description
                    .map(|d| truncate(&html_to_text(&d), SUMMARY_LIMIT))
                    .filter(|s| !s.is_empty()),
                guid: non_empty(item.guid.and_then(|g| g.text)),
                source: non_empty(item.source.and_then(|s| s.text)),
                published_at: item.pub_date.as_deref().and_then(parse_pub_date),
            })
        })
        .collect())
}

/// Strips markup and collapses whitespace.
pub fn html_to_text(fragment: &str) -> String {
    if !fragment.contains('<') {
        return collapse_whitespace(fragment);
    }
    let html = Html::parse_fragment(fragment);
    let text: Vec<&str> = html.root_element().text().collect();
    collapse_whitespace(&text.join(" "))
}

fn parse_pub_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw.trim())
        .ok()
        .map(|ts| whole_seconds(ts.with_timezone(&Utc)))
        .or_else(|| parse_timestamp(raw))
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate(s: &str, limit: usize) -> String {
    match s.char_indices().nth(limit) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

// XML only knows five named entities; feeds routinely use HTML ones.
fn scrub_html_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
        .replace("&hellip;", "...")
}
