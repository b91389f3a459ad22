//! Geographic/entity scope and feed configuration.
//!
//! Every field has a default describing the reference district, so a partial
//! YAML file only needs to override what differs.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        lat > self.min_lat && lat < self.max_lat && lng > self.min_lng && lng < self.max_lng
    }

    /// SoQL predicate over the given coordinate columns.
    pub fn soql(&self, lat_field: &str, lng_field: &str) -> String {
        format!(
            "{lat_field} > {} AND {lat_field} < {} AND {lng_field} > {} AND {lng_field} < {}",
            self.min_lat, self.max_lat, self.min_lng, self.max_lng
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistrictScope {
    pub name: String,
    pub council_district: u32,
    /// HPD borough id (1 = Manhattan).
    pub borough_id: String,
    pub zips: Vec<String>,
    pub neighborhoods: Vec<String>,
    pub bbox: BoundingBox,
}

impl Default for DistrictScope {
    fn default() -> Self {
        Self {
            name: "NYC Council District 2".to_string(),
            council_district: 2,
            borough_id: "1".to_string(),
            zips: ["10002", "10003", "10009", "10010", "10016", "10017", "10012"]
                .map(String::from)
                .to_vec(),
            neighborhoods: [
                "Lower East Side",
                "East Village",
                "Greenwich Village",
                "NoHo",
                "Gramercy",
                "Kips Bay",
                "Murray Hill",
                "Stuyvesant Town",
                "Peter Cooper Village",
                "Alphabet City",
                "Flatiron",
                "Union Square",
                "Midtown South",
            ]
            .map(String::from)
            .to_vec(),
            bbox: BoundingBox {
                min_lat: 40.715,
                max_lat: 40.748,
                min_lng: -74.003,
                max_lng: -73.970,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocrataConfig {
    pub base_url: String,
    pub page_size: usize,
    pub max_pages: usize,
    pub fdny_incidents: String,
    pub nypd_complaints: String,
    pub requests_311: String,
    pub calls_911: String,
    pub hpd_violations: String,
    pub hpd_complaints: String,
    pub hpd_contacts: String,
    pub hpd_buildings: String,
}

impl Default for SocrataConfig {
    fn default() -> Self {
        Self {
            base_url: "https://data.cityofnewyork.us/resource".to_string(),
            page_size: 5000,
            max_pages: 10,
            fdny_incidents: "8m42-w767".to_string(),
            // Published quarterly; expect a multi-week lag.
            nypd_complaints: "5uac-w243".to_string(),
            requests_311: "erm2-nwe9".to_string(),
            calls_911: "n2zq-pubd".to_string(),
            hpd_violations: "csn4-vhvf".to_string(),
            hpd_complaints: "ygpa-z7cr".to_string(),
            hpd_contacts: "feu5-w2e2".to_string(),
            hpd_buildings: "kj4p-ruqc".to_string(),
        }
    }
}

impl SocrataConfig {
    pub fn dataset_url(&self, dataset_id: &str) -> String {
        format!("{}/{}.json", self.base_url.trim_end_matches('/'), dataset_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub key: String,
    pub name: String,
    pub url: String,
    /// Skip the neighborhood-term relevance check for this feed.
    pub always_relevant: bool,
    /// Feed follows the tracked entity (council member) rather than a place.
    pub topic_related: bool,
    pub district: bool,
    /// Entries matching this regex are dropped even when otherwise relevant.
    pub exclude_pattern: Option<String>,
    /// Entries matching this regex are kept.
    pub confirm_pattern: Option<String>,
    /// Fate of entries matching neither pattern. Kept by default, which can
    /// over-include for ambiguous names.
    pub keep_unmatched: bool,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            name: String::new(),
            url: String::new(),
            always_relevant: false,
            topic_related: false,
            district: false,
            exclude_pattern: None,
            confirm_pattern: None,
            keep_unmatched: true,
        }
    }
}

impl FeedConfig {
    fn google_news(key: &str, query: &str, topic_related: bool, district: bool) -> Self {
        let disambiguate = topic_related;
        Self {
            key: key.to_string(),
            name: "Google News".to_string(),
            url: format!("https://news.google.com/rss/search?q={query}&hl=en-US&gl=US&ceid=US:en"),
            always_relevant: true,
            topic_related,
            district,
            exclude_pattern: disambiguate.then(|| {
                r"(?i)(weinstein|jeffrey\s+epstein|sex\s+traffick|convicted\s+sex|epstein\s+island|ghislaine|maxwell|financier|pedophil)".to_string()
            }),
            confirm_pattern: disambiguate.then(|| {
                r"(?i)(council\s*member|city\s+council|district\s*2|assembly|lower\s+east\s+side|east\s+village|legislat|housing|tenant|nyc\s+council|new\s+york\s+city\s+council)".to_string()
            }),
            keep_unmatched: true,
        }
    }

    fn hyperlocal(key: &str, name: &str, url: &str, neighborhood_specific: bool) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            url: url.to_string(),
            always_relevant: neighborhood_specific,
            topic_related: false,
            district: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSchedule {
    pub job: String,
    pub interval_minutes: u64,
    /// Steady-state lookback window for each run.
    pub lookback_hours: i64,
}

impl JobSchedule {
    pub fn new(job: &str, interval_minutes: u64, lookback_hours: i64) -> Self {
        Self {
            job: job.to_string(),
            interval_minutes,
            lookback_hours,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    pub district: DistrictScope,
    pub socrata: SocrataConfig,
    pub news_feeds: Vec<FeedConfig>,
    pub hyperlocal_feeds: Vec<FeedConfig>,
    pub notify_feed: FeedConfig,
    pub legistar_base: String,
    pub sponsor_name: String,
    /// Maximum distinct foreign keys resolved per adapter run.
    pub enrichment_cap: usize,
    pub enrichment_concurrency: usize,
    pub schedule: Vec<JobSchedule>,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            district: DistrictScope::default(),
            socrata: SocrataConfig::default(),
            news_feeds: vec![
                FeedConfig::google_news(
                    "district_news",
                    "%22District+2%22+%22City+Council%22+NYC",
                    false,
                    true,
                ),
                FeedConfig::google_news(
                    "member_news",
                    "%22Harvey+Epstein%22+%22Council+Member%22+NYC+-Weinstein+-Jeffrey+-trafficking",
                    true,
                    false,
                ),
                FeedConfig::google_news(
                    "member_news_alt",
                    "%22Harvey+Epstein%22+%22District+2%22+NYC+-Weinstein+-Jeffrey",
                    true,
                    false,
                ),
                FeedConfig::google_news(
                    "neighborhood_news",
                    "(%22Lower+East+Side%22+OR+%22East+Village%22+OR+%22Greenwich+Village%22+OR+%22Midtown+South%22+OR+%22Flatiron%22+OR+%22Union+Square%22+OR+%22Gramercy%22+OR+%22Murray+Hill%22+OR+%22Kips+Bay%22)+NYC",
                    false,
                    true,
                ),
            ],
            hyperlocal_feeds: vec![
                FeedConfig::hyperlocal(
                    "ev_grieve",
                    "EV Grieve",
                    "https://evgrieve.com/feeds/posts/default?alt=rss",
                    true,
                ),
                FeedConfig::hyperlocal(
                    "the_lodown",
                    "The Lo-Down",
                    "https://www.thelodownny.com/leslog/feed/",
                    true,
                ),
                FeedConfig::hyperlocal("the_city", "THE CITY", "https://www.thecity.nyc/feed", false),
                FeedConfig::hyperlocal("gothamist", "Gothamist", "https://gothamist.com/feed", false),
                FeedConfig::hyperlocal(
                    "amny_manhattan",
                    "amNewYork",
                    "https://www.amny.com/new-york/manhattan/feed",
                    false,
                ),
            ],
            notify_feed: FeedConfig {
                key: "notify_nyc".to_string(),
                name: "Notify NYC".to_string(),
                url: "https://a858-nycnotify.nyc.gov/RSS/NotifyNYC?lang=en".to_string(),
                district: true,
                ..FeedConfig::default()
            },
            legistar_base: "https://webapi.legistar.com/v1/nyc".to_string(),
            sponsor_name: "Harvey Epstein".to_string(),
            enrichment_cap: 200,
            enrichment_concurrency: 8,
            schedule: vec![
                JobSchedule::new("fdny", 15, 1),
                JobSchedule::new("nypd", 30, 2),
                JobSchedule::new("311", 15, 1),
                JobSchedule::new("911", 15, 2),
                JobSchedule::new("notify", 5, 24),
                JobSchedule::new("hyperlocal", 30, 24 * 7),
                JobSchedule::new("news", 30, 24 * 7),
                JobSchedule::new("hpd_violations", 360, 24 * 7),
                JobSchedule::new("hpd_complaints", 360, 24 * 7),
                JobSchedule::new("legislation", 360, 24 * 365),
                JobSchedule::new("aggregate", 1440, 24 * 30),
            ],
        }
    }
}

impl ScopeConfig {
    pub fn schedule_for(&self, job: &str) -> Option<&JobSchedule> {
        self.schedule.iter().find(|s| s.job == job)
    }
}
