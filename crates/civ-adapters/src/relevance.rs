use civ_core::{DistrictScope, FeedConfig};
use regex::Regex;

use crate::AdapterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Drop,
}

/// Decides whether a feed entry belongs to the configured scope.
///
/// Order of evaluation: an `exclude` match always drops; otherwise the entry
/// must be relevant (feed marked always-relevant, or any scope term appears
/// case-insensitively); a relevant entry matching `confirm` is kept, and one
/// matching neither pattern falls back to `keep_unmatched`.
#[derive(Debug, Clone)]
pub struct RelevanceFilter {
    terms: Vec<String>,
    always_relevant: bool,
    exclude: Option<Regex>,
    confirm: Option<Regex>,
    keep_unmatched: bool,
}

impl RelevanceFilter {
    pub fn for_feed(feed: &FeedConfig, scope: &DistrictScope) -> Result<Self, AdapterError> {
        let compile = |pattern: &Option<String>| -> Result<Option<Regex>, AdapterError> {
            pattern
                .as_deref()
                .map(Regex::new)
                .transpose()
                .map_err(|err| AdapterError::Malformed {
                    source_id: "relevance",
                    message: format!("feed {}: {err}", feed.key),
                })
        };

        Ok(Self {
            terms: scope_terms(scope),
            always_relevant: feed.always_relevant,
            exclude: compile(&feed.exclude_pattern)?,
            confirm: compile(&feed.confirm_pattern)?,
            keep_unmatched: feed.keep_unmatched,
        })
    }

    pub fn is_relevant(&self, text: &str) -> bool {
        if self.always_relevant {
            return true;
        }
        let haystack = text.to_lowercase();
        self.terms.iter().any(|term| haystack.contains(term.as_str()))
    }

    pub fn verdict(&self, text: &str) -> Verdict {
        if self.exclude.as_ref().is_some_and(|re| re.is_match(text)) {
            return Verdict::Drop;
        }
        if !self.is_relevant(text) {
            return Verdict::Drop;
        }
        let confirmed = self.confirm.as_ref().is_some_and(|re| re.is_match(text));
        if confirmed || self.keep_unmatched || self.confirm.is_none() {
            Verdict::Keep
        } else {
            Verdict::Drop
        }
    }
}

/// Lower-cased neighborhood names and ZIP codes of the district.
pub(crate) fn scope_terms(scope: &DistrictScope) -> Vec<String> {
    scope
        .neighborhoods
        .iter()
        .chain(scope.zips.iter())
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use civ_core::ScopeConfig;

    fn feed(key: &str) -> FeedConfig {
        let scope = ScopeConfig::default();
        scope
            .news_feeds
            .iter()
            .chain(scope.hyperlocal_feeds.iter())
            .find(|f| f.key == key)
            .cloned()
            .expect("feed")
    }

    #[test]
    fn neighborhood_terms_gate_non_specific_feeds() {
        let filter = RelevanceFilter::for_feed(&feed("gothamist"), &DistrictScope::default()).unwrap();
        assert_eq!(filter.verdict("New bike lanes in the EAST VILLAGE"), Verdict::Keep);
        assert_eq!(filter.verdict("Rent freeze vote, 10009 tenants react"), Verdict::Keep);
        assert_eq!(filter.verdict("Bronx zoo welcomes new penguins"), Verdict::Drop);

        let local = RelevanceFilter::for_feed(&feed("ev_grieve"), &DistrictScope::default()).unwrap();
        assert_eq!(local.verdict("Bronx zoo welcomes new penguins"), Verdict::Keep);
    }

    #[test]
    fn exclude_beats_confirm_and_unmatched_is_kept_by_default() {
        let filter = RelevanceFilter::for_feed(&feed("member_news"), &DistrictScope::default()).unwrap();
        assert_eq!(
            filter.verdict("Epstein files: financier's associates named, city council reacts"),
            Verdict::Drop
        );
        assert_eq!(
            filter.verdict("Council Member Epstein introduces tenant protection bill"),
            Verdict::Keep
        );
        assert_eq!(filter.verdict("Epstein attends ribbon cutting"), Verdict::Keep);
    }

    #[test]
    fn strict_mode_drops_unconfirmed_entries() {
        let mut strict = feed("member_news");
        strict.keep_unmatched = false;
        let filter = RelevanceFilter::for_feed(&strict, &DistrictScope::default()).unwrap();
        assert_eq!(filter.verdict("Epstein attends ribbon cutting"), Verdict::Drop);
        assert_eq!(filter.verdict("Epstein speaks at City Council hearing"), Verdict::Keep);
    }

    #[test]
    fn invalid_patterns_are_reported() {
        let mut broken = feed("member_news");
        broken.exclude_pattern = Some("(unclosed".into());
        assert!(RelevanceFilter::for_feed(&broken, &DistrictScope::default()).is_err());
    }
}
