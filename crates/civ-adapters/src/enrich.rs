use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use civ_core::OwnerContacts;
use futures::stream::{self, StreamExt};
use tracing::{debug, info};

use crate::raw::RawRecord;
use crate::socrata::SocrataClient;
use crate::AdapterError;

/// Secondary lookup of one foreign key against another dataset.
#[async_trait]
pub trait Lookup: Send + Sync {
    type Output: Clone + Send + Sync;

    fn name(&self) -> &'static str;

    /// `Ok(None)` when the key is known not to resolve.
    async fn lookup(&self, key: &str) -> Result<Option<Self::Output>, AdapterError>;
}

/// Run-local, capped, memoizing resolver.
///
/// At most `cap` distinct keys are looked up per run, in order of first
/// appearance. Keys past the cap and keys whose lookup fails twice resolve to
/// `None`.
pub struct Resolver<L: Lookup> {
    lookup: L,
    cap: usize,
    concurrency: usize,
    cache: HashMap<String, Option<L::Output>>,
    issued: AtomicUsize,
}

impl<L: Lookup> Resolver<L> {
    pub fn new(lookup: L, cap: usize, concurrency: usize) -> Self {
        Self {
            lookup,
            cap,
            concurrency: concurrency.max(1),
            cache: HashMap::new(),
            issued: AtomicUsize::new(0),
        }
    }

    pub async fn resolve_all<'a, I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let remaining = self.cap.saturating_sub(self.cache.len());
        let mut seen = HashSet::new();
        let distinct: Vec<String> = keys
            .into_iter()
            .map(str::trim)
            .filter(|k| !k.is_empty() && !self.cache.contains_key(*k) && seen.insert(*k))
            .map(str::to_string)
            .collect();
        let skipped = distinct.len().saturating_sub(remaining);
        let pending: Vec<String> = distinct.into_iter().take(remaining).collect();
        if pending.is_empty() && skipped == 0 {
            return;
        }

        let lookup = &self.lookup;
        let issued = &self.issued;
        let resolved: Vec<(String, Option<L::Output>)> = stream::iter(pending)
            .map(|key| async move {
                let value = resolve_with_retry(lookup, issued, &key).await;
                (key, value)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let hits = resolved.iter().filter(|(_, v)| v.is_some()).count();
        info!(
            lookup = self.lookup.name(),
            attempted = resolved.len(),
            hits,
            skipped,
            "enrichment resolved"
        );
        self.cache.extend(resolved);
    }

    pub fn get(&self, key: &str) -> Option<&L::Output> {
        self.cache.get(key.trim()).and_then(Option::as_ref)
    }

    /// Lookup calls issued so far, retries included.
    pub fn lookups_issued(&self) -> usize {
        self.issued.load(Ordering::Relaxed)
    }
}

async fn resolve_with_retry<L: Lookup>(
    lookup: &L,
    issued: &AtomicUsize,
    key: &str,
) -> Option<L::Output> {
    for attempt in 0..2 {
        issued.fetch_add(1, Ordering::Relaxed);
        match lookup.lookup(key).await {
            Ok(value) => return value,
            Err(err) => debug!(lookup = lookup.name(), key, attempt, error = %err, "lookup failed"),
        }
    }
    None
}

fn sanitized_key(key: &str) -> Option<&str> {
    let key = key.trim();
    (!key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric())).then_some(key)
}

const CONTACT_TYPES: &str =
    "'CorporateOwner','IndividualOwner','JointOwner','HeadOfficer','Officer','Agent','SiteManager'";

/// Registration id to owner contacts.
pub struct ContactLookup {
    client: SocrataClient,
}

impl ContactLookup {
    pub fn new(client: SocrataClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Lookup for ContactLookup {
    type Output = OwnerContacts;

    fn name(&self) -> &'static str {
        "registration_contacts"
    }

    async fn lookup(&self, key: &str) -> Result<Option<OwnerContacts>, AdapterError> {
        let Some(key) = sanitized_key(key) else {
            return Ok(None);
        };
        let predicate = format!("registrationid='{key}' AND type IN({CONTACT_TYPES})");
        let dataset = self.client.config().hpd_contacts.clone();
        let contacts = self
            .client
            .lookup_rows(&dataset, &[("$where", predicate.as_str())], 10)
            .await?;
        Ok(select_owner(&contacts))
    }
}

/// Building id to `(latitude, longitude)`.
pub struct BuildingLookup {
    client: SocrataClient,
}

impl BuildingLookup {
    pub fn new(client: SocrataClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Lookup for BuildingLookup {
    type Output = (f64, f64);

    fn name(&self) -> &'static str {
        "buildings"
    }

    async fn lookup(&self, key: &str) -> Result<Option<(f64, f64)>, AdapterError> {
        let Some(key) = sanitized_key(key) else {
            return Ok(None);
        };
        let dataset = self.client.config().hpd_buildings.clone();
        let rows = self
            .client
            .lookup_rows(&dataset, &[("buildingid", key)], 1)
            .await?;
        Ok(rows
            .first()
            .and_then(|row| Some((row.f64("latitude")?, row.f64("longitude")?))))
    }
}

fn full_name(contact: &RawRecord) -> Option<String> {
    let name = [contact.str("firstname"), contact.str("lastname")]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    (!name.is_empty()).then_some(name)
}

fn display_name(contact: &RawRecord) -> Option<String> {
    contact.str("corporationname").or_else(|| full_name(contact))
}

/// Picks the registered owner among a registration's contacts:
/// CorporateOwner, then IndividualOwner, then any other contact. A corporate
/// name is preferred over a person's full name. `None` only when there are
/// no contacts at all.
pub fn select_owner(contacts: &[RawRecord]) -> Option<OwnerContacts> {
    if contacts.is_empty() {
        return None;
    }
    let of_type = |kind: &str| {
        contacts
            .iter()
            .find(|c| c.str("type").is_some_and(|t| t.eq_ignore_ascii_case(kind)))
    };

    let owner = of_type("CorporateOwner")
        .or_else(|| of_type("IndividualOwner"))
        .or_else(|| contacts.first());

    Some(OwnerContacts {
        owner_name: Some(
            owner
                .and_then(display_name)
                .unwrap_or_else(|| "Unknown".to_string()),
        ),
        owner_type: owner.and_then(|c| c.str("type")),
        corporation_name: of_type("CorporateOwner").and_then(|c| c.str("corporationname")),
        head_officer: of_type("HeadOfficer").and_then(full_name),
        officer: of_type("Officer").and_then(full_name),
        managing_agent: of_type("Agent").and_then(display_name),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Counting {
        fail_first: HashSet<String>,
        always_fail: HashSet<String>,
        calls: std::sync::Mutex<Vec<String>>,
    }

    impl Counting {
        fn new() -> Self {
            Self {
                fail_first: HashSet::new(),
                always_fail: HashSet::new(),
                calls: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Lookup for Counting {
        type Output = String;

        fn name(&self) -> &'static str {
            "counting"
        }

        async fn lookup(&self, key: &str) -> Result<Option<String>, AdapterError> {
            let previous = {
                let mut calls = self.calls.lock().unwrap();
                let previous = calls.iter().filter(|k| k.as_str() == key).count();
                calls.push(key.to_string());
                previous
            };
            let unavailable = AdapterError::Malformed {
                source_id: "test",
                message: "unavailable".into(),
            };
            if self.always_fail.contains(key) || (previous == 0 && self.fail_first.contains(key)) {
                return Err(unavailable);
            }
            Ok(Some(format!("owner-of-{key}")))
        }
    }

    #[tokio::test]
    async fn cap_bounds_distinct_lookups() {
        let keys: Vec<String> = (0..500).map(|i| format!("{i}")).collect();
        let mut resolver = Resolver::new(Counting::new(), 200, 8);
        resolver.resolve_all(keys.iter().map(String::as_str)).await;

        assert_eq!(resolver.lookups_issued(), 200);
        let resolved = keys.iter().filter(|k| resolver.get(k).is_some()).count();
        assert_eq!(resolved, 200);
        assert!(keys[..200].iter().all(|k| resolver.get(k).is_some()));
        assert!(keys[200..].iter().all(|k| resolver.get(k).is_none()));

        resolver.resolve_all(keys.iter().map(String::as_str)).await;
        assert_eq!(resolver.lookups_issued(), 200);
    }

    #[tokio::test]
    async fn repeated_keys_are_looked_up_once() {
        let mut resolver = Resolver::new(Counting::new(), 200, 4);
        resolver.resolve_all(["7", "7", " 7 ", "8", "", "7"]).await;
        assert_eq!(resolver.lookups_issued(), 2);
        assert_eq!(resolver.get("7").map(String::as_str), Some("owner-of-7"));
    }

    #[tokio::test]
    async fn failures_retry_once_then_resolve_to_unknown() {
        let mut lookup = Counting::new();
        lookup.fail_first.insert("flaky".into());
        lookup.always_fail.insert("down".into());
        let mut resolver = Resolver::new(lookup, 10, 1);
        resolver.resolve_all(["flaky", "down", "ok"]).await;

        assert_eq!(resolver.lookups_issued(), 5);
        assert_eq!(resolver.get("flaky").map(String::as_str), Some("owner-of-flaky"));
        assert_eq!(resolver.get("down"), None);
        assert_eq!(resolver.get("ok").map(String::as_str), Some("owner-of-ok"));
    }

    fn contact(value: serde_json::Value) -> RawRecord {
        RawRecord::from_value(value).unwrap()
    }

    #[test]
    fn owner_precedence_prefers_corporate_names() {
        let contacts = vec![
            contact(json!({"type": "Agent", "corporationname": "ACME MGMT"})),
            contact(json!({"type": "IndividualOwner", "firstname": "JANE", "lastname": "DOE"})),
            contact(json!({"type": "HeadOfficer", "firstname": "JOHN", "lastname": "ROE"})),
            contact(json!({"type": "CorporateOwner", "corporationname": "123 AVE B LLC"})),
        ];
        let owner = select_owner(&contacts).unwrap();
        assert_eq!(owner.owner_name.as_deref(), Some("123 AVE B LLC"));
        assert_eq!(owner.owner_type.as_deref(), Some("CorporateOwner"));
        assert_eq!(owner.corporation_name.as_deref(), Some("123 AVE B LLC"));
        assert_eq!(owner.head_officer.as_deref(), Some("JOHN ROE"));
        assert_eq!(owner.managing_agent.as_deref(), Some("ACME MGMT"));

        let individual = select_owner(&contacts[..2]).unwrap();
        assert_eq!(individual.owner_name.as_deref(), Some("JANE DOE"));
        assert_eq!(individual.corporation_name, None);

        let nameless = select_owner(&[contact(json!({"type": "SiteManager"}))]).unwrap();
        assert_eq!(nameless.owner_name.as_deref(), Some("Unknown"));
        assert!(select_owner(&[]).is_none());
    }
}
