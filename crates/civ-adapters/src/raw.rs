use chrono::{DateTime, Utc};
use civ_core::parse_timestamp;
use serde_json::{Map, Value};
use tracing::warn;

/// One loosely-typed upstream record. Field lookup tries the exact key, then
/// its lower-case and upper-case forms, since some datasets mirror columns
/// under both spellings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord(Map<String, Value>);

impl RawRecord {
    /// `None` unless `value` is a JSON object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0
            .get(key)
            .or_else(|| self.0.get(&key.to_ascii_lowercase()))
            .or_else(|| self.0.get(&key.to_ascii_uppercase()))
            .filter(|v| !v.is_null())
    }

    /// Trimmed, non-empty text. Numbers and booleans are rendered as text.
    pub fn str(&self, key: &str) -> Option<String> {
        let text = match self.get(key)? {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return None,
        };
        (!text.is_empty()).then_some(text)
    }

    pub fn str_or(&self, key: &str, default: &str) -> String {
        self.str(key).unwrap_or_else(|| default.to_string())
    }

    pub fn f64(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .filter(|v: &f64| v.is_finite())
    }

    pub fn timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        self.str(key).as_deref().and_then(parse_timestamp)
    }

    /// The record as compact JSON, kept for audit.
    pub fn to_json(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }
}

/// Applies `normalize` to each record, dropping (and counting) the ones it rejects.
pub(crate) fn normalize_batch<T>(
    source_id: &'static str,
    records: &[RawRecord],
    normalize: impl Fn(&RawRecord) -> Option<T>,
) -> Vec<T> {
    let rows: Vec<T> = records.iter().filter_map(&normalize).collect();
    let dropped = records.len() - rows.len();
    if dropped > 0 {
        warn!(source_id, dropped, kept = rows.len(), "dropped records without a natural key or timestamp");
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_access_is_case_insensitive_with_explicit_defaults() {
        let record = RawRecord::from_value(json!({
            "STARFIRE_INCIDENT_ID": "2401",
            "highest_alarm_level": 3,
            "latitude": "40.7261",
            "longitude": "n/a",
            "zip": "   ",
            "closed": null
        }))
        .expect("object");

        assert_eq!(record.str("starfire_incident_id").as_deref(), Some("2401"));
        assert_eq!(record.str("HIGHEST_ALARM_LEVEL").as_deref(), Some("3"));
        assert_eq!(record.f64("latitude"), Some(40.7261));
        assert_eq!(record.f64("longitude"), None);
        assert_eq!(record.str("zip"), None);
        assert_eq!(record.str_or("closed", "Open"), "Open");
        assert!(RawRecord::from_value(json!([1, 2])).is_none());
    }
}
