// Persisted Document Model
//
// Serde model of the on-disk store document. Timestamps are kept as
// the raw strings found on disk and parsed on demand, so one malformed
// value never prevents the rest of the document from loading.
//
// Unknown fields at every level are captured and written back untouched.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Identifier of an upstream feed or channel.
pub type SourceId = String;

/// One forwarded item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostRecord {
    #[serde(alias = "guid")]
    pub key: String,

    /// Opaque identifier returned by the publisher. Never interpreted.
    #[serde(default, alias = "post_uri")]
    pub external_ref: String,

    #[serde(default, alias = "posted_at", deserialize_with = "lenient_timestamp")]
    pub posted_at: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PostRecord {
    pub fn new(key: impl Into<String>, external_ref: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            external_ref: external_ref.into(),
            posted_at: format_timestamp(at),
            extra: Map::new(),
        }
    }

    /// Recording time, or `None` if the stored value is unparsable.
    pub fn posted_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.posted_at)
    }
}

/// Per-source history and last completed pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceState {
    #[serde(default, alias = "posted_guids")]
    pub posted: Vec<PostRecord>,

    #[serde(
        default,
        alias = "last_successful_run",
        deserialize_with = "lenient_optional_timestamp"
    )]
    pub last_run: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SourceState {
    pub fn contains(&self, key: &str) -> bool {
        self.posted.iter().any(|record| record.key == key)
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        self.last_run.as_deref().and_then(parse_timestamp)
    }
}

/// Top-level persisted document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default, alias = "feeds")]
    pub sources: BTreeMap<SourceId, SourceState>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StoreDocument {
    pub fn source(&self, source: &str) -> Option<&SourceState> {
        self.sources.get(source)
    }

    /// Mutable access, creating an empty entry for an unknown source.
    pub fn source_mut(&mut self, source: &str) -> &mut SourceState {
        self.sources.entry(source.to_owned()).or_default()
    }
}

// A non-string timestamp becomes an empty (unparsable) one instead of
// failing the whole document; eviction drops the record later.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_optional_timestamp(deserializer)?.unwrap_or_default())
}

fn lenient_optional_timestamp<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(raw) => Ok(Some(raw)),
        Value::Null => Ok(None),
        other => {
            tracing::warn!(value = %other, "ignoring non-string timestamp");
            Ok(None)
        }
    }
}

/// Canonical timestamp encoding: RFC 3339 in UTC with a `Z` suffix.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parse an RFC 3339 timestamp, or a zone-less ISO 8601 one as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_canonical_and_legacy_timestamps() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 12, 30, 0).unwrap();

        assert_eq!(parse_timestamp("2024-01-01T12:30:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01T14:30:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01T12:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01T12:30:00.000000"), Some(expected));
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn format_then_parse_is_lossless() {
        let at = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        assert_eq!(parse_timestamp(&format_timestamp(at)), Some(at));
    }

    #[test]
    fn legacy_field_names_are_accepted() {
        let json = r#"
        {
          "feeds": {
            "nba": {
              "posted_guids": [
                { "guid": "t3_abc", "post_uri": "at://post/1", "posted_at": "2024-01-01T00:00:00" }
              ],
              "last_successful_run": "2024-01-02T00:00:00"
            }
          }
        }
        "#;

        let doc: StoreDocument = serde_json::from_str(json).unwrap();
        let nba = doc.source("nba").unwrap();

        assert!(nba.contains("t3_abc"));
        assert_eq!(nba.posted[0].external_ref, "at://post/1");
        assert!(nba.posted[0].posted_at().is_some());
        assert!(nba.last_run().is_some());
    }

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let json = r#"
        {
          "version": 3,
          "sources": {
            "kagi": {
              "posted": [
                { "key": "k1", "externalRef": "r1", "postedAt": "2024-01-01T00:00:00Z", "title": "hello" }
              ],
              "lastRun": null,
              "cursor": "abc"
            }
          }
        }
        "#;

        let doc: StoreDocument = serde_json::from_str(json).unwrap();
        let reencoded = serde_json::to_string(&doc).unwrap();
        let again: StoreDocument = serde_json::from_str(&reencoded).unwrap();

        assert_eq!(doc, again);
        assert_eq!(again.extra["version"], 3);
        assert_eq!(again.sources["kagi"].extra["cursor"], "abc");
        assert_eq!(again.sources["kagi"].posted[0].extra["title"], "hello");
    }

    #[test]
    fn non_string_timestamps_load_as_unparsable() {
        let json = r#"
        {
          "sources": {
            "a": {
              "posted": [
                { "key": "null-ts", "postedAt": null },
                { "key": "numeric-ts", "postedAt": 1700000000 },
                { "key": "good", "postedAt": "2024-01-01T00:00:00Z" }
              ],
              "lastRun": 1700000000
            },
            "b": { "posted": [], "lastRun": { "at": "2024-01-01" } }
          }
        }
        "#;

        let doc: StoreDocument = serde_json::from_str(json).unwrap();
        let a = &doc.sources["a"];

        assert!(a.posted[0].posted_at().is_none());
        assert!(a.posted[1].posted_at().is_none());
        assert!(a.posted[2].posted_at().is_some());
        assert_eq!(a.last_run, None);
        assert_eq!(doc.sources["b"].last_run, None);
    }

    #[test]
    fn record_without_timestamp_still_loads() {
        let json = r#"{ "sources": { "a": { "posted": [ { "key": "x" } ] } } }"#;

        let doc: StoreDocument = serde_json::from_str(json).unwrap();
        let record = &doc.sources["a"].posted[0];

        assert_eq!(record.key, "x");
        assert!(record.posted_at().is_none());
    }
}
