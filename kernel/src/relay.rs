// Source Relay
//
// Runs one source pass against the dedup store:
// entry → key → already posted? → publish → record → last run
//
// Publishing is delegated to a `Publisher`. A publish failure leaves
// the entry unrecorded so a later run retries it. A store failure
// aborts the pass.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::store::{DedupStore, StateBackend, StoreError};

/// A feed item as handed over by a source enumerator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub id: Option<String>,
    pub link: Option<String>,
    pub title: Option<String>,
}

/// Stable dedup key for an entry.
///
/// Uses the entry id, then its link, then the SHA-256 of its title.
/// Returns `None` when the entry carries none of them.
pub fn entry_key(entry: &FeedEntry) -> Option<String> {
    let present = |field: &Option<String>| field.as_deref().filter(|v| !v.is_empty()).map(str::to_owned);

    if let Some(key) = present(&entry.id).or_else(|| present(&entry.link)) {
        return Some(key);
    }

    present(&entry.title).map(|title| {
        tracing::warn!("using title hash as entry key (no id or link)");
        hex::encode(Sha256::digest(title.as_bytes()))
    })
}

/// Downstream system that receives new entries.
pub trait Publisher {
    type Error: std::fmt::Display;

    /// Publish `entry` for `source`, returning the downstream reference.
    fn publish(&mut self, source: &str, entry: &FeedEntry) -> Result<String, Self::Error>;
}

/// Outcome counters for one source pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub posted: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Run one pass for `source`.
///
/// Stops after `limit` successful posts when a limit is given. The last
/// run is stamped even when nothing new was posted.
pub fn run_source<B, P, I>(
    store: &mut DedupStore<B>,
    source: &str,
    entries: I,
    publisher: &mut P,
    limit: Option<usize>,
) -> Result<RunSummary, RelayError>
where
    B: StateBackend,
    P: Publisher,
    I: IntoIterator<Item = FeedEntry>,
{
    let mut summary = RunSummary::default();

    for entry in entries {
        if limit.is_some_and(|max| summary.posted >= max) {
            break;
        }

        // 1. Derive key
        let Some(key) = entry_key(&entry) else {
            summary.skipped += 1;
            tracing::warn!(source, "skipping entry without id, link or title");
            continue;
        };

        // 2. Dedup
        if store.is_posted(source, &key) {
            summary.duplicates += 1;
            tracing::debug!(source, key = %key, "skipping already-posted entry");
            continue;
        }

        // 3. Publish, record only on success
        match publisher.publish(source, &entry) {
            Ok(external_ref) => {
                store.mark_posted(source, &key, &external_ref)?;
                summary.posted += 1;
            }
            Err(error) => {
                summary.failed += 1;
                tracing::error!(source, key = %key, %error, "failed to publish entry");
            }
        }
    }

    // 4. Stamp the pass
    let now = store.now();
    store.update_last_run(source, now)?;

    tracing::info!(
        source,
        posted = summary.posted,
        duplicates = summary.duplicates,
        failed = summary.failed,
        skipped = summary.skipped,
        "source pass complete"
    );

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retention::RetentionPolicy;
    use tempfile::tempdir;

    /// Publisher that records calls and fails for selected titles.
    #[derive(Default)]
    struct RecordingPublisher {
        calls: Vec<String>,
        fail_titles: Vec<String>,
    }

    impl Publisher for RecordingPublisher {
        type Error = String;

        fn publish(&mut self, source: &str, entry: &FeedEntry) -> Result<String, String> {
            let title = entry.title.clone().unwrap_or_default();
            self.calls.push(title.clone());
            if self.fail_titles.contains(&title) {
                return Err(format!("rejected {title}"));
            }
            Ok(format!("at://{source}/{}", self.calls.len()))
        }
    }

    fn entry(id: &str, title: &str) -> FeedEntry {
        FeedEntry {
            id: Some(id.into()),
            title: Some(title.into()),
            ..Default::default()
        }
    }

    #[test]
    fn key_prefers_id_then_link_then_title_hash() {
        let full = FeedEntry {
            id: Some("t3_abc".into()),
            link: Some("https://example.com/a".into()),
            title: Some("A".into()),
        };
        assert_eq!(entry_key(&full).as_deref(), Some("t3_abc"));

        let no_id = FeedEntry {
            id: Some(String::new()),
            ..full.clone()
        };
        assert_eq!(entry_key(&no_id).as_deref(), Some("https://example.com/a"));

        let title_only = FeedEntry {
            title: Some("hello".into()),
            ..Default::default()
        };
        assert_eq!(
            entry_key(&title_only).as_deref(),
            Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );

        assert_eq!(entry_key(&FeedEntry::default()), None);
    }

    #[test]
    fn run_posts_new_entries_and_skips_known_ones() {
        let dir = tempdir().unwrap();
        let mut store =
            DedupStore::open(dir.path().join("state.json"), RetentionPolicy::default()).unwrap();
        store.mark_posted("nba", "seen", "at://old").unwrap();

        let mut publisher = RecordingPublisher::default();
        let summary = run_source(
            &mut store,
            "nba",
            vec![entry("seen", "Seen"), entry("fresh", "Fresh"), FeedEntry::default()],
            &mut publisher,
            None,
        )
        .unwrap();

        assert_eq!(
            summary,
            RunSummary {
                posted: 1,
                duplicates: 1,
                failed: 0,
                skipped: 1
            }
        );
        assert_eq!(publisher.calls, vec!["Fresh".to_string()]);
        assert!(store.is_posted("nba", "fresh"));
        assert!(store.last_run("nba").is_some());
    }

    #[test]
    fn failed_publish_is_not_recorded() {
        let dir = tempdir().unwrap();
        let mut store =
            DedupStore::open(dir.path().join("state.json"), RetentionPolicy::default()).unwrap();

        let mut publisher = RecordingPublisher {
            fail_titles: vec!["Bad".into()],
            ..Default::default()
        };
        let summary = run_source(
            &mut store,
            "nba",
            vec![entry("bad", "Bad"), entry("good", "Good")],
            &mut publisher,
            None,
        )
        .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.posted, 1);
        assert!(!store.is_posted("nba", "bad"));
        assert!(store.is_posted("nba", "good"));
    }

    #[test]
    fn limit_caps_new_posts_per_run() {
        let dir = tempdir().unwrap();
        let mut store =
            DedupStore::open(dir.path().join("state.json"), RetentionPolicy::default()).unwrap();

        let mut publisher = RecordingPublisher::default();
        let entries = (0..5).map(|i| entry(&format!("id-{i}"), &format!("T{i}")));
        let summary = run_source(&mut store, "nba", entries, &mut publisher, Some(2)).unwrap();

        assert_eq!(summary.posted, 2);
        assert_eq!(store.posted_keys("nba"), vec!["id-0", "id-1"]);
    }

    #[test]
    fn empty_pass_still_stamps_last_run() {
        let dir = tempdir().unwrap();
        let mut store =
            DedupStore::open(dir.path().join("state.json"), RetentionPolicy::default()).unwrap();

        let mut publisher = RecordingPublisher::default();
        run_source(&mut store, "quiet", Vec::new(), &mut publisher, None).unwrap();

        assert!(store.last_run("quiet").is_some());
        assert_eq!(store.posted_count("quiet"), 0);
    }
}
