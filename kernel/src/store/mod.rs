// Dedup Store
//
// Durable record of which items have been forwarded, per source.
// Every mutating call persists the whole document before returning,
// so a successful `mark_posted` survives a crash and reload.
//
// The store owns its backing location for the duration of a run.
// There is no inter-process locking.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::clock::{Clock, SystemClock};
use crate::document::{format_timestamp, PostRecord, StoreDocument};
use crate::retention::RetentionPolicy;

pub mod backend;

pub use backend::{JsonFileBackend, LoadOutcome, StateBackend};

/// Errors surfaced by the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read store at {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to persist store to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode store document: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Per-source at-most-once bookkeeping with bounded retention.
///
/// If a mutating call returns `Err`, the in-memory state may already
/// include the change while disk does not. Treat the item as possibly
/// posted and make the next publish attempt idempotent. The store never
/// retries on its own.
pub struct DedupStore<B: StateBackend = JsonFileBackend> {
    backend: B,
    policy: RetentionPolicy,
    clock: Box<dyn Clock>,
    document: StoreDocument,
}

impl DedupStore<JsonFileBackend> {
    /// Open (or create) the store file at `path` using the system clock.
    pub fn open(path: impl AsRef<Path>, policy: RetentionPolicy) -> Result<Self, StoreError> {
        Self::with_backend(JsonFileBackend::new(path.as_ref()), policy, SystemClock)
    }
}

impl<B: StateBackend> DedupStore<B> {
    /// Load the document from `backend`.
    ///
    /// A missing or unreadable document yields an empty store, which is
    /// persisted immediately so the backing document exists afterwards.
    pub fn with_backend(
        backend: B,
        policy: RetentionPolicy,
        clock: impl Clock + 'static,
    ) -> Result<Self, StoreError> {
        let (document, fresh) = match backend.load()? {
            LoadOutcome::Found(document) => {
                tracing::info!(
                    location = %backend.location(),
                    sources = document.sources.len(),
                    "loaded store"
                );
                (document, false)
            }
            LoadOutcome::Missing => {
                tracing::info!(location = %backend.location(), "creating new store");
                (StoreDocument::default(), true)
            }
            LoadOutcome::Quarantined { .. } => (StoreDocument::default(), true),
        };

        let store = Self {
            backend,
            policy,
            clock: Box::new(clock),
            document,
        };

        if fresh {
            store.persist()?;
        }

        Ok(store)
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    pub fn document(&self) -> &StoreDocument {
        &self.document
    }

    /// Current time according to the store's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Whether `key` has been recorded for `source`.
    pub fn is_posted(&self, source: &str, key: &str) -> bool {
        self.document
            .source(source)
            .is_some_and(|state| state.contains(key))
    }

    /// Record a successful publish, evict, and persist.
    ///
    /// Call only after the publish succeeded. Recording a key twice
    /// appends a redundant entry; it is harmless to `is_posted`.
    pub fn mark_posted(
        &mut self,
        source: &str,
        key: &str,
        external_ref: &str,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();

        self.document
            .source_mut(source)
            .posted
            .push(PostRecord::new(key, external_ref, now));

        self.evict_source(source, now);
        self.persist()?;

        tracing::info!(source, key, external_ref, "marked as posted");
        Ok(())
    }

    /// Stamp the last completed pass for `source` and persist.
    pub fn update_last_run(&mut self, source: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.document.source_mut(source).last_run = Some(format_timestamp(at));
        self.persist()?;

        tracing::info!(source, last_run = %at, "updated last run");
        Ok(())
    }

    /// Last completed pass for `source`, if any.
    pub fn last_run(&self, source: &str) -> Option<DateTime<Utc>> {
        self.document.source(source).and_then(|state| state.last_run())
    }

    /// Apply the retention rule to `source`.
    ///
    /// Returns how many records were removed. Persists only when
    /// something changed.
    pub fn evict(&mut self, source: &str) -> Result<usize, StoreError> {
        if self.document.source(source).is_none() {
            return Ok(0);
        }

        let removed = self.evict_source(source, self.clock.now());
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Apply the retention rule to every source, with a single persist.
    pub fn evict_all(&mut self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let removed: usize = self
            .source_ids()
            .iter()
            .map(|source| self.evict_source(source, now))
            .sum();

        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Number of records currently held for `source`.
    pub fn posted_count(&self, source: &str) -> usize {
        self.document
            .source(source)
            .map_or(0, |state| state.posted.len())
    }

    /// Keys currently held for `source`, in insertion order.
    pub fn posted_keys(&self, source: &str) -> Vec<String> {
        self.document
            .source(source)
            .map(|state| state.posted.iter().map(|r| r.key.clone()).collect())
            .unwrap_or_default()
    }

    /// Known sources, sorted.
    pub fn source_ids(&self) -> Vec<String> {
        self.document.sources.keys().cloned().collect()
    }

    fn evict_source(&mut self, source: &str, now: DateTime<Utc>) -> usize {
        let Some(state) = self.document.sources.get_mut(source) else {
            return 0;
        };

        let before = state.posted.len();
        let records = std::mem::take(&mut state.posted);
        state.posted = self.policy.apply(records, now);

        let removed = before - state.posted.len();
        if removed > 0 {
            tracing::info!(source, removed, remaining = state.posted.len(), "evicted old entries");
        }
        removed
    }

    fn persist(&self) -> Result<(), StoreError> {
        self.backend.save(&self.document)
    }
}
