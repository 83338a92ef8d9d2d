// Retention Policy
//
// Bounds per-source history by age and by count. The pass is pure:
// it takes a record list and "now", and returns what survives.
//
// Order of application:
// 1. drop records older than `now - max_age_days`
// 2. keep the `max_count` newest of the remainder

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::document::PostRecord;

/// Retention limits, supplied by the enclosing process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Records older than this many days are dropped.
    pub max_age_days: u32,

    /// Upper bound on records kept per source.
    pub max_count: usize,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RetentionError {
    #[error("max_age_days must be a positive integer")]
    ZeroMaxAge,

    #[error("max_count must be a positive integer")]
    ZeroMaxCount,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age_days: 30,
            max_count: 100,
        }
    }
}

impl RetentionPolicy {
    pub fn new(max_age_days: u32, max_count: usize) -> Result<Self, RetentionError> {
        let policy = Self {
            max_age_days,
            max_count,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), RetentionError> {
        if self.max_age_days == 0 {
            return Err(RetentionError::ZeroMaxAge);
        }
        if self.max_count == 0 {
            return Err(RetentionError::ZeroMaxCount);
        }
        Ok(())
    }

    /// Oldest `posted_at` still inside the retention window.
    ///
    /// A window reaching past the earliest representable time has no
    /// cutoff.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        Duration::try_days(i64::from(self.max_age_days))
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Apply the retention rule to one source's records.
    ///
    /// Records with an unparsable timestamp are dropped. Among equal
    /// timestamps the later-inserted record counts as newer. Survivors
    /// keep their insertion order.
    pub fn apply(&self, records: Vec<PostRecord>, now: DateTime<Utc>) -> Vec<PostRecord> {
        let cutoff = self.cutoff(now);

        let mut fresh: Vec<(usize, DateTime<Utc>, PostRecord)> = records
            .into_iter()
            .enumerate()
            .filter_map(|(position, record)| match record.posted_at() {
                Some(at) if at >= cutoff => Some((position, at, record)),
                Some(_) => None,
                None => {
                    tracing::warn!(
                        key = %record.key,
                        posted_at = %record.posted_at,
                        "dropping record with invalid timestamp"
                    );
                    None
                }
            })
            .collect();

        if fresh.len() > self.max_count {
            fresh.sort_by(|a, b| b.1.cmp(&a.1).then(b.0.cmp(&a.0)));
            fresh.truncate(self.max_count);
            fresh.sort_by_key(|(position, _, _)| *position);
        }

        fresh.into_iter().map(|(_, _, record)| record).collect()
    }
}
