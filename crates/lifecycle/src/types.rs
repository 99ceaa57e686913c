use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One lifecycle rule's expiration clause: either a fixed number of
/// days since last-modified, or an absolute calendar date (§4.6
/// "bucket_lc_process").
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct Expiration {
    pub days: Option<u32>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub date: Option<OffsetDateTime>,
}

impl Expiration {
    pub fn is_set(&self) -> bool {
        self.days.is_some() || self.date.is_some()
    }
}

/// One lifecycle rule (§4.6 "Loads the bucket's LC policy blob").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LcRule {
    pub id: String,
    pub prefix: String,
    pub enabled: bool,
    /// All tags here must be present on an object for the rule to match.
    pub tag_filter: Vec<(String, String)>,
    pub expiration: Option<Expiration>,
    /// Non-current-version expiration, honored against the next-older
    /// version's mtime.
    pub noncur_expiration_days: Option<u32>,
    /// If set, a delete-marker that is the bucket's only remaining
    /// version is itself removed once this many days old.
    pub dm_expiration_days: Option<u32>,
    /// Multipart-upload abort threshold in days, 0 disables.
    pub mp_expiration_days: Option<u32>,
}

impl LcRule {
    pub fn matches_key_and_tags(&self, key: &str, tags: &[(String, String)]) -> bool {
        self.enabled && key.starts_with(&self.prefix) && self.tag_filter.iter().all(|(k, v)| tags.iter().any(|(tk, tv)| tk == k && tv == v))
    }
}

/// The bucket's full lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LcPolicy {
    pub rules: Vec<LcRule>,
}

/// Whether `mtime` has aged past `days` (§4.6 `obj_has_expired`).
pub fn obj_has_expired(mtime: OffsetDateTime, days: u32, now: OffsetDateTime) -> bool {
    now >= mtime + time::Duration::days(days as i64)
}

/// One queue entry's processing status (§4.6 step 5, step 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    Uninitial,
    Processing,
    Complete,
    Failed,
}

/// A bucket queued for lifecycle processing in one shard's omap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LcEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    pub status: EntryStatus,
}

impl LcEntry {
    pub fn reset(now: OffsetDateTime) -> Self {
        Self { start_time: now, status: EntryStatus::Uninitial }
    }
}

/// The result of one `bucket_lc_process` call, driving the entry's
/// next status (§4.6 step 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Complete,
    Failed,
    /// The bucket no longer exists; the queue entry should be removed.
    BucketGone,
}
