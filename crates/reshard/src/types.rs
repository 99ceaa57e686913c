use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Category an index entry is accounted under for per-shard copy
/// stats (§4.5 step 4 "Accumulate per-target ... by ObjCategory").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjCategory {
    Normal,
    MultipartPart,
}

/// One bucket-index entry as copied during a reshard (§4.5 step 4).
/// Multipart `.meta` objects carry `parent_head = None` (they hash on
/// their own key, same as a normal object); multipart *parts* carry
/// their head's key so they land on the same target shard as the
/// `.meta` they belong to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: String,
    pub instance: String,
    pub is_delete_marker: bool,
    pub parent_head: Option<String>,
    pub size: u64,
    pub size_rounded: u64,
    pub category: ObjCategory,
}

impl IndexEntry {
    /// The name hashed to pick a target shard.
    pub fn hash_key(&self) -> &str {
        self.parent_head.as_deref().unwrap_or(&self.key)
    }
}

/// One shard-count generation (`{gen, num_shards}`, §4.5 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketLayout {
    pub gen: u64,
    pub num_shards: u32,
}

/// A retired index generation still referenced by a syncing peer, so
/// `can_reshard`/`commit_reshard` know it can't be dropped yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLayout {
    pub gen: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ReshardingState {
    #[default]
    None,
    InProgress,
}

/// The persisted per-bucket reshard state (§4.5 steps 2 & 5). One
/// object per bucket, CAS-updated throughout the protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketReshardLayout {
    pub current: BucketLayout,
    pub target: Option<BucketLayout>,
    pub logs: Vec<LogLayout>,
    pub resharding: ReshardingState,
}

impl BucketReshardLayout {
    pub fn initial(num_shards: u32) -> Self {
        Self {
            current: BucketLayout { gen: 0, num_shards },
            target: None,
            logs: vec![LogLayout { gen: 0 }],
            resharding: ReshardingState::None,
        }
    }
}

/// Per-target-shard, per-category accumulated copy stats (§4.5 step
/// 4), committed with each flushed batch via a compound "update stats"
/// op.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStats {
    pub num_entries: u64,
    pub total_size: u64,
    pub total_size_rounded: u64,
    pub actual_size: u64,
}

impl ShardStats {
    pub fn accumulate(&mut self, entry: &IndexEntry) {
        self.num_entries += 1;
        self.total_size += entry.size;
        self.total_size_rounded += entry.size_rounded;
        self.actual_size += entry.size;
    }
}

/// A queue entry's processing status (§4.5 "Reshard queue"); `Failed`
/// entries are retained rather than removed so an operator can inspect
/// and retry them by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReshardEntryStatus {
    Uninitial,
    InProgress,
    Done,
    Failed,
}

/// A pending reshard queue entry (§4.5 "Reshard queue").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReshardQueueEntry {
    pub tenant: String,
    pub bucket_name: String,
    pub bucket_id: String,
    pub new_num_shards: u32,
    pub old_num_shards: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    pub status: ReshardEntryStatus,
}

impl ReshardQueueEntry {
    pub fn new(tenant: impl Into<String>, bucket_name: impl Into<String>, bucket_id: impl Into<String>, old_num_shards: u32, new_num_shards: u32, now: OffsetDateTime) -> Self {
        Self {
            tenant: tenant.into(),
            bucket_name: bucket_name.into(),
            bucket_id: bucket_id.into(),
            new_num_shards,
            old_num_shards,
            time: now,
            status: ReshardEntryStatus::Uninitial,
        }
    }
}
