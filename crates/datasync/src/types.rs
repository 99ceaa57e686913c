use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Per-source-zone, per-data-log-shard sync cursor (§3 "Sync marker").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMarker {
    pub state: ShardSyncState,
    pub marker: String,
    pub next_step_marker: String,
    pub pos: u64,
    pub total_entries: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl SyncMarker {
    pub fn init_full_sync(next_step_marker: String, timestamp: OffsetDateTime) -> Self {
        Self {
            state: ShardSyncState::FullSync,
            marker: String::new(),
            next_step_marker,
            pos: 0,
            total_entries: 0,
            timestamp,
        }
    }

    /// The marker a trim coordinator may safely advance past (§4.4.11):
    /// `next_step_marker` while still in full sync, else the live marker.
    pub fn stable_marker(&self) -> &str {
        match self.state {
            ShardSyncState::FullSync => &self.next_step_marker,
            ShardSyncState::IncrementalSync => &self.marker,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardSyncState {
    FullSync,
    IncrementalSync,
}

/// Top-level per-source-zone sync_info (§4.4.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceZoneSyncInfo {
    pub state: SourceSyncState,
    pub num_shards: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceSyncState {
    Init,
    BuildingFullSyncMaps,
    Sync,
}

/// Per-destination-bucket sync status (§3 "Bucket sync status").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketSyncStatus {
    pub state: BucketSyncState,
    pub incremental_gen: u64,
    pub shards_done_with_gen: Vec<bool>,
}

impl BucketSyncStatus {
    pub fn init(num_shards: usize) -> Self {
        Self {
            state: BucketSyncState::Init,
            incremental_gen: 0,
            shards_done_with_gen: vec![false; num_shards],
        }
    }

    /// Marks `shard_id` done for the current generation; if every shard
    /// has now reported, clears the vector and advances
    /// `incremental_gen` to `next_gen` (§4.4.8 step 5).
    pub fn mark_shard_done(&mut self, shard_id: usize, next_gen: u64) -> bool {
        if shard_id < self.shards_done_with_gen.len() {
            self.shards_done_with_gen[shard_id] = true;
        }
        let all_done = !self.shards_done_with_gen.is_empty() && self.shards_done_with_gen.iter().all(|b| *b);
        if all_done {
            self.incremental_gen = next_gen;
            self.shards_done_with_gen.iter_mut().for_each(|b| *b = false);
        }
        all_done
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketSyncState {
    Init,
    Full,
    Incremental,
    Stopped,
}

/// Per-bucket-shard incremental position within one generation (§3
/// "Per-bucket-shard incremental marker").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketShardMarker {
    pub position: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// A single remote bilog (bucket-index log) entry, decoded from the
/// peer's `/admin/log?type=bucket-index` response (§6.2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BilogEntry {
    pub log_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub object: String,
    pub instance: String,
    pub op: BilogOp,
    pub olh_epoch: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BilogOp {
    Add,
    LinkOlh,
    LinkOlhDm,
    Del,
    UnlinkInstance,
    SyncStop,
    Resync,
    Cancel,
}

impl BilogOp {
    /// §4.4.8 step 3: entries that never reach a sync obligation but
    /// still advance the high marker.
    pub fn is_skipped(&self) -> bool {
        matches!(self, BilogOp::SyncStop | BilogOp::Resync | BilogOp::Cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_marker_prefers_next_step_in_full_sync() {
        let m = SyncMarker {
            state: ShardSyncState::FullSync,
            marker: "m".into(),
            next_step_marker: "nsm".into(),
            pos: 0,
            total_entries: 0,
            timestamp: OffsetDateTime::from_unix_timestamp(0).unwrap(),
        };
        assert_eq!(m.stable_marker(), "nsm");
    }

    #[test]
    fn bucket_sync_status_advances_gen_when_all_shards_done() {
        let mut s = BucketSyncStatus::init(2);
        assert!(!s.mark_shard_done(0, 5));
        assert_eq!(s.incremental_gen, 0);
        assert!(s.mark_shard_done(1, 5));
        assert_eq!(s.incremental_gen, 5);
        assert!(s.shards_done_with_gen.iter().all(|b| !*b));
    }
}
