//! The Incremental Data Sync Engine (§4.4): pulls a peer zone's
//! data-change log, fans each bucket-shard out across configured
//! replication pipes, and replays bucket-index logs object by object.
//!
//! Grounded on `gazette`'s shard-controller/lease-renewal split for the
//! per-shard state machine, and on `automations::executors::poll_task`
//! for the work-vs-heartbeat race every leased operation runs under.

pub mod bootstrap;
pub mod bucket_shard;
pub mod bucket_sources;
pub mod bucket_sync;
pub mod engine;
pub mod entry_sync;
pub mod error_repo;
pub mod lease;
pub mod marker_tracker;
pub mod persist;
pub mod policy;
pub mod remote;
pub mod shard;
pub mod sync_error_log;
pub mod trim;
pub mod types;

pub use bucket_shard::{BucketShardSync, TrimCursor};
pub use bucket_sync::{ObjectReplicator, PageOutcome, ShardSyncOutcome};
pub use engine::SourceZoneSyncEngine;
pub use policy::{BucketSyncPolicyResolver, Pipe, PipeFilter, StaticPolicyResolver};
pub use remote::{BilogPage, BucketInstance, DataLogPage, ObjectVersionEntry, SourceZoneClient};
pub use shard::ShardController;
pub use sync_error_log::{SyncErrorLog, SyncErrorRecord};
pub use trim::{DataLogTrimCoordinator, PeerSyncStatusClient};
pub use types::{
    BilogEntry, BilogOp, BucketShardMarker, BucketSyncState, BucketSyncStatus, ShardSyncState, SourceSyncState,
    SourceZoneSyncInfo, SyncMarker,
};
