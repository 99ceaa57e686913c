//! The Bucket Resharder (§4.5): an online split of a bucket's index
//! from its current shard count to a new one, driven by a lease-guarded
//! lock → init-target → block-writes → copy → commit-or-cancel
//! protocol, plus a sharded, lease-guarded work queue that schedules
//! reshards across a fleet of gateways.
//!
//! Grounded on `datasync`'s lease-racing and CAS-update helpers (the
//! same `automations::executors::poll_task`-style work-vs-heartbeat
//! race governs the reshard lock), and on `gazette`'s shard-owned
//! queue/worker split for the reshard queue.

pub mod engine;
pub mod fault;
pub mod lease;
pub mod objects;
pub mod persist;
pub mod queue;
pub mod types;

pub use engine::{get_target_shard_id, BucketResharder, ReshardConfig, DEFAULT_MAX_HISTORICAL_LOGS};
pub use fault::{FaultInjector, NoFaults};
pub use queue::{ReshardQueue, ReshardWorker};
pub use types::{BucketLayout, BucketReshardLayout, IndexEntry, LogLayout, ObjCategory, ReshardEntryStatus, ReshardQueueEntry, ReshardingState, ShardStats};
