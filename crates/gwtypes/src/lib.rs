//! Shared identifiers and error taxonomy used across the gateway's sync,
//! reshard, and lifecycle engines.
//!
//! Grounded on `models::Id` (teacher's compact binary identifier) and the
//! error enums of `journal-client`/`gazette` (`thiserror`-derived, one
//! variant per wire-level outcome).

mod error;
mod identity;
mod lease;

pub use error::{GwError, GwResult};
pub use identity::{BucketIdentity, BucketShard};
pub use lease::Lease;

/// A monotonic marker position within a single log shard. Markers are
/// backend-specific opaque strings but are always totally ordered by
/// plain string comparison within their shard (§3 "Log entry").
pub type Marker = String;

/// Hashes a string the way bucket-shard-to-log-shard assignment does
/// (§4.3 step 1): `(hash(name) + max(shard_id, 0)) mod num_shards`.
pub fn hash_name(name: &str) -> u64 {
    xxhash_rust::xxh3::xxh3_64(name.as_bytes())
}

/// Chooses a log shard for a bucket-shard write, per §4.3 step 1.
pub fn log_shard_for(bucket_name: &str, shard_id: i32, num_log_shards: u32) -> u32 {
    let h = hash_name(bucket_name).wrapping_add(shard_id.max(0) as u64);
    (h % num_log_shards as u64) as u32
}
