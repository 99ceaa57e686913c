use objstore::ObjectId;

/// The per-bucket reshard layout object (§4.5 steps 2 & 5).
pub fn layout_object(pool: &str, bucket_id: &str) -> ObjectId {
    ObjectId::new(pool.to_string(), format!("bucket.reshard-layout.{bucket_id}"))
}

/// The reshard lock object (§4.5 step 1).
pub fn lock_object(pool: &str, bucket_id: &str) -> ObjectId {
    ObjectId::new(pool.to_string(), format!("bucket.reshard-lock.{bucket_id}"))
}

/// One bucket-index shard object for generation `gen`, shard `shard`.
pub fn index_shard_object(pool: &str, bucket_id: &str, gen: u64, shard: u32) -> ObjectId {
    ObjectId::new(pool.to_string(), format!("bucket.index.{bucket_id}.{gen}.{shard}"))
}

/// The accumulated copy-stats object for one target shard (§4.5 step 4).
pub fn stats_object(pool: &str, bucket_id: &str, gen: u64, shard: u32) -> ObjectId {
    ObjectId::new(pool.to_string(), format!("bucket.index-stats.{bucket_id}.{gen}.{shard}"))
}

/// The attribute name set on current shards to stall writer clients
/// during the copy step (§4.5 step 3).
pub const BLOCK_WRITES_ATTR: &str = "reshard_status";
