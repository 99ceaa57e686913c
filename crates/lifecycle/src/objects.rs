use objstore::ObjectId;

/// The `lc.N` shard object holding one shard's header attrs and its
/// omap queue of `{bucket_key -> LcEntry}` (§4.6 "Shards").
pub fn shard_object(pool: &str, shard: u32) -> ObjectId {
    ObjectId::new(pool, format!("lc.{shard}"))
}

pub const ATTR_START_DATE: &str = "start_date";
pub const ATTR_MARKER: &str = "marker";
pub const LOCK_NAME: &str = "lc_process";
