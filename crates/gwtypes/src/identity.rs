use serde::{Deserialize, Serialize};

/// `(tenant, name, bucket_id, marker)` per §3 "Bucket identity". `bucket_id`
/// is immutable for a given index incarnation; `marker` is set at creation
/// and survives reshards. `bucket_id != marker` iff the bucket has been
/// resharded at least once.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketIdentity {
    pub tenant: String,
    pub name: String,
    pub bucket_id: String,
    pub marker: String,
}

impl BucketIdentity {
    pub fn new(tenant: impl Into<String>, name: impl Into<String>, bucket_id: impl Into<String>) -> Self {
        let bucket_id = bucket_id.into();
        Self {
            tenant: tenant.into(),
            name: name.into(),
            marker: bucket_id.clone(),
            bucket_id,
        }
    }

    pub fn has_resharded(&self) -> bool {
        self.bucket_id != self.marker
    }

    /// `"tenant/name"`, or just `"name"` for the empty tenant — matches
    /// the canonical form used in bucket-instance keys (§6.2).
    pub fn tenant_name(&self) -> String {
        if self.tenant.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.tenant, self.name)
        }
    }
}

/// A pair `(bucket, shard_id)` with `shard_id` in `[0, num_shards)`, or
/// `-1` for an unsharded bucket (§3 "Bucket-shard").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketShard {
    pub bucket: BucketIdentity,
    pub shard_id: i32,
}

impl BucketShard {
    pub fn new(bucket: BucketIdentity, shard_id: i32) -> Self {
        Self { bucket, shard_id }
    }

    /// The canonical `"tenant/name:bucket_id:shard_id"` form used as a
    /// data-change entry's key (§3 "Data-change entry").
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.bucket.tenant_name(),
            self.bucket.bucket_id,
            self.shard_id
        )
    }

    /// Parses a key produced by [`BucketShard::key`]. Used when decoding
    /// data-change entries and error-repo keys.
    pub fn parse_key(key: &str) -> Option<(String, i32)> {
        let (bucket_part, shard_part) = key.rsplit_once(':')?;
        let shard_id: i32 = shard_part.parse().ok()?;
        Some((bucket_part.to_string(), shard_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips() {
        let b = BucketIdentity::new("t1", "mybucket", "bid-123");
        let bs = BucketShard::new(b, 5);
        assert_eq!(bs.key(), "t1/mybucket:bid-123:5");

        let (bucket_part, shard) = BucketShard::parse_key(&bs.key()).unwrap();
        assert_eq!(bucket_part, "t1/mybucket:bid-123");
        assert_eq!(shard, 5);
    }

    #[test]
    fn unsharded_uses_negative_one() {
        let b = BucketIdentity::new("", "solo", "bid-1");
        let bs = BucketShard::new(b, -1);
        assert_eq!(bs.key(), "solo:bid-1:-1");
    }

    #[test]
    fn reshard_flag_tracks_bucket_id_vs_marker() {
        let mut b = BucketIdentity::new("t", "n", "m0");
        assert!(!b.has_resharded());
        b.bucket_id = "m1".to_string();
        assert!(b.has_resharded());
    }
}
