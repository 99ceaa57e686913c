use crate::engine::BucketResharder;
use crate::lease;
use crate::types::{ReshardEntryStatus, ReshardQueueEntry};
use gwtypes::{hash_name, BucketIdentity, GwError, GwResult};
use objstore::{ObjectId, ObjectStore, Op};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const QUEUE_LEASE: Duration = Duration::from_secs(30);
const QUEUE_LEASE_RENEW_FRACTION: f64 = 0.75;
const QUEUE_PAGE_SIZE: usize = 100;

/// A persistent priority queue of pending reshards, sharded into
/// `num_logshards` shards by hashing `(tenant, bucket_name)` (§4.5
/// "Reshard queue").
pub struct ReshardQueue {
    store: Arc<dyn ObjectStore>,
    pool: String,
    num_logshards: u32,
}

impl ReshardQueue {
    pub fn new(store: Arc<dyn ObjectStore>, pool: impl Into<String>, num_logshards: u32) -> Self {
        Self { store, pool: pool.into(), num_logshards }
    }

    fn logshard_for(&self, tenant: &str, bucket_name: &str) -> u32 {
        (hash_name(&format!("{tenant}/{bucket_name}")) % self.num_logshards.max(1) as u64) as u32
    }

    fn logshard_object(&self, logshard: u32) -> ObjectId {
        ObjectId::new(self.pool.clone(), format!("reshard.log.{logshard}"))
    }

    /// Enqueues a reshard request. Idempotent: re-queuing the same
    /// `(tenant, bucket_name)` just overwrites the pending entry.
    pub async fn enqueue(&self, entry: ReshardQueueEntry) -> GwResult<()> {
        let logshard = self.logshard_for(&entry.tenant, &entry.bucket_name);
        let id = self.logshard_object(logshard);
        let key = format!("{}/{}", entry.tenant, entry.bucket_name);
        let bytes = serde_json::to_vec(&entry).map_err(GwError::fatal)?;
        self.store.operate(&id, vec![Op::OmapSet(vec![(key, bytes)])]).await?;
        Ok(())
    }

    /// Removes a queue entry; missing entry is success (§4.5 "queue
    /// removal is idempotent").
    pub async fn remove(&self, tenant: &str, bucket_name: &str) -> GwResult<()> {
        let logshard = self.logshard_for(tenant, bucket_name);
        let id = self.logshard_object(logshard);
        let key = format!("{tenant}/{bucket_name}");
        self.store.operate(&id, vec![Op::OmapRemoveKeys(vec![key])]).await?;
        Ok(())
    }

    /// Overwrites an entry's status in place, leaving it queued (§7
    /// "the reshard queue retains failed entries with status=Failed for
    /// manual intervention").
    pub async fn set_status(&self, entry: &ReshardQueueEntry, status: ReshardEntryStatus) -> GwResult<()> {
        let logshard = self.logshard_for(&entry.tenant, &entry.bucket_name);
        let id = self.logshard_object(logshard);
        let key = format!("{}/{}", entry.tenant, entry.bucket_name);
        let mut updated = entry.clone();
        updated.status = status;
        let bytes = serde_json::to_vec(&updated).map_err(GwError::fatal)?;
        self.store.operate(&id, vec![Op::OmapSet(vec![(key, bytes)])]).await?;
        Ok(())
    }

    /// Lists all pending entries in one logshard, oldest-queued first.
    pub async fn list_logshard(&self, logshard: u32, max: usize) -> GwResult<Vec<ReshardQueueEntry>> {
        let id = self.logshard_object(logshard);
        let (entries, _truncated) = self.store.omap_get_range(&id, None, None, max).await?;
        entries.into_iter().map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(GwError::fatal)).collect()
    }
}

/// The reshard worker: holds one logshard's lease and drains its queue
/// one bucket at a time, verifying the queued `bucket_id` still
/// matches before running (§4.5 "Reshard queue").
pub struct ReshardWorker {
    store: Arc<dyn ObjectStore>,
    queue: Arc<ReshardQueue>,
    resharder: Arc<BucketResharder>,
    cookie: String,
}

impl ReshardWorker {
    pub fn new(store: Arc<dyn ObjectStore>, queue: Arc<ReshardQueue>, resharder: Arc<BucketResharder>, cookie: impl Into<String>) -> Self {
        Self { store, queue, resharder, cookie: cookie.into() }
    }

    /// Drains one logshard's pending entries under its lease, returning
    /// the number of reshards attempted.
    pub async fn drain_logshard(&self, logshard: u32) -> GwResult<usize> {
        let lease_id = self.queue.logshard_object(logshard);
        let store = self.store.clone();
        lease::with_lease(&store, &lease_id, "reshard-queue", &self.cookie, QUEUE_LEASE, QUEUE_LEASE_RENEW_FRACTION, async {
            let entries = self.queue.list_logshard(logshard, QUEUE_PAGE_SIZE).await?;
            let mut attempted = 0;
            for entry in entries {
                if entry.status == ReshardEntryStatus::Failed {
                    continue;
                }
                attempted += 1;
                self.queue.set_status(&entry, ReshardEntryStatus::InProgress).await?;
                if let Err(e) = self.process_one(&entry).await {
                    warn!(bucket = %entry.bucket_name, error = %e, "reshard queue entry failed, marking Failed for manual intervention");
                    self.queue.set_status(&entry, ReshardEntryStatus::Failed).await?;
                    continue;
                }
                self.queue.remove(&entry.tenant, &entry.bucket_name).await?;
            }
            Ok(attempted)
        })
        .await
    }

    async fn process_one(&self, entry: &ReshardQueueEntry) -> GwResult<()> {
        let current_bucket_id = self.current_bucket_id(&entry.tenant, &entry.bucket_name).await?;
        if current_bucket_id != entry.bucket_id {
            info!(bucket = %entry.bucket_name, "queued bucket_id is stale, dropping entry");
            return Ok(());
        }
        let bucket = BucketIdentity::new(entry.tenant.clone(), entry.bucket_name.clone(), entry.bucket_id.clone());
        self.resharder.reshard(&bucket, entry.new_num_shards).await
    }

    /// Looks up the bucket's current `bucket_id`, so a reshard queued
    /// against a stale incarnation (e.g. the bucket was deleted and
    /// recreated, or already resharded) is dropped rather than run.
    async fn current_bucket_id(&self, tenant: &str, bucket_name: &str) -> GwResult<String> {
        let id = ObjectId::new("bucket-instances".to_string(), format!("{tenant}/{bucket_name}"));
        match self.store.read_full(&id).await {
            Ok(bytes) => {
                let recorded: String = serde_json::from_slice(&bytes).map_err(GwError::fatal)?;
                Ok(recorded)
            }
            Err(e) if e.is_not_found() => Err(GwError::NotFound(format!("{tenant}/{bucket_name}"))),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ReshardConfig;
    use crate::fault::NoFaults;
    use objstore::MemStore;
    use time::OffsetDateTime;

    #[tokio::test]
    async fn enqueue_then_remove_is_idempotent() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let queue = ReshardQueue::new(store, "reshard-pool", 16);
        let entry = ReshardQueueEntry::new("t", "b", "bid-1", 4, 8, OffsetDateTime::now_utc());
        queue.enqueue(entry.clone()).await.unwrap();

        let logshard = queue.logshard_for("t", "b");
        let listed = queue.list_logshard(logshard, 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].bucket_id, "bid-1");

        queue.remove("t", "b").await.unwrap();
        queue.remove("t", "b").await.unwrap();
        assert!(queue.list_logshard(logshard, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_bucket_id_drops_without_resharding() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let queue = Arc::new(ReshardQueue::new(store.clone(), "reshard-pool", 16));
        let resharder = Arc::new(BucketResharder::new(store.clone(), None, Arc::new(NoFaults), "idx-pool", "cookie", ReshardConfig::default()));
        let worker = ReshardWorker::new(store.clone(), queue.clone(), resharder, "worker-cookie");

        let instance_id = ObjectId::new("bucket-instances".to_string(), "t/b".to_string());
        store.operate(&instance_id, vec![Op::WriteFull(serde_json::to_vec("bid-current").unwrap())]).await.unwrap();

        let entry = ReshardQueueEntry::new("t", "b", "bid-stale", 4, 8, OffsetDateTime::now_utc());
        queue.enqueue(entry).await.unwrap();

        let logshard = queue.logshard_for("t", "b");
        let attempted = worker.drain_logshard(logshard).await.unwrap();
        assert_eq!(attempted, 1);
        assert!(queue.list_logshard(logshard, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_reshard_persists_failed_status_and_stays_queued() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let queue = Arc::new(ReshardQueue::new(store.clone(), "reshard-pool", 16));
        let resharder = Arc::new(BucketResharder::new(store.clone(), None, Arc::new(NoFaults), "idx-pool", "cookie", ReshardConfig::default()));
        let worker = ReshardWorker::new(store.clone(), queue.clone(), resharder, "worker-cookie");

        // No "bucket-instances" object for t/b, so `current_bucket_id`
        // fails with NotFound and `process_one` returns an error.
        let entry = ReshardQueueEntry::new("t", "b", "bid-1", 4, 8, OffsetDateTime::now_utc());
        queue.enqueue(entry).await.unwrap();

        let logshard = queue.logshard_for("t", "b");
        let attempted = worker.drain_logshard(logshard).await.unwrap();
        assert_eq!(attempted, 1);

        let listed = queue.list_logshard(logshard, 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, ReshardEntryStatus::Failed);

        // A later drain must not keep retrying an already-failed entry.
        let attempted_again = worker.drain_logshard(logshard).await.unwrap();
        assert_eq!(attempted_again, 0);
    }
}
