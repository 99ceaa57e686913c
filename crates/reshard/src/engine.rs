use crate::fault::FaultInjector;
use crate::lease;
use crate::objects::{self, BLOCK_WRITES_ATTR};
use crate::persist::CasObject;
use crate::types::{BucketLayout, BucketReshardLayout, IndexEntry, LogLayout, ReshardingState, ShardStats};
use changelog::DataChangeLog;
use gwtypes::{BucketIdentity, BucketShard, GwError, GwResult};
use objstore::{ObjectStore, Op};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Default max number of historical `logs` entries `can_reshard` will
/// tolerate before refusing to abandon peers still syncing from them
/// (§4.5 "Precondition check").
pub const DEFAULT_MAX_HISTORICAL_LOGS: usize = 4;

const COPY_PAGE_SIZE: usize = 1000;
const DEFAULT_AIO_WINDOW: usize = 8;
const DEFAULT_BATCH_SIZE: usize = 2048;
const RESHARD_LEASE: Duration = Duration::from_secs(360);
const RESHARD_LEASE_RENEW_FRACTION: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct ReshardConfig {
    pub max_historical_logs: usize,
    pub aio_window: usize,
    pub batch_size: usize,
    pub copy_page_size: usize,
    pub data_logging_enabled: bool,
}

impl Default for ReshardConfig {
    fn default() -> Self {
        Self {
            max_historical_logs: DEFAULT_MAX_HISTORICAL_LOGS,
            aio_window: DEFAULT_AIO_WINDOW,
            batch_size: DEFAULT_BATCH_SIZE,
            copy_page_size: COPY_PAGE_SIZE,
            data_logging_enabled: true,
        }
    }
}

/// Picks a target shard for an index entry (§4.5 step 4:
/// `get_target_shard_id`). Multipart parts hash their parent head's
/// key instead of their own, via [`IndexEntry::hash_key`].
pub fn get_target_shard_id(hash_key: &str, num_target_shards: u32) -> u32 {
    (gwtypes::hash_name(hash_key) % num_target_shards.max(1) as u64) as u32
}

/// Drives the online-reshard protocol for a single bucket (§4.5).
pub struct BucketResharder {
    store: Arc<dyn ObjectStore>,
    dcl: Option<Arc<DataChangeLog>>,
    fault: Arc<dyn FaultInjector>,
    pool: String,
    cookie: String,
    config: ReshardConfig,
}

impl BucketResharder {
    pub fn new(store: Arc<dyn ObjectStore>, dcl: Option<Arc<DataChangeLog>>, fault: Arc<dyn FaultInjector>, pool: impl Into<String>, cookie: impl Into<String>, config: ReshardConfig) -> Self {
        Self {
            store,
            dcl,
            fault,
            pool: pool.into(),
            cookie: cookie.into(),
            config,
        }
    }

    fn layout_store(&self, bucket_id: &str) -> CasObject<BucketReshardLayout> {
        CasObject::new(self.store.clone(), objects::layout_object(&self.pool, bucket_id))
    }

    /// Creates the bucket's reshard layout the first time it's needed.
    /// A production caller derives `initial_num_shards` from the
    /// bucket's creation-time index layout; here it's just the
    /// known-current shard count when nothing has been persisted yet.
    pub async fn ensure_layout(&self, bucket_id: &str, initial_num_shards: u32) -> GwResult<BucketReshardLayout> {
        let layout_store = self.layout_store(bucket_id);
        if let Some(layout) = layout_store.read().await? {
            return Ok(layout);
        }
        layout_store.update(|cur| Ok(cur.unwrap_or_else(|| BucketReshardLayout::initial(initial_num_shards)))).await
    }

    /// §4.5 "Precondition check": refuses to reshard while too many
    /// historical log generations are still outstanding.
    fn can_reshard(&self, layout: &BucketReshardLayout) -> GwResult<()> {
        if layout.logs.len() > self.config.max_historical_logs {
            return Err(GwError::PreconditionFailed(format!(
                "{} historical log generations outstanding, exceeds max {}",
                layout.logs.len(),
                self.config.max_historical_logs
            )));
        }
        if layout.resharding == ReshardingState::InProgress {
            return Err(GwError::Busy("reshard already in progress".to_string()));
        }
        Ok(())
    }

    /// Runs the full lock → init → block → copy → commit-or-cancel
    /// protocol (§4.5 "Protocol (reshard)") for one bucket.
    pub async fn reshard(&self, bucket: &BucketIdentity, new_num_shards: u32) -> GwResult<()> {
        let bucket_id = bucket.bucket_id.clone();
        let lock_id = objects::lock_object(&self.pool, &bucket_id);
        let store = self.store.clone();

        lease::with_lease(&store, &lock_id, "reshard", &self.cookie, RESHARD_LEASE, RESHARD_LEASE_RENEW_FRACTION, async {
            let layout = self.layout_store(&bucket_id).read().await?.ok_or_else(|| GwError::fatal("reshard attempted before layout was initialized"))?;
            self.can_reshard(&layout)?;

            match self.copy_phase(bucket, &layout, new_num_shards).await {
                Ok((target, entries_by_shard)) => self.commit_reshard(bucket, &layout, target, entries_by_shard).await,
                Err(e) => {
                    warn!(bucket = %bucket.name, error = %e, "reshard copy failed, canceling");
                    // `copy_phase` may have already persisted a target
                    // layout via CAS before failing, so re-read rather
                    // than cancel against the pre-copy snapshot.
                    let current = self.layout_store(&bucket_id).read().await?.unwrap_or(layout);
                    self.cancel_reshard(&bucket_id, &current).await?;
                    Err(e)
                }
            }
        })
        .await
    }

    /// Steps 2-4: init target layout, block writes, copy. Returns the
    /// new target layout and per-target-shard entry counts (for
    /// logging) on success; leaves the target shards populated and the
    /// current shards blocked for the caller to either commit or
    /// cancel.
    async fn copy_phase(&self, bucket: &BucketIdentity, layout: &BucketReshardLayout, new_num_shards: u32) -> GwResult<(BucketLayout, HashMap<u32, u64>)> {
        self.fault.check("set_target_layout").await?;

        let new_gen = layout.current.gen.max(layout.target.map(|t| t.gen).unwrap_or(0)) + 1;
        let target = BucketLayout { gen: new_gen, num_shards: new_num_shards };

        let mut allocated = Vec::with_capacity(new_num_shards as usize);
        for shard in 0..new_num_shards {
            let id = objects::index_shard_object(&self.pool, &bucket.bucket_id, target.gen, shard);
            self.store.operate(&id, vec![Op::CreateExclusive]).await?;
            allocated.push(id);
        }

        let persisted = self
            .layout_store(&bucket.bucket_id)
            .update(|cur| {
                let mut l = cur.ok_or_else(|| GwError::fatal("layout vanished during init_target_layout"))?;
                l.target = Some(target);
                l.resharding = ReshardingState::InProgress;
                Ok(l)
            })
            .await;

        if let Err(e) = persisted {
            self.fault.check("revert_target_layout").await.ok();
            for id in &allocated {
                let _ = self.store.remove(id).await;
            }
            return Err(e);
        }

        if let Err(e) = self.fault.check("block_writes").await {
            self.delete_target_shards(&bucket.bucket_id, target).await;
            return Err(e);
        }
        for shard in 0..layout.current.num_shards {
            let id = objects::index_shard_object(&self.pool, &bucket.bucket_id, layout.current.gen, shard);
            self.store.operate(&id, vec![Op::SetAttr(BLOCK_WRITES_ATTR.to_string(), vec![1])]).await?;
        }

        if let Err(e) = self.fault.check("do_reshard").await {
            return Err(e);
        }
        let entries_by_shard = self.copy_entries(bucket, layout.current, target).await?;
        Ok((target, entries_by_shard))
    }

    /// §4.5 step 4: pages every source shard's index entries, fans
    /// them out to their hashed target shard, and flushes each target
    /// in bounded batches while accumulating stats.
    async fn copy_entries(&self, bucket: &BucketIdentity, source: BucketLayout, target: BucketLayout) -> GwResult<HashMap<u32, u64>> {
        use futures::stream::{self, StreamExt};

        let mut totals: HashMap<u32, u64> = HashMap::new();
        for source_shard in 0..source.num_shards {
            let source_id = objects::index_shard_object(&self.pool, &bucket.bucket_id, source.gen, source_shard);
            let mut from: Option<String> = None;
            loop {
                let (page, truncated) = self.store.omap_get_range(&source_id, from.as_deref(), None, self.config.copy_page_size).await?;
                if page.is_empty() {
                    break;
                }

                let mut by_target: HashMap<u32, Vec<(String, IndexEntry)>> = HashMap::new();
                for (key, bytes) in &page {
                    let entry: IndexEntry = serde_json::from_slice(bytes).map_err(GwError::fatal)?;
                    let target_shard = get_target_shard_id(entry.hash_key(), target.num_shards);
                    by_target.entry(target_shard).or_default().push((key.clone(), entry));
                }

                let flushes: Vec<_> = by_target.into_iter().collect();
                let results: Vec<GwResult<(u32, usize)>> = stream::iter(flushes)
                    .map(|(target_shard, batch)| self.flush_batch(&bucket.bucket_id, target, target_shard, batch))
                    .buffer_unordered(self.config.aio_window)
                    .collect()
                    .await;
                for r in results {
                    let (shard, count) = r?;
                    *totals.entry(shard).or_insert(0) += count as u64;
                }

                from = page.last().map(|(k, _)| k.clone());
                if !truncated {
                    break;
                }
            }
        }
        Ok(totals)
    }

    /// Writes one target-shard batch and commits its accumulated stats
    /// in the same pass (§4.5 step 4: "commit these stats with each
    /// flushed batch via a compound 'update stats' op").
    async fn flush_batch(&self, bucket_id: &str, target: BucketLayout, target_shard: u32, batch: Vec<(String, IndexEntry)>) -> GwResult<(u32, usize)> {
        for chunk in batch.chunks(self.config.batch_size) {
            let target_id = objects::index_shard_object(&self.pool, bucket_id, target.gen, target_shard);
            let ops = chunk
                .iter()
                .map(|(key, entry)| Ok((key.clone(), serde_json::to_vec(entry).map_err(GwError::fatal)?)))
                .collect::<GwResult<Vec<_>>>()?;
            self.store.operate(&target_id, vec![Op::OmapSet(ops)]).await?;

            let mut by_category: HashMap<crate::types::ObjCategory, ShardStats> = HashMap::new();
            for (_, entry) in chunk {
                by_category.entry(entry.category).or_default().accumulate(entry);
            }
            let stats_store: CasObject<HashMap<crate::types::ObjCategory, ShardStats>> = CasObject::new(self.store.clone(), objects::stats_object(&self.pool, bucket_id, target.gen, target_shard));
            stats_store
                .update(|cur| {
                    let mut merged = cur.unwrap_or_default();
                    for (cat, delta) in &by_category {
                        let entry = merged.entry(*cat).or_default();
                        entry.num_entries += delta.num_entries;
                        entry.total_size += delta.total_size;
                        entry.total_size_rounded += delta.total_size_rounded;
                        entry.actual_size += delta.actual_size;
                    }
                    Ok(merged)
                })
                .await?;
        }
        metrics::counter!(gateway_metrics::names::RESHARD_ENTRIES_COPIED).increment(batch.len() as u64);
        Ok((target_shard, batch.len()))
    }

    async fn delete_target_shards(&self, bucket_id: &str, target: BucketLayout) {
        for shard in 0..target.num_shards {
            let id = objects::index_shard_object(&self.pool, bucket_id, target.gen, shard);
            let _ = self.store.remove(&id).await;
        }
    }

    async fn unblock_writes(&self, bucket_id: &str, current: BucketLayout) {
        for shard in 0..current.num_shards {
            let id = objects::index_shard_object(&self.pool, bucket_id, current.gen, shard);
            let _ = self.store.operate(&id, vec![Op::RemoveAttr(BLOCK_WRITES_ATTR.to_string())]).await;
        }
    }

    /// §4.5 step 5 (copy-failure / `do_reshard` fault path):
    /// `cancel_reshard`.
    async fn cancel_reshard(&self, bucket_id: &str, layout: &BucketReshardLayout) -> GwResult<()> {
        self.unblock_writes(bucket_id, layout.current).await;
        if let Some(target) = layout.target {
            self.delete_target_shards(bucket_id, target).await;
        }
        self.layout_store(bucket_id)
            .update(|cur| {
                let mut l = cur.ok_or_else(|| GwError::fatal("layout vanished during cancel_reshard"))?;
                l.target = None;
                l.resharding = ReshardingState::None;
                Ok(l)
            })
            .await?;
        Ok(())
    }

    /// §4.5 step 5 (copy-success path): `commit_reshard`.
    async fn commit_reshard(&self, bucket: &BucketIdentity, layout: &BucketReshardLayout, target: BucketLayout, entries_by_shard: HashMap<u32, u64>) -> GwResult<()> {
        self.fault.check("commit_target_layout").await?;

        let old_gen = layout.current.gen;
        let old_num_shards = layout.current.num_shards;
        let retire_old_shards = if !self.config.data_logging_enabled {
            true
        } else {
            !layout.logs.iter().any(|l| l.gen == old_gen)
        };

        let persisted = self
            .layout_store(&bucket.bucket_id)
            .update(|cur| {
                let mut l = cur.ok_or_else(|| GwError::fatal("layout vanished during commit_reshard"))?;
                let next_log_gen = l.logs.last().map(|log| log.gen).unwrap_or(old_gen) + 1;
                if !self.config.data_logging_enabled {
                    // Not syncing data: any existing logs can be dropped.
                    l.logs.clear();
                }
                l.current = target;
                l.target = None;
                l.logs.push(LogLayout { gen: next_log_gen });
                l.resharding = ReshardingState::None;
                Ok(l)
            })
            .await;

        if let Err(e) = persisted {
            self.unblock_writes(&bucket.bucket_id, layout.current).await;
            return Err(e);
        }

        if self.config.data_logging_enabled {
            if let Some(dcl) = &self.dcl {
                for shard in 0..old_num_shards {
                    dcl.add_entry(BucketShard::new(bucket.clone(), shard as i32)).await?;
                }
            }
        }

        if retire_old_shards {
            for shard in 0..old_num_shards {
                let id = objects::index_shard_object(&self.pool, &bucket.bucket_id, old_gen, shard);
                let _ = self.store.remove(&id).await;
            }
        }

        info!(
            bucket = %bucket.name,
            new_shards = target.num_shards,
            gen = target.gen,
            copied = entries_by_shard.values().sum::<u64>(),
            "reshard committed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::testing::BreakpointFaults;
    use crate::fault::NoFaults;
    use crate::types::ObjCategory;
    use objstore::MemStore;

    fn entry(key: &str, size: u64) -> IndexEntry {
        IndexEntry {
            key: key.to_string(),
            instance: "v1".to_string(),
            is_delete_marker: false,
            parent_head: None,
            size,
            size_rounded: size,
            category: ObjCategory::Normal,
        }
    }

    async fn seed_shard(store: &Arc<dyn ObjectStore>, pool: &str, bucket_id: &str, gen: u64, shard: u32, entries: &[IndexEntry]) {
        let id = objects::index_shard_object(pool, bucket_id, gen, shard);
        let ops = entries.iter().map(|e| (e.key.clone(), serde_json::to_vec(e).unwrap())).collect();
        store.operate(&id, vec![Op::CreateExclusive]).await.unwrap();
        store.operate(&id, vec![Op::OmapSet(ops)]).await.unwrap();
    }

    #[tokio::test]
    async fn reshard_copies_all_entries_and_commits() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let bucket = BucketIdentity::new("", "mybucket", "bid-1");
        let resharder = BucketResharder::new(
            store.clone(),
            None,
            Arc::new(NoFaults),
            "idx-pool",
            "cookie-1",
            ReshardConfig { data_logging_enabled: false, ..ReshardConfig::default() },
        );
        resharder.ensure_layout(&bucket.bucket_id, 2).await.unwrap();

        let seeded: Vec<IndexEntry> = (0..20).map(|i| entry(&format!("obj-{i}"), 100)).collect();
        seed_shard(&store, "idx-pool", &bucket.bucket_id, 0, 0, &seeded[..10]).await;
        seed_shard(&store, "idx-pool", &bucket.bucket_id, 0, 1, &seeded[10..]).await;

        resharder.reshard(&bucket, 4).await.unwrap();

        let layout = resharder.layout_store(&bucket.bucket_id).read().await.unwrap().unwrap();
        assert_eq!(layout.current.num_shards, 4);
        assert_eq!(layout.current.gen, 1);
        assert!(layout.target.is_none());
        assert_eq!(layout.resharding, ReshardingState::None);
        // `data_logging_enabled: false` clears stale logs before
        // appending the new generation's layout, so only one remains.
        assert_eq!(layout.logs, vec![LogLayout { gen: 1 }]);

        assert!(!store.exists(&objects::index_shard_object("idx-pool", &bucket.bucket_id, 0, 0)).await.unwrap());

        let mut total_copied = 0usize;
        for shard in 0..4 {
            let id = objects::index_shard_object("idx-pool", &bucket.bucket_id, 1, shard);
            let (keys, truncated) = store.omap_get_range(&id, None, None, 100).await.unwrap();
            assert!(!truncated);
            total_copied += keys.len();
        }
        assert_eq!(total_copied, 20);
    }

    #[tokio::test]
    async fn reshard_cancels_when_do_reshard_fault_trips() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let bucket = BucketIdentity::new("", "mybucket", "bid-2");
        let resharder = BucketResharder::new(store.clone(), None, Arc::new(BreakpointFaults::new(["do_reshard"])), "idx-pool", "cookie-1", ReshardConfig::default());
        resharder.ensure_layout(&bucket.bucket_id, 2).await.unwrap();
        seed_shard(&store, "idx-pool", &bucket.bucket_id, 0, 0, &[entry("obj-0", 50)]).await;
        seed_shard(&store, "idx-pool", &bucket.bucket_id, 0, 1, &[]).await;

        let err = resharder.reshard(&bucket, 4).await.unwrap_err();
        assert!(matches!(err, GwError::Canceled(_)));

        let layout = resharder.layout_store(&bucket.bucket_id).read().await.unwrap().unwrap();
        assert!(layout.target.is_none());
        assert_eq!(layout.resharding, ReshardingState::None);
        assert!(!store.exists(&objects::index_shard_object("idx-pool", &bucket.bucket_id, 1, 0)).await.unwrap());
        assert!(store.exists(&objects::index_shard_object("idx-pool", &bucket.bucket_id, 0, 0)).await.unwrap());
    }
}
