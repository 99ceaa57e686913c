use crate::client::LifecycleObjectClient;
use crate::objects;
use crate::process::{bucket_lc_process, ProcessConfig};
use crate::scheduling::Schedule;
use crate::shard::{self, ShardHeader};
use crate::types::{EntryStatus, LcEntry, ProcessOutcome};
use gwtypes::{GwError, GwResult};
use objstore::{ObjectId, ObjectStore};
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{info, warn};

const SHARD_LEASE: Duration = Duration::from_secs(90);
const MAX_LOCK_WAIT: Duration = Duration::from_secs(600);
const EBUSY_RETRY_SLEEP: Duration = Duration::from_secs(5);
const PREPARE_PAGE_SIZE: usize = 1000;

/// Drives all `lc.N` shards through the 7-step per-shard loop (§4.6),
/// processing shards in a random permutation on each wake.
pub struct LifecycleEngine {
    store: Arc<dyn ObjectStore>,
    client: Arc<dyn LifecycleObjectClient>,
    pool: String,
    num_shards: u32,
    cookie: String,
    schedule: Schedule,
    process_config: ProcessConfig,
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        client: Arc<dyn LifecycleObjectClient>,
        pool: impl Into<String>,
        num_shards: u32,
        cookie: impl Into<String>,
        schedule: Schedule,
        process_config: ProcessConfig,
    ) -> Self {
        Self { store, client, pool: pool.into(), num_shards, cookie: cookie.into(), schedule, process_config }
    }

    /// One wake: every shard, in a random order, so that N concurrent
    /// engine instances contend evenly rather than racing shard 0 first
    /// every time.
    pub async fn sweep(&self) {
        let mut order: Vec<u32> = (0..self.num_shards).collect();
        order.shuffle(&mut rand::thread_rng());
        for shard_id in order {
            if let Err(e) = self.process_shard(shard_id).await {
                warn!(shard_id, error = %e, "lifecycle shard processing failed");
            }
        }
    }

    async fn process_shard(&self, shard_id: u32) -> GwResult<()> {
        let id = objects::shard_object(&self.pool, shard_id);
        let now = OffsetDateTime::now_utc();

        if !self.acquire_with_retry(&id, now).await? {
            return Ok(());
        }

        let result = self.drive_shard(&id, shard_id, now).await;
        let _ = self.store.unlock(&id, objects::LOCK_NAME, &self.cookie).await;
        result
    }

    /// Step 1: acquire the shard lease, sleeping 5s and retrying on
    /// `EBUSY` up to the max lock wait. Returns `false` if the deadline
    /// passed without acquiring (another processor is actively working
    /// this shard; try again next wake).
    async fn acquire_with_retry(&self, id: &ObjectId, started: OffsetDateTime) -> GwResult<bool> {
        let deadline = started + MAX_LOCK_WAIT;
        loop {
            match self.store.lock_exclusive(id, objects::LOCK_NAME, &self.cookie, SHARD_LEASE, false).await {
                Ok(()) => return Ok(true),
                Err(GwError::Busy(_)) => {
                    if OffsetDateTime::now_utc() >= deadline {
                        return Ok(false);
                    }
                    tokio::time::sleep(EBUSY_RETRY_SLEEP).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Steps 2-7: decide whether to (re)start today's sweep, then drain
    /// queue entries one at a time, releasing the shard lock while
    /// `bucket_lc_process` runs and reacquiring it to record the
    /// outcome.
    async fn drive_shard(&self, id: &ObjectId, shard_id: u32, now: OffsetDateTime) -> GwResult<()> {
        let header = shard::read_header(&self.store, id).await?;

        if let Some(h) = &header {
            if !h.marker.is_empty() {
                if let Some(entry) = shard::get_entry(&self.store, id, &h.marker).await? {
                    let age = now - entry.start_time;
                    if entry.status == EntryStatus::Processing && age < self.schedule.run_validity_time() {
                        info!(shard_id, marker = %h.marker, "shard owned by another processor, skipping");
                        return Ok(());
                    }
                }
            }
            if self.schedule.ran_today(h.start_date, now) {
                return Ok(());
            }
        }

        self.start_new_sweep(id, now).await?;

        let mut marker = String::new();
        loop {
            let (page, _) = shard::list_entries(&self.store, id, &marker, 1).await?;
            let Some((bucket_key, _)) = page.into_iter().next() else {
                break;
            };

            shard::mark_processing(&self.store, id, &bucket_key, now).await?;
            marker = bucket_key.clone();
            shard::write_header(&self.store, id, &ShardHeader { start_date: now, marker: marker.clone() }).await?;
            self.store.unlock(id, objects::LOCK_NAME, &self.cookie).await?;

            let stop_at = self.schedule.stop_at(now);
            let versioned = self.client.is_versioned(&bucket_key).await.unwrap_or(false);
            let outcome = bucket_lc_process(self.client.as_ref(), &bucket_key, versioned, &self.process_config, now, stop_at).await;

            if !self.acquire_with_retry(id, OffsetDateTime::now_utc()).await? {
                // Another processor claimed the shard while we were
                // running bucket_lc_process; leave the entry as
                // Processing for it to resolve via the header check.
                return Ok(());
            }

            match outcome {
                Ok(ProcessOutcome::Complete) => {
                    shard::set_entry(&self.store, id, &bucket_key, &LcEntry { start_time: now, status: EntryStatus::Complete }).await?;
                }
                Ok(ProcessOutcome::BucketGone) => {
                    shard::remove_entry(&self.store, id, &bucket_key).await?;
                }
                Ok(ProcessOutcome::Failed) => {
                    warn!(shard_id, bucket = %bucket_key, "lifecycle processing reported failure");
                    shard::set_entry(&self.store, id, &bucket_key, &LcEntry { start_time: now, status: EntryStatus::Failed }).await?;
                }
                Err(e) if e.is_not_found() => {
                    shard::remove_entry(&self.store, id, &bucket_key).await?;
                }
                Err(e) => {
                    warn!(shard_id, bucket = %bucket_key, error = %e, "lifecycle processing errored");
                    shard::set_entry(&self.store, id, &bucket_key, &LcEntry { start_time: now, status: EntryStatus::Failed }).await?;
                }
            }
        }

        Ok(())
    }

    /// Step 4: a new calendar day's sweep resets every queued entry to
    /// `Uninitial` and clears the header marker.
    async fn start_new_sweep(&self, id: &ObjectId, now: OffsetDateTime) -> GwResult<()> {
        let mut marker = String::new();
        loop {
            let (page, truncated) = shard::list_entries(&self.store, id, &marker, PREPARE_PAGE_SIZE).await?;
            for (key, _) in &page {
                shard::bucket_lc_prepare(&self.store, id, key, now).await?;
            }
            match page.last() {
                Some((key, _)) => marker = key.clone(),
                None => break,
            }
            if !truncated {
                break;
            }
        }
        shard::write_header(&self.store, id, &ShardHeader { start_date: now, marker: String::new() }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ListedObject, MultipartUpload};
    use crate::types::LcPolicy;
    use async_trait::async_trait;
    use objstore::{MemStore, Op};

    struct EmptyPolicyClient;

    #[async_trait]
    impl LifecycleObjectClient for EmptyPolicyClient {
        async fn get_lc_policy(&self, _bucket: &str) -> GwResult<LcPolicy> {
            Ok(LcPolicy::default())
        }
        async fn is_versioned(&self, _bucket: &str) -> GwResult<bool> {
            Ok(false)
        }
        async fn list_objects(&self, _bucket: &str, _prefix: &str, _marker: &str, _max: usize) -> GwResult<(Vec<ListedObject>, bool, String)> {
            Ok((vec![], false, String::new()))
        }
        async fn list_object_versions(&self, _bucket: &str, _prefix: &str, _marker: &str, _max: usize) -> GwResult<(Vec<ListedObject>, bool, String)> {
            Ok((vec![], false, String::new()))
        }
        async fn list_multipart_uploads(&self, _bucket: &str, _prefix: &str, _marker: &str, _max: usize) -> GwResult<(Vec<MultipartUpload>, bool, String)> {
            Ok((vec![], false, String::new()))
        }
        async fn get_tags(&self, _bucket: &str, _key: &str, _instance: &str) -> GwResult<Vec<(String, String)>> {
            Ok(vec![])
        }
        async fn get_mtime(&self, _bucket: &str, _key: &str, _instance: &str) -> GwResult<OffsetDateTime> {
            Ok(OffsetDateTime::now_utc())
        }
        async fn delete_object(&self, _bucket: &str, _key: &str, _instance: &str, _remove_indeed: bool) -> GwResult<()> {
            Ok(())
        }
        async fn abort_multipart_upload(&self, _bucket: &str, _upload_id: &str) -> GwResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn processes_a_queued_entry_and_marks_it_complete() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let client: Arc<dyn LifecycleObjectClient> = Arc::new(EmptyPolicyClient);
        let engine = LifecycleEngine::new(store.clone(), client, "lc-pool", 4, "cookie-a", Schedule::debug(Duration::from_secs(1)), ProcessConfig::default());

        let shard_obj = objects::shard_object("lc-pool", 0);
        store.operate(&shard_obj, vec![Op::OmapSet(vec![("t/bucket1".to_string(), serde_json::to_vec(&LcEntry::reset(OffsetDateTime::now_utc())).unwrap())])]).await.unwrap();

        engine.sweep().await;

        let entry = shard::get_entry(&store, &shard_obj, "t/bucket1").await.unwrap().expect("entry still queued");
        assert_eq!(entry.status, EntryStatus::Complete);
    }

    #[tokio::test]
    async fn second_sweep_same_day_skips_already_processed_shard() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let client: Arc<dyn LifecycleObjectClient> = Arc::new(EmptyPolicyClient);
        // No debug interval: once a shard's header records "ran today", a
        // same-day re-sweep must not reset/reprocess it.
        let engine = LifecycleEngine::new(store.clone(), client, "lc-pool", 1, "cookie-a", Schedule::default(), ProcessConfig::default());

        let shard_obj = objects::shard_object("lc-pool", 0);
        let now = OffsetDateTime::now_utc();
        store
            .operate(
                &shard_obj,
                vec![Op::OmapSet(vec![("t/bucket1".to_string(), serde_json::to_vec(&LcEntry::reset(now)).unwrap())])],
            )
            .await
            .unwrap();

        engine.sweep().await;
        let first = shard::get_entry(&store, &shard_obj, "t/bucket1").await.unwrap().unwrap();
        assert_eq!(first.status, EntryStatus::Complete);

        // Re-mark the entry Uninitial by hand, simulating the header's
        // `start_date` already being "today" from the first sweep.
        store
            .operate(
                &shard_obj,
                vec![Op::OmapSet(vec![("t/bucket1".to_string(), serde_json::to_vec(&LcEntry::reset(now)).unwrap())])],
            )
            .await
            .unwrap();
        engine.sweep().await;

        let second = shard::get_entry(&store, &shard_obj, "t/bucket1").await.unwrap().unwrap();
        assert_eq!(second.status, EntryStatus::Uninitial, "same-day re-sweep must not reprocess");
    }
}
