use crate::bucket_shard::BucketShardSync;
use crate::bucket_sources::run_bucket_sources_sync;
use crate::bucket_sync::ObjectReplicator;
use crate::entry_sync::{sync_single_entry, DataSyncSingleEntryCache, SyncObligation};
use crate::error_repo::ErrorRepo;
use crate::lease;
use crate::marker_tracker::MarkerTracker;
use crate::persist::CasObject;
use crate::policy::{BucketSyncPolicyResolver, PipeFilter};
use crate::remote::SourceZoneClient;
use crate::sync_error_log::SyncErrorLog;
use crate::types::{ShardSyncState, SyncMarker};
use changelog::DataChangeLog;
use gwtypes::GwResult;
use objstore::{ObjectId, ObjectStore};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{info, warn};

const FULL_SYNC_PAGE_SIZE: usize = 100;
const FULL_SYNC_WINDOW: usize = 20;
const INCREMENTAL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(20);
const DATA_SYNC_LEASE: std::time::Duration = std::time::Duration::from_secs(30);
const DATA_SYNC_LEASE_RENEW_FRACTION: f64 = 0.75;

/// Drives one source-zone data-log shard's full-then-incremental state
/// machine (§4.4.3).
pub struct ShardController {
    pub shard_id: u32,
    source_zone: String,
    store: Arc<dyn ObjectStore>,
    remote: Arc<dyn SourceZoneClient>,
    policy: Arc<dyn BucketSyncPolicyResolver>,
    replicator: Arc<dyn ObjectReplicator>,
    is_archive_zone: bool,
    local_dcl: Option<Arc<DataChangeLog>>,
    marker_store: CasObject<SyncMarker>,
    full_sync_index: ObjectId,
    status_object: ObjectId,
    log_pool: String,
    entry_cache: Arc<DataSyncSingleEntryCache>,
    marker_tracker: Mutex<MarkerTracker>,
    error_repo: ErrorRepo,
    error_log: Arc<SyncErrorLog>,
    lease_cookie: String,
}

impl ShardController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shard_id: u32,
        source_zone: impl Into<String>,
        log_pool: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        remote: Arc<dyn SourceZoneClient>,
        policy: Arc<dyn BucketSyncPolicyResolver>,
        replicator: Arc<dyn ObjectReplicator>,
        is_archive_zone: bool,
        local_dcl: Option<Arc<DataChangeLog>>,
        lease_cookie: impl Into<String>,
        error_log: Arc<SyncErrorLog>,
    ) -> Self {
        let source_zone = source_zone.into();
        let log_pool = log_pool.into();
        let status_object = ObjectId::new(log_pool.clone(), format!("datalog.sync-status.shard.{source_zone}.{shard_id}"));
        let full_sync_index = ObjectId::new(log_pool.clone(), format!("data.full-sync.index.{source_zone}.{shard_id}"));
        let error_repo = ErrorRepo::new(store.clone(), &status_object);
        Self {
            shard_id,
            source_zone,
            marker_store: CasObject::new(store.clone(), status_object.clone()),
            store,
            remote,
            policy,
            replicator,
            is_archive_zone,
            local_dcl,
            full_sync_index,
            status_object,
            log_pool,
            entry_cache: Arc::new(DataSyncSingleEntryCache::new()),
            // Window 1 for data-sync markers (§4.4.6).
            marker_tracker: Mutex::new(MarkerTracker::new(1)),
            error_repo,
            error_log,
            lease_cookie: lease_cookie.into(),
        }
    }

    async fn run_obligation(&self, obligation: SyncObligation) -> GwResult<()> {
        let policy = self.policy.clone();
        let source_zone = self.source_zone.clone();
        let store = self.store.clone();
        let remote = self.remote.clone();
        let replicator = self.replicator.clone();
        let is_archive_zone = self.is_archive_zone;
        let log_pool = self.log_pool.clone();
        let lease_cookie = self.lease_cookie.clone();
        sync_single_entry(&self.entry_cache, &self.marker_tracker, &self.error_repo, &self.error_log, obligation, move |bs_key, gen| {
            let policy = policy.clone();
            let source_zone = source_zone.clone();
            let store = store.clone();
            let remote = remote.clone();
            let replicator = replicator.clone();
            let log_pool = log_pool.clone();
            let lease_cookie = lease_cookie.clone();
            async move {
                run_bucket_sources_sync(policy.as_ref(), &source_zone, &bs_key, gen, FULL_SYNC_WINDOW, move |dest_zone, dest_bucket, shard, gen| {
                    let store = store.clone();
                    let remote = remote.clone();
                    let replicator = replicator.clone();
                    let log_pool = log_pool.clone();
                    let lease_cookie = lease_cookie.clone();
                    async move {
                        // Pipes carry a bucket name, not a resolved
                        // destination bucket-instance key, and `shard`
                        // is always 0 (`run_bucket_sources_sync`'s
                        // single-shard fan-out); a real policy engine
                        // that knows the destination's instance id and
                        // shard count plugs in here.
                        let pipe_sync = BucketShardSync::new(
                            store,
                            remote,
                            replicator,
                            log_pool,
                            format!("{dest_zone}.{dest_bucket}"),
                            PipeFilter::default(),
                            is_archive_zone,
                            lease_cookie,
                        );
                        pipe_sync.sync_bucket_shard(shard as usize, 1, &dest_bucket, gen).await?;
                        Ok(OffsetDateTime::now_utc())
                    }
                })
                .await
            }
        })
        .await
    }

    /// §4.4.3's `full_sync()`: lists the full-sync OMAP index page by
    /// page, spawning a bounded-window sync for each bucket-shard key,
    /// then atomically transitions to incremental sync.
    pub async fn full_sync(&self) -> GwResult<()> {
        let lease_duration = DATA_SYNC_LEASE;
        lease::with_lease(&self.store, &self.status_object, "data-sync", &self.lease_cookie, lease_duration, DATA_SYNC_LEASE_RENEW_FRACTION, async {
            // Snapshot the remote log's current head before paging the
            // full-sync index, so incremental sync resumes exactly where
            // full sync started rather than missing entries written
            // while it ran.
            let (snapshot_marker, _) = self.remote.data_log_shard_info(self.shard_id).await?;
            self.marker_store
                .update(|cur| {
                    let mut m = cur.unwrap_or_else(|| SyncMarker::init_full_sync(snapshot_marker.clone(), OffsetDateTime::now_utc()));
                    m.next_step_marker = snapshot_marker.clone();
                    Ok(m)
                })
                .await?;

            let mut from_marker: Option<String> = None;
            loop {
                let (keys, truncated) = self
                    .store
                    .omap_get_range(&self.full_sync_index, from_marker.as_deref(), None, FULL_SYNC_PAGE_SIZE)
                    .await?;
                use futures::stream::{self, StreamExt};
                let now = OffsetDateTime::now_utc();
                stream::iter(keys.iter())
                    .map(|(key, _)| {
                        self.run_obligation(SyncObligation {
                            bucket_shard_key: key.clone(),
                            gen: None,
                            timestamp: now,
                            log_marker: None,
                            is_retry: false,
                        })
                    })
                    .buffer_unordered(FULL_SYNC_WINDOW)
                    .collect::<Vec<_>>()
                    .await;

                if let Some((last_key, _)) = keys.last() {
                    from_marker = Some(last_key.clone());
                }
                if !truncated {
                    break;
                }
            }

            self.marker_store
                .update(|cur| {
                    let mut m = cur.ok_or_else(|| gwtypes::GwError::fatal("sync marker vanished mid full-sync"))?;
                    m.state = ShardSyncState::IncrementalSync;
                    m.marker = m.next_step_marker.clone();
                    m.next_step_marker = String::new();
                    Ok(m)
                })
                .await?;
            info!(shard = self.shard_id, "full sync complete, transitioned to incremental");
            Ok(())
        })
        .await
    }

    /// §4.4.3's `incremental_sync()`.
    pub async fn incremental_sync(&self) -> GwResult<()> {
        let lease_duration = DATA_SYNC_LEASE;
        lease::with_lease(&self.store, &self.status_object, "data-sync", &self.lease_cookie, lease_duration, DATA_SYNC_LEASE_RENEW_FRACTION, async {
            // Step 1: locally modified bucket-shards the peer needs
            // re-synced, pushed with no marker-tracker update.
            if let Some(dcl) = &self.local_dcl {
                let modified = dcl.read_clear_modified();
                if let Some(keys) = modified.get(&self.shard_id) {
                    for key in keys {
                        let _ = self
                            .run_obligation(SyncObligation {
                                bucket_shard_key: key.clone(),
                                gen: None,
                                timestamp: OffsetDateTime::UNIX_EPOCH,
                                log_marker: None,
                                is_retry: false,
                            })
                            .await;
                    }
                }
            }

            // Step 2: error-repo retries, up to 10 per poll.
            for (bs_key, gen, ts) in self.error_repo.list(10).await? {
                let _ = self
                    .run_obligation(SyncObligation {
                        bucket_shard_key: bs_key,
                        gen,
                        timestamp: ts,
                        log_marker: None,
                        is_retry: true,
                    })
                    .await;
            }

            // Step 3-4: pull the remote data-log page and advance the marker.
            let current_marker = self.marker_store.read().await?.map(|m| m.marker).unwrap_or_default();
            let page = self.remote.data_log_list(self.shard_id, &current_marker).await?;

            for e in &page.entries {
                self.marker_tracker.lock().await.start(e.log_id.clone(), e.entry.timestamp);
            }

            use futures::stream::{self, StreamExt};
            let entries = page.entries.clone();
            stream::iter(entries.iter())
                .map(|e| {
                    self.run_obligation(SyncObligation {
                        bucket_shard_key: e.entry.key.clone(),
                        gen: None,
                        timestamp: e.entry.timestamp,
                        log_marker: Some(e.log_id.clone()),
                        is_retry: false,
                    })
                })
                .buffer_unordered(FULL_SYNC_WINDOW)
                .collect::<Vec<_>>()
                .await;

            // Every dispatched obligation calls `finish` regardless of
            // outcome, so after the page drains the tracker holds the
            // full contiguous prefix — a gap can only remain if the page
            // itself was empty.
            let next_marker = match self.marker_tracker.lock().await.persisted() {
                Some((marker, _)) => marker.to_string(),
                None if !page.marker.is_empty() => page.marker.clone(),
                None => current_marker.clone(),
            };

            self.marker_store
                .update(|cur| {
                    let mut m = cur.unwrap_or_else(|| SyncMarker::init_full_sync(String::new(), OffsetDateTime::now_utc()));
                    m.state = ShardSyncState::IncrementalSync;
                    m.marker = next_marker.clone();
                    m.timestamp = OffsetDateTime::now_utc();
                    Ok(m)
                })
                .await?;

            if !page.truncated {
                tokio::time::sleep(INCREMENTAL_INTERVAL).await;
            }
            Ok(())
        })
        .await
    }

    /// Runs the full-then-incremental loop forever, backing off on
    /// error while preserving `IncrementalSync` state (§7 "backoff-retry
    /// with the IncrementalSync state preserved").
    pub async fn run(&self) {
        loop {
            let state = match self.marker_store.read().await {
                Ok(Some(m)) => m.state,
                Ok(None) => ShardSyncState::FullSync,
                Err(e) => {
                    warn!(shard = self.shard_id, error = %e, "failed to read sync marker, retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                }
            };

            let result = match state {
                ShardSyncState::FullSync => self.full_sync().await,
                ShardSyncState::IncrementalSync => self.incremental_sync().await,
            };

            if let Err(e) = result {
                warn!(shard = self.shard_id, error = %e, "shard sync iteration failed, backing off");
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
        }
    }
}
