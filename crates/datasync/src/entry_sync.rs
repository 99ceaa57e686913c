use crate::error_repo::ErrorRepo;
use crate::marker_tracker::MarkerTracker;
use crate::sync_error_log::SyncErrorLog;
use dashmap::DashMap;
use gwtypes::{GwError, GwResult};
use std::future::Future;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::Mutex;

struct Slot {
    epoch: u64,
    target_timestamp: OffsetDateTime,
    progress_timestamp: OffsetDateTime,
}

impl Default for Slot {
    fn default() -> Self {
        let epoch0 = OffsetDateTime::UNIX_EPOCH;
        Self {
            epoch: 0,
            target_timestamp: epoch0,
            progress_timestamp: epoch0,
        }
    }
}

/// The per-bucket-shard in-flight state cache (§4.4.4): at most one sync
/// loop owns a given bucket-shard at a time. A newer obligation bumps
/// the slot's epoch and supersedes whichever loop currently holds it;
/// an older or equal obligation is dropped outright.
#[derive(Default)]
pub struct DataSyncSingleEntryCache {
    slots: DashMap<String, Arc<Mutex<Slot>>>,
}

impl DataSyncSingleEntryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot_for(&self, key: &str) -> Arc<Mutex<Slot>> {
        self.slots.entry(key.to_string()).or_insert_with(|| Arc::new(Mutex::new(Slot::default()))).clone()
    }
}

/// One sync obligation for a bucket-shard, sourced either from a fresh
/// data-log entry, a modified-shards wakeup, or an error-repo retry
/// (§4.4.4).
pub struct SyncObligation {
    pub bucket_shard_key: String,
    pub gen: Option<u64>,
    pub timestamp: OffsetDateTime,
    pub log_marker: Option<String>,
    pub is_retry: bool,
}

/// Drives one `DataSyncSingleEntry` obligation to completion (§4.4.4).
/// `run` is `RunBucketSourcesSync`: given `(bucket_shard_key, gen)` it
/// returns the minimum progress timestamp reached across every fanned-out
/// destination shard.
pub async fn sync_single_entry<F, Fut>(
    cache: &DataSyncSingleEntryCache,
    marker_tracker: &Mutex<MarkerTracker>,
    error_repo: &ErrorRepo,
    error_log: &SyncErrorLog,
    obligation: SyncObligation,
    run: F,
) -> GwResult<()>
where
    F: Fn(String, Option<u64>) -> Fut,
    Fut: Future<Output = GwResult<OffsetDateTime>>,
{
    let slot = cache.slot_for(&obligation.bucket_shard_key);

    let my_epoch = {
        let mut s = slot.lock().await;
        if obligation.timestamp <= s.target_timestamp {
            // A newer-or-equal obligation already owns this bucket-shard;
            // this one is strictly older and is dropped (§4.4.4).
            if let Some(marker) = &obligation.log_marker {
                marker_tracker.lock().await.finish(marker);
            }
            return Ok(());
        }
        s.epoch += 1;
        s.target_timestamp = obligation.timestamp;
        s.epoch
    };

    let mut result: GwResult<()> = Ok(());
    loop {
        let (still_owner, progress) = {
            let s = slot.lock().await;
            (s.epoch == my_epoch && s.progress_timestamp < s.target_timestamp, s.progress_timestamp)
        };
        if !still_owner {
            // Either superseded by a newer obligation, or already caught up.
            let _ = progress;
            break;
        }

        match run(obligation.bucket_shard_key.clone(), obligation.gen).await {
            Ok(progress) => {
                let mut s = slot.lock().await;
                if s.epoch == my_epoch {
                    s.progress_timestamp = progress;
                }
            }
            Err(e) if e.is_not_found() => {
                // Stale entry for a removed bucket: treat as success.
                let mut s = slot.lock().await;
                if s.epoch == my_epoch {
                    s.progress_timestamp = s.target_timestamp;
                }
                break;
            }
            Err(GwError::Busy(_)) => {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                continue;
            }
            Err(e) => {
                metrics::counter!(gateway_metrics::names::SYNC_ERRORS).increment(1);
                error_log.append(
                    obligation.bucket_shard_key.clone(),
                    obligation.gen,
                    e.to_string(),
                    obligation.timestamp,
                );
                error_repo
                    .record(&obligation.bucket_shard_key, obligation.gen, obligation.timestamp)
                    .await
                    .ok();
                result = Err(e);
                break;
            }
        }
    }

    if result.is_ok() && obligation.is_retry {
        let _ = error_repo
            .remove_if_matches(&obligation.bucket_shard_key, obligation.gen, obligation.timestamp)
            .await;
    }

    if let Some(marker) = &obligation.log_marker {
        marker_tracker.lock().await.finish(marker);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use objstore::{MemStore, ObjectId, ObjectStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ts(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(secs).unwrap()
    }

    fn harness() -> (DataSyncSingleEntryCache, Mutex<MarkerTracker>, ErrorRepo, SyncErrorLog) {
        let store: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let sync_status = ObjectId::new("log-pool", "datalog.sync-status.shard.us-east.0");
        (
            DataSyncSingleEntryCache::new(),
            Mutex::new(MarkerTracker::new(10)),
            ErrorRepo::new(store, &sync_status),
            SyncErrorLog::new(16),
        )
    }

    #[tokio::test]
    async fn older_obligation_is_dropped_without_running() {
        let (cache, tracker, repo, log) = harness();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls2 = calls.clone();
        sync_single_entry(
            &cache,
            &tracker,
            &repo,
            &log,
            SyncObligation {
                bucket_shard_key: "B:0".into(),
                gen: None,
                timestamp: ts(100),
                log_marker: None,
                is_retry: false,
            },
            move |_, _| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(ts(100))
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let calls2 = calls.clone();
        sync_single_entry(
            &cache,
            &tracker,
            &repo,
            &log,
            SyncObligation {
                bucket_shard_key: "B:0".into(),
                gen: None,
                timestamp: ts(50), // older than what already completed
                log_marker: None,
                is_retry: false,
            },
            move |_, _| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(ts(50))
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1, "older obligation must not re-run sync");
    }

    #[tokio::test]
    async fn not_found_is_treated_as_success() {
        let (cache, tracker, repo, log) = harness();
        let result = sync_single_entry(
            &cache,
            &tracker,
            &repo,
            &log,
            SyncObligation {
                bucket_shard_key: "B:1".into(),
                gen: None,
                timestamp: ts(1),
                log_marker: Some("0000000001".into()),
                is_retry: false,
            },
            |_, _| async { Err(GwError::NotFound("gone".into())) },
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn failure_records_error_repo_entry() {
        let (cache, tracker, repo, log) = harness();
        let result = sync_single_entry(
            &cache,
            &tracker,
            &repo,
            &log,
            SyncObligation {
                bucket_shard_key: "B:2".into(),
                gen: Some(5),
                timestamp: ts(100),
                log_marker: None,
                is_retry: false,
            },
            |_, _| async { Err(GwError::Transport("peer unreachable".into())) },
        )
        .await;
        assert!(result.is_err());
        let pending = repo.list(10).await.unwrap();
        assert_eq!(pending, vec![("B:2".to_string(), Some(5), ts(100))]);
        assert_eq!(log.snapshot().len(), 1);
    }
}
