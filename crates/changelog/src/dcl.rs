use crate::backend::LogBackend;
use crate::entry::{DataChange, EntityType, LogEntry};
use crate::generations::GenerationsManager;
use dashmap::DashMap;
use gwtypes::{BucketShard, GwError, GwResult};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

struct ChangeStatusInner {
    cur_expiration: Option<OffsetDateTime>,
    cur_sent: Option<OffsetDateTime>,
    pending: bool,
}

/// Per-bucket-shard coalescing record (§4.3). Held both by the
/// `statuses` map and, transiently, by in-flight waiters subscribed on
/// `wake`.
struct ChangeStatus {
    inner: Mutex<ChangeStatusInner>,
    wake: broadcast::Sender<Result<(), String>>,
}

impl ChangeStatus {
    fn new() -> Self {
        let (wake, _) = broadcast::channel(16);
        Self {
            inner: Mutex::new(ChangeStatusInner {
                cur_expiration: None,
                cur_sent: None,
                pending: false,
            }),
            wake,
        }
    }
}

/// Sharded, coalescing change stream recording which bucket-shards were
/// modified (§4.3). Converts a high-rate request stream into at most one
/// log entry per bucket-shard per window `W`.
pub struct DataChangeLog {
    generations: Arc<GenerationsManager>,
    num_log_shards: u32,
    window: Duration,
    statuses: DashMap<String, Arc<ChangeStatus>>,
    modified: RwLock<HashMap<u32, HashSet<String>>>,
    renewal_set: Mutex<HashMap<String, (u32, BucketShard)>>,
}

impl DataChangeLog {
    pub fn new(generations: Arc<GenerationsManager>, num_log_shards: u32, window: Duration) -> Self {
        Self {
            generations,
            num_log_shards,
            window,
            statuses: DashMap::new(),
            modified: RwLock::new(HashMap::new()),
            renewal_set: Mutex::new(HashMap::new()),
        }
    }

    fn log_shard_for(&self, bs: &BucketShard) -> u32 {
        gwtypes::log_shard_for(&bs.bucket.name, bs.shard_id, self.num_log_shards)
    }

    fn mark_modified(&self, log_shard: u32, key: &str) {
        let mut modified = self.modified.write().unwrap();
        modified.entry(log_shard).or_default().insert(key.to_string());
    }

    async fn mark_for_renewal(&self, log_shard: u32, bs: &BucketShard, key: &str) {
        let mut set = self.renewal_set.lock().await;
        set.insert(key.to_string(), (log_shard, bs.clone()));
    }

    /// Records a bucket-shard modification, coalescing bursts into at
    /// most one push per window (§4.3 steps 1-8).
    pub async fn add_entry(&self, bs: BucketShard) -> GwResult<()> {
        let log_shard = self.log_shard_for(&bs);
        let key = bs.key();
        self.mark_modified(log_shard, &key);

        loop {
            let status = self
                .statuses
                .entry(key.clone())
                .or_insert_with(|| Arc::new(ChangeStatus::new()))
                .clone();
            let now = OffsetDateTime::now_utc();

            let mut waiter = None;
            {
                let mut inner = status.inner.lock().await;
                if let Some(exp) = inner.cur_expiration {
                    if now < exp {
                        self.mark_for_renewal(log_shard, &bs, &key).await;
                        metrics::counter!(gateway_metrics::names::DCL_COALESCED).increment(1);
                        return Ok(());
                    }
                }
                if inner.pending {
                    waiter = Some(status.wake.subscribe());
                } else {
                    inner.pending = true;
                    inner.cur_sent = Some(now);
                    inner.cur_expiration = Some(now + self.window);
                }
            }

            if let Some(mut rx) = waiter {
                match rx.recv().await {
                    Ok(Ok(())) => return Ok(()),
                    Ok(Err(msg)) => return Err(GwError::Transport(msg)),
                    Err(_) => continue,
                }
            }

            let change = DataChange {
                entity_type: EntityType::Bucket,
                key: key.clone(),
                timestamp: now,
            };
            let payload = serde_json::to_vec(&change).map_err(GwError::fatal)?;
            let backend = self.generations.current_backend();
            let push_result = backend.push_one(log_shard, now, payload).await;

            let mut inner = status.inner.lock().await;
            match push_result {
                Ok(()) => {
                    let sent = inner.cur_sent.unwrap_or(now);
                    inner.cur_expiration = Some(sent + self.window);
                    inner.pending = false;
                    let _ = status.wake.send(Ok(()));
                    metrics::counter!(gateway_metrics::names::DCL_ENTRIES_PUSHED).increment(1);
                    return Ok(());
                }
                Err(e) => {
                    inner.pending = false;
                    let window_elapsed = OffsetDateTime::now_utc() > inner.cur_expiration.unwrap_or(now);
                    drop(inner);
                    let _ = status.wake.send(Err(e.to_string()));
                    if window_elapsed {
                        warn!(%key, error = %e, "DCL push failed, window elapsed, retrying");
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Drains and returns the set of bucket-shards modified since the
    /// last call, grouped by log shard (§4.3 `read_clear_modified`,
    /// consumed by the IDSE wakeup path).
    pub fn read_clear_modified(&self) -> HashMap<u32, HashSet<String>> {
        std::mem::take(&mut *self.modified.write().unwrap())
    }

    pub async fn list_entries(
        &self,
        shard: u32,
        max: usize,
        from_marker: Option<&str>,
    ) -> GwResult<(Vec<LogEntry>, String, bool)> {
        let backend = self.generations.current_backend();
        let (raw, marker, more) = backend.list(shard, max, from_marker).await?;
        let mut out = Vec::with_capacity(raw.len());
        for r in raw {
            let change: DataChange = serde_json::from_slice(&r.payload).map_err(GwError::fatal)?;
            out.push(LogEntry {
                log_id: r.marker,
                log_timestamp: r.timestamp,
                entry: change,
            });
        }
        Ok((out, marker, more))
    }

    pub async fn trim_entries(&self, shard: u32, marker: &str) -> GwResult<()> {
        self.generations.current_backend().trim(shard, marker).await
    }

    pub async fn get_info(&self, shard: u32) -> GwResult<(String, Option<OffsetDateTime>)> {
        self.generations.current_backend().get_info(shard).await
    }

    pub fn max_marker(&self) -> String {
        self.generations.current_backend().max_marker()
    }

    /// Runs forever, waking every `3/4 * window` to re-push a batched
    /// entry for every bucket-shard that has stayed active without being
    /// re-pushed (§4.3 "Renewal loop"). Exits when `shutdown` resolves.
    pub async fn run_renewal_loop(self: &Arc<Self>, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let period = self.window.mul_f64(0.75);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = &mut shutdown => {
                    debug!("DCL renewal loop shutting down");
                    return;
                }
            }

            let due: HashMap<String, (u32, BucketShard)> = std::mem::take(&mut *self.renewal_set.lock().await);
            if due.is_empty() {
                continue;
            }

            let mut by_shard: HashMap<u32, Vec<(String, BucketShard)>> = HashMap::new();
            for (key, (shard, bs)) in due {
                by_shard.entry(shard).or_default().push((key, bs));
            }

            let now = OffsetDateTime::now_utc();
            let backend = self.generations.current_backend();
            for (shard, entries) in by_shard {
                let payloads: Vec<Vec<u8>> = entries
                    .iter()
                    .filter_map(|(key, _)| {
                        serde_json::to_vec(&DataChange {
                            entity_type: EntityType::Bucket,
                            key: key.clone(),
                            timestamp: now,
                        })
                        .ok()
                    })
                    .collect();
                let batch = backend.prepare(now, payloads);
                match backend.push(shard, batch).await {
                    Ok(()) => {
                        metrics::counter!(gateway_metrics::names::DCL_ENTRIES_PUSHED).increment(entries.len() as u64);
                        for (key, _) in &entries {
                            if let Some(status) = self.statuses.get(key) {
                                let mut inner = status.inner.lock().await;
                                inner.cur_expiration = Some(now + self.window);
                            }
                        }
                    }
                    Err(e) => warn!(shard, error = %e, "DCL renewal push failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generations::{GenerationsObserver, GenerationRecord, LogType};
    use async_trait::async_trait;
    use gwtypes::BucketIdentity;
    use objstore::{MemStore, ObjectStore};

    struct NullObserver;
    #[async_trait]
    impl GenerationsObserver for NullObserver {
        async fn handle_init(&self, _non_empty: Vec<GenerationRecord>) {}
        async fn handle_new_gens(&self, _new: Vec<GenerationRecord>) {}
        async fn handle_empty_to(&self, _new_tail: u64) {}
    }

    async fn dcl() -> Arc<DataChangeLog> {
        let store: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let gens = Arc::new(
            GenerationsManager::load_or_init(store, "log-pool", "data_log", 4, LogType::OrderedOmap, &NullObserver)
                .await
                .unwrap(),
        );
        Arc::new(DataChangeLog::new(gens, 4, Duration::from_secs(30)))
    }

    fn bs(name: &str, shard: i32) -> BucketShard {
        BucketShard::new(BucketIdentity::new("", name, "bid-1"), shard)
    }

    #[tokio::test]
    async fn coalesces_repeat_entries_within_window() {
        let log = dcl().await;
        let b = bs("mybucket", 5);
        log.add_entry(b.clone()).await.unwrap();
        log.add_entry(b.clone()).await.unwrap();
        log.add_entry(b.clone()).await.unwrap();

        let shard = gwtypes::log_shard_for("mybucket", 5, 4);
        let (entries, _, _) = log.list_entries(shard, 10, None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry.key, b.key());
    }

    #[tokio::test]
    async fn read_clear_modified_drains_once() {
        let log = dcl().await;
        log.add_entry(bs("a", 0)).await.unwrap();
        let first = log.read_clear_modified();
        assert!(!first.is_empty());
        let second = log.read_clear_modified();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn list_then_trim_removes_entries() {
        let log = dcl().await;
        let b = bs("bucket-x", 1);
        log.add_entry(b.clone()).await.unwrap();
        let shard = gwtypes::log_shard_for("bucket-x", 1, 4);
        let (entries, marker, _) = log.list_entries(shard, 10, None).await.unwrap();
        assert_eq!(entries.len(), 1);

        log.trim_entries(shard, &marker).await.unwrap();
        let (remaining, ..) = log.list_entries(shard, 10, None).await.unwrap();
        assert!(remaining.is_empty());
    }
}
