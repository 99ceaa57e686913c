use crate::bucket_shard::TrimCursor;
use crate::lease;
use crate::types::SyncMarker;
use async_trait::async_trait;
use changelog::DataChangeLog;
use gwtypes::GwResult;
use objstore::{ObjectId, ObjectStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const TRIM_LEASE: Duration = Duration::from_secs(30);
const TRIM_LEASE_RENEW_FRACTION: f64 = 0.75;

/// One peer's reported data-log sync status, as surfaced by
/// `/admin/log?type=data&status` (§4.4.11 step 1). `sync_markers[i]` is
/// per local data-log shard `i`.
#[async_trait]
pub trait PeerSyncStatusClient: Send + Sync + 'static {
    async fn data_log_sync_status(&self) -> GwResult<Vec<SyncMarker>>;
}

/// §4.4.11's coordinated trim loop: one gateway holding the "data_trim"
/// lease computes, per local shard, the minimum stable marker across
/// every peer and trims the local DCL up to it.
pub struct DataLogTrimCoordinator {
    store: Arc<dyn ObjectStore>,
    dcl: Arc<DataChangeLog>,
    peers: Vec<Arc<dyn PeerSyncStatusClient>>,
    lease_object: ObjectId,
    lease_cookie: String,
    cursor: TrimCursor,
}

impl DataLogTrimCoordinator {
    pub fn new(store: Arc<dyn ObjectStore>, dcl: Arc<DataChangeLog>, peers: Vec<Arc<dyn PeerSyncStatusClient>>, lease_pool: impl Into<String>, lease_cookie: impl Into<String>) -> Self {
        Self {
            store,
            dcl,
            peers,
            lease_object: ObjectId::new(lease_pool.into(), "data_trim".to_string()),
            lease_cookie: lease_cookie.into(),
            cursor: TrimCursor::new(),
        }
    }

    /// Runs one trim pass (§4.4.11 steps 1-3). Shards with no peer
    /// reporting a marker yet are left untouched.
    pub async fn run_once(&self, num_shards: u32) -> GwResult<()> {
        let store = self.store.clone();
        lease::with_lease(&store, &self.lease_object, "data_trim", &self.lease_cookie, TRIM_LEASE, TRIM_LEASE_RENEW_FRACTION, async {
            let mut per_peer_markers: Vec<Vec<SyncMarker>> = Vec::with_capacity(self.peers.len());
            for peer in &self.peers {
                match peer.data_log_sync_status().await {
                    Ok(markers) => per_peer_markers.push(markers),
                    Err(e) => warn!(error = %e, "failed to fetch peer sync status, skipping this pass"),
                }
            }
            if per_peer_markers.is_empty() {
                return Ok(());
            }

            let mut last_trim = self.cursor.last_trim.lock().await;
            for shard in 0..num_shards {
                let mut min_stable: Option<String> = None;
                for markers in &per_peer_markers {
                    let Some(marker) = markers.get(shard as usize) else { continue };
                    let stable = marker.stable_marker();
                    min_stable = Some(match min_stable {
                        Some(cur) if cur <= stable => cur,
                        _ => stable.to_string(),
                    });
                }
                let Some(min_stable) = min_stable else { continue };

                let advanced = last_trim.get(&shard).map(|cur| *cur < min_stable).unwrap_or(true);
                if advanced && !min_stable.is_empty() {
                    self.dcl.trim_entries(shard, &min_stable).await?;
                    last_trim.insert(shard, min_stable.clone());
                    info!(shard, marker = %min_stable, "trimmed data log shard");
                }
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ShardSyncState;
    use changelog::{GenerationsManager, GenerationsObserver, LogType};
    use objstore::MemStore;

    struct NullObserver;
    #[async_trait]
    impl GenerationsObserver for NullObserver {
        async fn handle_init(&self, _non_empty: Vec<changelog::GenerationRecord>) {}
        async fn handle_new_gens(&self, _new: Vec<changelog::GenerationRecord>) {}
        async fn handle_empty_to(&self, _new_tail: u64) {}
    }

    struct FixedPeer(Vec<SyncMarker>);
    #[async_trait]
    impl PeerSyncStatusClient for FixedPeer {
        async fn data_log_sync_status(&self) -> GwResult<Vec<SyncMarker>> {
            Ok(self.0.clone())
        }
    }

    fn marker(state: ShardSyncState, marker: &str, next_step: &str) -> SyncMarker {
        SyncMarker {
            state,
            marker: marker.to_string(),
            next_step_marker: next_step.to_string(),
            pos: 0,
            total_entries: 0,
            timestamp: time::OffsetDateTime::from_unix_timestamp(0).unwrap(),
        }
    }

    #[tokio::test]
    async fn trims_to_the_minimum_stable_marker_across_peers() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let gens = Arc::new(GenerationsManager::load_or_init(store.clone(), "log-pool", "data_log", 4, LogType::OrderedOmap, &NullObserver).await.unwrap());
        let dcl = Arc::new(DataChangeLog::new(gens, 4, std::time::Duration::from_secs(30)));
        dcl.add_entry(gwtypes::BucketShard::new(gwtypes::BucketIdentity::new("", "b", "bid"), 0)).await.unwrap();

        let all_shards_incremental = vec![marker(ShardSyncState::IncrementalSync, "9999999999", ""); 4];
        let all_shards_full = vec![marker(ShardSyncState::FullSync, "irrelevant", "0000000001"); 4];
        let peers: Vec<Arc<dyn PeerSyncStatusClient>> = vec![Arc::new(FixedPeer(all_shards_incremental)), Arc::new(FixedPeer(all_shards_full))];
        let coordinator = DataLogTrimCoordinator::new(store, dcl.clone(), peers, "log-pool", "trim-cookie");
        coordinator.run_once(4).await.unwrap();

        let shard = gwtypes::log_shard_for("b", 0, 4);
        let (remaining, ..) = dcl.list_entries(shard, 10, None).await.unwrap();
        assert!(remaining.is_empty());
    }
}
