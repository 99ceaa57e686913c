use crate::lease;
use crate::persist::CasObject;
use crate::remote::SourceZoneClient;
use crate::types::{SourceSyncState, SourceZoneSyncInfo};
use futures::stream::{self, StreamExt};
use gwtypes::{BucketIdentity, BucketShard, GwResult};
use objstore::{ObjectId, ObjectStore, Op};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const SYNC_INFO_LEASE: Duration = Duration::from_secs(30);
const LEASE_RENEW_FRACTION: f64 = 0.75;
const BUCKET_LIST_PAGE: usize = 100;
const BUILD_MAPS_WINDOW: usize = 20;

/// Drives §4.4.1's `sync_info` bootstrap and §4.4.2's full-sync map
/// build. Both phases run once per source zone, guarded by the same
/// lease a `ShardController` uses for its own per-shard work (§5
/// "Locking discipline": one lease name per logical unit of ownership).
pub struct SourceZoneBootstrap {
    store: Arc<dyn ObjectStore>,
    remote: Arc<dyn SourceZoneClient>,
    source_zone: String,
    log_pool: String,
    info_store: CasObject<SourceZoneSyncInfo>,
    info_object: ObjectId,
}

impl SourceZoneBootstrap {
    pub fn new(store: Arc<dyn ObjectStore>, remote: Arc<dyn SourceZoneClient>, source_zone: impl Into<String>, log_pool: impl Into<String>) -> Self {
        let source_zone = source_zone.into();
        let log_pool = log_pool.into();
        let info_object = ObjectId::new(log_pool.clone(), format!("datalog.sync-info.{source_zone}"));
        Self {
            info_store: CasObject::new(store.clone(), info_object.clone()),
            store,
            remote,
            source_zone,
            log_pool,
            info_object,
        }
    }

    fn full_sync_index(&self, local_shard: u32) -> ObjectId {
        ObjectId::new(self.log_pool.clone(), format!("data.full-sync.index.{}.{local_shard}", self.source_zone))
    }

    /// §4.4.1: if `sync_info` is absent, creates it in `Init` with the
    /// peer's reported shard count. Returns the info as it stands after
    /// the call — `Init` means the caller must still run
    /// [`Self::build_full_sync_maps`].
    pub async fn ensure_initialized(&self, lease_cookie: &str) -> GwResult<SourceZoneSyncInfo> {
        lease::with_lease(&self.store, &self.info_object, "bootstrap", lease_cookie, SYNC_INFO_LEASE, LEASE_RENEW_FRACTION, async {
            if let Some(info) = self.info_store.read().await? {
                return Ok(info);
            }
            let num_shards = self.remote.data_log_num_shards().await?;
            let info = self
                .info_store
                .update(|_| {
                    Ok(SourceZoneSyncInfo {
                        state: SourceSyncState::Init,
                        num_shards,
                    })
                })
                .await?;
            info!(zone = %self.source_zone, num_shards, "initialized source-zone sync info");
            Ok(info)
        })
        .await
    }

    /// §4.4.2: lists every bucket instance on the peer and appends
    /// `(bucket_shard_key, dcl_log_shard_id)` pairs into this zone's
    /// per-local-shard full-sync index objects, then transitions
    /// `sync_info.state` to `Sync`.
    pub async fn build_full_sync_maps(&self, lease_cookie: &str, num_local_log_shards: u32) -> GwResult<()> {
        lease::with_lease(&self.store, &self.info_object, "bootstrap", lease_cookie, SYNC_INFO_LEASE, LEASE_RENEW_FRACTION, async {
            let info = match self.info_store.read().await? {
                Some(i) if i.state == SourceSyncState::Init => i,
                Some(_) => return Ok(()),
                None => return Err(gwtypes::GwError::fatal("build_full_sync_maps called before ensure_initialized")),
            };
            self.info_store
                .update(|cur| {
                    let mut i = cur.unwrap_or(info.clone());
                    i.state = SourceSyncState::BuildingFullSyncMaps;
                    Ok(i)
                })
                .await?;

            let mut from_marker = String::new();
            loop {
                let (keys, next_marker, truncated) = self.remote.bucket_instance_list(&from_marker, BUCKET_LIST_PAGE).await?;
                stream::iter(keys.iter())
                    .map(|key| self.index_one_bucket(num_local_log_shards, key))
                    .buffer_unordered(BUILD_MAPS_WINDOW)
                    .collect::<Vec<_>>()
                    .await
                    .into_iter()
                    .collect::<GwResult<Vec<()>>>()?;

                if !truncated {
                    break;
                }
                from_marker = next_marker;
            }

            self.info_store
                .update(|cur| {
                    let mut i = cur.unwrap_or(info.clone());
                    i.state = SourceSyncState::Sync;
                    Ok(i)
                })
                .await?;
            info!(zone = %self.source_zone, "full-sync maps built, transitioned to Sync");
            Ok(())
        })
        .await
    }

    async fn index_one_bucket(&self, num_local_log_shards: u32, instance_key: &str) -> GwResult<()> {
        let instance = self.remote.bucket_instance_get(instance_key).await?;
        let identity = BucketIdentity::new(instance.tenant, instance.name, instance.bucket_id);

        let num_shards = instance.num_shards.max(1);
        for shard_id in 0..num_shards as i32 {
            let bs = BucketShard::new(identity.clone(), shard_id);
            let key = bs.key();
            let local_shard = gwtypes::log_shard_for(&identity.name, shard_id, num_local_log_shards);
            let index = self.full_sync_index(local_shard);
            self.store.operate(&index, vec![Op::OmapSet(vec![(key, Vec::new())])]).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{BilogPage, BucketInstance, DataLogPage, ObjectVersionEntry};
    use async_trait::async_trait;
    use objstore::MemStore;

    struct FakeRemote {
        instances: Vec<BucketInstance>,
    }

    #[async_trait]
    impl SourceZoneClient for FakeRemote {
        async fn data_log_num_shards(&self) -> GwResult<u32> {
            Ok(4)
        }
        async fn data_log_shard_info(&self, _shard: u32) -> GwResult<(String, Option<time::OffsetDateTime>)> {
            Ok((String::new(), None))
        }
        async fn data_log_list(&self, _shard: u32, _from_marker: &str) -> GwResult<DataLogPage> {
            Ok(DataLogPage { entries: vec![], marker: String::new(), truncated: false })
        }
        async fn bucket_instance_list(&self, _from_marker: &str, _max: usize) -> GwResult<(Vec<String>, String, bool)> {
            Ok((self.instances.iter().map(|i| i.key.clone()).collect(), String::new(), false))
        }
        async fn bucket_instance_get(&self, key: &str) -> GwResult<BucketInstance> {
            self.instances.iter().find(|i| i.key == key).cloned().ok_or_else(|| gwtypes::GwError::NotFound(key.to_string()))
        }
        async fn bilog_info(&self, _bucket_instance_key: &str) -> GwResult<(Vec<String>, u64, u64)> {
            Ok((vec![], 0, 0))
        }
        async fn bilog_list(&self, _bucket_instance_key: &str, _shard: u32, _generation: u64, _from_marker: &str) -> GwResult<BilogPage> {
            Ok(BilogPage { entries: vec![], truncated: false, next_log: None })
        }
        async fn bucket_list_versions(&self, _bucket: &str, _key_marker: &str, _version_id_marker: &str) -> GwResult<(Vec<ObjectVersionEntry>, bool, String, String)> {
            Ok((vec![], false, String::new(), String::new()))
        }
    }

    #[tokio::test]
    async fn bootstraps_then_builds_full_sync_maps() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let remote: Arc<dyn SourceZoneClient> = Arc::new(FakeRemote {
            instances: vec![BucketInstance {
                key: "t/b:bid-1".into(),
                tenant: "t".into(),
                name: "b".into(),
                bucket_id: "bid-1".into(),
                num_shards: 2,
            }],
        });
        let bootstrap = SourceZoneBootstrap::new(store.clone(), remote, "us-east", "log-pool");

        let info = bootstrap.ensure_initialized("cookie-a").await.unwrap();
        assert_eq!(info.state, SourceSyncState::Init);
        assert_eq!(info.num_shards, 4);

        bootstrap.build_full_sync_maps("cookie-a", 8).await.unwrap();
        let info = bootstrap.info_store.read().await.unwrap().unwrap();
        assert_eq!(info.state, SourceSyncState::Sync);

        let shard0 = gwtypes::log_shard_for("b", 0, 8);
        let index = bootstrap.full_sync_index(shard0);
        let (entries, _) = store.omap_get_range(&index, None, None, 10).await.unwrap();
        assert!(entries.iter().any(|(k, _)| k == "t/b:bid-1:0"));
    }
}
