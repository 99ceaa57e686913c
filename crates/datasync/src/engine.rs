use crate::bootstrap::SourceZoneBootstrap;
use crate::bucket_sync::ObjectReplicator;
use crate::policy::BucketSyncPolicyResolver;
use crate::remote::SourceZoneClient;
use crate::shard::ShardController;
use crate::sync_error_log::SyncErrorLog;
use crate::types::SourceSyncState;
use changelog::DataChangeLog;
use gwtypes::GwResult;
use objstore::ObjectStore;
use std::sync::Arc;
use tracing::{info, warn};

/// The per-source-zone IDSE coordinator: bootstraps `sync_info`, builds
/// the full-sync maps once, then hands one [`ShardController`] per
/// data-log shard to its own long-running task (§4.4, top level).
pub struct SourceZoneSyncEngine {
    store: Arc<dyn ObjectStore>,
    remote: Arc<dyn SourceZoneClient>,
    policy: Arc<dyn BucketSyncPolicyResolver>,
    replicator: Arc<dyn ObjectReplicator>,
    is_archive_zone: bool,
    local_dcl: Option<Arc<DataChangeLog>>,
    source_zone: String,
    log_pool: String,
    num_local_log_shards: u32,
    cookie: String,
    error_log: Arc<SyncErrorLog>,
}

impl SourceZoneSyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        remote: Arc<dyn SourceZoneClient>,
        policy: Arc<dyn BucketSyncPolicyResolver>,
        replicator: Arc<dyn ObjectReplicator>,
        is_archive_zone: bool,
        local_dcl: Option<Arc<DataChangeLog>>,
        source_zone: impl Into<String>,
        log_pool: impl Into<String>,
        num_local_log_shards: u32,
        cookie: impl Into<String>,
    ) -> Self {
        Self {
            store,
            remote,
            policy,
            replicator,
            is_archive_zone,
            local_dcl,
            source_zone: source_zone.into(),
            log_pool: log_pool.into(),
            num_local_log_shards,
            cookie: cookie.into(),
            error_log: Arc::new(SyncErrorLog::new(1000)),
        }
    }

    pub fn error_log(&self) -> Arc<SyncErrorLog> {
        self.error_log.clone()
    }

    /// Runs the engine forever: bootstrap once, then spawn one shard
    /// worker per remote data-log shard and block until all exit (which,
    /// barring a fatal bootstrap error, is never — each shard worker
    /// retries its own failures internally).
    pub async fn run(&self) -> GwResult<()> {
        let bootstrap = SourceZoneBootstrap::new(self.store.clone(), self.remote.clone(), self.source_zone.clone(), self.log_pool.clone());

        let info = bootstrap.ensure_initialized(&self.cookie).await?;
        let info = if info.state == SourceSyncState::Init {
            bootstrap.build_full_sync_maps(&self.cookie, self.num_local_log_shards).await?;
            bootstrap.ensure_initialized(&self.cookie).await?
        } else {
            info
        };
        info!(zone = %self.source_zone, num_shards = info.num_shards, "source zone sync engine starting shard workers");

        let mut handles = Vec::new();
        for shard_id in 0..info.num_shards {
            let controller = Arc::new(ShardController::new(
                shard_id,
                self.source_zone.clone(),
                self.log_pool.clone(),
                self.store.clone(),
                self.remote.clone(),
                self.policy.clone(),
                self.replicator.clone(),
                self.is_archive_zone,
                self.local_dcl.clone(),
                format!("{}-{shard_id}", self.cookie),
                self.error_log.clone(),
            ));
            handles.push(tokio::spawn(async move { controller.run().await }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(zone = %self.source_zone, error = %e, "shard worker task panicked");
            }
        }
        Ok(())
    }
}
