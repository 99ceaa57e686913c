//! Composition root wiring the four engines (DCL, IDSE, BR, LCE) onto a
//! shared object-store backend and a `/metrics` endpoint.

use anyhow::Context;
use async_trait::async_trait;
use axum::{extract::State, routing::get, Router};
use changelog::{DataChangeLog, GenerationRecord, GenerationsManager, GenerationsObserver, LogType};
use clap::Parser;
use datasync::{
    BucketInstance, BilogPage, DataLogPage, ObjectReplicator, ObjectVersionEntry, Pipe, SourceZoneClient, SourceZoneSyncEngine, StaticPolicyResolver,
    SyncErrorLog,
};
use futures::FutureExt;
use gwtypes::GwResult;
use lifecycle::{LcPolicy, LifecycleEngine, LifecycleObjectClient, ListedObject, MultipartUpload, ProcessConfig, Schedule};
use metrics_exporter_prometheus::PrometheusHandle;
use objstore::{MemStore, ObjectStore};
use reshard::{BucketResharder, NoFaults, ReshardConfig, ReshardQueue, ReshardWorker};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{info, warn};

/// Flags for the gateway daemon. Modeled on the control-plane agent's
/// CLI: `clap` derive, `env` fallbacks, sensible defaults for local
/// bring-up.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Port the `/metrics` endpoint listens on.
    #[clap(long, env = "METRICS_PORT", default_value = "9090")]
    metrics_port: u16,
    /// Pool backing the data-change log's shard objects.
    #[clap(long, env = "LOG_POOL", default_value = "gateway.log")]
    log_pool: String,
    /// Pool backing the reshard queue and lock/layout objects.
    #[clap(long, env = "RESHARD_POOL", default_value = "gateway.reshard")]
    reshard_pool: String,
    /// Pool backing the lifecycle shard objects.
    #[clap(long, env = "LIFECYCLE_POOL", default_value = "gateway.lc")]
    lifecycle_pool: String,
    /// Number of data-change-log shards.
    #[clap(long, env = "NUM_LOG_SHARDS", default_value = "16")]
    num_log_shards: u32,
    /// Number of lifecycle shards.
    #[clap(long, env = "NUM_LC_SHARDS", default_value = "8")]
    num_lc_shards: u32,
    /// A stable identity for this process's locks and leases. Defaults
    /// to the pod hostname in k8s deployments.
    #[clap(long, env = "COOKIE")]
    cookie: Option<String>,
    /// How often the reshard queue and lifecycle engine wake to sweep
    /// for work.
    #[clap(long, env = "SWEEP_INTERVAL_SECS", default_value = "30")]
    sweep_interval_secs: u64,
    /// Enables the incremental data sync engine against a configured
    /// source zone. Off by default: this build ships no real peer-zone
    /// HTTP client, only a local no-op placeholder.
    #[clap(long, env = "ENABLE_SYNC")]
    enable_sync: bool,
    /// Source zone name to sync from, when `--enable-sync` is set.
    #[clap(long, env = "SOURCE_ZONE", default_value = "")]
    source_zone: String,
}

fn main() -> Result<(), anyhow::Error> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let args = Args::parse();
    tracing::info!(?args, "started!");

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let task = runtime.spawn(async move { async_main(args).await });
    let result = runtime.block_on(task);

    tracing::info!(?result, "main function completed, shutting down runtime");
    runtime.shutdown_timeout(Duration::from_secs(5));
    result?
}

async fn async_main(args: Args) -> Result<(), anyhow::Error> {
    let cookie = args.cookie.clone().unwrap_or_else(|| std::env::var("HOSTNAME").unwrap_or_else(|_| "gateway-daemon".to_string()));

    // The in-memory reference `ObjectStore` implementation. A real
    // deployment swaps this for a RADOS-backed client; every engine
    // here is built against the trait, not this implementation.
    let store: Arc<dyn ObjectStore> = Arc::new(MemStore::new());

    let metrics_handle = gateway_metrics::install();
    // No admin CLI (§1 Non-goals), but the sync-error ring buffer is
    // ambient observability and gets a read-only route alongside metrics.
    let sync_errors: Arc<SyncErrorLog> = Arc::new(SyncErrorLog::new(1000));

    let shutdown = tokio::signal::ctrl_c().map(|_| ()).shared();

    let dcl = build_dcl(store.clone(), &args).await?;
    let (dcl_shutdown_tx, dcl_shutdown_rx) = tokio::sync::oneshot::channel();
    let dcl_for_renewal = dcl.clone();
    let renewal_task = tokio::spawn(async move { dcl_for_renewal.run_renewal_loop(dcl_shutdown_rx).await });

    let resharder = Arc::new(BucketResharder::new(store.clone(), Some(dcl.clone()), Arc::new(NoFaults), args.reshard_pool.clone(), cookie.clone(), ReshardConfig::default()));
    let reshard_queue = Arc::new(ReshardQueue::new(store.clone(), args.reshard_pool.clone(), args.num_log_shards));
    let reshard_worker = ReshardWorker::new(store.clone(), reshard_queue, resharder, cookie.clone());
    let reshard_task = {
        let num_log_shards = args.num_log_shards;
        let interval = Duration::from_secs(args.sweep_interval_secs);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                for logshard in 0..num_log_shards {
                    if let Err(e) = reshard_worker.drain_logshard(logshard).await {
                        warn!(logshard, error = %e, "reshard queue drain failed");
                    }
                }
            }
        })
    };

    let lifecycle_engine = LifecycleEngine::new(
        store.clone(),
        Arc::new(NoopLifecycleClient) as Arc<dyn LifecycleObjectClient>,
        args.lifecycle_pool.clone(),
        args.num_lc_shards,
        cookie.clone(),
        Schedule::default(),
        ProcessConfig::default(),
    );
    let lifecycle_task = {
        let interval = Duration::from_secs(args.sweep_interval_secs);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                lifecycle_engine.sweep().await;
            }
        })
    };

    let (sync_task, sync_errors) = if args.enable_sync {
        let engine = Arc::new(SourceZoneSyncEngine::new(
            store.clone(),
            Arc::new(NoopSourceZoneClient) as Arc<dyn SourceZoneClient>,
            Arc::new(StaticPolicyResolver::new(Vec::<Pipe>::new())),
            Arc::new(NoopObjectReplicator) as Arc<dyn ObjectReplicator>,
            false,
            Some(dcl.clone()),
            args.source_zone.clone(),
            args.log_pool.clone(),
            args.num_log_shards,
            cookie.clone(),
        ));
        let error_log = engine.error_log();
        let task = tokio::spawn(async move {
            if let Err(e) = engine.run().await {
                warn!(error = %e, "source zone sync engine exited");
            }
        });
        (task, error_log)
    } else {
        let task = tokio::spawn(async move { info!("incremental data sync disabled (--enable-sync not set)") });
        (task, sync_errors)
    };

    let metrics_listener = tokio::net::TcpListener::bind(format!("[::]:{}", args.metrics_port))
        .await
        .context("failed to bind metrics port")?;
    let metrics_routes = Router::new().route("/metrics", get(render_metrics)).with_state(metrics_handle);
    let admin_routes = Router::new().route("/admin/sync-errors", get(render_sync_errors)).with_state(sync_errors);
    let router = metrics_routes.merge(admin_routes);
    let metrics_server = axum::serve(metrics_listener, router);
    let metrics_server = async move { anyhow::Result::Ok(metrics_server.await?) };

    tokio::select! {
        result = metrics_server => { result? }
        _ = shutdown.clone() => {
            info!("shutdown signal received");
        }
    }

    let _ = dcl_shutdown_tx.send(());
    renewal_task.abort();
    reshard_task.abort();
    lifecycle_task.abort();
    sync_task.abort();

    Ok(())
}

async fn render_metrics(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

async fn render_sync_errors(State(log): State<Arc<SyncErrorLog>>) -> String {
    log.snapshot()
        .into_iter()
        .map(|r| format!("{}\t{}\t{}\t{}", r.timestamp, r.bucket_shard_key, r.gen.map(|g| g.to_string()).unwrap_or_default(), r.error))
        .collect::<Vec<_>>()
        .join("\n")
}

async fn build_dcl(store: Arc<dyn ObjectStore>, args: &Args) -> anyhow::Result<Arc<DataChangeLog>> {
    struct NullObserver;
    #[async_trait]
    impl GenerationsObserver for NullObserver {
        async fn handle_init(&self, _non_empty: Vec<GenerationRecord>) {}
        async fn handle_new_gens(&self, _new: Vec<GenerationRecord>) {}
        async fn handle_empty_to(&self, _new_tail: u64) {}
    }

    let generations = GenerationsManager::load_or_init(store, args.log_pool.clone(), "data_log", args.num_log_shards, LogType::OrderedOmap, &NullObserver)
        .await
        .context("initializing log generations")?;
    Ok(Arc::new(DataChangeLog::new(Arc::new(generations), args.num_log_shards, Duration::from_secs(120))))
}

/// Placeholder `LifecycleObjectClient`: reports no lifecycle policy for
/// every bucket, so the engine's sweeps run but process nothing. A real
/// deployment replaces this with a bucket-index-backed client.
struct NoopLifecycleClient;

#[async_trait]
impl LifecycleObjectClient for NoopLifecycleClient {
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

/// Placeholder `ObjectReplicator`: acknowledges every fetch/delete
/// without touching any object data. Fetching bytes across zones is
/// outside this workspace's scope (§1 Non-goals); a real deployment
/// replaces this with an HTTP-backed implementation that actually moves
/// object data between zones.
struct NoopObjectReplicator;

#[async_trait]
impl ObjectReplicator for NoopObjectReplicator {
    async fn fetch_and_write(&self, _object: &str, _instance: &str, _olh_epoch: Option<u64>) -> GwResult<()> {
        Ok(())
    }
    async fn delete(&self, _object: &str, _instance: &str) -> GwResult<()> {
        Ok(())
    }
    async fn create_delete_marker(&self, _object: &str) -> GwResult<()> {
        Ok(())
    }
}

/// Placeholder `SourceZoneClient`: reports zero data-log shards and no
/// buckets, so the sync engine bootstraps and idles rather than
/// spawning shard workers against a peer that doesn't exist in this
/// build. A real deployment replaces this with an HTTP admin-API client
/// against the peer zone's gateway.
struct NoopSourceZoneClient;

#[async_trait]
impl SourceZoneClient for NoopSourceZoneClient {
    async fn data_log_num_shards(&self) -> GwResult<u32> {
        Ok(0)
    }
    async fn data_log_shard_info(&self, _shard: u32) -> GwResult<(String, Option<OffsetDateTime>)> {
        Ok((String::new(), None))
    }
    async fn data_log_list(&self, _shard: u32, _from_marker: &str) -> GwResult<DataLogPage> {
        Ok(DataLogPage { entries: vec![], marker: String::new(), truncated: false })
    }
    async fn bucket_instance_list(&self, _from_marker: &str, _max: usize) -> GwResult<(Vec<String>, String, bool)> {
        Ok((vec![], String::new(), false))
    }
    async fn bucket_instance_get(&self, key: &str) -> GwResult<BucketInstance> {
        Err(gwtypes::GwError::NotFound(key.to_string()))
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
