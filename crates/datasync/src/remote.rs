use crate::types::BilogEntry;
use async_trait::async_trait;
use gwtypes::GwResult;

/// A source zone's bilog listing response (§6.2 bucket-index endpoint).
#[derive(Debug, Clone)]
pub struct BilogPage {
    pub entries: Vec<BilogEntry>,
    pub truncated: bool,
    /// Populated only by peers new enough to report it (§9 open
    /// question: absence means "no generation transition", not
    /// "current generation is complete").
    pub next_log: Option<(u64, u32)>,
}

/// A source zone's data-log listing response.
#[derive(Debug, Clone)]
pub struct DataLogPage {
    pub entries: Vec<changelog::LogEntry>,
    pub marker: String,
    pub truncated: bool,
}

/// Bucket-instance metadata as returned by a peer (§6.2
/// `/admin/metadata/bucket.instance`).
#[derive(Debug, Clone)]
pub struct BucketInstance {
    pub key: String,
    pub tenant: String,
    pub name: String,
    pub bucket_id: String,
    pub num_shards: u32,
}

/// One page of a remote bucket's version listing (§6.2 `?versions`).
#[derive(Debug, Clone)]
pub struct ObjectVersionEntry {
    pub key: String,
    pub version_id: String,
    pub is_latest: bool,
    pub is_delete_marker: bool,
    #[allow(dead_code)]
    pub size: u64,
    pub mtime: time::OffsetDateTime,
}

/// The HTTP admin surface a peer zone exposes (§6.2). This is a
/// deliberately excluded external collaborator: the wire parsing, the
/// HTTP client pool, and connection retry policy all live outside this
/// workspace. We program against this trait the same way `objstore`
/// programs against `ObjectStore` — any real implementation plugs a
/// request client in behind it.
#[async_trait]
pub trait SourceZoneClient: Send + Sync + 'static {
    async fn data_log_num_shards(&self) -> GwResult<u32>;

    async fn data_log_shard_info(&self, shard: u32) -> GwResult<(String, Option<time::OffsetDateTime>)>;

    async fn data_log_list(&self, shard: u32, from_marker: &str) -> GwResult<DataLogPage>;

    async fn bucket_instance_list(&self, from_marker: &str, max: usize) -> GwResult<(Vec<String>, String, bool)>;

    async fn bucket_instance_get(&self, key: &str) -> GwResult<BucketInstance>;

    async fn bilog_info(&self, bucket_instance_key: &str) -> GwResult<(Vec<String>, u64, u64)>;

    async fn bilog_list(
        &self,
        bucket_instance_key: &str,
        shard: u32,
        generation: u64,
        from_marker: &str,
    ) -> GwResult<BilogPage>;

    async fn bucket_list_versions(
        &self,
        bucket: &str,
        key_marker: &str,
        version_id_marker: &str,
    ) -> GwResult<(Vec<ObjectVersionEntry>, bool, String, String)>;
}
