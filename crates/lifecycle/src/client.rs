use crate::types::LcPolicy;
use async_trait::async_trait;
use gwtypes::GwResult;
use time::OffsetDateTime;

/// One listed object or version, as returned by the bucket-index
/// listing calls the lifecycle engine drives (§4.6 "Non-versioned
/// path", "Versioned path").
#[derive(Debug, Clone)]
pub struct ListedObject {
    pub key: String,
    pub instance: String,
    pub mtime: OffsetDateTime,
    pub size: u64,
    pub is_current: bool,
    pub is_delete_marker: bool,
    /// `true` for keys under the reserved namespace (multipart parts,
    /// OLH shadow objects) the non-versioned/versioned sweeps must
    /// skip (§4.6 "skip namespaced objects").
    pub is_namespaced: bool,
}

/// One in-progress multipart upload, as listed under the MULTIPART
/// namespace (§4.6 "Multipart-upload expiration").
#[derive(Debug, Clone)]
pub struct MultipartUpload {
    pub meta_key: String,
    pub upload_id: String,
    pub mtime: OffsetDateTime,
}

/// The bucket-facing operations `bucket_lc_process` needs from the
/// object store (§6.1, specialized for lifecycle listing/deletion).
/// This is the one external collaborator the engine is built against;
/// a production build plugs in the real bucket-index client here.
#[async_trait]
pub trait LifecycleObjectClient: Send + Sync + 'static {
    async fn get_lc_policy(&self, bucket: &str) -> GwResult<LcPolicy>;

    /// Whether the bucket has versioning enabled, selecting between the
    /// non-versioned and versioned processing paths.
    async fn is_versioned(&self, bucket: &str) -> GwResult<bool>;

    /// Lists current-version objects under `prefix`, paginated by `marker`.
    async fn list_objects(&self, bucket: &str, prefix: &str, marker: &str, max: usize) -> GwResult<(Vec<ListedObject>, bool, String)>;

    /// Lists every version (current and non-current, including delete
    /// markers) under `prefix`, paginated by `marker`, newest first
    /// within each key so "next-older" is simply the following entry.
    async fn list_object_versions(&self, bucket: &str, prefix: &str, marker: &str, max: usize) -> GwResult<(Vec<ListedObject>, bool, String)>;

    /// Lists in-progress multipart uploads under `prefix`.
    async fn list_multipart_uploads(&self, bucket: &str, prefix: &str, marker: &str, max: usize) -> GwResult<(Vec<MultipartUpload>, bool, String)>;

    /// Re-reads an object's current tag set, for tag-filter matching.
    async fn get_tags(&self, bucket: &str, key: &str, instance: &str) -> GwResult<Vec<(String, String)>>;

    /// Re-reads an object's current mtime, to detect a write racing
    /// the expiration check (§4.6 "re-read object state — skip if
    /// mtime changed").
    async fn get_mtime(&self, bucket: &str, key: &str, instance: &str) -> GwResult<OffsetDateTime>;

    /// Deletes one specific version. `remove_indeed = true` performs a
    /// hard delete rather than writing a delete marker (§4.6
    /// "non-current ... remove_indeed = true").
    async fn delete_object(&self, bucket: &str, key: &str, instance: &str, remove_indeed: bool) -> GwResult<()>;

    async fn abort_multipart_upload(&self, bucket: &str, upload_id: &str) -> GwResult<()>;
}
