mod fifo;
mod ordered_omap;

pub use fifo::FifoBackend;
pub use ordered_omap::OrderedOmapBackend;

use async_trait::async_trait;
use gwtypes::GwResult;

/// One stored log entry, as returned by [`LogBackend::list`]. Decoding the
/// payload into a `DataChange` is left to the caller (§3 "Log entry").
#[derive(Debug, Clone, PartialEq)]
pub struct RawLogEntry {
    pub marker: String,
    pub timestamp: time::OffsetDateTime,
    pub payload: Vec<u8>,
}

/// A backend-native batch built by [`LogBackend::prepare`], ready to push.
/// No I/O has happened yet (§4.1).
#[derive(Debug, Clone)]
pub struct PreparedBatch {
    pub entries: Vec<(time::OffsetDateTime, Vec<u8>)>,
}

/// Abstracts a per-shard append log over the object store (§4.1). Two
/// implementations exist: [`OrderedOmapBackend`] and [`FifoBackend`];
/// callers hold one as `Box<dyn LogBackend>` and pick the implementation
/// at generation-instantiation time from the persisted `log_type`
/// discriminator (§9 "Dynamic dispatch for log backends").
#[async_trait]
pub trait LogBackend: Send + Sync {
    /// Builds a batched record with no I/O (§4.1).
    fn prepare(&self, now: time::OffsetDateTime, payloads: Vec<Vec<u8>>) -> PreparedBatch {
        PreparedBatch {
            entries: payloads.into_iter().map(|p| (now, p)).collect(),
        }
    }

    /// Atomically appends a prepared batch to shard `shard`'s log object.
    async fn push(&self, shard: u32, batch: PreparedBatch) -> GwResult<()>;

    /// Shorthand for a single-entry push.
    async fn push_one(&self, shard: u32, now: time::OffsetDateTime, payload: Vec<u8>) -> GwResult<()> {
        self.push(shard, PreparedBatch { entries: vec![(now, payload)] }).await
    }

    /// Ordered listing starting strictly after `from_marker` (or from the
    /// beginning if `None`), up to `max` entries. A missing shard object
    /// yields `(empty, "", false)` rather than an error (§4.1).
    async fn list(
        &self,
        shard: u32,
        max: usize,
        from_marker: Option<&str>,
    ) -> GwResult<(Vec<RawLogEntry>, String, bool)>;

    /// `(max_marker_in_shard, last_update_time)`.
    async fn get_info(&self, shard: u32) -> GwResult<(String, Option<time::OffsetDateTime>)>;

    /// Removes entries whose markers are `<= up_to_marker`. A missing
    /// shard object is success, not an error (§4.1).
    async fn trim(&self, shard: u32, up_to_marker: &str) -> GwResult<()>;

    /// A constant string that compares greater than any real marker this
    /// backend can produce; used as a trim sentinel meaning "nothing was
    /// ever trimmed" (§4.1).
    fn max_marker(&self) -> String;
}
