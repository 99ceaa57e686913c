//! The Object-Store Client contract (§6.1). This is the one external
//! collaborator the spec asks us to model with a trait rather than a
//! real implementation — a production build would plug in a
//! content-addressed, RADOS-style client here. We define the trait
//! every other crate in this workspace programs against, plus an
//! in-memory reference implementation (`mem`) that satisfies it well
//! enough to drive the engines' own tests.
//!
//! Grounded on `journal-client`'s `Client`/`Error` split and on the
//! "coroutine yields at every I/O" design note: every suspension point
//! named in §5 (omap read, push, lease acquire/renew, watch/notify) is
//! simply an `.await` on one of this trait's methods.

mod mem;
mod ops;
mod watch;

pub use mem::MemStore;
pub use ops::Op;
pub use watch::{Notification, WatchHandle};

use async_trait::async_trait;
use gwtypes::GwResult;
use std::time::Duration;

/// `(pool, oid)` identifies a named object (§6.1).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId {
    pub pool: String,
    pub oid: String,
}

impl ObjectId {
    pub fn new(pool: impl Into<String>, oid: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            oid: oid.into(),
        }
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.pool, self.oid)
    }
}

/// The result of a successful compound `operate()`: the object's new
/// version, used for optimistic-concurrency CAS by callers (§3
/// "Ownership", §5 "Locking discipline").
pub type ObjVersion = u64;

/// The async object-store client contract. Implementations MUST apply
/// every `Op` in a single `operate()` call atomically (§6.1 "Atomic
/// compound operations").
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Applies a batch of ops atomically, returning the object's new
    /// version. `rgw_rados_operate(obj, op, yield_ctx)` in the source
    /// maps directly to awaiting this method: the `yield_ctx` is simply
    /// "this call is an await point."
    async fn operate(&self, id: &ObjectId, ops: Vec<Op>) -> GwResult<ObjVersion>;

    /// Reads the full byte payload of an object.
    async fn read_full(&self, id: &ObjectId) -> GwResult<Vec<u8>>;

    /// Reads the attribute map of an object.
    async fn get_attrs(&self, id: &ObjectId) -> GwResult<std::collections::BTreeMap<String, Vec<u8>>>;

    /// Reads an ordered key range `[from, to)` of an object's omap, up to
    /// `max` entries. `from = None` starts at the beginning; `to = None`
    /// has no upper bound. Returns `(entries, truncated)`.
    async fn omap_get_range(
        &self,
        id: &ObjectId,
        from: Option<&str>,
        to: Option<&str>,
        max: usize,
    ) -> GwResult<(Vec<(String, Vec<u8>)>, bool)>;

    /// Lists all known object ids under a pool, paginated from a marker.
    /// Returns `(oids, next_marker)`; an empty `next_marker` means done.
    async fn list_raw_objects(
        &self,
        pool: &str,
        from_marker: &str,
        max: usize,
    ) -> GwResult<(Vec<String>, String)>;

    /// Returns `true` if the named object exists.
    async fn exists(&self, id: &ObjectId) -> GwResult<bool>;

    /// Deletes an object outright (used for cleaning up stale reshard
    /// target/source shards). Missing object is success.
    async fn remove(&self, id: &ObjectId) -> GwResult<()>;

    /// Acquires (or renews, if `must_renew`) an exclusive lock slot named
    /// `name` on `id`, held by `cookie` for `duration`. Returns
    /// `GwError::Busy` if held by a different cookie (§6.1).
    async fn lock_exclusive(
        &self,
        id: &ObjectId,
        name: &str,
        cookie: &str,
        duration: Duration,
        must_renew: bool,
    ) -> GwResult<()>;

    /// Releases a previously-acquired lock. A mismatched cookie is a
    /// no-op success (the lock already expired and was taken by someone
    /// else, or we never held it).
    async fn unlock(&self, id: &ObjectId, name: &str, cookie: &str) -> GwResult<()>;

    /// Registers interest in notifications on `id`. The returned handle
    /// is a `Stream` of [`Notification`]; implementations MUST
    /// transparently re-establish the watch after a disconnect (§6.1).
    async fn watch(&self, id: &ObjectId) -> GwResult<WatchHandle>;

    /// Sends a notification to all current watchers of `id`.
    async fn notify(&self, id: &ObjectId, payload: Vec<u8>) -> GwResult<()>;
}
