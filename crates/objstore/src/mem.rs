use crate::{Notification, ObjectId, ObjectStore, ObjVersion, Op, WatchHandle};
use async_trait::async_trait;
use dashmap::DashMap;
use gwtypes::{GwError, GwResult};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

#[derive(Default)]
struct Object {
    version: u64,
    bytes: Vec<u8>,
    attrs: BTreeMap<String, Vec<u8>>,
    omap: BTreeMap<String, Vec<u8>>,
    locks: BTreeMap<String, LockState>,
}

struct LockState {
    cookie: String,
    expires_at: Instant,
}

/// An in-memory reference implementation of [`ObjectStore`], sufficient
/// to drive every other crate's tests. Not a production backend: no
/// durability, no real network partitions. Modeled closely enough on
/// RADOS semantics (CAS via version assertion, exclusive locks with a
/// cookie, watch/notify) that the engines built against it exercise the
/// same code paths a real object-store client would.
pub struct MemStore {
    objects: DashMap<ObjectId, Mutex<Object>>,
    watchers: DashMap<ObjectId, broadcast::Sender<Notification>>,
    notify_seq: AtomicU64,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            watchers: DashMap::new(),
            notify_seq: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn operate(&self, id: &ObjectId, ops: Vec<Op>) -> GwResult<ObjVersion> {
        let entry = self.objects.entry(id.clone()).or_default();
        let mut obj = entry.lock().unwrap();

        // First pass: validate preconditions without mutating, so a
        // failing op leaves the object untouched (atomicity).
        for op in &ops {
            match op {
                Op::AssertVersion(expect) => {
                    if obj.version != *expect {
                        return Err(GwError::Canceled(format!(
                            "{id}: version mismatch, expected {expect} got {}",
                            obj.version
                        )));
                    }
                }
                Op::CreateExclusive => {
                    if obj.version != 0 {
                        return Err(GwError::Canceled(format!("{id}: already exists")));
                    }
                }
                Op::AssertExists => {
                    if obj.version == 0 {
                        return Err(GwError::NotFound(id.to_string()));
                    }
                }
                _ => {}
            }
        }

        for op in ops {
            match op {
                Op::AssertVersion(_) | Op::CreateExclusive | Op::AssertExists => {}
                Op::SetAttr(k, v) => {
                    obj.attrs.insert(k, v);
                }
                Op::RemoveAttr(k) => {
                    obj.attrs.remove(&k);
                }
                Op::WriteFull(bytes) => {
                    obj.bytes = bytes;
                }
                Op::OmapSet(kvs) => {
                    for (k, v) in kvs {
                        obj.omap.insert(k, v);
                    }
                }
                Op::OmapRemoveKeys(keys) => {
                    for k in keys {
                        obj.omap.remove(&k);
                    }
                }
                Op::OmapRemoveRange { from, to } => {
                    let keys: Vec<String> = obj
                        .omap
                        .range(from..=to)
                        .map(|(k, _)| k.clone())
                        .collect();
                    for k in keys {
                        obj.omap.remove(&k);
                    }
                }
                Op::Remove => {
                    *obj = Object::default();
                    continue;
                }
            }
        }
        obj.version += 1;
        Ok(obj.version)
    }

    async fn read_full(&self, id: &ObjectId) -> GwResult<Vec<u8>> {
        let entry = self
            .objects
            .get(id)
            .ok_or_else(|| GwError::NotFound(id.to_string()))?;
        let obj = entry.lock().unwrap();
        if obj.version == 0 {
            return Err(GwError::NotFound(id.to_string()));
        }
        Ok(obj.bytes.clone())
    }

    async fn get_attrs(&self, id: &ObjectId) -> GwResult<BTreeMap<String, Vec<u8>>> {
        let entry = self
            .objects
            .get(id)
            .ok_or_else(|| GwError::NotFound(id.to_string()))?;
        Ok(entry.lock().unwrap().attrs.clone())
    }

    async fn omap_get_range(
        &self,
        id: &ObjectId,
        from: Option<&str>,
        to: Option<&str>,
        max: usize,
    ) -> GwResult<(Vec<(String, Vec<u8>)>, bool)> {
        let Some(entry) = self.objects.get(id) else {
            return Ok((Vec::new(), false));
        };
        let obj = entry.lock().unwrap();

        let iter = obj.omap.range::<str, _>((
            from.map(std::ops::Bound::Excluded)
                .unwrap_or(std::ops::Bound::Unbounded),
            to.map(std::ops::Bound::Excluded)
                .unwrap_or(std::ops::Bound::Unbounded),
        ));

        let mut out = Vec::with_capacity(max.min(obj.omap.len()));
        let mut truncated = false;
        for (i, (k, v)) in iter.enumerate() {
            if i == max {
                truncated = true;
                break;
            }
            out.push((k.clone(), v.clone()));
        }
        Ok((out, truncated))
    }

    async fn list_raw_objects(
        &self,
        pool: &str,
        from_marker: &str,
        max: usize,
    ) -> GwResult<(Vec<String>, String)> {
        let mut oids: Vec<String> = self
            .objects
            .iter()
            .filter(|kv| kv.key().pool == pool && kv.key().oid.as_str() > from_marker)
            .map(|kv| kv.key().oid.clone())
            .collect();
        oids.sort();
        let truncated = oids.len() > max;
        oids.truncate(max);
        let next_marker = if truncated {
            oids.last().cloned().unwrap_or_default()
        } else {
            String::new()
        };
        Ok((oids, next_marker))
    }

    async fn exists(&self, id: &ObjectId) -> GwResult<bool> {
        Ok(self
            .objects
            .get(id)
            .map(|e| e.lock().unwrap().version != 0)
            .unwrap_or(false))
    }

    async fn remove(&self, id: &ObjectId) -> GwResult<()> {
        self.objects.remove(id);
        Ok(())
    }

    async fn lock_exclusive(
        &self,
        id: &ObjectId,
        name: &str,
        cookie: &str,
        duration: Duration,
        must_renew: bool,
    ) -> GwResult<()> {
        let entry = self.objects.entry(id.clone()).or_default();
        let mut obj = entry.lock().unwrap();
        let now = Instant::now();

        if let Some(existing) = obj.locks.get(name) {
            let held_by_other = existing.cookie != cookie;
            let still_live = existing.expires_at > now;
            if held_by_other && still_live {
                return Err(GwError::Busy(format!("{id}#{name} held by another cookie")));
            }
            if must_renew && existing.cookie != cookie {
                return Err(GwError::Busy(format!(
                    "{id}#{name}: cannot renew, not the current holder"
                )));
            }
        } else if must_renew {
            return Err(GwError::Busy(format!("{id}#{name}: no lock to renew")));
        }

        obj.locks.insert(
            name.to_string(),
            LockState {
                cookie: cookie.to_string(),
                expires_at: now + duration,
            },
        );
        Ok(())
    }

    async fn unlock(&self, id: &ObjectId, name: &str, cookie: &str) -> GwResult<()> {
        if let Some(entry) = self.objects.get(id) {
            let mut obj = entry.lock().unwrap();
            if let Some(existing) = obj.locks.get(name) {
                if existing.cookie == cookie {
                    obj.locks.remove(name);
                }
            }
        }
        Ok(())
    }

    async fn watch(&self, id: &ObjectId) -> GwResult<WatchHandle> {
        let sender = self
            .watchers
            .entry(id.clone())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone();
        Ok(WatchHandle::new(sender.subscribe()))
    }

    async fn notify(&self, id: &ObjectId, payload: Vec<u8>) -> GwResult<()> {
        if let Some(sender) = self.watchers.get(id) {
            let notify_id = self.notify_seq.fetch_add(1, Ordering::Relaxed);
            // No live receivers is not an error: notify is best-effort.
            let _ = sender.send(Notification {
                notify_id,
                cookie: notify_id,
                notifier_id: 0,
                payload,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(s: &str) -> ObjectId {
        ObjectId::new("pool", s)
    }

    #[tokio::test]
    async fn create_exclusive_then_cas() {
        let store = MemStore::new();
        let id = oid("a");

        let v1 = store
            .operate(&id, vec![Op::CreateExclusive, Op::WriteFull(b"hi".to_vec())])
            .await
            .unwrap();
        assert_eq!(v1, 1);

        let err = store
            .operate(&id, vec![Op::CreateExclusive])
            .await
            .unwrap_err();
        assert!(matches!(err, GwError::Canceled(_)));

        let v2 = store
            .operate(&id, vec![Op::AssertVersion(1), Op::WriteFull(b"bye".to_vec())])
            .await
            .unwrap();
        assert_eq!(v2, 2);

        let stale = store.operate(&id, vec![Op::AssertVersion(1)]).await;
        assert!(stale.is_err());
    }

    #[tokio::test]
    async fn omap_range_and_trim() {
        let store = MemStore::new();
        let id = oid("log.0");
        store
            .operate(
                &id,
                vec![Op::OmapSet(vec![
                    ("00000001".into(), b"a".to_vec()),
                    ("00000002".into(), b"b".to_vec()),
                    ("00000003".into(), b"c".to_vec()),
                ])],
            )
            .await
            .unwrap();

        let (entries, truncated) = store.omap_get_range(&id, None, None, 2).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(truncated);

        store
            .operate(
                &id,
                vec![Op::OmapRemoveRange {
                    from: "00000000".into(),
                    to: "00000002".into(),
                }],
            )
            .await
            .unwrap();
        let (entries, truncated) = store.omap_get_range(&id, None, None, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!truncated);
        assert_eq!(entries[0].0, "00000003");
    }

    #[tokio::test]
    async fn lock_exclusive_rejects_other_cookie() {
        let store = MemStore::new();
        let id = oid("bucket.lease");
        store
            .lock_exclusive(&id, "reshard", "cookie-a", Duration::from_secs(60), false)
            .await
            .unwrap();

        let err = store
            .lock_exclusive(&id, "reshard", "cookie-b", Duration::from_secs(60), false)
            .await
            .unwrap_err();
        assert!(matches!(err, GwError::Busy(_)));

        // Same cookie may re-acquire/renew.
        store
            .lock_exclusive(&id, "reshard", "cookie-a", Duration::from_secs(60), true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn watch_receives_notify() {
        let store = MemStore::new();
        let id = oid("gens");
        let mut handle = store.watch(&id).await.unwrap();
        store.notify(&id, b"changed".to_vec()).await.unwrap();

        let n = handle.recv().await.unwrap();
        assert_eq!(n.payload, b"changed");
    }
}
