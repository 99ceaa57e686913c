use super::{LogBackend, PreparedBatch, RawLogEntry};
use async_trait::async_trait;
use gwtypes::GwResult;
use objstore::{ObjectId, ObjectStore, Op};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;

const NEXT_ID_ATTR: &str = "next_id";
const LAST_UPDATE_ATTR: &str = "last_update";
const MAX_RETRIES: usize = 10;

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    payload: Vec<u8>,
}

/// Each shard is one object storing entries in an ordered key-value map
/// keyed by a synthesized monotonic id (§4.1 "Ordered-omap backend").
/// `max_marker()` is a fixed sentinel wider than any real id this backend
/// will ever synthesize.
pub struct OrderedOmapBackend {
    store: Arc<dyn ObjectStore>,
    pool: String,
    prefix: String,
    gen_id: u64,
}

impl OrderedOmapBackend {
    pub fn new(store: Arc<dyn ObjectStore>, pool: impl Into<String>, prefix: impl Into<String>, gen_id: u64) -> Self {
        Self {
            store,
            pool: pool.into(),
            prefix: prefix.into(),
            gen_id,
        }
    }

    fn shard_object(&self, shard: u32) -> ObjectId {
        let oid = if self.gen_id == 0 {
            format!("{}.{}", self.prefix, shard)
        } else {
            format!("{}@G{}.{}", self.prefix, self.gen_id, shard)
        };
        ObjectId::new(self.pool.clone(), oid)
    }

    fn encode_id(id: u64) -> String {
        format!("{id:010}")
    }
}

#[async_trait]
impl LogBackend for OrderedOmapBackend {
    async fn push(&self, shard: u32, batch: PreparedBatch) -> GwResult<()> {
        if batch.entries.is_empty() {
            return Ok(());
        }
        let id = self.shard_object(shard);

        for attempt in 0..MAX_RETRIES {
            // No primitive reads an object's version directly; a no-op
            // compound operate is the cheapest way to learn it (mirrors
            // an object stat round trip).
            let version = self.store.operate(&id, vec![]).await?;

            let attrs = self.store.get_attrs(&id).await.unwrap_or_default();
            let mut next_id: u64 = attrs
                .get(NEXT_ID_ATTR)
                .and_then(|b| std::str::from_utf8(b).ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);

            let mut kvs = Vec::with_capacity(batch.entries.len());
            let mut last_ts = batch.entries[0].0;
            for (ts, payload) in &batch.entries {
                let encoded = serde_json::to_vec(&StoredEntry {
                    timestamp: *ts,
                    payload: payload.clone(),
                })
                .map_err(|e| gwtypes::GwError::fatal(e))?;
                kvs.push((Self::encode_id(next_id), encoded));
                next_id += 1;
                last_ts = *ts;
            }

            let result = self
                .store
                .operate(
                    &id,
                    vec![
                        Op::AssertVersion(version),
                        Op::OmapSet(kvs),
                        Op::SetAttr(NEXT_ID_ATTR.into(), next_id.to_string().into_bytes()),
                        Op::SetAttr(
                            LAST_UPDATE_ATTR.into(),
                            last_ts
                                .format(&time::format_description::well_known::Rfc3339)
                                .map_err(|e| gwtypes::GwError::fatal(e))?
                                .into_bytes(),
                        ),
                    ],
                )
                .await;

            match result {
                Ok(_) => return Ok(()),
                Err(e) if e.is_retryable() && attempt + 1 < MAX_RETRIES => continue,
                Err(e) => return Err(e),
            }
        }
        Err(gwtypes::GwError::Canceled(format!(
            "{id}: exhausted {MAX_RETRIES} retries pushing to shard {shard}"
        )))
    }

    async fn list(
        &self,
        shard: u32,
        max: usize,
        from_marker: Option<&str>,
    ) -> GwResult<(Vec<RawLogEntry>, String, bool)> {
        let id = self.shard_object(shard);
        let (kvs, truncated) = match self.store.omap_get_range(&id, from_marker, None, max).await {
            Ok(v) => v,
            Err(e) if e.is_not_found() => return Ok((Vec::new(), String::new(), false)),
            Err(e) => return Err(e),
        };

        let mut out = Vec::with_capacity(kvs.len());
        let mut next_marker = String::new();
        for (marker, bytes) in kvs {
            let stored: StoredEntry = serde_json::from_slice(&bytes).map_err(|e| gwtypes::GwError::fatal(e))?;
            next_marker = marker.clone();
            out.push(RawLogEntry {
                marker,
                timestamp: stored.timestamp,
                payload: stored.payload,
            });
        }
        Ok((out, next_marker, truncated))
    }

    async fn get_info(&self, shard: u32) -> GwResult<(String, Option<OffsetDateTime>)> {
        let id = self.shard_object(shard);
        let attrs = match self.store.get_attrs(&id).await {
            Ok(a) => a,
            Err(e) if e.is_not_found() => return Ok((String::new(), None)),
            Err(e) => return Err(e),
        };
        let next_id: u64 = attrs
            .get(NEXT_ID_ATTR)
            .and_then(|b| std::str::from_utf8(b).ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let max_marker = if next_id == 0 {
            String::new()
        } else {
            Self::encode_id(next_id - 1)
        };
        let last_update = attrs
            .get(LAST_UPDATE_ATTR)
            .and_then(|b| std::str::from_utf8(b).ok())
            .and_then(|s| OffsetDateTime::parse(s, &time::format_description::well_known::Rfc3339).ok());
        Ok((max_marker, last_update))
    }

    async fn trim(&self, shard: u32, up_to_marker: &str) -> GwResult<()> {
        let id = self.shard_object(shard);
        match self
            .store
            .operate(
                &id,
                vec![Op::OmapRemoveRange {
                    from: Self::encode_id(0),
                    to: up_to_marker.to_string(),
                }],
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn max_marker(&self) -> String {
        // Ten nines, not eight: `encode_id` zero-pads to 10 digits, and an
        // eight-nine sentinel would be a strict prefix of (so sort below)
        // any real marker once a shard's id counter passes 10^8.
        "9999999999".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objstore::MemStore;

    fn backend() -> OrderedOmapBackend {
        OrderedOmapBackend::new(Arc::new(MemStore::new()), "log-pool", "data_log", 0)
    }

    #[tokio::test]
    async fn push_then_list_preserves_order() {
        let be = backend();
        let t0 = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        be.push_one(0, t0, b"a".to_vec()).await.unwrap();
        be.push_one(0, t0, b"b".to_vec()).await.unwrap();

        let (entries, marker, truncated) = be.list(0, 10, None).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!truncated);
        assert_eq!(entries[0].payload, b"a");
        assert_eq!(entries[1].payload, b"b");
        assert_eq!(marker, entries[1].marker);
    }

    #[tokio::test]
    async fn trim_removes_up_to_marker() {
        let be = backend();
        let t0 = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        be.push_one(0, t0, b"a".to_vec()).await.unwrap();
        be.push_one(0, t0, b"b".to_vec()).await.unwrap();
        let (entries, ..) = be.list(0, 10, None).await.unwrap();
        let first_marker = entries[0].marker.clone();

        be.trim(0, &first_marker).await.unwrap();
        let (remaining, ..) = be.list(0, 10, None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].payload, b"b");
    }

    #[tokio::test]
    async fn missing_shard_lists_empty() {
        let be = backend();
        let (entries, marker, truncated) = be.list(3, 10, None).await.unwrap();
        assert!(entries.is_empty());
        assert_eq!(marker, "");
        assert!(!truncated);
    }

    #[tokio::test]
    async fn gen_suffix_applied_for_nonzero_generation() {
        let be = OrderedOmapBackend::new(Arc::new(MemStore::new()), "log-pool", "data_log", 3);
        assert_eq!(be.shard_object(2).oid, "data_log@G3.2");
    }
}
