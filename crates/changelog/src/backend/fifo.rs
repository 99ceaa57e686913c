use super::{LogBackend, PreparedBatch, RawLogEntry};
use async_trait::async_trait;
use gwtypes::{GwError, GwResult};
use objstore::{ObjectId, ObjectStore, Op};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;

const HEAD_PART_ATTR: &str = "head_part";
const TAIL_PART_ATTR: &str = "tail_part";
const NEXT_OFFSET_ATTR: &str = "next_offset";
const LAST_UPDATE_ATTR: &str = "last_update";
const MAX_PART_ENTRIES: u64 = 100_000;
const MAX_RETRIES: usize = 10;

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    payload: Vec<u8>,
}

/// Each shard is a FIFO over multiple object parts; markers are
/// `{part_no}:{offset}` (§4.1 "FIFO backend"). The header object (the
/// shard object itself) tracks `head_part`/`tail_part`/`next_offset`;
/// each part is a separate object holding one page of entries keyed by
/// zero-padded offset.
pub struct FifoBackend {
    store: Arc<dyn ObjectStore>,
    pool: String,
    prefix: String,
    gen_id: u64,
}

impl FifoBackend {
    pub fn new(store: Arc<dyn ObjectStore>, pool: impl Into<String>, prefix: impl Into<String>, gen_id: u64) -> Self {
        Self {
            store,
            pool: pool.into(),
            prefix: prefix.into(),
            gen_id,
        }
    }

    fn header_object(&self, shard: u32) -> ObjectId {
        let oid = if self.gen_id == 0 {
            format!("{}.{}", self.prefix, shard)
        } else {
            format!("{}@G{}.{}", self.prefix, self.gen_id, shard)
        };
        ObjectId::new(self.pool.clone(), oid)
    }

    fn part_object(&self, shard: u32, part_no: u64) -> ObjectId {
        let header = self.header_object(shard);
        ObjectId::new(self.pool.clone(), format!("{}.p{part_no:010}", header.oid))
    }

    fn encode_marker(part_no: u64, offset: u64) -> String {
        format!("{part_no:010}:{offset:010}")
    }

    fn decode_marker(marker: &str) -> GwResult<(u64, u64)> {
        let (p, o) = marker
            .split_once(':')
            .ok_or_else(|| GwError::fatal(format!("malformed FIFO marker {marker}")))?;
        let part_no: u64 = p.parse().map_err(|_| GwError::fatal(format!("bad part in {marker}")))?;
        let offset: u64 = o.parse().map_err(|_| GwError::fatal(format!("bad offset in {marker}")))?;
        Ok((part_no, offset))
    }

    async fn read_header(&self, header: &ObjectId) -> GwResult<(u64, u64, u64)> {
        let attrs = match self.store.get_attrs(header).await {
            Ok(a) => a,
            Err(e) if e.is_not_found() => return Ok((0, 0, 0)),
            Err(e) => return Err(e),
        };
        let head_part = parse_attr(&attrs, HEAD_PART_ATTR);
        let tail_part = parse_attr(&attrs, TAIL_PART_ATTR);
        let next_offset = parse_attr(&attrs, NEXT_OFFSET_ATTR);
        Ok((head_part, tail_part, next_offset))
    }
}

fn parse_attr(attrs: &std::collections::BTreeMap<String, Vec<u8>>, key: &str) -> u64 {
    attrs
        .get(key)
        .and_then(|b| std::str::from_utf8(b).ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl LogBackend for FifoBackend {
    async fn push(&self, shard: u32, batch: PreparedBatch) -> GwResult<()> {
        if batch.entries.is_empty() {
            return Ok(());
        }
        let header = self.header_object(shard);
        let n = batch.entries.len() as u64;

        for attempt in 0..MAX_RETRIES {
            let version = self.store.operate(&header, vec![]).await?;
            let (mut head_part, tail_part, mut next_offset) = self.read_header(&header).await?;

            if next_offset + n > MAX_PART_ENTRIES {
                head_part += 1;
                next_offset = 0;
            }
            let part_no = head_part;
            let base_offset = next_offset;
            let last_ts = batch.entries.last().unwrap().0;

            let result = self
                .store
                .operate(
                    &header,
                    vec![
                        Op::AssertVersion(version),
                        Op::SetAttr(HEAD_PART_ATTR.into(), head_part.to_string().into_bytes()),
                        Op::SetAttr(TAIL_PART_ATTR.into(), tail_part.to_string().into_bytes()),
                        Op::SetAttr(NEXT_OFFSET_ATTR.into(), (next_offset + n).to_string().into_bytes()),
                        Op::SetAttr(
                            LAST_UPDATE_ATTR.into(),
                            last_ts
                                .format(&time::format_description::well_known::Rfc3339)
                                .map_err(GwError::fatal)?
                                .into_bytes(),
                        ),
                    ],
                )
                .await;

            match result {
                Ok(_) => {
                    let part = self.part_object(shard, part_no);
                    let mut kvs = Vec::with_capacity(batch.entries.len());
                    for (i, (ts, payload)) in batch.entries.iter().enumerate() {
                        let encoded = serde_json::to_vec(&StoredEntry {
                            timestamp: *ts,
                            payload: payload.clone(),
                        })
                        .map_err(GwError::fatal)?;
                        kvs.push((format!("{:010}", base_offset + i as u64), encoded));
                    }
                    self.store.operate(&part, vec![Op::OmapSet(kvs)]).await?;
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt + 1 < MAX_RETRIES => continue,
                Err(e) => return Err(e),
            }
        }
        Err(GwError::Canceled(format!(
            "{header}: exhausted {MAX_RETRIES} retries pushing to shard {shard}"
        )))
    }

    async fn list(
        &self,
        shard: u32,
        max: usize,
        from_marker: Option<&str>,
    ) -> GwResult<(Vec<RawLogEntry>, String, bool)> {
        let header = self.header_object(shard);
        let (head_part, tail_part, next_offset) = self.read_header(&header).await?;
        if next_offset == 0 && head_part == tail_part {
            return Ok((Vec::new(), String::new(), false));
        }

        let (mut part_no, mut from_offset) = match from_marker {
            Some(m) if !m.is_empty() => {
                let (p, o) = Self::decode_marker(m)?;
                (p, Some(o))
            }
            _ => (tail_part, None),
        };

        let mut out = Vec::new();
        let mut next_marker = String::new();
        let mut truncated = false;

        while part_no <= head_part {
            let part = self.part_object(shard, part_no);
            let from_key = from_offset.map(|o| format!("{o:010}"));
            let (kvs, part_truncated) = match self
                .store
                .omap_get_range(&part, from_key.as_deref(), None, max - out.len())
                .await
            {
                Ok(v) => v,
                Err(e) if e.is_not_found() => (Vec::new(), false),
                Err(e) => return Err(e),
            };
            for (offset_key, bytes) in kvs {
                let offset: u64 = offset_key.parse().map_err(|_| GwError::fatal("corrupt FIFO offset key"))?;
                let stored: StoredEntry = serde_json::from_slice(&bytes).map_err(GwError::fatal)?;
                next_marker = Self::encode_marker(part_no, offset);
                out.push(RawLogEntry {
                    marker: next_marker.clone(),
                    timestamp: stored.timestamp,
                    payload: stored.payload,
                });
            }
            if out.len() >= max {
                truncated = part_truncated || part_no < head_part;
                break;
            }
            from_offset = None;
            part_no += 1;
        }

        Ok((out, next_marker, truncated))
    }

    async fn get_info(&self, shard: u32) -> GwResult<(String, Option<OffsetDateTime>)> {
        let header = self.header_object(shard);
        let (head_part, _tail_part, next_offset) = self.read_header(&header).await?;
        if next_offset == 0 {
            return Ok((String::new(), None));
        }
        let max_marker = Self::encode_marker(head_part, next_offset - 1);
        let attrs = self.store.get_attrs(&header).await.unwrap_or_default();
        let last_update = attrs
            .get(LAST_UPDATE_ATTR)
            .and_then(|b| std::str::from_utf8(b).ok())
            .and_then(|s| OffsetDateTime::parse(s, &time::format_description::well_known::Rfc3339).ok());
        Ok((max_marker, last_update))
    }

    async fn trim(&self, shard: u32, up_to_marker: &str) -> GwResult<()> {
        // §4.1: "0:0" must not invoke real FIFO trim (it would fail on an
        // empty/never-written FIFO); synthesize success instead.
        if up_to_marker == "0:0" {
            return Ok(());
        }
        let (target_part, target_offset) = Self::decode_marker(up_to_marker)?;
        let header = self.header_object(shard);
        let (head_part, mut tail_part, _next_offset) = self.read_header(&header).await?;

        while tail_part < target_part {
            let part = self.part_object(shard, tail_part);
            let _ = self.store.remove(&part).await;
            tail_part += 1;
        }
        let part = self.part_object(shard, target_part);
        match self
            .store
            .operate(
                &part,
                vec![Op::OmapRemoveRange {
                    from: "0000000000".to_string(),
                    to: format!("{target_offset:010}"),
                }],
            )
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        if tail_part > 0 || target_part > 0 {
            let fully_drained = target_part < head_part;
            let new_tail = if fully_drained { target_part + 1 } else { tail_part };
            let version = self.store.operate(&header, vec![]).await?;
            self.store
                .operate(
                    &header,
                    vec![
                        Op::AssertVersion(version),
                        Op::SetAttr(TAIL_PART_ATTR.into(), new_tail.to_string().into_bytes()),
                    ],
                )
                .await?;
        }
        Ok(())
    }

    fn max_marker(&self) -> String {
        Self::encode_marker(u64::MAX, u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objstore::MemStore;

    fn backend() -> FifoBackend {
        FifoBackend::new(Arc::new(MemStore::new()), "log-pool", "data_log", 0)
    }

    #[tokio::test]
    async fn push_then_list_within_one_part() {
        let be = backend();
        let t0 = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        be.push_one(0, t0, b"a".to_vec()).await.unwrap();
        be.push_one(0, t0, b"b".to_vec()).await.unwrap();

        let (entries, marker, truncated) = be.list(0, 10, None).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!truncated);
        assert_eq!(entries[0].marker, "0000000000:0000000000");
        assert_eq!(entries[1].marker, "0000000000:0000000001");
        assert_eq!(marker, entries[1].marker);
    }

    #[tokio::test]
    async fn trim_zero_zero_is_always_success() {
        let be = backend();
        be.trim(0, "0:0").await.unwrap();
    }

    #[tokio::test]
    async fn trim_removes_consumed_entries() {
        let be = backend();
        let t0 = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        be.push_one(0, t0, b"a".to_vec()).await.unwrap();
        be.push_one(0, t0, b"b".to_vec()).await.unwrap();

        be.trim(0, "0000000000:0000000000").await.unwrap();
        let (entries, ..) = be.list(0, 10, None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, b"b");
    }

    #[tokio::test]
    async fn missing_shard_lists_empty() {
        let be = backend();
        let (entries, marker, truncated) = be.list(7, 10, None).await.unwrap();
        assert!(entries.is_empty());
        assert_eq!(marker, "");
        assert!(!truncated);
    }
}
