use crate::objects;
use crate::types::{EntryStatus, LcEntry};
use gwtypes::{GwError, GwResult};
use objstore::{ObjectId, ObjectStore, Op};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// One `lc.N` shard's header: the day its current sweep started, and
/// the omap-key marker it last made progress past (§4.6 step 2, step
/// 4). Stored as the shard object's attribute map, distinct from the
/// omap queue of per-bucket entries.
#[derive(Debug, Clone)]
pub struct ShardHeader {
    pub start_date: OffsetDateTime,
    pub marker: String,
}

impl ShardHeader {
    fn to_ops(&self) -> GwResult<Vec<Op>> {
        let start_date = self.start_date.format(&Rfc3339).map_err(|e| GwError::fatal(format!("formatting start_date: {e}")))?;
        Ok(vec![
            Op::SetAttr(objects::ATTR_START_DATE.to_string(), start_date.into_bytes()),
            Op::SetAttr(objects::ATTR_MARKER.to_string(), self.marker.clone().into_bytes()),
        ])
    }
}

/// Reads a shard's header. A shard with no attrs yet (never processed)
/// reads as `None`.
pub async fn read_header(store: &Arc<dyn ObjectStore>, id: &ObjectId) -> GwResult<Option<ShardHeader>> {
    let attrs = match store.get_attrs(id).await {
        Ok(a) => a,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e),
    };
    let Some(raw_date) = attrs.get(objects::ATTR_START_DATE) else {
        return Ok(None);
    };
    let date_str = String::from_utf8_lossy(raw_date);
    let start_date = OffsetDateTime::parse(&date_str, &Rfc3339).map_err(|e| GwError::fatal(format!("parsing start_date: {e}")))?;
    let marker = attrs.get(objects::ATTR_MARKER).map(|b| String::from_utf8_lossy(b).into_owned()).unwrap_or_default();
    Ok(Some(ShardHeader { start_date, marker }))
}

pub async fn write_header(store: &Arc<dyn ObjectStore>, id: &ObjectId, header: &ShardHeader) -> GwResult<()> {
    store.operate(id, header.to_ops()?).await?;
    Ok(())
}

/// Lists every queued bucket key in the shard's omap, starting after
/// `marker`, up to `max` per page.
pub async fn list_entries(store: &Arc<dyn ObjectStore>, id: &ObjectId, marker: &str, max: usize) -> GwResult<(Vec<(String, LcEntry)>, bool)> {
    let from = if marker.is_empty() { None } else { Some(marker) };
    let (raw, truncated) = store.omap_get_range(id, from, None, max).await?;
    let entries = raw
        .into_iter()
        .filter_map(|(k, v)| serde_json::from_slice::<LcEntry>(&v).ok().map(|e| (k, e)))
        .collect();
    Ok((entries, truncated))
}

/// Point-reads one omap key. `ObjectStore` only exposes ranged omap
/// reads, so this pages through in lexicographic order, stopping as
/// soon as the scan passes where `key` would sort.
pub async fn get_entry(store: &Arc<dyn ObjectStore>, id: &ObjectId, key: &str) -> GwResult<Option<LcEntry>> {
    const SCAN_PAGE: usize = 1000;
    let mut marker = String::new();
    loop {
        let from = if marker.is_empty() { None } else { Some(marker.as_str()) };
        let (page, truncated) = store.omap_get_range(id, from, None, SCAN_PAGE).await?;
        let Some((_, v)) = page.iter().find(|(k, _)| k == key) else {
            let past_key = page.last().map(|(k, _)| k.as_str() > key).unwrap_or(true);
            if past_key || !truncated {
                return Ok(None);
            }
            marker = page.last().unwrap().0.clone();
            continue;
        };
        return Ok(serde_json::from_slice(v).ok());
    }
}

pub async fn set_entry(store: &Arc<dyn ObjectStore>, id: &ObjectId, key: &str, entry: &LcEntry) -> GwResult<()> {
    let payload = serde_json::to_vec(entry).map_err(|e| GwError::fatal(format!("encoding lc entry: {e}")))?;
    store.operate(id, vec![Op::OmapSet(vec![(key.to_string(), payload)])]).await?;
    Ok(())
}

pub async fn remove_entry(store: &Arc<dyn ObjectStore>, id: &ObjectId, key: &str) -> GwResult<()> {
    store.operate(id, vec![Op::OmapRemoveKeys(vec![key.to_string()])]).await?;
    Ok(())
}

/// `bucket_lc_prepare`: enqueues a bucket for processing, resetting
/// its entry to `Uninitial` with a fresh `start_time` (§4.6 "Entry
/// reset on enqueue").
pub async fn bucket_lc_prepare(store: &Arc<dyn ObjectStore>, id: &ObjectId, bucket_key: &str, now: OffsetDateTime) -> GwResult<()> {
    set_entry(store, id, bucket_key, &LcEntry::reset(now)).await
}

/// §4.6 step 5: marks the entry `Processing` before handing it to
/// `bucket_lc_process`.
pub async fn mark_processing(store: &Arc<dyn ObjectStore>, id: &ObjectId, bucket_key: &str, now: OffsetDateTime) -> GwResult<()> {
    set_entry(store, id, bucket_key, &LcEntry { start_time: now, status: EntryStatus::Processing }).await
}
