use crate::marker_tracker::KeyedMarkerTracker;
use crate::types::{BilogEntry, BilogOp, BucketSyncStatus};
use async_trait::async_trait;
use gwtypes::GwResult;
use std::collections::HashMap;

/// Computes the squash map for one bilog page (§4.4.8 step 2): within
/// the page, collapse `(object, instance)` to the single newest op,
/// preferring an OLH-epoch-bearing op over a non-OLH-epoch one at equal
/// timestamps. Returns the indices of entries that survive and should
/// actually be synced; every other index still counts toward advancing
/// the high marker, it just performs no work.
pub fn squash_winners(entries: &[BilogEntry]) -> Vec<bool> {
    let mut winner_idx: HashMap<(&str, &str), usize> = HashMap::new();

    for (i, e) in entries.iter().enumerate() {
        let key = (e.object.as_str(), e.instance.as_str());
        match winner_idx.get(&key) {
            None => {
                winner_idx.insert(key, i);
            }
            Some(&cur) => {
                let current = &entries[cur];
                let better = match e.timestamp.cmp(&current.timestamp) {
                    std::cmp::Ordering::Greater => true,
                    std::cmp::Ordering::Equal => e.olh_epoch.is_some() && current.olh_epoch.is_none(),
                    std::cmp::Ordering::Less => false,
                };
                if better {
                    winner_idx.insert(key, i);
                }
            }
        }
    }

    let winners: std::collections::HashSet<usize> = winner_idx.into_values().collect();
    (0..entries.len()).map(|i| winners.contains(&i)).collect()
}

/// The per-object replication primitive (§4.4.9 `BucketSyncSingleEntry`).
/// Fetching bytes from a remote zone and applying ACL/tag translation is
/// outside this workspace's scope (§1 "deliberately excluded"); this
/// trait is the seam a real HTTP-backed implementation plugs into.
#[async_trait]
pub trait ObjectReplicator: Send + Sync + 'static {
    async fn fetch_and_write(&self, object: &str, instance: &str, olh_epoch: Option<u64>) -> GwResult<()>;
    async fn delete(&self, object: &str, instance: &str) -> GwResult<()>;
    async fn create_delete_marker(&self, object: &str) -> GwResult<()>;
}

/// Applies one post-squash bilog entry (§4.4.9). `retries` bounds the
/// `ECANCELED` retry loop for ADD/LINK_OLH (default 10, per §7's CAS
/// retry convention).
pub async fn bucket_sync_single_entry(
    replicator: &dyn ObjectReplicator,
    entry: &BilogEntry,
    max_retries: usize,
) -> GwResult<()> {
    use gwtypes::GwError;

    match entry.op {
        BilogOp::Add | BilogOp::LinkOlh => {
            let mut attempt = 0;
            loop {
                match replicator.fetch_and_write(&entry.object, &entry.instance, entry.olh_epoch).await {
                    Ok(()) => return Ok(()),
                    Err(GwError::Canceled(_)) if attempt + 1 < max_retries => {
                        attempt += 1;
                        continue;
                    }
                    Err(GwError::PreconditionFailed(_)) => return Ok(()), // soft skip: newer local change
                    Err(e) if e.is_not_found() || matches!(e, GwError::PermissionDenied(_)) => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        }
        BilogOp::Del | BilogOp::UnlinkInstance => match replicator.delete(&entry.object, &entry.instance).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() || matches!(e, GwError::PermissionDenied(_)) => Ok(()),
            Err(e) => Err(e),
        },
        BilogOp::LinkOlhDm => match replicator.create_delete_marker(&entry.object).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        },
        BilogOp::SyncStop | BilogOp::Resync | BilogOp::Cancel => Ok(()),
    }
}

/// One page of `BucketShardIncrementalSync` (§4.4.8): squash, skip what
/// must be skipped, enforce per-key serialization, and report whether
/// every remaining entry in the page was actually processed plus the
/// new high marker.
pub struct PageOutcome {
    pub high_marker: String,
    pub processed: usize,
    pub skipped: usize,
}

pub async fn apply_bilog_page(
    replicator: &dyn ObjectReplicator,
    tracker: &mut KeyedMarkerTracker,
    entries: &[BilogEntry],
    max_retries: usize,
) -> GwResult<PageOutcome> {
    let winners = squash_winners(entries);
    let mut high_marker = String::new();
    let mut processed = 0;
    let mut skipped = 0;

    for (entry, is_winner) in entries.iter().zip(winners.iter()) {
        high_marker = entry.log_id.clone();

        if entry.op.is_skipped() || !is_winner {
            skipped += 1;
            continue;
        }

        let serialize_key = match entry.op {
            // OLH ops serialize per object name, not per instance, to
            // prevent a LINK/UNLINK race (§5 "Ordering guarantees").
            BilogOp::LinkOlh | BilogOp::LinkOlhDm => entry.object.clone(),
            _ => format!("{}\u{0}{}", entry.object, entry.instance),
        };

        if !tracker.start(&serialize_key, entry.log_id.clone(), entry.timestamp) {
            // Another op on this key is in-flight; caller retries this
            // page later rather than racing it.
            skipped += 1;
            continue;
        }

        let result = bucket_sync_single_entry(replicator, entry, max_retries).await;
        tracker.finish(&serialize_key, &entry.log_id);
        if let Err(e) = result {
            metrics::counter!(gateway_metrics::names::SYNC_ERRORS).increment(1);
            return Err(e);
        }
        metrics::counter!(gateway_metrics::names::SYNC_OBJECTS_APPLIED).increment(1);
        processed += 1;
    }

    Ok(PageOutcome { high_marker, processed, skipped })
}

/// Marks shard `shard_id` done for the current generation; if the page
/// exhausted with `next_log` present and every shard has reported,
/// advances `status.incremental_gen` (§4.4.8 step 5).
pub fn bucket_shard_is_done(status: &mut BucketSyncStatus, shard_id: usize, next_log: Option<(u64, u32)>) -> bool {
    let Some((next_gen, _num_shards)) = next_log else {
        return false;
    };
    status.mark_shard_done(shard_id, next_gen)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardSyncOutcome {
    Continue,
    AdvancedGeneration(u64),
}

/// §4.4.7's dispatch when the caller already holds `incremental_gen`
/// context for a shard: a request for a strictly newer generation than
/// what we've reached must be retried later (`EAGAIN`); a request for an
/// older one is already satisfied.
pub fn compare_requested_generation(status: &BucketSyncStatus, requested_gen: u64) -> GwResult<Option<ShardSyncOutcome>> {
    use std::cmp::Ordering;
    match requested_gen.cmp(&status.incremental_gen) {
        Ordering::Greater => Err(gwtypes::GwError::Canceled(format!(
            "requested gen {requested_gen} ahead of incremental_gen {}",
            status.incremental_gen
        ))),
        Ordering::Less => Ok(Some(ShardSyncOutcome::Continue)),
        Ordering::Equal => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn entry(object: &str, instance: &str, op: BilogOp, secs: i64, olh: Option<u64>) -> BilogEntry {
        BilogEntry {
            log_id: format!("{secs:010}"),
            timestamp: OffsetDateTime::from_unix_timestamp(secs).unwrap(),
            object: object.into(),
            instance: instance.into(),
            op,
            olh_epoch: olh,
        }
    }

    #[test]
    fn squash_keeps_newest_per_object_instance() {
        let entries = vec![
            entry("k1", "v1", BilogOp::Add, 1, None),
            entry("k1", "v1", BilogOp::Del, 2, None),
            entry("k2", "v1", BilogOp::Add, 1, None),
        ];
        let winners = squash_winners(&entries);
        assert_eq!(winners, vec![false, true, true]);
    }

    #[test]
    fn squash_prefers_olh_epoch_at_equal_timestamp() {
        let entries = vec![
            entry("k1", "v1", BilogOp::Add, 5, None),
            entry("k1", "v1", BilogOp::LinkOlh, 5, Some(3)),
        ];
        let winners = squash_winners(&entries);
        assert_eq!(winners, vec![false, true]);
    }

    struct CountingReplicator {
        fetches: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ObjectReplicator for CountingReplicator {
        async fn fetch_and_write(&self, _object: &str, _instance: &str, _olh_epoch: Option<u64>) -> GwResult<()> {
            self.fetches.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
        async fn delete(&self, _object: &str, _instance: &str) -> GwResult<()> {
            Ok(())
        }
        async fn create_delete_marker(&self, _object: &str) -> GwResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn apply_page_skips_non_winners_but_advances_marker() {
        let entries = vec![
            entry("k1", "v1", BilogOp::Add, 1, None),
            entry("k1", "v1", BilogOp::Del, 2, None),
        ];
        let replicator = CountingReplicator { fetches: 0.into() };
        let mut tracker = KeyedMarkerTracker::new(10);
        let outcome = apply_bilog_page(&replicator, &mut tracker, &entries, 10).await.unwrap();
        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.high_marker, "0000000002");
        assert_eq!(replicator.fetches.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn shard_done_advances_generation_only_with_next_log() {
        let mut status = BucketSyncStatus::init(1);
        assert!(!bucket_shard_is_done(&mut status, 0, None));
        assert_eq!(status.incremental_gen, 0);
        assert!(bucket_shard_is_done(&mut status, 0, Some((7, 4))));
        assert_eq!(status.incremental_gen, 7);
    }
}
