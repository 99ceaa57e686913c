use crate::policy::BucketSyncPolicyResolver;
use futures::stream::{self, StreamExt};
use gwtypes::GwResult;
use std::future::Future;
use time::OffsetDateTime;

/// §4.4.5: resolves the source bucket-shard into every destination pipe
/// shard, runs each under bounded concurrency, and returns the minimum
/// progress timestamp across all of them — callers must never mark a
/// log position complete until every fan-out target has caught up past
/// it.
pub async fn run_bucket_sources_sync<F, Fut>(
    policy: &dyn BucketSyncPolicyResolver,
    source_zone: &str,
    source_bucket_shard_key: &str,
    gen: Option<u64>,
    window: usize,
    sync_one_pipe_shard: F,
) -> GwResult<OffsetDateTime>
where
    F: Fn(String, String, u32, Option<u64>) -> Fut,
    Fut: Future<Output = GwResult<OffsetDateTime>>,
{
    let (source_bucket, _shard_id) = gwtypes::BucketShard::parse_key(source_bucket_shard_key)
        .ok_or_else(|| gwtypes::GwError::fatal(format!("malformed bucket-shard key {source_bucket_shard_key}")))?;

    let pipes = policy.resolve(source_zone, &source_bucket).await?;
    if pipes.is_empty() {
        return Ok(OffsetDateTime::now_utc());
    }

    let mut jobs = Vec::new();
    for pipe in pipes {
        let dest_bucket = pipe.dest_bucket.clone().unwrap_or_else(|| pipe.source_bucket.clone());
        // A real deployment resolves `num_shards` from the destination
        // bucket's layout; lacking that context here, callers that need
        // more than one destination shard pass a `sync_one_pipe_shard`
        // that fans out internally per shard id it is given.
        jobs.push((pipe.dest_zone.clone(), dest_bucket, 0u32));
    }

    let results: Vec<GwResult<OffsetDateTime>> = stream::iter(jobs)
        .map(|(dest_zone, dest_bucket, shard_id)| sync_one_pipe_shard(dest_zone, dest_bucket, shard_id, gen))
        .buffer_unordered(window)
        .collect()
        .await;

    let mut min_progress: Option<OffsetDateTime> = None;
    for r in results {
        let ts = r?;
        min_progress = Some(match min_progress {
            Some(cur) if cur < ts => cur,
            _ => ts,
        });
    }
    Ok(min_progress.unwrap_or_else(OffsetDateTime::now_utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Pipe, PipeFilter, StaticPolicyResolver};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ts(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(secs).unwrap()
    }

    #[tokio::test]
    async fn empty_pipe_set_is_success() {
        let resolver = StaticPolicyResolver::new(vec![]);
        let out = run_bucket_sources_sync(&resolver, "us-east", "b:0", None, 20, |_, _, _, _| async { Ok(ts(1)) })
            .await
            .unwrap();
        assert!(out >= ts(0));
    }

    #[tokio::test]
    async fn returns_minimum_progress_across_pipes() {
        let resolver = StaticPolicyResolver::new(vec![
            Pipe {
                source_zone: "us-east".into(),
                source_bucket: "b".into(),
                dest_zone: "us-west".into(),
                dest_bucket: None,
                filter: PipeFilter::default(),
            },
            Pipe {
                source_zone: "us-east".into(),
                source_bucket: "b".into(),
                dest_zone: "eu-central".into(),
                dest_bucket: None,
                filter: PipeFilter::default(),
            },
        ]);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let out = run_bucket_sources_sync(&resolver, "us-east", "b:0", None, 20, move |zone, _, _, _| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(if zone == "us-west" { ts(100) } else { ts(50) })
            }
        })
        .await
        .unwrap();
        assert_eq!(out, ts(50));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
