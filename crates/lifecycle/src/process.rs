use crate::client::{LifecycleObjectClient, ListedObject};
use crate::types::{obj_has_expired, LcPolicy, ProcessOutcome};
use futures::stream::{self, StreamExt};
use gwtypes::GwResult;
use time::OffsetDateTime;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct ProcessConfig {
    pub max_workers: usize,
    pub page_size: usize,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self { max_workers: 32, page_size: 1000 }
    }
}

/// `bucket_lc_process`: runs the non-versioned, versioned, and
/// multipart-expiration passes over one bucket (§4.6). `stop_at` bounds
/// total wall time; hitting it ends the pass early with whatever
/// progress was made, which is still reported as `Complete` for this
/// cycle (the next daily sweep reprocesses the bucket from scratch).
pub async fn bucket_lc_process(
    client: &dyn LifecycleObjectClient,
    bucket: &str,
    versioned: bool,
    config: &ProcessConfig,
    now: OffsetDateTime,
    stop_at: OffsetDateTime,
) -> GwResult<ProcessOutcome> {
    let policy = match client.get_lc_policy(bucket).await {
        Ok(p) => p,
        // No LC config is indistinguishable here from the bucket having
        // been deleted out from under the queue entry; either way there
        // is nothing left to do with it.
        Err(e) if e.is_not_found() => return Ok(ProcessOutcome::BucketGone),
        Err(e) => return Err(e),
    };
    if policy.rules.is_empty() {
        return Ok(ProcessOutcome::Complete);
    }

    if now >= stop_at {
        return Ok(ProcessOutcome::Complete);
    }

    if versioned {
        process_versioned(client, bucket, &policy, config, now, stop_at).await?;
    } else {
        process_non_versioned(client, bucket, &policy, config, now, stop_at).await?;
    }
    process_multipart(client, bucket, &policy, config, now, stop_at).await?;

    Ok(ProcessOutcome::Complete)
}

async fn process_non_versioned(
    client: &dyn LifecycleObjectClient,
    bucket: &str,
    policy: &LcPolicy,
    config: &ProcessConfig,
    now: OffsetDateTime,
    stop_at: OffsetDateTime,
) -> GwResult<()> {
    for rule in &policy.rules {
        if now >= stop_at {
            return Ok(());
        }
        if !rule.enabled || rule.expiration.map(|e| !e.is_set()).unwrap_or(true) {
            continue;
        }

        let mut marker = String::new();
        loop {
            if now >= stop_at {
                return Ok(());
            }
            let (page, truncated, next_marker) = client.list_objects(bucket, &rule.prefix, &marker, config.page_size).await?;

            let results = stream::iter(page.into_iter().filter(|o| !o.is_namespaced))
                .map(|obj| expire_current_object(client, bucket, policy, obj, now))
                .buffer_unordered(config.max_workers)
                .collect::<Vec<_>>()
                .await;
            for r in results {
                if let Err(e) = r {
                    warn!(bucket, error = %e, "non-versioned expiration worker failed");
                }
            }

            if !truncated {
                break;
            }
            marker = next_marker;
        }
    }
    Ok(())
}

/// Whether `rule`'s `expiration` clause fires for an object last
/// modified at `mtime`: either a fixed day count or an absolute date.
fn expiration_fires(exp: &crate::types::Expiration, mtime: OffsetDateTime, now: OffsetDateTime) -> bool {
    if let Some(date) = exp.date {
        return now >= date;
    }
    match exp.days {
        Some(days) => obj_has_expired(mtime, days, now),
        None => false,
    }
}

async fn expire_current_object(client: &dyn LifecycleObjectClient, bucket: &str, policy: &LcPolicy, obj: ListedObject, now: OffsetDateTime) -> GwResult<()> {
    let tags = client.get_tags(bucket, &obj.key, &obj.instance).await?;
    let expired = policy
        .rules
        .iter()
        .filter(|r| r.matches_key_and_tags(&obj.key, &tags))
        .filter_map(|r| r.expiration.as_ref())
        .any(|exp| expiration_fires(exp, obj.mtime, now));
    if !expired {
        return Ok(());
    }

    // Re-read mtime: a write racing the expiration check invalidates it.
    let current_mtime = client.get_mtime(bucket, &obj.key, &obj.instance).await?;
    if current_mtime != obj.mtime {
        debug!(bucket, key = %obj.key, "skipping expiration, object modified since listing");
        return Ok(());
    }

    client.delete_object(bucket, &obj.key, &obj.instance, false).await?;
    metrics::counter!(gateway_metrics::names::LIFECYCLE_OBJECTS_EXPIRED).increment(1);
    Ok(())
}

async fn process_versioned(
    client: &dyn LifecycleObjectClient,
    bucket: &str,
    policy: &LcPolicy,
    config: &ProcessConfig,
    now: OffsetDateTime,
    stop_at: OffsetDateTime,
) -> GwResult<()> {
    let mut marker = String::new();
    loop {
        if now >= stop_at {
            return Ok(());
        }
        let (page, truncated, next_marker) = client.list_object_versions(bucket, "", &marker, config.page_size).await?;

        for (idx, entry) in page.iter().enumerate() {
            if entry.is_namespaced {
                continue;
            }
            if entry.is_current {
                if entry.is_delete_marker {
                    maybe_remove_standalone_marker(client, bucket, policy, entry, &page, idx, now).await?;
                } else {
                    let tags = client.get_tags(bucket, &entry.key, &entry.instance).await?;
                    let expired = policy
                        .rules
                        .iter()
                        .filter(|r| r.matches_key_and_tags(&entry.key, &tags))
                        .filter_map(|r| r.expiration.as_ref())
                        .any(|exp| expiration_fires(exp, entry.mtime, now));
                    if expired {
                        client.delete_object(bucket, &entry.key, &entry.instance, false).await?;
                        metrics::counter!(gateway_metrics::names::LIFECYCLE_OBJECTS_EXPIRED).increment(1);
                    }
                }
            } else {
                // Non-current: `noncur_expiration` is honored against
                // the next-older version's mtime, i.e. this entry's
                // mtime, since listings return newest-first per key.
                let tags = client.get_tags(bucket, &entry.key, &entry.instance).await?;
                let expired = policy
                    .rules
                    .iter()
                    .filter(|r| r.matches_key_and_tags(&entry.key, &tags))
                    .filter_map(|r| r.noncur_expiration_days)
                    .any(|days| obj_has_expired(entry.mtime, days, now));
                if expired {
                    client.delete_object(bucket, &entry.key, &entry.instance, true).await?;
                    metrics::counter!(gateway_metrics::names::LIFECYCLE_OBJECTS_EXPIRED).increment(1);
                }
            }
        }

        if !truncated {
            break;
        }
        marker = next_marker;
    }
    Ok(())
}

/// A delete marker is only removed outright when it is the sole
/// remaining version of its key (no older version follows it in the
/// newest-first listing) and a rule sets `dm_expiration_days`.
async fn maybe_remove_standalone_marker(
    client: &dyn LifecycleObjectClient,
    bucket: &str,
    policy: &LcPolicy,
    entry: &ListedObject,
    page: &[ListedObject],
    idx: usize,
    now: OffsetDateTime,
) -> GwResult<()> {
    let has_older_version = page.get(idx + 1).map(|next| next.key == entry.key).unwrap_or(false);
    if has_older_version {
        return Ok(());
    }
    let dm_days = policy.rules.iter().filter(|r| r.matches_key_and_tags(&entry.key, &[])).filter_map(|r| r.dm_expiration_days).min();
    if let Some(days) = dm_days {
        if obj_has_expired(entry.mtime, days, now) {
            client.delete_object(bucket, &entry.key, &entry.instance, true).await?;
            metrics::counter!(gateway_metrics::names::LIFECYCLE_OBJECTS_EXPIRED).increment(1);
        }
    }
    Ok(())
}

async fn process_multipart(
    client: &dyn LifecycleObjectClient,
    bucket: &str,
    policy: &LcPolicy,
    config: &ProcessConfig,
    now: OffsetDateTime,
    stop_at: OffsetDateTime,
) -> GwResult<()> {
    for rule in &policy.rules {
        if now >= stop_at {
            return Ok(());
        }
        let Some(mp_days) = rule.mp_expiration_days.filter(|d| *d > 0) else {
            continue;
        };

        let mut marker = String::new();
        loop {
            if now >= stop_at {
                return Ok(());
            }
            let (uploads, truncated, next_marker) = client.list_multipart_uploads(bucket, &rule.prefix, &marker, config.page_size).await?;
            for upload in &uploads {
                if obj_has_expired(upload.mtime, mp_days, now) {
                    client.abort_multipart_upload(bucket, &upload.upload_id).await?;
                }
            }
            if !truncated {
                break;
            }
            marker = next_marker;
        }
    }
    Ok(())
}

#[cfg(test)]
mod process_tests {
    use super::*;
    use crate::client::MultipartUpload;
    use crate::types::{Expiration, LcRule};
    use async_trait::async_trait;
    use gwtypes::GwError;
    use std::sync::Mutex;
    use time::macros::datetime;

    struct FakeClient {
        policy: LcPolicy,
        objects: Vec<ListedObject>,
        uploads: Vec<MultipartUpload>,
        deleted: Mutex<Vec<String>>,
        aborted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LifecycleObjectClient for FakeClient {
        async fn get_lc_policy(&self, _bucket: &str) -> GwResult<LcPolicy> {
            Ok(self.policy.clone())
        }

        async fn is_versioned(&self, _bucket: &str) -> GwResult<bool> {
            Ok(false)
        }

        async fn list_objects(&self, _bucket: &str, prefix: &str, _marker: &str, _max: usize) -> GwResult<(Vec<ListedObject>, bool, String)> {
            let matched = self.objects.iter().filter(|o| o.key.starts_with(prefix)).cloned().collect();
            Ok((matched, false, String::new()))
        }

        async fn list_object_versions(&self, _bucket: &str, _prefix: &str, _marker: &str, _max: usize) -> GwResult<(Vec<ListedObject>, bool, String)> {
            Ok((self.objects.clone(), false, String::new()))
        }

        async fn list_multipart_uploads(&self, _bucket: &str, _prefix: &str, _marker: &str, _max: usize) -> GwResult<(Vec<MultipartUpload>, bool, String)> {
            Ok((self.uploads.clone(), false, String::new()))
        }

        async fn get_tags(&self, _bucket: &str, _key: &str, _instance: &str) -> GwResult<Vec<(String, String)>> {
            Ok(vec![])
        }

        async fn get_mtime(&self, _bucket: &str, key: &str, _instance: &str) -> GwResult<OffsetDateTime> {
            self.objects.iter().find(|o| o.key == key).map(|o| o.mtime).ok_or_else(|| GwError::NotFound(key.to_string()))
        }

        async fn delete_object(&self, _bucket: &str, key: &str, _instance: &str, _remove_indeed: bool) -> GwResult<()> {
            self.deleted.lock().unwrap().push(key.to_string());
            Ok(())
        }

        async fn abort_multipart_upload(&self, _bucket: &str, upload_id: &str) -> GwResult<()> {
            self.aborted.lock().unwrap().push(upload_id.to_string());
            Ok(())
        }
    }

    fn expiring_rule(days: u32) -> LcRule {
        LcRule {
            id: "r1".to_string(),
            prefix: "logs/".to_string(),
            enabled: true,
            tag_filter: vec![],
            expiration: Some(Expiration { days: Some(days), date: None }),
            noncur_expiration_days: None,
            dm_expiration_days: None,
            mp_expiration_days: None,
        }
    }

    #[tokio::test]
    async fn non_versioned_deletes_only_expired_objects() {
        let now = datetime!(2026-01-31 00:00:00 UTC);
        let client = FakeClient {
            policy: LcPolicy { rules: vec![expiring_rule(7)] },
            objects: vec![
                ListedObject {
                    key: "logs/old".into(),
                    instance: String::new(),
                    mtime: datetime!(2026-01-01 00:00:00 UTC),
                    size: 10,
                    is_current: true,
                    is_delete_marker: false,
                    is_namespaced: false,
                },
                ListedObject {
                    key: "logs/new".into(),
                    instance: String::new(),
                    mtime: datetime!(2026-01-30 00:00:00 UTC),
                    size: 10,
                    is_current: true,
                    is_delete_marker: false,
                    is_namespaced: false,
                },
            ],
            uploads: vec![],
            deleted: Mutex::new(vec![]),
            aborted: Mutex::new(vec![]),
        };

        let outcome = bucket_lc_process(&client, "b", false, &ProcessConfig::default(), now, now + time::Duration::hours(24)).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Complete);
        assert_eq!(client.deleted.lock().unwrap().as_slice(), ["logs/old"]);
    }

    #[tokio::test]
    async fn multipart_uploads_past_threshold_are_aborted() {
        let now = datetime!(2026-01-31 00:00:00 UTC);
        let mut rule = expiring_rule(7);
        rule.expiration = None;
        rule.mp_expiration_days = Some(3);
        let client = FakeClient {
            policy: LcPolicy { rules: vec![rule] },
            objects: vec![],
            uploads: vec![
                MultipartUpload { meta_key: "logs/a.meta".into(), upload_id: "up-1".into(), mtime: datetime!(2026-01-01 00:00:00 UTC) },
                MultipartUpload { meta_key: "logs/b.meta".into(), upload_id: "up-2".into(), mtime: datetime!(2026-01-30 00:00:00 UTC) },
            ],
            deleted: Mutex::new(vec![]),
            aborted: Mutex::new(vec![]),
        };

        bucket_lc_process(&client, "b", false, &ProcessConfig::default(), now, now + time::Duration::hours(24)).await.unwrap();
        assert_eq!(client.aborted.lock().unwrap().as_slice(), ["up-1"]);
    }
}
