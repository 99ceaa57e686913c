use gwtypes::GwResult;
use objstore::{ObjectId, ObjectStore, Op};
use std::sync::Arc;
use time::OffsetDateTime;

/// The error-repo omap colocated with a shard's sync-status object
/// (§3 "Error repo", §4.4.4). Holds sync obligations that failed and
/// must be retried once `error_retry_time` has passed.
pub struct ErrorRepo {
    store: Arc<dyn ObjectStore>,
    id: ObjectId,
}

fn encode_key(bucket_shard_key: &str, gen: Option<u64>) -> String {
    match gen {
        Some(g) => format!("{bucket_shard_key}#{g}"),
        None => bucket_shard_key.to_string(),
    }
}

fn decode_key(key: &str) -> (String, Option<u64>) {
    match key.rsplit_once('#') {
        Some((bs, g)) => match g.parse() {
            Ok(gen) => (bs.to_string(), Some(gen)),
            Err(_) => (key.to_string(), None),
        },
        None => (key.to_string(), None),
    }
}

impl ErrorRepo {
    pub fn new(store: Arc<dyn ObjectStore>, sync_status_oid: &ObjectId) -> Self {
        let id = ObjectId::new(sync_status_oid.pool.clone(), format!("{}.retry", sync_status_oid.oid));
        Self { store, id }
    }

    /// Records a failed sync obligation for later retry (Scenario 5).
    pub async fn record(&self, bucket_shard_key: &str, gen: Option<u64>, timestamp: OffsetDateTime) -> GwResult<()> {
        let key = encode_key(bucket_shard_key, gen);
        let value = timestamp
            .format(&time::format_description::well_known::Rfc3339)
            .map_err(gwtypes::GwError::fatal)?
            .into_bytes();
        self.store.operate(&self.id, vec![Op::OmapSet(vec![(key, value)])]).await?;
        Ok(())
    }

    /// Removes an entry only if its stored timestamp matches `timestamp`
    /// exactly (§4.4.4 "remove its key from the error-repo ... conditional
    /// on timestamp match").
    pub async fn remove_if_matches(
        &self,
        bucket_shard_key: &str,
        gen: Option<u64>,
        timestamp: OffsetDateTime,
    ) -> GwResult<bool> {
        let key = encode_key(bucket_shard_key, gen);
        let (entries, _) = match self.store.omap_get_range(&self.id, None, None, usize::MAX).await {
            Ok(v) => v,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        let Some((_, stored)) = entries.into_iter().find(|(k, _)| *k == key) else {
            return Ok(false);
        };
        let stored_str = String::from_utf8_lossy(&stored);
        let matches = stored_str
            == timestamp
                .format(&time::format_description::well_known::Rfc3339)
                .map_err(gwtypes::GwError::fatal)?;
        if matches {
            self.store.operate(&self.id, vec![Op::OmapRemoveKeys(vec![key])]).await?;
        }
        Ok(matches)
    }

    /// Lists up to `max` pending retries (§4.4.3 step 2: "up to 10 keys").
    pub async fn list(&self, max: usize) -> GwResult<Vec<(String, Option<u64>, OffsetDateTime)>> {
        let (entries, _) = match self.store.omap_get_range(&self.id, None, None, max).await {
            Ok(v) => v,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        entries
            .into_iter()
            .map(|(k, v)| {
                let (bs, gen) = decode_key(&k);
                let ts_str = String::from_utf8_lossy(&v).into_owned();
                let ts = OffsetDateTime::parse(&ts_str, &time::format_description::well_known::Rfc3339)
                    .map_err(gwtypes::GwError::fatal)?;
                Ok((bs, gen, ts))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objstore::MemStore;

    fn ts(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(secs).unwrap()
    }

    #[tokio::test]
    async fn record_then_retry_removes_on_matching_timestamp() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let sync_status = ObjectId::new("log-pool", "datalog.sync-status.shard.us-east.0");
        let repo = ErrorRepo::new(store, &sync_status);

        repo.record("B:0", Some(5), ts(100)).await.unwrap();
        let pending = repo.list(10).await.unwrap();
        assert_eq!(pending, vec![("B:0".to_string(), Some(5), ts(100))]);

        let removed = repo.remove_if_matches("B:0", Some(5), ts(999)).await.unwrap();
        assert!(!removed);
        let removed = repo.remove_if_matches("B:0", Some(5), ts(100)).await.unwrap();
        assert!(removed);
        assert!(repo.list(10).await.unwrap().is_empty());
    }
}
