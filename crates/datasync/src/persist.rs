use gwtypes::{GwError, GwResult};
use objstore::{ObjectId, ObjectStore, Op};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

const MAX_RETRIES: usize = 10;

/// A JSON-encoded object read and updated via optimistic concurrency
/// (§5 "Log generations: writers use CAS via obj-version", applied here
/// to sync markers and sync status — the same discipline, different
/// payloads).
pub struct CasObject<T> {
    store: Arc<dyn ObjectStore>,
    id: ObjectId,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned + Clone + Send + Sync> CasObject<T> {
    pub fn new(store: Arc<dyn ObjectStore>, id: ObjectId) -> Self {
        Self { store, id, _marker: std::marker::PhantomData }
    }

    pub async fn read(&self) -> GwResult<Option<T>> {
        match self.store.read_full(&self.id).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(GwError::fatal)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Applies `mutate` to the current value (or `None` if absent) in a
    /// bounded CAS retry loop, returning the value that was persisted.
    pub async fn update<F>(&self, mut mutate: F) -> GwResult<T>
    where
        F: FnMut(Option<T>) -> GwResult<T>,
    {
        for attempt in 0..MAX_RETRIES {
            let version = self.store.operate(&self.id, vec![]).await?;
            let current = self.read().await?;
            let next = mutate(current)?;
            let bytes = serde_json::to_vec(&next).map_err(GwError::fatal)?;

            match self.store.operate(&self.id, vec![Op::AssertVersion(version), Op::WriteFull(bytes)]).await {
                Ok(_) => return Ok(next),
                Err(e) if e.is_retryable() && attempt + 1 < MAX_RETRIES => continue,
                Err(e) => return Err(e),
            }
        }
        Err(GwError::Canceled(format!("{}: exhausted {MAX_RETRIES} CAS retries", self.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objstore::MemStore;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
    struct Counter {
        n: u64,
    }

    #[tokio::test]
    async fn update_initializes_then_increments() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let obj: CasObject<Counter> = CasObject::new(store, ObjectId::new("pool", "counter"));

        let v1 = obj.update(|cur| Ok(Counter { n: cur.map(|c| c.n).unwrap_or(0) + 1 })).await.unwrap();
        assert_eq!(v1.n, 1);
        let v2 = obj.update(|cur| Ok(Counter { n: cur.unwrap().n + 1 })).await.unwrap();
        assert_eq!(v2.n, 2);
    }
}
