use gwtypes::{GwError, GwResult};
use objstore::{ObjectId, ObjectStore, Op};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

const MAX_RETRIES: usize = 10;

/// A JSON-encoded object read and updated via optimistic concurrency
/// (§5 "Log generations: writers use CAS via obj-version", applied
/// here to the per-bucket reshard layout).
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
