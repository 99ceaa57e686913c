use gwtypes::{GwError, GwResult};
use objstore::{ObjectId, ObjectStore};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Runs `work` under an exclusive lease on `(id, name)`, racing it
/// against a renewal loop the same way `automations::executors::poll_task`
/// races a task's execution against its heartbeat: if the lease cannot
/// be renewed, the whole operation is canceled rather than left running
/// ungoverned (§5 "Cancellation" — "its controlling lease dropping").
///
/// `renew_fraction` is typically 0.5-0.75 of `duration` (§5 "Timeouts").
pub async fn with_lease<T, F>(
    store: &Arc<dyn ObjectStore>,
    id: &ObjectId,
    name: &str,
    cookie: &str,
    duration: Duration,
    renew_fraction: f64,
    work: F,
) -> GwResult<T>
where
    F: Future<Output = GwResult<T>>,
{
    store.lock_exclusive(id, name, cookie, duration, false).await?;

    let renew_period = duration.mul_f64(renew_fraction);
    let renewal = async {
        loop {
            tokio::time::sleep(renew_period).await;
            if let Err(e) = store.lock_exclusive(id, name, cookie, duration, true).await {
                warn!(%id, name, error = %e, "lease renewal failed, canceling guarded work");
                return e;
            }
        }
    };
    tokio::pin!(renewal);

    let result = tokio::select! {
        result = work => result,
        lost = &mut renewal => Err(GwError::Canceled(format!("lease lost on {id}#{name}: {lost}"))),
    };

    let _ = store.unlock(id, name, cookie).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use objstore::MemStore;

    #[tokio::test]
    async fn runs_work_to_completion_under_lease() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let id = ObjectId::new("pool", "shard.0");
        let out = with_lease(&store, &id, "sync", "cookie-a", Duration::from_secs(30), 0.75, async {
            Ok::<_, GwError>(42)
        })
        .await
        .unwrap();
        assert_eq!(out, 42);

        // Lock was released; a different cookie can now acquire it.
        store
            .lock_exclusive(&id, "sync", "cookie-b", Duration::from_secs(30), false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejects_when_already_held_by_another_cookie() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemStore::new());
        let id = ObjectId::new("pool", "shard.0");
        store
            .lock_exclusive(&id, "sync", "cookie-a", Duration::from_secs(30), false)
            .await
            .unwrap();

        let err = with_lease(&store, &id, "sync", "cookie-b", Duration::from_secs(30), 0.75, async {
            Ok::<_, GwError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, GwError::Busy(_)));
    }
}
