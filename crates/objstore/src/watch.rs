use tokio::sync::broadcast;

/// A `(notify_id, cookie, notifier_id, payload)` tuple delivered to a
/// watcher (§6.1 "Watch/notify").
#[derive(Debug, Clone)]
pub struct Notification {
    pub notify_id: u64,
    pub cookie: u64,
    pub notifier_id: u64,
    pub payload: Vec<u8>,
}

/// A live subscription returned by `ObjectStore::watch`. Implementations
/// that can disconnect (a real RADOS watch can) are expected to
/// transparently re-establish the registration before handing back a
/// `WatchHandle`, so callers only ever see a simple receive loop.
pub struct WatchHandle {
    rx: broadcast::Receiver<Notification>,
}

impl WatchHandle {
    pub(crate) fn new(rx: broadcast::Receiver<Notification>) -> Self {
        Self { rx }
    }

    /// Awaits the next notification. Returns `None` only if the watch
    /// was permanently torn down (object removed).
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            match self.rx.recv().await {
                Ok(n) => return Some(n),
                // A slow watcher missed some notifications; this is not
                // fatal, just re-poll for the next one (callers re-read
                // state from the object itself on each wakeup anyway).
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
