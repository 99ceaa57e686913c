/// The gateway's error taxonomy (§6.4, §7). Every subsystem's fallible
/// operations resolve to one of these kinds; callers match on kind rather
/// than string content.
#[derive(Debug, thiserror::Error)]
pub enum GwError {
    /// Absent key, missing object, or a trimmed log entry. Never fatal;
    /// callers treat this as "nothing to do."
    #[error("not found: {0}")]
    NotFound(String),

    /// Lease contention (someone else holds the lock).
    #[error("busy: {0}")]
    Busy(String),

    /// Optimistic-concurrency CAS failure or a stale identity mismatch.
    /// Retryable, with a bounded retry count at the call site.
    #[error("canceled: {0}")]
    Canceled(String),

    /// The source-side object or policy changed under us; skip the op.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Authorization failed on the peer. Counted, swallowed at the
    /// per-entry level, never written to an error-repo.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// HTTP/socket/transport error reaching a peer or the store.
    /// Counted and retried on the next poll cycle.
    #[error("transport error: {0}")]
    Transport(String),

    /// Any unexpected error: decode failure, invariant violation. Not
    /// absorbed locally; propagates to the owning shard worker and
    /// triggers a backoff-restart of that shard only.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl GwError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GwError::NotFound(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GwError::Busy(_) | GwError::Canceled(_) | GwError::Transport(_)
        )
    }

    pub fn transport(msg: impl std::fmt::Display) -> Self {
        GwError::Transport(msg.to_string())
    }

    pub fn fatal(msg: impl std::fmt::Display) -> Self {
        GwError::Fatal(msg.to_string())
    }
}

pub type GwResult<T> = Result<T, GwError>;
