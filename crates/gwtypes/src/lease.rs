use std::time::{Duration, Instant};

/// A time-bounded exclusive lock, refreshed periodically. Expires on
/// holder failure (§5, GLOSSARY "Lease"). This type carries only local
/// bookkeeping (when to renew, when we believe it to have expired); the
/// actual lock is held in the object store via
/// `objstore::Client::lock_exclusive`.
#[derive(Debug, Clone)]
pub struct Lease {
    pub cookie: String,
    pub duration: Duration,
    acquired_at: Instant,
    last_renewed_at: Instant,
}

impl Lease {
    pub fn new(cookie: impl Into<String>, duration: Duration) -> Self {
        let now = Instant::now();
        Self {
            cookie: cookie.into(),
            duration,
            acquired_at: now,
            last_renewed_at: now,
        }
    }

    /// True once `fraction` of the lease duration has elapsed since the
    /// last renewal. §5 says components refresh "at a configurable
    /// fraction of the duration (typically 1/2 to 3/4)".
    pub fn should_renew(&self, fraction: f64) -> bool {
        self.last_renewed_at.elapsed() >= self.duration.mul_f64(fraction)
    }

    pub fn mark_renewed(&mut self) {
        self.last_renewed_at = Instant::now();
    }

    /// True once the full duration has elapsed since the last successful
    /// renewal; at this point the holder must assume the lease was lost
    /// and cancel any in-flight work guarded by it (§5 "Cancellation").
    pub fn is_expired(&self) -> bool {
        self.last_renewed_at.elapsed() >= self.duration
    }

    pub fn age(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_lease_does_not_need_renewal() {
        let lease = Lease::new("c1", Duration::from_secs(30));
        assert!(!lease.should_renew(0.5));
        assert!(!lease.is_expired());
    }
}
