use std::collections::VecDeque;
use std::sync::Mutex;
use time::OffsetDateTime;

/// One entry in the ring-buffered sync-error log (§7 "User-visible
/// failure behavior"). The admin CLI that would normally read this is
/// explicitly excluded from scope; we keep the buffer accessible
/// read-only for whatever surface eventually wants it (SPEC_FULL.md §C).
#[derive(Debug, Clone, PartialEq)]
pub struct SyncErrorRecord {
    pub bucket_shard_key: String,
    pub gen: Option<u64>,
    pub error: String,
    pub timestamp: OffsetDateTime,
}

/// A bounded ring buffer of the most recent sync errors across all
/// shards of a source zone.
pub struct SyncErrorLog {
    capacity: usize,
    entries: Mutex<VecDeque<SyncErrorRecord>>,
}

impl SyncErrorLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn append(&self, bucket_shard_key: String, gen: Option<u64>, error: String, timestamp: OffsetDateTime) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(SyncErrorRecord {
            bucket_shard_key,
            gen,
            error,
            timestamp,
        });
    }

    /// Read-only snapshot, oldest first.
    pub fn snapshot(&self) -> Vec<SyncErrorRecord> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_evicts_oldest() {
        let log = SyncErrorLog::new(2);
        let ts = OffsetDateTime::from_unix_timestamp(0).unwrap();
        log.append("a".into(), None, "e1".into(), ts);
        log.append("b".into(), None, "e2".into(), ts);
        log.append("c".into(), None, "e3".into(), ts);
        let snap = log.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].bucket_shard_key, "b");
        assert_eq!(snap[1].bucket_shard_key, "c");
    }
}
