use std::collections::{HashSet, VecDeque};
use time::OffsetDateTime;

struct Pending {
    marker: String,
    timestamp: OffsetDateTime,
    done: bool,
}

/// A bounded out-of-order completion tracker (§4.4.6). `start` registers
/// a marker as in-flight; `finish` marks it done. `persisted()` returns
/// only the highest *contiguously* completed prefix — a gap anywhere
/// earlier in the queue holds back every marker after it.
///
/// Window size governs how many in-flight entries the tracker will
/// admit before `start` is refused: 1 for data-sync markers (strict
/// per-shard ordering), 10 for bucket-index markers (§4.4.6).
pub struct MarkerTracker {
    window: usize,
    queue: VecDeque<Pending>,
    persisted_marker: String,
    persisted_timestamp: Option<OffsetDateTime>,
}

impl MarkerTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            queue: VecDeque::new(),
            persisted_marker: String::new(),
            persisted_timestamp: None,
        }
    }

    /// True if the tracker has room for another in-flight entry.
    pub fn has_capacity(&self) -> bool {
        self.queue.iter().filter(|p| !p.done).count() < self.window
    }

    pub fn start(&mut self, marker: String, timestamp: OffsetDateTime) {
        self.queue.push_back(Pending { marker, timestamp, done: false });
    }

    /// Marks `marker` complete and advances the persisted contiguous
    /// prefix as far as the queue allows.
    pub fn finish(&mut self, marker: &str) {
        if let Some(entry) = self.queue.iter_mut().find(|p| p.marker == marker) {
            entry.done = true;
        }
        while let Some(front) = self.queue.front() {
            if !front.done {
                break;
            }
            let front = self.queue.pop_front().unwrap();
            self.persisted_marker = front.marker;
            self.persisted_timestamp = Some(front.timestamp);
        }
    }

    /// The highest contiguously completed `(marker, timestamp)`, if any
    /// progress has been made yet.
    pub fn persisted(&self) -> Option<(&str, OffsetDateTime)> {
        self.persisted_timestamp.map(|ts| (self.persisted_marker.as_str(), ts))
    }
}

/// Wraps a [`MarkerTracker`] with a per-object-key in-flight registry,
/// used by bucket-incremental-sync (§4.4.6): "a second `start(key)` sets
/// a retry flag and returns refusal" so the caller waits for the
/// in-flight op on that key before retrying.
pub struct KeyedMarkerTracker {
    inner: MarkerTracker,
    in_flight_keys: HashSet<String>,
}

impl KeyedMarkerTracker {
    pub fn new(window: usize) -> Self {
        Self {
            inner: MarkerTracker::new(window),
            in_flight_keys: HashSet::new(),
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.inner.has_capacity()
    }

    /// Returns `false` (refusal) if `key` already has an in-flight
    /// operation; the caller must wait and retry.
    pub fn start(&mut self, key: &str, marker: String, timestamp: OffsetDateTime) -> bool {
        if !self.in_flight_keys.insert(key.to_string()) {
            return false;
        }
        self.inner.start(marker, timestamp);
        true
    }

    pub fn finish(&mut self, key: &str, marker: &str) {
        self.in_flight_keys.remove(key);
        self.inner.finish(marker);
    }

    pub fn persisted(&self) -> Option<(&str, OffsetDateTime)> {
        self.inner.persisted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(secs).unwrap()
    }

    #[test]
    fn out_of_order_completion_holds_back_on_gap() {
        let mut t = MarkerTracker::new(10);
        t.start("0000000001".into(), ts(1));
        t.start("0000000002".into(), ts(2));
        t.start("0000000003".into(), ts(3));

        // Scenario 4 from the testable-properties section: entry 2
        // completes first, then 1, then 3.
        t.finish("0000000002");
        assert_eq!(t.persisted(), None);

        t.finish("0000000001");
        assert_eq!(t.persisted().unwrap().0, "0000000002");

        t.finish("0000000003");
        assert_eq!(t.persisted().unwrap().0, "0000000003");
    }

    #[test]
    fn window_limits_capacity() {
        let mut t = MarkerTracker::new(1);
        assert!(t.has_capacity());
        t.start("m1".into(), ts(1));
        assert!(!t.has_capacity());
        t.finish("m1");
        assert!(t.has_capacity());
    }

    #[test]
    fn keyed_tracker_refuses_duplicate_in_flight_key() {
        let mut t = KeyedMarkerTracker::new(10);
        assert!(t.start("obj-a", "m1".into(), ts(1)));
        assert!(!t.start("obj-a", "m2".into(), ts(2)));
        t.finish("obj-a", "m1");
        assert!(t.start("obj-a", "m2".into(), ts(2)));
    }
}
