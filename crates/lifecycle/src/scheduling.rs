use std::time::Duration;
use time::OffsetDateTime;

/// `rgw_lifecycle_work_time`: the daily HH:MM-HH:MM window lifecycle
/// workers wake within (§4.6 "Scheduling"). A `debug_interval`
/// overrides this entirely: "any time, every N seconds."
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub window_start_hour: u8,
    pub window_end_hour: u8,
    pub debug_interval: Option<Duration>,
}

impl Default for Schedule {
    fn default() -> Self {
        Self { window_start_hour: 0, window_end_hour: 6, debug_interval: None }
    }
}

impl Schedule {
    pub fn debug(interval: Duration) -> Self {
        Self { window_start_hour: 0, window_end_hour: 24, debug_interval: Some(interval) }
    }

    pub fn in_window(&self, now: OffsetDateTime) -> bool {
        if self.debug_interval.is_some() {
            return true;
        }
        let hour = now.hour();
        if self.window_start_hour <= self.window_end_hour {
            hour >= self.window_start_hour && hour < self.window_end_hour
        } else {
            hour >= self.window_start_hour || hour < self.window_end_hour
        }
    }

    /// How long a cached `Processing` entry is still presumed live: a
    /// debug interval if set, else `2·24h` (§4.6 step 2's "expired"
    /// threshold of `2 · debug_interval`).
    pub fn run_validity_time(&self) -> time::Duration {
        let secs = self.debug_interval.map(|d| d.as_secs() * 2).unwrap_or(2 * 24 * 3600);
        time::Duration::seconds(secs as i64)
    }

    /// The `stop_at` deadline for one shard's processing pass (§4.6
    /// step 6).
    pub fn stop_at(&self, now: OffsetDateTime) -> OffsetDateTime {
        now + self.debug_interval.unwrap_or(Duration::from_secs(24 * 3600))
    }

    /// §4.6 step 3: whether a sweep that started at `start_date` counts
    /// as having already run "today" relative to `now`.
    pub fn ran_today(&self, start_date: OffsetDateTime, now: OffsetDateTime) -> bool {
        match self.debug_interval {
            Some(interval) => now - start_date < time::Duration::seconds(interval.as_secs() as i64),
            None => start_date.date() == now.date(),
        }
    }
}
