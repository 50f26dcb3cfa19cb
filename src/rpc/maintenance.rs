//! Periodic upkeep of the routing table and the local store.

use std::time::{Duration, Instant};

/// Longest time between two checks for stale buckets.
const MAX_REFRESH_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const STORAGE_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Maintenance timers
#[derive(Debug)]
pub(crate) struct Maintenance {
    refresh_check_interval: Option<Duration>,
    last_refresh_check: Instant,
    last_storage_cleanup: Instant,
}

/// Decisions about maintenance, computed once per tick.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct MaintenanceDecisions {
    /// Look up a random id in every stale bucket.
    pub should_refresh_stale_buckets: bool,
    /// Drop expired records from the local store.
    pub should_cleanup_storage: bool,
}

impl Maintenance {
    /// `staleness_timeout` of `None` disables bucket refreshes.
    pub fn new(staleness_timeout: Option<Duration>) -> Self {
        let now = Instant::now();

        Self {
            refresh_check_interval: staleness_timeout
                .map(|timeout| timeout.min(MAX_REFRESH_CHECK_INTERVAL)),
            last_refresh_check: now,
            last_storage_cleanup: now,
        }
    }

    pub fn decisions(&mut self) -> MaintenanceDecisions {
        self.decisions_at(Instant::now())
    }

    fn decisions_at(&mut self, now: Instant) -> MaintenanceDecisions {
        let should_refresh_stale_buckets = match self.refresh_check_interval {
            Some(interval) => now.saturating_duration_since(self.last_refresh_check) >= interval,
            None => false,
        };
        let should_cleanup_storage =
            now.saturating_duration_since(self.last_storage_cleanup) >= STORAGE_CLEANUP_INTERVAL;

        if should_refresh_stale_buckets {
            self.last_refresh_check = now;
        }
        if should_cleanup_storage {
            self.last_storage_cleanup = now;
        }

        MaintenanceDecisions {
            should_refresh_stale_buckets,
            should_cleanup_storage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_due_right_away() {
        let mut maintenance = Maintenance::new(Some(Duration::from_secs(600)));

        assert_eq!(maintenance.decisions(), MaintenanceDecisions::default());
    }

    #[test]
    fn refresh_check_is_due_after_interval() {
        let mut maintenance = Maintenance::new(Some(Duration::from_secs(10)));

        // Advance time forward past the interval.
        // We add to Instant::now() instead of subtracting, because on Windows
        // Instant can be close to its internal epoch and subtraction overflows.
        let future = Instant::now() + Duration::from_secs(11);

        let decisions = maintenance.decisions_at(future);

        assert!(decisions.should_refresh_stale_buckets);
        assert!(!decisions.should_cleanup_storage);
        assert_eq!(maintenance.last_refresh_check, future);

        assert!(!maintenance.decisions_at(future).should_refresh_stale_buckets);
    }

    #[test]
    fn refresh_check_interval_is_capped() {
        let mut maintenance = Maintenance::new(Some(Duration::from_secs(3600)));

        let future = Instant::now() + MAX_REFRESH_CHECK_INTERVAL;

        let decisions = maintenance.decisions_at(future);

        assert!(decisions.should_refresh_stale_buckets);
        assert!(decisions.should_cleanup_storage);
    }

    #[test]
    fn disabled_staleness_never_refreshes() {
        let mut maintenance = Maintenance::new(None);

        let future = Instant::now() + Duration::from_secs(24 * 3600);

        assert!(!maintenance.decisions_at(future).should_refresh_stale_buckets);
    }
}
