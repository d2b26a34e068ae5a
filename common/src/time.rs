use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};

/// Wall clock the firmware can be told to trust.
pub trait SystemClock: Send + Sync {
    fn unix_time(&self) -> i64;

    fn set_unix_time(&self, unix_time: i64);

    /// Milliseconds since boot; never goes backwards.
    fn uptime_ms(&self) -> u64;

    /// Reads `local` as a UTC wall time, the way the time driver stores it.
    fn local_to_unix(&self, local: NaiveDateTime) -> i64 {
        local.and_utc().timestamp()
    }

    fn unix_to_local(&self, unix_time: i64, utc_offset_secs: i32) -> Option<DateTime<FixedOffset>> {
        let offset = FixedOffset::east_opt(utc_offset_secs)?;
        offset.timestamp_opt(unix_time, 0).single()
    }

    fn now_local(&self, utc_offset_secs: i32) -> Option<DateTime<FixedOffset>> {
        self.unix_to_local(self.unix_time(), utc_offset_secs)
    }
}

/// Host clock with an adjustable offset from the OS clock.
#[derive(Debug)]
pub struct AdjustableClock {
    boot: Instant,
    correction_secs: AtomicI64,
}

impl Default for AdjustableClock {
    fn default() -> Self {
        Self::new()
    }
}

impl AdjustableClock {
    pub fn new() -> Self {
        Self {
            boot: Instant::now(),
            correction_secs: AtomicI64::new(0),
        }
    }

    fn os_unix_time() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or(0)
    }
}

impl SystemClock for AdjustableClock {
    fn unix_time(&self) -> i64 {
        Self::os_unix_time() + self.correction_secs.load(Ordering::Relaxed)
    }

    fn set_unix_time(&self, unix_time: i64) {
        self.correction_secs
            .store(unix_time - Self::os_unix_time(), Ordering::Relaxed);
    }

    fn uptime_ms(&self) -> u64 {
        self.boot.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn set_time_shifts_reported_time() {
        let clock = AdjustableClock::new();
        clock.set_unix_time(1_000_000);

        assert!((clock.unix_time() - 1_000_000).abs() <= 1);
    }

    #[test]
    fn local_conversion_keeps_wall_clock() {
        let clock = AdjustableClock::new();
        let wall = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(18, 30, 0)
            .unwrap();

        let as_utc = clock.local_to_unix(wall);
        let local = clock.unix_to_local(as_utc - 3600, 3600).unwrap();

        assert_eq!(local.naive_local(), wall);
        assert_eq!(local.offset().local_minus_utc(), 3600);
    }
}
