//! Time source for day-bucketed usage accounting.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::sync::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// The current quota period: today's date in UTC.
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }

    /// Seconds until the next UTC midnight, when a fresh period starts.
    fn seconds_until_reset(&self) -> u64 {
        let now = self.now();
        let next_midnight = (now.date_naive() + Duration::days(1))
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc())
            .unwrap_or(now);
        (next_midnight - now).num_seconds().max(0) as u64
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = to;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_else(|e| *e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn reset_is_counted_to_next_utc_midnight() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 0).unwrap());
        assert_eq!(clock.seconds_until_reset(), 3600);

        clock.advance(Duration::minutes(59));
        assert_eq!(clock.seconds_until_reset(), 60);
    }

    #[test]
    fn advancing_past_midnight_changes_the_period() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 23, 59, 0).unwrap());
        let before = clock.today();
        clock.advance(Duration::minutes(2));
        assert_eq!(clock.today(), before.succ_opt().unwrap());
    }
}
