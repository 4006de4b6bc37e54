//! Wall clock seam.
//!
//! Day buckets are UTC calendar days. Schedulers read the clock at day and
//! upload boundaries, so tests drive midnight crossings through a manual
//! clock instead of waiting for one.

use chrono::{DateTime, NaiveDate, Utc};

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Current UTC calendar day.
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_today_matches_now() {
        let clock = SystemClock;
        let now = clock.now();
        let today = clock.today();
        assert!(today >= now.date_naive());
    }
}
