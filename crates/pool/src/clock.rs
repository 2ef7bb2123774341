//! Time source for the engine.
//!
//! All lifecycle timestamps (enqueue times, vote windows, cooldowns, last
//! seen) come from a [`Clock`] so tests can drive time explicitly.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
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

    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *guard = offset(*guard, by);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// `at + by`, saturating at the maximum representable instant.
pub fn offset(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    let millis = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
    TimeDelta::try_milliseconds(millis)
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Time from `since` to `now`; zero when `since` lies in the future.
pub fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_only_when_told() {
        let clock = ManualClock::starting_now();
        let start = clock.now();
        assert_eq!(clock.now(), start);
        clock.advance(Duration::from_secs(30));
        assert_eq!(elapsed(start, clock.now()), Duration::from_secs(30));
    }

    #[test]
    fn elapsed_never_goes_negative() {
        let now = Utc::now();
        let later = offset(now, Duration::from_secs(5));
        assert_eq!(elapsed(later, now), Duration::ZERO);
    }

    #[test]
    fn offset_saturates() {
        let far = offset(Utc::now(), Duration::MAX);
        assert_eq!(far, DateTime::<Utc>::MAX_UTC);
    }
}
