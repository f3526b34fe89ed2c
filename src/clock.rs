//! Injectable wall-clock abstraction.
//!
//! The scheduler never reads `SystemTime::now()` or `chrono::Utc::now()`
//! directly; every call site goes through a `Clock` so lateness windows,
//! backoff arithmetic, and next-tick rounding can be tested without real
//! sleeps.

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Current time, expressed as both a millisecond epoch and a `DateTime<Utc>`
/// (cron evaluation needs the latter; persistence and comparisons use the
/// former).
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;

    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.now_ms()).unwrap_or_else(Utc::now)
    }
}

/// Real wall-clock time, backed by `SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// A clock whose value is set explicitly, for deterministic boundary tests.
#[cfg(test)]
#[derive(Debug)]
pub struct FakeClock(std::sync::atomic::AtomicI64);

#[cfg(test)]
impl FakeClock {
    pub fn new(now_ms: i64) -> Self {
        Self(std::sync::atomic::AtomicI64::new(now_ms))
    }

    pub fn advance(&self, delta_ms: i64) {
        self.0
            .fetch_add(delta_ms, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: i64) {
        self.0.store(now_ms, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for FakeClock {
    fn now_ms(&self) -> i64 {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances() {
        let clock = FakeClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set(0);
        assert_eq!(clock.now_ms(), 0);
    }

    #[test]
    fn now_utc_roundtrips_through_millis() {
        let clock = FakeClock::new(1_700_000_000_000);
        assert_eq!(clock.now_utc().timestamp_millis(), 1_700_000_000_000);
    }
}
