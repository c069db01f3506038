//! Time source for task timestamps and eta comparisons.

use std::sync::Mutex;

use chrono::{DateTime, Duration, TimeZone, Utc};

/// Source of "now" for the queue engine.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
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
    /// Creates a clock frozen at `secs` seconds after the Unix epoch.
    pub fn at_secs(secs: i64) -> Self {
        let now = Utc
            .timestamp_opt(secs, 0)
            .single()
            .unwrap_or_default();
        Self {
            now: Mutex::new(now),
        }
    }

    /// Moves the clock to an absolute time.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.lock() = now;
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.lock();
        *now += by;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.lock()
    }
}

/// Encodes a timestamp the way task records store it: epoch seconds with
/// millisecond precision.
pub fn to_epoch_secs(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_millis() as f64 / 1000.0
}

/// Decodes a stored timestamp.
pub fn from_epoch_secs(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    Utc.timestamp_millis_opt((secs * 1000.0).round() as i64).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::at_secs(1000);
        assert_eq!(clock.now().timestamp(), 1000);

        clock.advance(Duration::seconds(5));
        assert_eq!(clock.now().timestamp(), 1005);
    }

    #[test]
    fn test_epoch_secs_roundtrip_keeps_millis() {
        let ts = Utc.timestamp_millis_opt(1_234_567).single().expect("valid");
        assert_eq!(to_epoch_secs(ts), 1234.567);
        assert_eq!(from_epoch_secs(1234.567), Some(ts));
        assert_eq!(from_epoch_secs(f64::NAN), None);
    }
}
