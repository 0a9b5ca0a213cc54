//! Process-wide time source.
//!
//! Store expiration reads the time through [`Clock`] so tests can freeze and
//! advance it deterministically. The override is global to the process; tests
//! that freeze the clock must run serially.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

static FROZEN_AT: RwLock<Option<DateTime<Utc>>> = parking_lot::const_rwlock(None);

/// Overridable UTC clock
pub struct Clock;

impl Clock {
    /// Current time, or the frozen instant when the clock is frozen
    pub fn now() -> DateTime<Utc> {
        match *FROZEN_AT.read() {
            Some(frozen) => frozen,
            None => Utc::now(),
        }
    }

    /// Freeze the clock at the current instant
    pub fn freeze() {
        let mut frozen = FROZEN_AT.write();
        if frozen.is_none() {
            *frozen = Some(Utc::now());
        }
    }

    /// Freeze the clock at a specific instant
    pub fn freeze_at(instant: DateTime<Utc>) {
        *FROZEN_AT.write() = Some(instant);
    }

    /// Move the clock forward, freezing it at the resulting instant
    pub fn advance_by(duration: Duration) {
        let mut frozen = FROZEN_AT.write();
        let base = frozen.unwrap_or_else(Utc::now);
        *frozen = Some(base + duration);
    }

    /// Return to the system clock
    pub fn reset() {
        *FROZEN_AT.write() = None;
    }

    /// Whether an override is currently in effect
    pub fn is_frozen() -> bool {
        FROZEN_AT.read().is_some()
    }
}

#[cfg(test)]
#[path = "clock_tests.rs"]
mod tests;
