// Wall-clock access for the core services.
//
// Cooldowns and mute expiries are absolute timestamps that get persisted, so the
// services need "now" as a `DateTime<Utc>`. Going through a trait lets tests move
// time forward without sleeping.

use chrono::{DateTime, Utc};

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock, used everywhere outside of tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub use manual::ManualClock;
