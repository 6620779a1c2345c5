//! Wall-clock anchored countdown.
//!
//! A [`Countdown`] stores only its end time. Remaining time is recomputed
//! from `end - now` on every read, so a suspended host that misses ticks
//! still reports the right value when it wakes up.

use serde::{Deserialize, Serialize};

use crate::model::UnixTimeMs;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Countdown {
    ends_at: UnixTimeMs,
    expired_notified: bool,
}

/// Result of one tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CountdownTick {
    pub remaining_seconds: u64,
    /// True on the single tick that observed the countdown reaching zero.
    pub expired_now: bool,
}

impl Countdown {
    #[must_use]
    pub fn until(ends_at: UnixTimeMs) -> Self {
        Self {
            ends_at,
            expired_notified: false,
        }
    }

    #[must_use]
    pub fn starting_at(now: UnixTimeMs, duration_ms: u64) -> Self {
        Self::until(now.add_millis(duration_ms))
    }

    #[must_use]
    pub fn ends_at(&self) -> UnixTimeMs {
        self.ends_at
    }

    #[must_use]
    pub fn remaining_ms(&self, now: UnixTimeMs) -> u64 {
        self.ends_at.elapsed_since(now)
    }

    /// Whole seconds left, rounded down.
    #[must_use]
    pub fn remaining_seconds(&self, now: UnixTimeMs) -> u64 {
        self.remaining_ms(now) / 1000
    }

    #[must_use]
    pub fn is_active(&self, now: UnixTimeMs) -> bool {
        self.remaining_seconds(now) > 0
    }

    #[must_use]
    pub fn has_expired(&self) -> bool {
        self.expired_notified
    }

    pub fn tick(&mut self, now: UnixTimeMs) -> CountdownTick {
        let remaining_seconds = self.remaining_seconds(now);
        let expired_now = remaining_seconds == 0 && !self.expired_notified;
        if expired_now {
            self.expired_notified = true;
        }
        CountdownTick {
            remaining_seconds,
            expired_now,
        }
    }

    /// Closes the countdown early without waiting for the clock. Returns
    /// whether this call was the one that expired it.
    pub fn expire(&mut self, now: UnixTimeMs) -> bool {
        if self.ends_at > now {
            self.ends_at = now;
        }
        let first = !self.expired_notified;
        self.expired_notified = true;
        first
    }
}
