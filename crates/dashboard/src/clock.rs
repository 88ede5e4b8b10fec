//! Local wall clock plus the correction that maps it onto the backend's
//! authoritative clock.
//!
//! All times are unix milliseconds held in `i64` so that ages computed from
//! a skewed server clock can go negative without wrapping.

use std::time::{SystemTime, UNIX_EPOCH};

/// Source of local wall-clock time.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

// ---------------------------------------------------------------------------
// Server clock offset
// ---------------------------------------------------------------------------

/// Tracks `serverTime - localTime`. Each update overwrites the previous one;
/// until the first update arrives the offset is zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockCorrector {
    offset_ms: i64,
}

impl ClockCorrector {
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms
    }

    pub fn set_offset(&mut self, offset_ms: i64) {
        self.offset_ms = offset_ms;
    }

    /// Derive the offset from an authoritative server timestamp observed at
    /// `local_now`. A zero or negative server time is treated as absent and
    /// resets the offset to zero.
    pub fn observe_server_time(&mut self, server_ms: i64, local_now: i64) {
        self.offset_ms = if server_ms > 0 {
            server_ms.saturating_sub(local_now)
        } else {
            0
        };
    }

    /// Best estimate of the server clock at local time `local_now`.
    pub fn server_now(&self, local_now: i64) -> i64 {
        local_now.saturating_add(self.offset_ms)
    }
}

// ---------------------------------------------------------------------------
// Test clock
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) use manual::ManualClock;


// ===========================================================================
// Tests
// ===========================================================================
