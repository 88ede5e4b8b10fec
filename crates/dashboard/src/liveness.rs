//! Liveness evaluation: a pure function of the current signals, the two
//! clocks and the thresholds.
//!
//! ```text
//! beat_fresh   = heartbeat > 0      && server_now - heartbeat      <= fresh_ms
//! stream_fresh = last_event > 0     && local_now  - last_event     <= quiet_ms
//! client_ok    = client connected
//! online       = beat_fresh && stream_fresh && client_ok
//! ```
//!
//! Every signal can lie on its own (a heartbeat cached from an earlier
//! session, a dead pipe still flagged connected, a flaky link report), so
//! the device only counts as online when all three agree.

use serde::Serialize;

use crate::config::WatchdogConfig;
use crate::signals::Signals;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Assessment {
    pub beat_fresh: bool,
    pub stream_fresh: bool,
    pub client_ok: bool,
    /// Heartbeat age on the server clock; `None` when never seen.
    pub beat_age_ms: Option<i64>,
    /// Time since the last data event on the local clock; `None` when never seen.
    pub stream_age_ms: Option<i64>,
}

impl Assessment {
    pub fn online(&self) -> bool {
        self.beat_fresh && self.stream_fresh && self.client_ok
    }
}

/// Age of `then` as seen at `now`. Negative when `then` lies in the future.
fn age(now: i64, then: i64) -> i64 {
    now.saturating_sub(then)
}

fn limit(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

/// A heartbeat is fresh when it has been seen and is no older than
/// `fresh_ms`. A negative age (server clock perceived behind) is fresh.
pub fn beat_fresh(heartbeat_ms: i64, server_now: i64, fresh_ms: u64) -> bool {
    heartbeat_ms > 0 && age(server_now, heartbeat_ms) <= limit(fresh_ms)
}

pub fn stream_fresh(last_event_local_ms: i64, local_now: i64, quiet_ms: u64) -> bool {
    last_event_local_ms > 0 && age(local_now, last_event_local_ms) <= limit(quiet_ms)
}

pub fn evaluate(
    signals: &Signals,
    config: &WatchdogConfig,
    server_now: i64,
    local_now: i64,
) -> Assessment {
    Assessment {
        beat_fresh: beat_fresh(signals.heartbeat_ms, server_now, config.fresh_ms),
        stream_fresh: stream_fresh(signals.last_event_local_ms, local_now, config.quiet_ms),
        client_ok: signals.client_connected,
        beat_age_ms: (signals.heartbeat_ms > 0).then(|| age(server_now, signals.heartbeat_ms)),
        stream_age_ms: (signals.last_event_local_ms > 0)
            .then(|| age(local_now, signals.last_event_local_ms)),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const T: i64 = 1_700_000_000_000;

    fn all_good() -> Signals {
        Signals {
            heartbeat_ms: T,
            last_event_local_ms: T,
            client_connected: true,
        }
    }

    // -- beat_fresh ---------------------------------------------------------

    #[test]
    fn beat_fresh_boundary_is_inclusive() {
        assert!(beat_fresh(T, T + 7_000, 7_000));
        assert!(!beat_fresh(T, T + 7_001, 7_000));
    }

    #[test]
    fn beat_fresh_is_monotonic_in_age() {
        let fresh_ms = 7_000;
        let mut was_fresh = true;
        for age in (0..=20_000).step_by(250) {
            let fresh = beat_fresh(T, T + age, fresh_ms);
            assert_eq!(fresh, age <= fresh_ms as i64, "age {age}");
            // once stale, never fresh again at a larger age
            assert!(was_fresh || !fresh, "freshness returned at age {age}");
            was_fresh = fresh;
        }
    }

    #[test]
    fn beat_never_seen_is_never_fresh() {
        assert!(!beat_fresh(0, 0, 7_000));
        assert!(!beat_fresh(0, T, u64::MAX));
    }

    #[test]
    fn negative_age_is_fresh() {
        // Offset jitter puts server_now behind the heartbeat.
        assert!(beat_fresh(T, T - 1_500, 7_000));
    }

    #[test]
    fn extreme_values_do_not_overflow() {
        assert!(!beat_fresh(1, i64::MAX, 7_000));
        assert!(beat_fresh(i64::MAX, i64::MIN, 7_000));
        assert!(beat_fresh(T, T + 1_000_000, u64::MAX));
    }

    // -- stream_fresh -------------------------------------------------------

    #[test]
    fn stream_fresh_boundary() {
        assert!(stream_fresh(T, T + 10_000, 10_000));
        assert!(!stream_fresh(T, T + 10_001, 10_000));
        assert!(!stream_fresh(0, T, 10_000));
    }

    // -- evaluate -----------------------------------------------------------

    #[test]
    fn all_signals_fresh_is_online() {
        let a = evaluate(&all_good(), &WatchdogConfig::default(), T + 3_000, T + 3_000);
        assert!(a.online());
        assert_eq!(a.beat_age_ms, Some(3_000));
        assert_eq!(a.stream_age_ms, Some(3_000));
    }

    #[test]
    fn each_signal_alone_can_veto() {
        let cfg = WatchdogConfig::default();

        let stale_beat = evaluate(&all_good(), &cfg, T + 7_001, T);
        assert!(!stale_beat.beat_fresh && !stale_beat.online());

        let quiet_stream = evaluate(&all_good(), &cfg, T, T + 10_001);
        assert!(!quiet_stream.stream_fresh && !quiet_stream.online());

        let mut offline_client = all_good();
        offline_client.client_connected = false;
        let a = evaluate(&offline_client, &cfg, T, T);
        assert!(a.beat_fresh && a.stream_fresh && !a.online());
    }

    #[test]
    fn nothing_seen_reports_no_ages() {
        let s = Signals {
            client_connected: true,
            ..Signals::default()
        };
        let a = evaluate(&s, &WatchdogConfig::default(), T, T);
        assert!(!a.online());
        assert_eq!(a.beat_age_ms, None);
        assert_eq!(a.stream_age_ms, None);
    }

    #[test]
    fn server_and_local_clocks_are_independent() {
        // Heartbeat judged on the server clock, stream on the local clock.
        let cfg = WatchdogConfig::default();
        let s = Signals {
            heartbeat_ms: T + 60_000, // server runs a minute ahead
            last_event_local_ms: T,
            client_connected: true,
        };
        let a = evaluate(&s, &cfg, T + 62_000, T + 2_000);
        assert!(a.online());
    }
}
