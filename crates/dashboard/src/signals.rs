//! Raw liveness signals as they arrive from the backend, plus lenient
//! payload coercion. Nothing here ever fails: a missing or malformed value
//! degrades to the "never seen" default.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Signals {
    /// Server time of the device's last heartbeat. 0 = never seen.
    pub heartbeat_ms: i64,
    /// Local time at which any sensor/status push was last received. 0 = never.
    pub last_event_local_ms: i64,
    /// Whether our own link to the backend is up.
    pub client_connected: bool,
}

impl Signals {
    pub fn record_heartbeat(&mut self, server_ts: i64) {
        self.heartbeat_ms = server_ts.max(0);
    }

    pub fn record_data_event(&mut self, local_now: i64) {
        self.last_event_local_ms = local_now;
    }

    /// Returns true when this update is a loss of connectivity.
    pub fn record_connectivity(&mut self, connected: bool) -> bool {
        self.client_connected = connected;
        !connected
    }

    pub fn heartbeat_seen(&self) -> bool {
        self.heartbeat_ms > 0
    }
}

/// Coerce a backend payload into a millisecond value.
///
/// Accepts a JSON number (fractions truncated) or a string holding one.
/// Anything else, including non-finite numbers, is 0.
pub fn coerce_millis(payload: &[u8]) -> i64 {
    match serde_json::from_slice::<Value>(payload) {
        Ok(v) => millis_from_value(&v),
        Err(_) => 0,
    }
}

fn millis_from_value(v: &Value) -> i64 {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
                .unwrap_or(0)
        }
        _ => 0,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
