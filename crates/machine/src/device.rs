//! The simulated machine's command handling and heartbeat muting.

use serde::Serialize;
use std::time::{Duration, Instant};

/// Heartbeats pause this long while the device "restarts".
pub const REBOOT_MUTE: Duration = Duration::from_secs(4);
/// Reconnecting to Wi-Fi takes longer than a restart.
pub const WIFI_RESET_MUTE: Duration = Duration::from_secs(15);

/// Payload of the `status` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMsg {
    pub running: bool,
    pub last_command_source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// Cleared or unknown action.
    Ignored,
    /// Running flag changed; publish status now.
    StatusChanged,
    /// Heartbeats are suppressed for the given time.
    Muted(Duration),
}

pub struct Device {
    running: bool,
    last_command_source: String,
    muted_until: Option<Instant>,
}

impl Device {
    pub fn new() -> Self {
        Self {
            running: false,
            last_command_source: "local".to_string(),
            muted_until: None,
        }
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn status(&self) -> StatusMsg {
        StatusMsg {
            running: self.running,
            last_command_source: self.last_command_source.clone(),
        }
    }

    pub fn handle_action(&mut self, action: &str, now: Instant) -> Reaction {
        match action.trim() {
            "start" => self.set_running(true),
            "stop" => self.set_running(false),
            "reboot" => self.mute(now, REBOOT_MUTE),
            "wifi_reset" => self.mute(now, WIFI_RESET_MUTE),
            _ => Reaction::Ignored,
        }
    }

    pub fn is_muted(&self, now: Instant) -> bool {
        self.muted_until.is_some_and(|until| now < until)
    }

    fn set_running(&mut self, running: bool) -> Reaction {
        self.running = running;
        self.last_command_source = "web".to_string();
        Reaction::StatusChanged
    }

    fn mute(&mut self, now: Instant, period: Duration) -> Reaction {
        self.muted_until = Some(now + period);
        Reaction::Muted(period)
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_and_stop_toggle_running() {
        let mut d = Device::new();
        let now = Instant::now();
        assert_eq!(d.handle_action("start", now), Reaction::StatusChanged);
        assert!(d.running());
        assert_eq!(d.status().last_command_source, "web");
        assert_eq!(d.handle_action("stop", now), Reaction::StatusChanged);
        assert!(!d.running());
    }

    #[test]
    fn cleared_and_unknown_actions_are_ignored() {
        let mut d = Device::new();
        let now = Instant::now();
        assert_eq!(d.handle_action("", now), Reaction::Ignored);
        assert_eq!(d.handle_action("explode", now), Reaction::Ignored);
        assert_eq!(d.status().last_command_source, "local");
    }

    #[test]
    fn reboot_mutes_briefly() {
        let mut d = Device::new();
        let now = Instant::now();
        assert_eq!(d.handle_action("reboot", now), Reaction::Muted(REBOOT_MUTE));
        assert!(d.is_muted(now));
        assert!(d.is_muted(now + REBOOT_MUTE - Duration::from_millis(1)));
        assert!(!d.is_muted(now + REBOOT_MUTE));
    }

    #[test]
    fn wifi_reset_mutes_longer_than_reboot() {
        let mut d = Device::new();
        let now = Instant::now();
        d.handle_action("wifi_reset", now);
        assert!(d.is_muted(now + REBOOT_MUTE));
        assert!(!d.is_muted(now + WIFI_RESET_MUTE));
    }

    #[test]
    fn status_serializes_camel_case() {
        let json = serde_json::to_value(Device::new().status()).unwrap();
        assert_eq!(json["running"], false);
        assert_eq!(json["lastCommandSource"], "local");
    }
}
