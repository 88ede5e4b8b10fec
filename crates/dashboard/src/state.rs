use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::backend::{SensorMsg, StatusMsg};
use crate::liveness::Assessment;
use crate::publisher::{ControlSurface, Notification, Verdict};
use crate::signals::Signals;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

/// Maximum number of sensor samples kept for the chart and CSV export.
pub const MAX_SAMPLES: usize = 100;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<DashboardState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct DashboardState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub verdict: Verdict,
    pub controls_locked: bool,
    pub offline_notice: bool,
    pub signals: Signals,
    pub liveness: Option<Assessment>,
    pub evaluations: u64,
    pub ticker_running: bool,
    pub sensors: Option<SensorSnapshot>,
    pub status: Option<MachineStatus>,
    pub notification: Option<Notification>,
    pub history: VecDeque<Sample>,
    pub events: VecDeque<DashboardEvent>,
}

#[derive(Clone, Serialize)]
pub struct SensorSnapshot {
    pub temperature: Option<f64>,
    pub moisture: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

#[derive(Clone, Serialize)]
pub struct MachineStatus {
    pub running: bool,
    pub last_command_source: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

#[derive(Clone, Serialize)]
pub struct Sample {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub temperature: Option<f64>,
    pub moisture: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct DashboardEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub title: String,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Status,
    Notification,
    Command,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub online: bool,
    pub verdict: Verdict,
    pub controls_locked: bool,
    pub offline_notice: bool,
    pub signals: Signals,
    pub liveness: Option<Assessment>,
    pub evaluations: u64,
    pub ticker_running: bool,
    pub sensors: Option<SensorSnapshot>,
    pub status: Option<MachineStatus>,
    pub notification: Option<Notification>,
    pub history: Vec<Sample>,
    pub events: Vec<DashboardEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl DashboardState {
    /// Starts locked with the offline notice up; only the watchdog unlocks.
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            verdict: Verdict::Pending,
            controls_locked: true,
            offline_notice: true,
            signals: Signals::default(),
            liveness: None,
            evaluations: 0,
            ticker_running: false,
            sensors: None,
            status: None,
            notification: None,
            history: VecDeque::with_capacity(MAX_SAMPLES),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a sensor push and append it to the history.
    pub fn record_sensors(&mut self, msg: SensorMsg) {
        let now = OffsetDateTime::now_utc();

        if self.history.len() >= MAX_SAMPLES {
            self.history.pop_front();
        }
        self.history.push_back(Sample {
            ts: now,
            temperature: msg.temperature,
            moisture: msg.moisture,
        });

        self.sensors = Some(SensorSnapshot {
            temperature: msg.temperature,
            moisture: msg.moisture,
            received_at: now,
        });

        let detail = format!(
            "temperature={} moisture={}",
            fmt_reading(msg.temperature),
            fmt_reading(msg.moisture)
        );
        self.push_event(EventKind::Reading, "Sensor reading", detail);
    }

    /// Record a status push. Only changes are logged as events.
    pub fn record_status(&mut self, msg: StatusMsg) {
        let changed = self
            .status
            .as_ref()
            .map(|s| s.running != msg.running)
            .unwrap_or(true);

        let source = msg.last_command_source.clone();
        self.status = Some(MachineStatus {
            running: msg.running,
            last_command_source: msg.last_command_source,
            received_at: OffsetDateTime::now_utc(),
        });

        if changed {
            let state_str = if msg.running { "RUNNING" } else { "STOPPED" };
            self.push_event(
                EventKind::Status,
                "Status changed",
                format!("{state_str} (source: {})", source.as_deref().unwrap_or("--")),
            );
        }
    }

    pub fn record_command(&mut self, action: &str) {
        self.push_event(EventKind::Command, "Command sent", format!("sent '{action}'"));
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, "Error", detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, "System", detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            online: self.verdict.is_online(),
            verdict: self.verdict,
            controls_locked: self.controls_locked,
            offline_notice: self.offline_notice,
            signals: self.signals,
            liveness: self.liveness,
            evaluations: self.evaluations,
            ticker_running: self.ticker_running,
            sensors: self.sensors.clone(),
            status: self.status.clone(),
            notification: self.notification.clone(),
            history: self.history.iter().cloned().collect(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, title: impl Into<String>, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(DashboardEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            title: title.into(),
            detail,
        });
    }
}

impl Default for DashboardState {
    fn default() -> Self {
        Self::new()
    }
}

fn fmt_reading(v: Option<f64>) -> String {
    v.map(|v| format!("{v:.1}")).unwrap_or_else(|| "--".to_string())
}

// ---------------------------------------------------------------------------
// UI collaborator
// ---------------------------------------------------------------------------

impl ControlSurface for DashboardState {
    fn lock_controls(&mut self) {
        self.controls_locked = true;
    }

    fn unlock_controls(&mut self) {
        self.controls_locked = false;
    }

    fn show_offline_notice(&mut self, show: bool) {
        self.offline_notice = show;
    }

    /// Replaces whatever toast is showing.
    fn notify(&mut self, notification: Notification) {
        self.push_event(
            EventKind::Notification,
            notification.title.clone(),
            notification.message.clone(),
        );
        self.notification = Some(notification);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::NotificationKind;

    fn sensors(t: f64, m: f64) -> SensorMsg {
        SensorMsg {
            temperature: Some(t),
            moisture: Some(m),
        }
    }

    #[test]
    fn starts_locked_and_pending() {
        let st = DashboardState::new();
        assert!(st.controls_locked);
        assert!(st.offline_notice);
        assert_eq!(st.verdict, Verdict::Pending);
        assert!(!st.to_status().online);
    }

    #[test]
    fn history_is_bounded() {
        let mut st = DashboardState::new();
        for i in 0..(MAX_SAMPLES + 5) {
            st.record_sensors(sensors(i as f64, 50.0));
        }
        assert_eq!(st.history.len(), MAX_SAMPLES);
        assert_eq!(st.history.front().unwrap().temperature, Some(5.0));
        assert_eq!(st.sensors.as_ref().unwrap().temperature, Some(104.0));
    }

    #[test]
    fn events_are_bounded_and_newest_first() {
        let mut st = DashboardState::new();
        for i in 0..(MAX_EVENTS + 10) {
            st.record_system(format!("e{i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        let status = st.to_status();
        assert_eq!(status.events[0].detail, format!("e{}", MAX_EVENTS + 9));
    }

    #[test]
    fn missing_readings_render_as_dashes() {
        let mut st = DashboardState::new();
        st.record_sensors(SensorMsg::default());
        assert_eq!(st.events.back().unwrap().detail, "temperature=-- moisture=--");
    }

    #[test]
    fn status_events_only_on_change() {
        let mut st = DashboardState::new();
        let running = StatusMsg {
            running: true,
            last_command_source: Some("WEB".into()),
        };
        st.record_status(running.clone());
        st.record_status(running);
        st.record_status(StatusMsg::default());
        let status_events = st
            .events
            .iter()
            .filter(|e| e.kind == EventKind::Status)
            .count();
        assert_eq!(status_events, 2);
        assert!(!st.status.as_ref().unwrap().running);
    }

    #[test]
    fn surface_calls_update_view() {
        let mut st = DashboardState::new();
        st.unlock_controls();
        st.show_offline_notice(false);
        st.notify(Notification::new(NotificationKind::Success, "Device online", "ok", 1_500));
        assert!(!st.controls_locked);
        assert!(!st.offline_notice);
        assert_eq!(st.notification.as_ref().unwrap().title, "Device online");
        let logged = st.events.back().unwrap();
        assert_eq!(logged.kind, EventKind::Notification);
        assert_eq!(logged.title, "Device online");
        assert_eq!(logged.detail, "ok");
    }

    #[test]
    fn status_response_serializes() {
        let mut st = DashboardState::new();
        st.record_sensors(sensors(21.5, 40.0));
        let json = serde_json::to_value(st.to_status()).unwrap();
        assert_eq!(json["verdict"], "pending");
        assert_eq!(json["online"], false);
        assert_eq!(json["sensors"]["temperature"], 21.5);
        assert!(json["history"].is_array());
        assert!(json["events"][0]["ts"].is_string());
        assert_eq!(json["events"][0]["title"], "Sensor reading");
    }
}
