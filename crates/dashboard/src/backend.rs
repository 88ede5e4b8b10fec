//! The machine's backend, an MQTT broker used as a push key-value store:
//! retained messages are the stored values, subscriptions are listeners and
//! a publish is a `set`.
//!
//! All keys live under a configurable prefix:
//!
//! | key               | payload                                          |
//! |-------------------|--------------------------------------------------|
//! | `info/serverTime` | authoritative server time, ms                    |
//! | `info/serverTimeOffset` | server minus local time, ms                |
//! | `status/lastSeen` | device heartbeat, ms on the server clock         |
//! | `sensors`         | `{"temperature": 21.5, "moisture": 40}`          |
//! | `status`          | `{"running": true, "lastCommandSource": "web"}`  |
//! | `controls/action` | command string, cleared to `""` after a delay    |

use std::future::Future;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKey {
    ServerTime,
    ServerOffset,
    Heartbeat,
    Sensors,
    Status,
    Action,
}

impl BackendKey {
    fn suffix(self) -> &'static str {
        match self {
            BackendKey::ServerTime => "info/serverTime",
            BackendKey::ServerOffset => "info/serverTimeOffset",
            BackendKey::Heartbeat => "status/lastSeen",
            BackendKey::Sensors => "sensors",
            BackendKey::Status => "status",
            BackendKey::Action => "controls/action",
        }
    }
}

// ---------------------------------------------------------------------------
// Topic layout
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim().to_string(),
        }
    }

    pub fn topic(&self, key: BackendKey) -> String {
        format!("{}/{}", self.prefix, key.suffix())
    }

    /// Keys the dashboard listens to. The action key is write-only.
    pub fn subscriptions(&self) -> Vec<String> {
        [
            BackendKey::ServerTime,
            BackendKey::ServerOffset,
            BackendKey::Heartbeat,
            BackendKey::Sensors,
            BackendKey::Status,
        ]
        .into_iter()
        .map(|k| self.topic(k))
        .collect()
    }

    /// Map an incoming topic back to its key.
    pub fn classify(&self, topic: &str) -> Option<BackendKey> {
        let rest = topic.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        [
            BackendKey::ServerTime,
            BackendKey::ServerOffset,
            BackendKey::Heartbeat,
            BackendKey::Sensors,
            BackendKey::Status,
            BackendKey::Action,
        ]
        .into_iter()
        .find(|k| k.suffix() == rest)
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Latest sensor push. A field that is missing or not a number is `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SensorMsg {
    pub temperature: Option<f64>,
    pub moisture: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusMsg {
    pub running: bool,
    pub last_command_source: Option<String>,
}

/// Unparseable payloads decode as an empty object rather than failing.
fn decode_object(payload: &[u8]) -> Value {
    serde_json::from_slice::<Value>(payload).unwrap_or(Value::Null)
}

fn finite(v: &Value) -> Option<f64> {
    v.as_f64().filter(|f| f.is_finite())
}

pub fn decode_sensors(payload: &[u8]) -> SensorMsg {
    let v = decode_object(payload);
    SensorMsg {
        temperature: finite(&v["temperature"]),
        moisture: finite(&v["moisture"]),
    }
}

pub fn decode_status(payload: &[u8]) -> StatusMsg {
    let v = decode_object(payload);
    let source = match &v["lastCommandSource"] {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_uppercase()),
        Value::Null => None,
        Value::String(_) => None,
        other => Some(other.to_string().to_uppercase()),
    };
    StatusMsg {
        running: v["running"].as_bool().unwrap_or(false),
        last_command_source: source,
    }
}

// ---------------------------------------------------------------------------
// Command write path
// ---------------------------------------------------------------------------

/// Writes the command key. Fire-and-forget: success means the write was
/// accepted, not that the machine acted on it.
pub trait CommandWriter: Send + Sync {
    fn write_action(&self, action: &str) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Clone)]
pub struct MqttWriter {
    client: AsyncClient,
    topic: String,
}

impl MqttWriter {
    pub fn new(client: AsyncClient, topics: &Topics) -> Self {
        Self {
            client,
            topic: topics.topic(BackendKey::Action),
        }
    }
}

impl CommandWriter for MqttWriter {
    async fn write_action(&self, action: &str) -> Result<()> {
        // Retained, so a machine that reconnects still sees a pending action
        // until it is cleared.
        self.client
            .publish(&self.topic, QoS::AtLeastOnce, true, action.as_bytes().to_vec())
            .await
            .with_context(|| format!("failed to publish '{action}' to {}", self.topic))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
