mod device;
mod sim;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::env;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use device::{Device, Reaction};
use sim::{Climate, ClimateSim, Scenario};

/// Payload of the `sensors` key.
#[derive(Debug, Serialize)]
struct SensorMsg {
    temperature: f64,
    moisture: f64,
}

impl From<Climate> for SensorMsg {
    fn from(c: Climate) -> Self {
        Self {
            temperature: c.temperature,
            moisture: c.humidity,
        }
    }
}

struct Topics {
    server_time: String,
    heartbeat: String,
    sensors: String,
    status: String,
    action: String,
}

impl Topics {
    fn new(prefix: &str) -> Self {
        let prefix = prefix.trim().trim_end_matches('/');
        Self {
            server_time: format!("{prefix}/info/serverTime"),
            heartbeat: format!("{prefix}/status/lastSeen"),
            sensors: format!("{prefix}/sensors"),
            status: format!("{prefix}/status"),
            action: format!("{prefix}/controls/action"),
        }
    }
}

fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env_or("MQTT_PORT", 1883);
    let prefix = env::var("TOPIC_PREFIX").unwrap_or_else(|_| "greenheat".to_string());
    let beat_ms: u64 = env_or("BEAT_MS", 5_000);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());

    let topics = Topics::new(&prefix);

    let mut mqttoptions = MqttOptions::new("greenheat-machine", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    // The event loop only forwards actions; the device itself is owned by
    // the publish loop below.
    let (action_tx, mut action_rx) = mpsc::channel::<String>(8);
    let sub_client = client.clone();
    let action_topic = topics.action.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("machine connected to mqtt");
                    if let Err(e) = sub_client.subscribe(&action_topic, QoS::AtLeastOnce).await {
                        warn!("subscribe failed: {e}");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) if p.topic == action_topic => {
                    let action = String::from_utf8_lossy(&p.payload).into_owned();
                    if action_tx.send(action).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    info!(%scenario, beat_ms, prefix = %prefix, "machine simulator started");

    let mut device = Device::new();
    let mut climate = ClimateSim::new(scenario);
    let mut beat = tokio::time::interval(Duration::from_millis(beat_ms));

    loop {
        tokio::select! {
            _ = beat.tick() => {
                let now = Instant::now();
                if device.is_muted(now) {
                    debug!("heartbeat muted");
                } else if fastrand::f64() < scenario.beat_drop_prob() {
                    debug!("heartbeat dropped");
                } else {
                    publish_beat(&client, &topics).await?;
                }

                if scenario.publishes_data() {
                    climate.set_heating(device.running());
                    let msg = SensorMsg::from(climate.sample());
                    publish_json(&client, &topics.sensors, &msg).await?;
                    publish_json(&client, &topics.status, &device.status()).await?;
                }
            }
            Some(action) = action_rx.recv() => {
                match device.handle_action(&action, Instant::now()) {
                    Reaction::Ignored => {
                        if !action.is_empty() {
                            warn!(action = %action, "unknown action");
                        }
                    }
                    Reaction::StatusChanged => {
                        info!(action = %action, running = device.running(), "command applied");
                        if scenario.publishes_data() {
                            publish_json(&client, &topics.status, &device.status()).await?;
                        }
                    }
                    Reaction::Muted(period) => {
                        info!(action = %action, muted_ms = period.as_millis() as u64, "heartbeats muted");
                    }
                }
            }
        }
    }
}

/// Publish the heartbeat along with the backend's notion of "now". Neither
/// is retained: a stored copy would outlive the machine.
async fn publish_beat(client: &AsyncClient, topics: &Topics) -> Result<()> {
    let ts = now_millis().to_string();
    client
        .publish(&topics.server_time, QoS::AtMostOnce, false, ts.as_bytes().to_vec())
        .await
        .context("publish server time")?;
    client
        .publish(&topics.heartbeat, QoS::AtLeastOnce, false, ts.as_bytes().to_vec())
        .await
        .context("publish heartbeat")?;
    debug!(ts = %ts, "heartbeat");
    Ok(())
}

async fn publish_json<T: Serialize>(client: &AsyncClient, topic: &str, msg: &T) -> Result<()> {
    let payload = serde_json::to_vec(msg).context("serialize payload")?;
    client
        .publish(topic, QoS::AtLeastOnce, true, payload)
        .await
        .with_context(|| format!("publish {topic}"))
}

// ===========================================================================
// Tests
// ===========================================================================
