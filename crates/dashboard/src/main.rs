mod backend;
mod clock;
mod commands;
mod config;
mod liveness;
mod publisher;
mod scheduler;
mod signals;
mod state;
mod watchdog;
mod web;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use backend::{decode_sensors, decode_status, BackendKey, MqttWriter, Topics};
use clock::SystemClock;
use commands::Dispatcher;
use scheduler::{WatchdogEvent, WatchdogHandle};
use signals::coerce_millis;
use state::{DashboardState, SharedState};
use watchdog::Watchdog;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "dashboard.toml".to_string());
    let cfg = config::resolve(&config_path)?;
    let topics = Topics::new(&cfg.mqtt.topic_prefix);

    // ── Shared state + watchdog ─────────────────────────────────────
    let shared = DashboardState::shared();
    shared
        .write()
        .await
        .record_system("dashboard started".to_string());

    let wd = Watchdog::new(cfg.watchdog, Arc::new(SystemClock));
    let (handle, watchdog_task) = scheduler::spawn(wd, Arc::clone(&shared));
    tokio::spawn(log_outages(handle.subscribe()));

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(&cfg.mqtt.client_id, &cfg.mqtt.host, cfg.mqtt.port);
    mqttoptions.set_keep_alive(Duration::from_secs(cfg.mqtt.keep_alive_sec));
    let (client, eventloop) = AsyncClient::new(mqttoptions, 20);

    // ── Web server ──────────────────────────────────────────────────
    let dispatcher = Dispatcher::new(
        MqttWriter::new(client.clone(), &topics),
        Arc::clone(&shared),
        Duration::from_millis(cfg.commands.clear_delay_ms),
    );
    let app = web::AppState {
        shared: Arc::clone(&shared),
        watchdog: handle.clone(),
        dispatcher: Arc::new(dispatcher),
    };
    let web_port = cfg.web.port;
    tokio::spawn(async move {
        if let Err(e) = web::serve(app, web_port).await {
            error!("{e:#}");
        }
    });

    info!(
        host = %cfg.mqtt.host,
        port = cfg.mqtt.port,
        prefix = %cfg.mqtt.topic_prefix,
        "connecting to backend"
    );

    let result = tokio::select! {
        r = run_backend(client, eventloop, &topics, &handle, &shared) => r,
        r = tokio::signal::ctrl_c() => {
            info!("shutting down");
            r.context("failed to listen for ctrl-c")
        }
    };

    handle.send(WatchdogEvent::Shutdown).await;
    drop(handle);
    if let Err(e) = watchdog_task.await {
        warn!("watchdog task ended abnormally: {e}");
    }
    result
}

/// Drive the MQTT event loop, turning backend traffic into watchdog events
/// and view-model updates. Only returns on a subscribe failure.
async fn run_backend(
    client: AsyncClient,
    mut eventloop: EventLoop,
    topics: &Topics,
    watchdog: &WatchdogHandle,
    shared: &SharedState,
) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let Some(key) = topics.classify(&p.topic) else {
                    debug!(topic = %p.topic, "unhandled topic");
                    continue;
                };
                handle_publish(key, &p.payload, p.retain, watchdog, shared).await;
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // Subscriptions are re-issued on every (re)connect.
                for topic in topics.subscriptions() {
                    client
                        .subscribe(&topic, QoS::AtLeastOnce)
                        .await
                        .with_context(|| format!("failed to subscribe to {topic}"))?;
                }
                {
                    let mut st = shared.write().await;
                    st.mqtt_connected = true;
                    st.record_system("mqtt connected".to_string());
                }
                watchdog.send(WatchdogEvent::Connectivity(true)).await;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                {
                    let mut st = shared.write().await;
                    st.mqtt_connected = false;
                    st.record_system("mqtt disconnected".to_string());
                }
                watchdog.send(WatchdogEvent::Connectivity(false)).await;
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                {
                    let mut st = shared.write().await;
                    st.mqtt_connected = false;
                    st.record_error(format!("mqtt error: {e}"));
                }
                watchdog.send(WatchdogEvent::Connectivity(false)).await;

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// Log how long each outage lasted once the machine is reachable again.
async fn log_outages(mut verdict: watch::Receiver<bool>) {
    let mut down_since: Option<Instant> = None;
    while verdict.changed().await.is_ok() {
        let online = *verdict.borrow_and_update();
        match (online, down_since) {
            (false, None) => down_since = Some(Instant::now()),
            (true, Some(since)) => {
                info!(outage_secs = since.elapsed().as_secs(), "machine reachable again");
                down_since = None;
            }
            _ => {}
        }
    }
}

/// The watchdog event a backend push carries, if any.
///
/// Retained pushes are the broker's stored copies, replayed on every
/// (re)subscribe. They say nothing about whether the machine is alive now,
/// so only the offset, which is a clock fact, is taken from them.
fn watchdog_event(key: BackendKey, payload: &[u8], retained: bool) -> Option<WatchdogEvent> {
    match key {
        BackendKey::ServerOffset => Some(WatchdogEvent::ServerOffset(coerce_millis(payload))),
        // Our own retained write echoing back; not a signal.
        BackendKey::Action => None,
        _ if retained => None,
        BackendKey::ServerTime => Some(WatchdogEvent::ServerTime(coerce_millis(payload))),
        BackendKey::Heartbeat => Some(WatchdogEvent::Heartbeat(coerce_millis(payload))),
        BackendKey::Sensors | BackendKey::Status => Some(WatchdogEvent::DataEvent),
    }
}

/// Update the view model, then forward whatever liveness signal the push
/// carries. Retained sensor and status values still fill the view.
async fn handle_publish(
    key: BackendKey,
    payload: &[u8],
    retained: bool,
    watchdog: &WatchdogHandle,
    shared: &SharedState,
) {
    match key {
        BackendKey::Sensors => {
            let msg = decode_sensors(payload);
            debug!(?msg, retained, "sensors");
            shared.write().await.record_sensors(msg);
        }
        BackendKey::Status => {
            let msg = decode_status(payload);
            debug!(?msg, retained, "status");
            shared.write().await.record_status(msg);
        }
        BackendKey::Heartbeat => debug!(ts = coerce_millis(payload), retained, "heartbeat"),
        _ => {}
    }

    match watchdog_event(key, payload, retained) {
        Some(event) => watchdog.send(event).await,
        None if retained => debug!(?key, "retained replay, not a liveness signal"),
        None => {}
    }
}

// ===========================================================================
// Tests
// ===========================================================================
