//! Watchdog task: owns the [`Watchdog`] and serialises every event that can
//! touch it through a single `select!` loop. Inputs are backend signals,
//! per-client visibility reports, the periodic tick and the one-shot startup
//! grace deadline.
//!
//! ## Ticker state machine
//!
//! ```text
//!          a client visible, or no live leases (no-op if already running)
//!  Paused ─────────────────────────────────────▶ Running
//!    ▲                                             │
//!    └──────── every leased client hidden ─────────┘
//! ```
//!
//! Each report is a lease of [`VIEWER_LEASE`]; a tab that stops reporting
//! stops counting once its lease runs out.
//!
//! Signal-triggered evaluations (heartbeat, connectivity loss) run inside
//! the same dispatch as the signal; the tick only backstops silence. While
//! paused no tick-based evaluation happens and the verdict may go stale.

use std::collections::HashMap;
use std::future;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::publisher::Transition;
use crate::state::SharedState;
use crate::watchdog::Watchdog;

/// Capacity of the event channel feeding the watchdog task.
const EVENT_QUEUE: usize = 64;

/// How long one visibility report counts for without being renewed.
const VIEWER_LEASE: Duration = Duration::from_secs(15);

/// How often expired leases are swept.
const VIEWER_SWEEP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogEvent {
    /// Authoritative server time, ms.
    ServerTime(i64),
    /// Server minus local time, ms.
    ServerOffset(i64),
    /// Device heartbeat, ms on the server clock.
    Heartbeat(i64),
    /// Any sensor or status push.
    DataEvent,
    /// Our link to the backend went up or down.
    Connectivity(bool),
    /// A dashboard tab reported itself visible or hidden.
    Visibility { client: u64, visible: bool },
    Shutdown,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cheap, cloneable access to a running watchdog task.
#[derive(Clone)]
pub struct WatchdogHandle {
    tx: mpsc::Sender<WatchdogEvent>,
    verdict: watch::Receiver<bool>,
}

impl WatchdogHandle {
    pub async fn send(&self, event: WatchdogEvent) {
        if self.tx.send(event).await.is_err() {
            debug!(?event, "watchdog task gone, event dropped");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.verdict.borrow()
    }

    /// Receiver notified on every online/offline change.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.verdict.clone()
    }

    /// A handle wired to a bare channel instead of a task.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::Receiver<WatchdogEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let (_vtx, verdict) = watch::channel(false);
        (Self { tx, verdict }, rx)
    }
}

// ---------------------------------------------------------------------------
// Ticker
// ---------------------------------------------------------------------------

enum Ticker {
    Running(Interval),
    Paused,
}

impl Ticker {
    /// Start ticking. Returns false if already running, in which case the
    /// existing schedule is kept.
    fn start(&mut self, period: Duration) -> bool {
        if matches!(self, Ticker::Running(_)) {
            return false;
        }
        // First tick one period from now, like a browser interval.
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        *self = Ticker::Running(interval);
        true
    }

    /// Returns false if already paused.
    fn pause(&mut self) -> bool {
        if matches!(self, Ticker::Paused) {
            return false;
        }
        *self = Ticker::Paused;
        true
    }

    fn is_running(&self) -> bool {
        matches!(self, Ticker::Running(_))
    }

    /// Start or pause to match `run`. Returns true if the state changed.
    fn set(&mut self, run: bool, period: Duration) -> bool {
        if run {
            self.start(period)
        } else {
            self.pause()
        }
    }

    async fn tick(&mut self) {
        match self {
            Ticker::Running(interval) => {
                interval.tick().await;
            }
            Ticker::Paused => future::pending::<()>().await,
        }
    }
}

// ---------------------------------------------------------------------------
// Viewers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Lease {
    visible: bool,
    expires: Instant,
}

/// Last visibility report per dashboard client.
#[derive(Debug, Default)]
struct Viewers {
    leases: HashMap<u64, Lease>,
}

impl Viewers {
    fn report(&mut self, client: u64, visible: bool, now: Instant) {
        self.leases.insert(
            client,
            Lease {
                visible,
                expires: now + VIEWER_LEASE,
            },
        );
    }

    /// Drop expired leases. Returns true if any were dropped.
    fn prune(&mut self, now: Instant) -> bool {
        let before = self.leases.len();
        self.leases.retain(|_, lease| lease.expires > now);
        self.leases.len() != before
    }

    fn visible(&self) -> usize {
        self.leases.values().filter(|l| l.visible).count()
    }

    /// Tick while any client is visible. With no live leases nobody has
    /// asked for a pause, so keep ticking.
    fn wants_ticks(&self) -> bool {
        self.leases.is_empty() || self.visible() > 0
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Spawn the watchdog task. No client has reported yet, so the ticker
/// starts running.
pub fn spawn(watchdog: Watchdog, shared: SharedState) -> (WatchdogHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE);
    let handle = WatchdogHandle {
        tx,
        verdict: watchdog.subscribe(),
    };
    let task = tokio::spawn(run(watchdog, rx, shared));
    (handle, task)
}

/// Run the watchdog loop until `Shutdown` arrives or every sender is gone.
pub async fn run(
    mut watchdog: Watchdog,
    mut rx: mpsc::Receiver<WatchdogEvent>,
    shared: SharedState,
) {
    let cfg = *watchdog.config();
    let period = Duration::from_millis(cfg.tick_interval_ms);

    let mut ticker = Ticker::Paused;
    ticker.start(period);
    let mut viewers = Viewers::default();
    let mut sweep = tokio::time::interval(VIEWER_SWEEP);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let grace = tokio::time::sleep(Duration::from_millis(cfg.startup_grace_ms));
    tokio::pin!(grace);
    let mut grace_pending = true;

    {
        let mut st = shared.write().await;
        watchdog.apply_initial(&mut *st);
        st.ticker_running = true;
        st.record_system("watchdog started".to_string());
    }

    info!(
        fresh_ms = cfg.fresh_ms,
        quiet_ms = cfg.quiet_ms,
        startup_grace_ms = cfg.startup_grace_ms,
        tick_interval_ms = cfg.tick_interval_ms,
        "watchdog started"
    );

    loop {
        let transition = tokio::select! {
            event = rx.recv() => match event {
                None | Some(WatchdogEvent::Shutdown) => break,
                Some(WatchdogEvent::Visibility { client, visible }) => {
                    let now = Instant::now();
                    viewers.prune(now);
                    viewers.report(client, visible, now);
                    sync_ticker(&mut ticker, &viewers, period, &shared).await;
                    continue;
                }
                Some(event) => handle_event(&mut watchdog, event),
            },
            _ = sweep.tick() => {
                if viewers.prune(Instant::now()) {
                    debug!(clients = viewers.leases.len(), "viewer leases expired");
                    sync_ticker(&mut ticker, &viewers, period, &shared).await;
                }
                continue;
            }
            () = ticker.tick() => watchdog.tick(),
            () = &mut grace, if grace_pending => {
                grace_pending = false;
                watchdog.startup_grace_elapsed()
            }
        };

        render(&watchdog, transition, &shared).await;
    }

    shared.write().await.ticker_running = false;
    info!("watchdog stopped");
}

pub(crate) fn handle_event(watchdog: &mut Watchdog, event: WatchdogEvent) -> Option<Transition> {
    match event {
        WatchdogEvent::ServerTime(ms) => {
            watchdog.on_server_time(ms);
            None
        }
        WatchdogEvent::ServerOffset(ms) => {
            watchdog.on_server_offset(ms);
            None
        }
        WatchdogEvent::Heartbeat(ms) => watchdog.on_heartbeat(ms),
        WatchdogEvent::DataEvent => {
            watchdog.on_any_data_event();
            None
        }
        WatchdogEvent::Connectivity(connected) => watchdog.on_connectivity_change(connected),
        WatchdogEvent::Visibility { .. } | WatchdogEvent::Shutdown => {
            warn!(?event, "unexpected watchdog event");
            None
        }
    }
}

async fn sync_ticker(ticker: &mut Ticker, viewers: &Viewers, period: Duration, shared: &SharedState) {
    let run = viewers.wants_ticks();
    if ticker.set(run, period) {
        info!(
            visible_clients = viewers.visible(),
            "watchdog ticker {}",
            if run { "resumed" } else { "paused" }
        );
    }
    shared.write().await.ticker_running = ticker.is_running();
}

/// Push the outcome of one dispatch into the view model.
async fn render(watchdog: &Watchdog, transition: Option<Transition>, shared: &SharedState) {
    let mut st = shared.write().await;
    if let Some(t) = transition {
        t.apply(&mut *st);
    }
    st.verdict = watchdog.verdict();
    st.signals = *watchdog.signals();
    st.liveness = Some(watchdog.assess());
    st.evaluations = watchdog.evaluations();
}

// ===========================================================================
// Tests
// ===========================================================================
