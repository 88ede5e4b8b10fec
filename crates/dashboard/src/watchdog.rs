//! The liveness watchdog context: clock correction, signal ingest,
//! evaluation and publication owned by a single value.
//!
//! Every entry point is synchronous and runs to completion. Entry points
//! that may change the verdict return the [`Transition`] the caller must
//! render; `None` means nothing to do.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::{Clock, ClockCorrector};
use crate::config::WatchdogConfig;
use crate::liveness::{self, Assessment};
use crate::publisher::{ControlSurface, StatePublisher, Transition, Verdict};
use crate::signals::Signals;

pub struct Watchdog {
    config: WatchdogConfig,
    clock: Arc<dyn Clock>,
    corrector: ClockCorrector,
    signals: Signals,
    publisher: StatePublisher,
    started_at_ms: i64,
    evaluations: u64,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig, clock: Arc<dyn Clock>) -> Self {
        let started_at_ms = clock.now_ms();
        Self {
            config,
            clock,
            corrector: ClockCorrector::default(),
            signals: Signals::default(),
            publisher: StatePublisher::new(),
            started_at_ms,
            evaluations: 0,
        }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    pub fn verdict(&self) -> Verdict {
        self.publisher.verdict()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.publisher.subscribe()
    }

    pub fn apply_initial(&self, surface: &mut impl ControlSurface) {
        self.publisher.apply_initial(surface);
    }

    pub fn signals(&self) -> &Signals {
        &self.signals
    }

    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    pub fn server_now(&self) -> i64 {
        self.corrector.server_now(self.clock.now_ms())
    }

    // -- Clock correction ---------------------------------------------------

    pub fn on_server_offset(&mut self, offset_ms: i64) {
        self.corrector.set_offset(offset_ms);
        debug!(offset_ms, "server clock offset updated");
    }

    /// Authoritative server time pushed by the backend.
    pub fn on_server_time(&mut self, server_ms: i64) {
        self.corrector
            .observe_server_time(server_ms, self.clock.now_ms());
        debug!(
            server_ms,
            offset_ms = self.corrector.offset_ms(),
            "server clock offset updated"
        );
    }

    // -- Signal ingest ------------------------------------------------------

    /// A fresh heartbeat can bring the UI online, so it is evaluated right
    /// away instead of waiting for the next tick.
    pub fn on_heartbeat(&mut self, server_ts: i64) -> Option<Transition> {
        self.signals.record_heartbeat(server_ts);
        debug!(
            heartbeat_ms = self.signals.heartbeat_ms,
            age_ms = self.server_now().saturating_sub(self.signals.heartbeat_ms),
            "heartbeat"
        );
        self.evaluate_and_publish()
    }

    /// Sensor or status push. Only stamps the arrival time.
    pub fn on_any_data_event(&mut self) {
        self.signals.record_data_event(self.clock.now_ms());
    }

    /// Losing connectivity forces offline immediately, whatever the other
    /// signals say. Regaining it waits for corroboration.
    pub fn on_connectivity_change(&mut self, connected: bool) -> Option<Transition> {
        if self.signals.record_connectivity(connected) {
            warn!("backend connectivity lost, forcing offline");
            return self.force_offline();
        }
        debug!("backend connectivity restored");
        None
    }

    // -- Scheduled evaluation -----------------------------------------------

    /// Periodic re-evaluation; catches silence, where no event arrives at all.
    pub fn tick(&mut self) -> Option<Transition> {
        self.evaluate_and_publish()
    }

    /// Called once when the startup grace period has elapsed.
    pub fn startup_grace_elapsed(&mut self) -> Option<Transition> {
        if !self.signals.heartbeat_seen() {
            info!(
                grace_ms = self.config.startup_grace_ms,
                "no heartbeat during startup grace, forcing offline"
            );
            return self.force_offline();
        }
        // Grace is over by definition here; no hold applies.
        let online = self.assess().online();
        self.evaluations += 1;
        self.commit(online)
    }

    pub fn assess(&self) -> Assessment {
        let local_now = self.clock.now_ms();
        liveness::evaluate(
            &self.signals,
            &self.config,
            self.corrector.server_now(local_now),
            local_now,
        )
    }

    fn in_startup_grace(&self) -> bool {
        let elapsed = self.clock.now_ms().saturating_sub(self.started_at_ms);
        elapsed < i64::try_from(self.config.startup_grace_ms).unwrap_or(i64::MAX)
    }

    fn evaluate_and_publish(&mut self) -> Option<Transition> {
        let assessment = self.assess();
        self.evaluations += 1;
        debug!(
            beat_fresh = assessment.beat_fresh,
            stream_fresh = assessment.stream_fresh,
            client_ok = assessment.client_ok,
            beat_age_ms = ?assessment.beat_age_ms,
            stream_age_ms = ?assessment.stream_age_ms,
            "liveness evaluated"
        );

        let online = assessment.online();
        // Before the grace period is over a negative result stays Pending:
        // the UI is already locked and nothing has been proven either way.
        if !online && self.publisher.verdict() == Verdict::Pending && self.in_startup_grace() {
            return None;
        }
        self.commit(online)
    }

    fn force_offline(&mut self) -> Option<Transition> {
        self.commit(false)
    }

    fn commit(&mut self, online: bool) -> Option<Transition> {
        let transition = self.publisher.publish(online)?;
        if online {
            info!(from = ?transition.from, "machine online");
        } else {
            warn!(from = ?transition.from, "machine offline");
        }
        Some(transition)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
