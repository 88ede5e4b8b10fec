//! Edge-triggered publication of the liveness verdict.
//!
//! ```text
//!            publish(true)
//!  Pending ───────────────▶ Online ◀──┐
//!     │                       │       │ publish(true)
//!     │ publish(false)        │ publish(false)
//!     ▼                       ▼       │
//!  Offline ◀──────────────────┘ ──────┘
//! ```
//!
//! `Pending` is the startup state. It gates exactly like `Offline` but has
//! not announced anything yet. Re-publishing the current verdict is a no-op,
//! so UI side effects fire once per transition no matter how many paths
//! (heartbeat, tick, connectivity) reach the same conclusion.

use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pending,
    Online,
    Offline,
}

impl Verdict {
    pub fn is_online(self) -> bool {
        self == Verdict::Online
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Success,
    Info,
    Warning,
    Error,
}

/// A short-lived toast shown by the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub ttl_ms: u64,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
        ttl_ms: u64,
    ) -> Self {
        Self {
            kind,
            title: title.into(),
            message: message.into(),
            ttl_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// UI collaborator
// ---------------------------------------------------------------------------

/// Whatever renders the dashboard. The publisher only ever talks to it
/// through these calls.
pub trait ControlSurface {
    fn lock_controls(&mut self);
    fn unlock_controls(&mut self);
    fn show_offline_notice(&mut self, show: bool);
    fn notify(&mut self, notification: Notification);
}

/// A verdict change that has already been committed by the publisher and
/// still has to be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Verdict,
    pub to: Verdict,
}

impl Transition {
    pub fn apply(&self, surface: &mut impl ControlSurface) {
        if self.to.is_online() {
            surface.unlock_controls();
            surface.show_offline_notice(false);
            surface.notify(Notification::new(
                NotificationKind::Success,
                "Device online",
                "Connection to the machine restored",
                1_500,
            ));
        } else {
            surface.lock_controls();
            surface.show_offline_notice(true);
            surface.notify(Notification::new(
                NotificationKind::Warning,
                "Device offline",
                "Check the machine's internet connection",
                2_500,
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

pub struct StatePublisher {
    verdict: Verdict,
    tx: watch::Sender<bool>,
}

impl StatePublisher {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            verdict: Verdict::Pending,
            tx,
        }
    }

    /// Render the locked startup default. No notification: nothing has
    /// been decided yet.
    pub fn apply_initial(&self, surface: &mut impl ControlSurface) {
        surface.lock_controls();
        surface.show_offline_notice(true);
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    /// Receiver that observes every online/offline change.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Commit `online` as the current verdict. Returns the transition to
    /// render, or `None` when nothing changed.
    pub fn publish(&mut self, online: bool) -> Option<Transition> {
        let to = if online {
            Verdict::Online
        } else {
            Verdict::Offline
        };
        if to == self.verdict {
            return None;
        }
        let from = std::mem::replace(&mut self.verdict, to);
        // Subscribers only see the boolean; Pending -> Offline is not a
        // change for them.
        self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
        Some(Transition { from, to })
    }
}

impl Default for StatePublisher {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Test surface
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) use recording::{Call, RecordingSurface};


// ===========================================================================
// Tests
// ===========================================================================
