//! Remote commands: fire-and-forget writes of an action string to the
//! backend, gated on the liveness verdict.
//!
//! A written action is cleared back to `""` after `clear_delay`. The clear
//! is owned by a [`ClearGuard`] armed as soon as the action write succeeds,
//! so it still happens if anything after that point returns early or
//! panics. The controls are locked for the duration of a dispatch; a
//! [`ReleaseGuard`] unlocks them if the dispatch is dropped mid-write.

use std::str::FromStr;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::backend::CommandWriter;
use crate::publisher::{ControlSurface, Notification, NotificationKind};
use crate::state::{DashboardState, SharedState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Reboot,
    WifiReset,
}

impl Command {
    pub fn action(self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Reboot => "reboot",
            Command::WifiReset => "wifi_reset",
        }
    }

    fn sent_message(self) -> &'static str {
        match self {
            Command::Start => "System will start",
            Command::Stop => "System will stop",
            Command::Reboot => "Asking the device to restart",
            Command::WifiReset => "Asking the device to reset Wi-Fi",
        }
    }
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(Command::Start),
            "stop" => Ok(Command::Stop),
            "reboot" => Ok(Command::Reboot),
            "wifi_reset" => Ok(Command::WifiReset),
            _ => Err(CommandError::Unknown(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("device is offline")]
    DeviceOffline,
    #[error("failed to send command: {0:#}")]
    Write(anyhow::Error),
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher<W> {
    writer: W,
    shared: SharedState,
    clear_delay: Duration,
}

impl<W> Dispatcher<W>
where
    W: CommandWriter + Clone + 'static,
{
    pub fn new(writer: W, shared: SharedState, clear_delay: Duration) -> Self {
        Self {
            writer,
            shared,
            clear_delay,
        }
    }

    pub async fn dispatch(&self, command: Command) -> Result<(), CommandError> {
        let action = command.action();

        // Gate and lock under one write so a concurrent offline transition
        // cannot slip in between.
        {
            let mut st = self.shared.write().await;
            if !st.verdict.is_online() {
                warn!(action, "command rejected: device offline");
                st.notify(Notification::new(
                    NotificationKind::Warning,
                    "Device offline",
                    "Cannot send commands while the machine is offline",
                    5_000,
                ));
                return Err(CommandError::DeviceOffline);
            }
            st.lock_controls();
        }

        let release = ReleaseGuard::arm(action, self.shared.clone());
        let written = self.writer.write_action(action).await;
        release.disarm();

        if let Err(e) = written {
            error!(action, "command write failed: {e:#}");
            let mut st = self.shared.write().await;
            release_if_online(&mut st);
            st.record_error(format!("command '{action}' failed: {e:#}"));
            st.notify(Notification::new(
                NotificationKind::Error,
                "Error",
                format!("Failed to send command: {e}"),
                5_000,
            ));
            return Err(CommandError::Write(e));
        }

        let _clear = ClearGuard::arm(
            self.writer.clone(),
            self.shared.clone(),
            self.clear_delay,
        );

        info!(action, "command sent");
        let mut st = self.shared.write().await;
        st.record_command(action);
        st.notify(Notification::new(
            NotificationKind::Info,
            "Command sent",
            command.sent_message(),
            5_000,
        ));
        Ok(())
    }
}

/// Controls unlock only while the machine is online; otherwise the
/// watchdog's lock stands.
fn release_if_online(st: &mut DashboardState) {
    if st.verdict.is_online() {
        st.unlock_controls();
    }
}

/// Unlocks the controls if dropped while armed, i.e. when the dispatch
/// future is cancelled between locking and the end of the write.
struct ReleaseGuard {
    action: &'static str,
    shared: Option<SharedState>,
}

impl ReleaseGuard {
    fn arm(action: &'static str, shared: SharedState) -> Self {
        Self {
            action,
            shared: Some(shared),
        }
    }

    fn disarm(mut self) {
        self.shared = None;
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        let action = self.action;
        warn!(action, "command dispatch cancelled mid-write");
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            error!(action, "no runtime to release the controls");
            return;
        };
        rt.spawn(async move {
            let mut st = shared.write().await;
            release_if_online(&mut st);
            st.record_error(format!("command '{action}' cancelled before it was sent"));
        });
    }
}

// ---------------------------------------------------------------------------
// Guaranteed clear
// ---------------------------------------------------------------------------

/// Clears the action key when dropped: waits `delay`, writes `""`, then
/// releases the controls.
pub struct ClearGuard<W>
where
    W: CommandWriter + Clone + 'static,
{
    writer: Option<W>,
    shared: SharedState,
    delay: Duration,
}

impl<W> ClearGuard<W>
where
    W: CommandWriter + Clone + 'static,
{
    pub fn arm(writer: W, shared: SharedState, delay: Duration) -> Self {
        Self {
            writer: Some(writer),
            shared,
            delay,
        }
    }
}

impl<W> Drop for ClearGuard<W>
where
    W: CommandWriter + Clone + 'static,
{
    fn drop(&mut self) {
        let Some(writer) = self.writer.take() else {
            return;
        };
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            error!("no runtime to clear the command key; action left set");
            return;
        };
        let shared = self.shared.clone();
        let delay = self.delay;
        rt.spawn(async move {
            tokio::time::sleep(delay).await;
            let result = writer.write_action("").await;
            let mut st = shared.write().await;
            release_if_online(&mut st);
            if let Err(e) = result {
                error!("failed to clear command key: {e:#}");
                st.record_error(format!("failed to clear command: {e:#}"));
            }
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
