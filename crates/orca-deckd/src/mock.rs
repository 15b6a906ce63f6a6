//! Recording collaborators for testing.
//!
//! These doubles stand in for the keypad link and the OS automation layer so
//! the lock controller and daemon can be exercised without hardware or a
//! desktop session.
//!
//! # Example
//!
//! ```
//! use orca_deckd::mock::{Recorder, RecordingSink};
//! use orca_deck_core::{CommandSink, OutboundCommand};
//!
//! let sink = RecordingSink::connected();
//! sink.send(&OutboundCommand::AuthOk).unwrap();
//! assert_eq!(sink.sent(), vec![OutboundCommand::AuthOk]);
//!
//! let recorder = Recorder::new();
//! assert!(recorder.actions().is_empty());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use orca_deck_core::protocol::OutboundCommand;
use orca_deck_core::traits::{
    AutomationError, Clipboard, CommandSink, IdleProbe, KeyPress, KeystrokeAutomation,
    StatusChange, StatusSink, TargetLauncher, TransportError,
};

/// One observed collaborator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Launch(String),
    Type(String),
    Press(KeyPress),
    Copy(String),
}

/// Records automation calls and status reports.
///
/// Clones share the same log.
#[derive(Clone, Default)]
pub struct Recorder {
    actions: Arc<Mutex<Vec<Action>>>,
    statuses: Arc<Mutex<Vec<StatusChange>>>,
    fail_launches: Arc<AtomicBool>,
    unsupported_launches: Arc<AtomicBool>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every launch fail.
    pub fn failing_launches(self) -> Self {
        self.fail_launches.store(true, Ordering::SeqCst);
        self
    }

    /// Answer every launch the way a launcher answers a free-text target.
    pub fn set_launches_unsupported(&self, unsupported: bool) {
        self.unsupported_launches.store(unsupported, Ordering::SeqCst);
    }

    pub fn actions(&self) -> Vec<Action> {
        self.actions.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn statuses(&self) -> Vec<StatusChange> {
        self.statuses.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn push(&self, action: Action) {
        self.actions.lock().unwrap_or_else(PoisonError::into_inner).push(action);
    }
}

impl TargetLauncher for Recorder {
    fn launch_target(&self, target: &str) -> Result<(), AutomationError> {
        self.push(Action::Launch(target.to_string()));
        if self.fail_launches.load(Ordering::SeqCst) {
            return Err(AutomationError::Failed("launch refused".to_string()));
        }
        if self.unsupported_launches.load(Ordering::SeqCst) {
            return Err(AutomationError::Unsupported(format!("'{}' is not a path or URL", target)));
        }
        Ok(())
    }
}

impl KeystrokeAutomation for Recorder {
    fn type_text(&self, text: &str) -> Result<(), AutomationError> {
        self.push(Action::Type(text.to_string()));
        Ok(())
    }

    fn press_key(&self, key: KeyPress) -> Result<(), AutomationError> {
        self.push(Action::Press(key));
        Ok(())
    }
}

impl Clipboard for Recorder {
    fn copy_to_clipboard(&self, text: &str) -> Result<(), AutomationError> {
        self.push(Action::Copy(text.to_string()));
        Ok(())
    }
}

impl StatusSink for Recorder {
    fn report_status(&self, status: &StatusChange) {
        self.statuses.lock().unwrap_or_else(PoisonError::into_inner).push(status.clone());
    }
}

/// A command sink that records what would have gone over the wire.
#[derive(Clone, Default)]
pub struct RecordingSink {
    sent: Arc<Mutex<Vec<OutboundCommand>>>,
    ports: Arc<Mutex<Vec<String>>>,
    connected: Arc<AtomicBool>,
}

impl RecordingSink {
    /// A sink that accepts commands.
    pub fn connected() -> Self {
        let sink = Self::default();
        sink.set_connected(true);
        sink
    }

    /// A sink that rejects every command with `NotConnected`.
    pub fn disconnected() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutboundCommand> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Ports requested through `switch_port`.
    pub fn ports(&self) -> Vec<String> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl CommandSink for RecordingSink {
    fn send(&self, command: &OutboundCommand) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).push(command.clone());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn switch_port(&self, port: &str) {
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(port.to_string());
    }
}

/// An idle probe whose answer the test controls.
#[derive(Clone, Default)]
pub struct FixedIdleProbe {
    idle: Arc<Mutex<Option<Duration>>>,
}

impl FixedIdleProbe {
    pub fn new(idle: Option<Duration>) -> Self {
        Self {
            idle: Arc::new(Mutex::new(idle)),
        }
    }

    pub fn set(&self, idle: Option<Duration>) {
        *self.idle.lock().unwrap_or_else(PoisonError::into_inner) = idle;
    }
}

impl IdleProbe for FixedIdleProbe {
    fn idle_duration(&self) -> Option<Duration> {
        *self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
