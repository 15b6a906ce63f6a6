//! Lock/unlock state machine.
//!
//! The [`LockController`] is owned by the daemon loop and is the only place
//! that touches the master key, the decrypted vault and the lock phase. It
//! consumes transport events, periodic ticks and control requests, and drives
//! the keypad and the OS automation collaborators in response.
//!
//! # Phases
//!
//! ```text
//! Uninitialized --submit_setup--> SetupPendingBadge --first badge--> Unlocked
//! Locked --authorized badge | recovery answers--> Unlocked
//! Unlocked --idle timeout | lock request--> Locked
//! ```
//!
//! Entering `Locked` always clears the master key and drops the vault.

use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use orca_deck_core::config::{Config, IdleSource};
use orca_deck_core::control::{ActivityEntry, ErrorCode, Request, Response, StatusReport};
use orca_deck_core::crypto::{CryptoError, VaultCrypto};
use orca_deck_core::icon::{IconError, IconPayload};
use orca_deck_core::protocol::{InboundCommand, OutboundCommand};
use orca_deck_core::recovery::{self, RecoveryError, RecoveryManager, QUESTIONS};
use orca_deck_core::store::{CredentialStore, DataDir, KeyRegistry, StoreError};
use orca_deck_core::traits::{
    AutomationError, Clipboard, CommandSink, IdleProbe, KeyPress, KeystrokeAutomation,
    StatusChange, StatusSink, TargetLauncher, TransportError,
};
use orca_deck_core::types::{
    BadgeUid, CredentialRecord, IdentifierError, KeySlot, LockPhase, SlotKind,
};
use secrecy::ExposeSecret;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::serial::TransportEvent;

/// Number of activity entries kept for status queries.
pub const ACTIVITY_LOG_CAPACITY: usize = 50;

/// Errors returned to control clients.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("system is locked")]
    Locked,

    #[error("{0}")]
    InvalidState(String),

    #[error("recovery failed")]
    Unauthorized,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unlock failed: {0}")]
    UnlockFailed(String),

    #[error(transparent)]
    Identifier(#[from] IdentifierError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Icon(#[from] IconError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ControlError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ControlError::Locked | ControlError::Store(StoreError::Locked) => ErrorCode::Locked,
            ControlError::InvalidState(_)
            | ControlError::Recovery(RecoveryError::AlreadyConfigured) => ErrorCode::InvalidState,
            ControlError::Unauthorized => ErrorCode::Unauthorized,
            ControlError::InvalidRequest(_)
            | ControlError::Identifier(_)
            | ControlError::Icon(_)
            | ControlError::Store(StoreError::Identifier(_))
            | ControlError::Store(StoreError::Invalid(_))
            | ControlError::Recovery(RecoveryError::WrongAnswerCount { .. })
            | ControlError::Recovery(RecoveryError::EmptyAnswer) => ErrorCode::InvalidRequest,
            ControlError::Transport(TransportError::NotConnected) => ErrorCode::NotConnected,
            ControlError::Transport(TransportError::UploadInProgress) => ErrorCode::Busy,
            _ => ErrorCode::InternalError,
        }
    }
}

impl From<ControlError> for Response {
    fn from(err: ControlError) -> Self {
        Response::error(err.code(), err.to_string())
    }
}

/// How an unlock was authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockMethod {
    Badge,
    Recovery,
    Device,
}

impl std::fmt::Display for UnlockMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnlockMethod::Badge => write!(f, "badge"),
            UnlockMethod::Recovery => write!(f, "recovery questions"),
            UnlockMethod::Device => write!(f, "keypad"),
        }
    }
}

/// An icon upload approved by the controller, to be run off the event loop.
#[derive(Debug)]
pub struct IconJob {
    pub kind: SlotKind,
    pub key: KeySlot,
    pub icon: IconPayload,
}

/// Result of a control request.
#[derive(Debug)]
pub enum Reply {
    /// Answer immediately.
    Now(Response),
    /// Run the upload, then answer.
    Upload(IconJob),
}

/// OS-facing collaborators.
pub struct Collaborators {
    pub launcher: Box<dyn TargetLauncher>,
    pub keystrokes: Box<dyn KeystrokeAutomation>,
    pub clipboard: Box<dyn Clipboard>,
    pub status: Box<dyn StatusSink>,
    pub idle: Option<Box<dyn IdleProbe>>,
}

/// Lock policy.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub auto_lock_after: Option<Duration>,
    pub idle_source: IdleSource,
    pub trust_device_unlock: bool,
    pub paste_via_clipboard: bool,
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            auto_lock_after: config.lock.auto_lock_after(),
            idle_source: config.lock.idle_source,
            trust_device_unlock: config.lock.trust_device_unlock,
            paste_via_clipboard: config.automation.paste_via_clipboard,
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// The lock state machine. See the module docs.
pub struct LockController {
    phase: LockPhase,
    connected: bool,
    dir: DataDir,
    crypto: VaultCrypto,
    recovery: RecoveryManager,
    store: CredentialStore,
    registry: KeyRegistry,
    sink: Box<dyn CommandSink>,
    collaborators: Collaborators,
    settings: ControllerSettings,
    last_activity: Instant,
    last_unlock: Option<SystemTime>,
    activity: VecDeque<ActivityEntry>,
}

impl LockController {
    /// Load persisted state from `dir` and pick the initial phase.
    pub fn new(
        dir: DataDir,
        sink: Box<dyn CommandSink>,
        collaborators: Collaborators,
        settings: ControllerSettings,
    ) -> Self {
        if let Err(e) = dir.ensure() {
            warn!(path = %dir.root().display(), error = %e, "Failed to create data directory");
        }
        let recovery = RecoveryManager::load(dir.security_path());
        let store = CredentialStore::load(dir.clone());
        let registry = KeyRegistry::load(dir.uids_path());

        let phase = if !recovery.is_configured() {
            LockPhase::Uninitialized
        } else if registry.is_empty() {
            LockPhase::SetupPendingBadge
        } else {
            LockPhase::Locked
        };
        info!(phase = %phase, data_dir = %dir.root().display(), "Lock controller ready");

        Self {
            phase,
            connected: sink.is_connected(),
            dir,
            crypto: VaultCrypto::new(),
            recovery,
            store,
            registry,
            sink,
            collaborators,
            settings,
            last_activity: Instant::now(),
            last_unlock: None,
            activity: VecDeque::with_capacity(ACTIVITY_LOG_CAPACITY),
        }
    }

    pub fn phase(&self) -> LockPhase {
        self.phase
    }

    pub fn is_unlocked(&self) -> bool {
        self.phase == LockPhase::Unlocked
    }

    /// Handle one event from the serial transport.
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.connected = true;
                self.note("Keypad connected");
            }
            TransportEvent::Disconnected => {
                self.connected = false;
                self.note("Keypad disconnected");
            }
            TransportEvent::Line(command) => {
                self.last_activity = Instant::now();
                self.handle_command(command);
            }
        }
    }

    fn handle_command(&mut self, command: InboundCommand) {
        match command {
            InboundCommand::AppLaunch(key) => self.launch_app(key),
            InboundCommand::PassLaunch(key) => self.type_password(key),
            InboundCommand::RfidRead(uid) => self.badge_scanned(uid),
            InboundCommand::RfidUnlockOk => {
                if self.phase == LockPhase::Locked && self.settings.trust_device_unlock {
                    self.unlock(UnlockMethod::Device);
                } else {
                    debug!(phase = %self.phase, "Ignoring RFID_UNLOCK_OK");
                }
            }
            InboundCommand::RfidUnlockFail => self.record("Keypad rejected a badge"),
            InboundCommand::Status(message) => info!(message = %message, "Keypad status"),
        }
    }

    fn launch_app(&mut self, key: KeySlot) {
        if !self.is_unlocked() {
            self.record(format!("Rejected app launch on {} while locked", key));
            return;
        }

        let Some(target) = self.store.app(key).map(|a| a.target.clone()) else {
            self.record(format!("No app bound to {}", key));
            return;
        };

        let label = self.store.label(SlotKind::App, key);
        match self.collaborators.launcher.launch_target(&target) {
            Ok(()) => self.record(format!("Launched {}", label)),
            Err(AutomationError::Unsupported(reason)) => {
                debug!(key = %key, reason = %reason, "Falling back to OS search");
                match self.search_launch(&target) {
                    Ok(()) => self.record(format!("Searched for {}", label)),
                    Err(e) => {
                        warn!(key = %key, error = %e, "Failed to search for target");
                        self.record(format!("Launch on {} failed: {}", key, e));
                    }
                }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to launch target");
                self.record(format!("Launch on {} failed: {}", key, e));
            }
        }
    }

    /// Opens the OS launcher search and types the target into it.
    fn search_launch(&self, target: &str) -> Result<(), AutomationError> {
        let keys = &self.collaborators.keystrokes;
        keys.press_key(KeyPress::Super)?;
        keys.type_text(target.trim())?;
        keys.press_key(KeyPress::Enter)
    }

    fn type_password(&mut self, key: KeySlot) {
        if !self.is_unlocked() {
            self.record(format!("Rejected password on {} while locked", key));
            return;
        }

        let result = match self.store.credential(key) {
            Ok(Some(record)) => Some(self.type_credential(record)),
            Ok(None) => None,
            Err(e) => Some(Err(AutomationError::Failed(e.to_string()))),
        };

        let label = self.store.label(SlotKind::Pass, key);
        match result {
            None => self.record(format!("No credential stored on {}", key)),
            Some(Ok(())) => self.record(format!("Typed credential for {}", label)),
            Some(Err(e)) => {
                warn!(key = %key, error = %e, "Failed to type credential");
                self.record(format!("Typing credential for {} failed: {}", label, e));
            }
        }
    }

    fn type_credential(&self, record: &CredentialRecord) -> Result<(), AutomationError> {
        let keys = &self.collaborators.keystrokes;

        if !record.is_password_only() {
            keys.type_text(&record.username)?;
            keys.press_key(KeyPress::Tab)?;
        }

        if self.settings.paste_via_clipboard {
            self.collaborators
                .clipboard
                .copy_to_clipboard(record.password.expose_secret())?;
            keys.press_key(KeyPress::Paste)?;
        } else {
            keys.type_text(record.password.expose_secret())?;
        }

        keys.press_key(KeyPress::Enter)
    }

    fn badge_scanned(&mut self, uid: BadgeUid) {
        match self.phase {
            LockPhase::Uninitialized => {
                self.record(format!("Badge {} scanned before setup, ignored", uid));
            }
            LockPhase::SetupPendingBadge => {
                if let Err(e) = self.registry.add(uid.clone()) {
                    warn!(error = %e, "Failed to enroll badge");
                    self.record(format!("Enrolling badge {} failed: {}", uid, e));
                    self.reply(OutboundCommand::AuthFail);
                    return;
                }
                self.record(format!("Enrolled badge {}", uid));
                let ok = self.unlock(UnlockMethod::Badge);
                self.reply(if ok {
                    OutboundCommand::AuthOk
                } else {
                    OutboundCommand::AuthFail
                });
            }
            LockPhase::Locked => {
                if !self.registry.is_authorized(&uid) {
                    self.record(format!("Unknown badge {} rejected", uid));
                    self.reply(OutboundCommand::AuthFail);
                    return;
                }
                let ok = self.unlock(UnlockMethod::Badge);
                self.reply(if ok {
                    OutboundCommand::AuthOk
                } else {
                    OutboundCommand::AuthFail
                });
            }
            LockPhase::Unlocked => {
                let authorized = self.registry.is_authorized(&uid);
                debug!(uid = %uid, authorized, "Badge scanned while unlocked");
                self.reply(if authorized {
                    OutboundCommand::AuthOk
                } else {
                    OutboundCommand::AuthFail
                });
            }
        }
    }

    /// Load the key and vault. On failure everything is cleared again and
    /// the phase is unchanged.
    fn unlock(&mut self, method: UnlockMethod) -> bool {
        if let Err(e) = self.open_secrets() {
            self.crypto.clear_key();
            self.store.close_vault();
            warn!(method = %method, error = %e, "Unlock failed");
            self.note(format!("Unlock via {} failed: {}", method, e));
            return false;
        }

        self.phase = LockPhase::Unlocked;
        self.last_unlock = Some(SystemTime::now());
        self.last_activity = Instant::now();
        self.note(format!("Unlocked via {}", method));
        true
    }

    fn open_secrets(&mut self) -> Result<(), ControlError> {
        self.crypto.load_key(&self.dir.key_path())?;
        self.store.open_vault(&self.crypto)?;
        Ok(())
    }

    /// Clear secrets and enter `Locked`. No-op unless unlocked.
    pub fn lock(&mut self, reason: &str) {
        if !self.is_unlocked() {
            return;
        }
        self.crypto.clear_key();
        self.store.close_vault();
        self.phase = LockPhase::Locked;
        self.note(format!("Locked ({})", reason));
    }

    /// Periodic check for the auto-lock timeout.
    pub fn on_tick(&mut self, now: Instant) {
        if !self.is_unlocked() {
            return;
        }
        let Some(threshold) = self.settings.auto_lock_after else {
            return;
        };

        let idle = self.idle_for(now);
        if idle >= threshold {
            info!(idle_secs = idle.as_secs(), "Auto-lock threshold reached");
            self.lock("idle timeout");
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        let serial_idle = now.saturating_duration_since(self.last_activity);
        match (self.settings.idle_source, &self.collaborators.idle) {
            (IdleSource::Os, Some(probe)) => probe.idle_duration().unwrap_or(serial_idle),
            _ => serial_idle,
        }
    }

    /// Lock and drop secrets before exit.
    pub fn shutdown(&mut self) {
        self.lock("shutdown");
        self.crypto.clear_key();
        self.store.close_vault();
    }

    /// Handle a control request.
    pub fn handle_request(&mut self, request: Request) -> Reply {
        match request {
            Request::UploadIcon { kind, key, payload } => {
                match self.prepare_icon_upload(kind, key, &payload) {
                    Ok(job) => Reply::Upload(job),
                    Err(e) => Reply::Now(e.into()),
                }
            }
            other => Reply::Now(self.respond(other).unwrap_or_else(Response::from)),
        }
    }

    fn respond(&mut self, request: Request) -> Result<Response, ControlError> {
        match request {
            Request::Ping => Ok(Response::Pong),
            Request::Status => Ok(Response::Status(self.status())),
            Request::Questions => Ok(Response::Questions {
                questions: QUESTIONS.iter().map(|q| q.to_string()).collect(),
            }),
            Request::Lock => {
                self.lock("manual");
                Ok(Response::Done)
            }
            Request::SubmitSetup { answers } => {
                let answers: Vec<&str> = answers.iter().map(|a| a.expose_secret()).collect();
                self.submit_setup(&answers)?;
                Ok(Response::Done)
            }
            Request::RecoveryUnlock { answers } => {
                let answers: Vec<&str> = answers.iter().map(|a| a.expose_secret()).collect();
                self.recovery_unlock(&answers)?;
                Ok(Response::Done)
            }
            Request::SetLabel { kind, key, name } => {
                self.require_unlocked()?;
                self.store.set_label(kind, key, &name)?;
                let name = self.store.label(kind, key);
                self.reply(OutboundCommand::Label { kind, key, name });
                Ok(Response::Done)
            }
            Request::SetApp { key, target } => {
                self.require_unlocked()?;
                self.store.set_app(key, &target)?;
                self.record(format!("App target set on {}", key));
                Ok(Response::Done)
            }
            Request::ClearApp { key } => {
                self.require_unlocked()?;
                self.store.clear_app(key)?;
                Ok(Response::Done)
            }
            Request::SetCredential {
                key,
                username,
                password,
            } => {
                self.require_unlocked()?;
                if password.expose_secret().is_empty() {
                    return Err(ControlError::InvalidRequest(
                        "password must not be empty".to_string(),
                    ));
                }
                let record = CredentialRecord::new(username.trim(), password.expose_secret());
                self.store.set_credential(key, record, &self.crypto)?;
                self.record(format!("Credential stored on {}", key));
                Ok(Response::Done)
            }
            Request::ClearCredential { key } => {
                self.require_unlocked()?;
                if self.store.clear_credential(key, &self.crypto)? {
                    self.record(format!("Credential cleared on {}", key));
                }
                Ok(Response::Done)
            }
            Request::ListSlots => Ok(Response::Slots {
                slots: self.store.slots(),
            }),
            Request::AddUid { uid } => {
                self.require_unlocked()?;
                let uid = BadgeUid::parse(&uid)?;
                if self.registry.add(uid.clone())? {
                    self.record(format!("Authorized badge {}", uid));
                }
                Ok(Response::Done)
            }
            Request::RemoveUid { uid } => {
                self.require_unlocked()?;
                let uid = BadgeUid::parse(&uid)?;
                if !self.registry.is_authorized(&uid) {
                    return Err(ControlError::InvalidRequest(format!(
                        "badge {} is not authorized",
                        uid
                    )));
                }
                if self.registry.len() == 1 {
                    return Err(ControlError::InvalidState(
                        "cannot remove the last authorized badge".to_string(),
                    ));
                }
                self.registry.remove(&uid)?;
                self.record(format!("Revoked badge {}", uid));
                Ok(Response::Done)
            }
            Request::ListUids => {
                self.require_unlocked()?;
                Ok(Response::Uids {
                    uids: self.registry.list().iter().map(|u| u.to_string()).collect(),
                })
            }
            Request::Configure {
                port,
                auto_lock_minutes,
            } => {
                self.require_unlocked()?;
                let port = port.map(|p| p.trim().to_string());
                if port.as_deref() == Some("") {
                    return Err(ControlError::InvalidRequest(
                        "serial port must not be empty".to_string(),
                    ));
                }
                if let Some(minutes) = auto_lock_minutes {
                    self.settings.auto_lock_after =
                        (minutes > 0).then(|| Duration::from_secs(minutes.saturating_mul(60)));
                    self.last_activity = Instant::now();
                    self.record(match minutes {
                        0 => "Auto-lock disabled".to_string(),
                        m => format!("Auto-lock set to {} min", m),
                    });
                }
                if let Some(port) = port {
                    self.sink.switch_port(&port);
                    self.record(format!("Serial port set to {}", port));
                }
                Ok(Response::Done)
            }
            Request::UploadIcon { .. } => Err(ControlError::InvalidState(
                "icon uploads are not answered inline".to_string(),
            )),
        }
    }

    /// First-run setup: store recovery answers, create the key and an empty vault.
    pub fn submit_setup(&mut self, answers: &[&str]) -> Result<(), ControlError> {
        if self.phase != LockPhase::Uninitialized {
            return Err(ControlError::InvalidState(
                "setup has already been completed".to_string(),
            ));
        }
        recovery::validate_answers(answers)?;

        // The security profile is written last: its presence marks setup as done.
        let result = self.create_key_and_vault().and_then(|()| {
            self.recovery.set_answers(answers)?;
            Ok(())
        });
        self.crypto.clear_key();
        self.store.close_vault();
        result?;

        self.phase = LockPhase::SetupPendingBadge;
        self.note("Setup saved, scan a badge to finish");
        Ok(())
    }

    fn create_key_and_vault(&mut self) -> Result<(), ControlError> {
        self.crypto.generate_key();
        self.crypto.save_key(&self.dir.key_path())?;
        self.store.initialize_vault(&self.crypto)?;
        Ok(())
    }

    /// Unlock with the recovery answers.
    pub fn recovery_unlock(&mut self, answers: &[&str]) -> Result<(), ControlError> {
        match self.phase {
            LockPhase::Unlocked => return Ok(()),
            LockPhase::Locked => {}
            _ => {
                return Err(ControlError::InvalidState(
                    "setup is not complete".to_string(),
                ))
            }
        }

        if !self.recovery.verify(answers) {
            self.note("Recovery answers rejected");
            return Err(ControlError::Unauthorized);
        }

        if self.unlock(UnlockMethod::Recovery) {
            Ok(())
        } else {
            Err(ControlError::UnlockFailed(
                "could not open the vault".to_string(),
            ))
        }
    }

    /// Validate an icon upload request. The upload itself runs elsewhere.
    pub fn prepare_icon_upload(
        &mut self,
        kind: SlotKind,
        key: KeySlot,
        payload: &str,
    ) -> Result<IconJob, ControlError> {
        self.require_unlocked()?;
        let key = key.editable()?;
        let bytes = BASE64
            .decode(payload.trim())
            .map_err(|e| ControlError::InvalidRequest(format!("icon payload: {}", e)))?;
        let icon = IconPayload::new(bytes)?;
        if !self.sink.is_connected() {
            return Err(TransportError::NotConnected.into());
        }
        self.record(format!("Uploading {} icon for {}", kind, key));
        Ok(IconJob { kind, key, icon })
    }

    /// Snapshot for status queries.
    pub fn status(&self) -> StatusReport {
        StatusReport {
            connected: self.connected,
            state: self.phase.lock_state(),
            phase: self.phase,
            last_unlock: self.last_unlock.map(unix_secs),
            authorized_uids: self.registry.len(),
            auto_lock_secs: self.settings.auto_lock_after.map(|d| d.as_secs()),
            recent: self.activity.iter().cloned().collect(),
        }
    }

    /// Add an entry to the activity log.
    pub fn record(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!(message = %message, "Activity");
        if self.activity.len() == ACTIVITY_LOG_CAPACITY {
            self.activity.pop_front();
        }
        self.activity.push_back(ActivityEntry {
            at: unix_secs(SystemTime::now()),
            message,
        });
    }

    /// Record and push a state or connection change.
    fn note(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.record(message.clone());
        self.collaborators.status.report_status(&StatusChange {
            connected: self.connected,
            phase: self.phase,
            message,
        });
    }

    fn reply(&self, command: OutboundCommand) {
        if let Err(e) = self.sink.send(&command) {
            debug!(command = %command, error = %e, "Reply not delivered");
        }
    }

    fn require_unlocked(&self) -> Result<(), ControlError> {
        if self.is_unlocked() {
            Ok(())
        } else {
            Err(ControlError::Locked)
        }
    }
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Action, FixedIdleProbe, Recorder, RecordingSink};
    use orca_deck_core::icon::ICON_BYTES;
    use orca_deck_core::types::LockState;
    use secrecy::SecretString;
    use tempfile::{tempdir, TempDir};

    const ANSWERS: [&str; 3] = ["Rex", "Smith", "Lisbon"];
    const BADGE: &str = "52A77A5C";

    struct Harness {
        dir: TempDir,
        controller: LockController,
        sink: RecordingSink,
        recorder: Recorder,
    }

    impl Harness {
        /// Rebuild the controller over the same data directory.
        fn restart(&mut self) {
            self.controller = controller_at(
                self.dir.path(),
                &self.sink,
                &self.recorder,
                ControllerSettings::default(),
                None,
            );
        }
    }

    fn controller_at(
        path: &std::path::Path,
        sink: &RecordingSink,
        recorder: &Recorder,
        settings: ControllerSettings,
        idle: Option<FixedIdleProbe>,
    ) -> LockController {
        let collaborators = Collaborators {
            launcher: Box::new(recorder.clone()),
            keystrokes: Box::new(recorder.clone()),
            clipboard: Box::new(recorder.clone()),
            status: Box::new(recorder.clone()),
            idle: idle.map(|p| Box::new(p) as Box<dyn IdleProbe>),
        };
        LockController::new(
            DataDir::new(path),
            Box::new(sink.clone()),
            collaborators,
            settings,
        )
    }

    fn harness_with(settings: ControllerSettings, idle: Option<FixedIdleProbe>) -> Harness {
        let dir = tempdir().unwrap();
        let sink = RecordingSink::connected();
        let recorder = Recorder::new();
        let controller = controller_at(dir.path(), &sink, &recorder, settings, idle);
        Harness {
            dir,
            controller,
            sink,
            recorder,
        }
    }

    fn harness() -> Harness {
        harness_with(ControllerSettings::default(), None)
    }

    fn line(text: &str) -> TransportEvent {
        TransportEvent::Line(InboundCommand::parse(text).unwrap())
    }

    fn key(c: char) -> KeySlot {
        KeySlot::new(c).unwrap()
    }

    fn secrets(values: &[&str]) -> Vec<SecretString> {
        values.iter().map(|v| SecretString::from(v.to_string())).collect()
    }

    fn done(reply: Reply) {
        match reply {
            Reply::Now(Response::Done) => {}
            other => panic!("expected done, got {:?}", other),
        }
    }

    fn error_code(reply: Reply) -> ErrorCode {
        match reply {
            Reply::Now(Response::Error { code, .. }) => code,
            other => panic!("expected error, got {:?}", other),
        }
    }

    /// Run setup and enroll the default badge, leaving the controller unlocked.
    fn set_up(h: &mut Harness) {
        done(h.controller.handle_request(Request::SubmitSetup {
            answers: secrets(&ANSWERS),
        }));
        h.controller.handle_transport_event(line(&format!("RFID_READ:{}", BADGE)));
        assert!(h.controller.is_unlocked());
        h.sink.clear();
    }

    #[test]
    fn creates_missing_data_directory() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("data");
        let _controller = controller_at(
            &root,
            &RecordingSink::connected(),
            &Recorder::new(),
            ControllerSettings::default(),
            None,
        );
        assert!(root.is_dir());
    }

    #[test]
    fn starts_uninitialized() {
        let h = harness();
        assert_eq!(h.controller.phase(), LockPhase::Uninitialized);
        assert_eq!(h.controller.status().state, LockState::Locked);
    }

    #[test]
    fn setup_then_first_badge_unlocks() {
        let mut h = harness();

        done(h.controller.handle_request(Request::SubmitSetup {
            answers: secrets(&ANSWERS),
        }));
        assert_eq!(h.controller.phase(), LockPhase::SetupPendingBadge);

        h.controller.handle_transport_event(line("RFID_READ:52a77a5c"));
        assert_eq!(h.controller.phase(), LockPhase::Unlocked);
        assert_eq!(h.sink.sent(), vec![OutboundCommand::AuthOk]);

        h.controller.lock("test");
        assert_eq!(h.controller.phase(), LockPhase::Locked);

        h.controller.handle_transport_event(line("RFID_READ:52A77A5C"));
        assert_eq!(h.controller.phase(), LockPhase::Unlocked);
        assert!(h.controller.status().last_unlock.is_some());
    }

    #[test]
    fn setup_rejects_bad_answers_and_second_attempt() {
        let mut h = harness();

        let code = error_code(h.controller.handle_request(Request::SubmitSetup {
            answers: secrets(&["rex", "", "lisbon"]),
        }));
        assert_eq!(code, ErrorCode::InvalidRequest);
        assert_eq!(h.controller.phase(), LockPhase::Uninitialized);

        set_up(&mut h);
        let code = error_code(h.controller.handle_request(Request::SubmitSetup {
            answers: secrets(&ANSWERS),
        }));
        assert_eq!(code, ErrorCode::InvalidState);
    }

    #[test]
    fn restart_resumes_pending_badge_then_locked() {
        let mut h = harness();
        done(h.controller.handle_request(Request::SubmitSetup {
            answers: secrets(&ANSWERS),
        }));

        h.restart();
        assert_eq!(h.controller.phase(), LockPhase::SetupPendingBadge);

        h.controller.handle_transport_event(line("RFID_READ:AA01"));
        assert_eq!(h.controller.phase(), LockPhase::Unlocked);

        h.restart();
        assert_eq!(h.controller.phase(), LockPhase::Locked);
        assert!(!h.controller.crypto.is_loaded());
    }

    #[test]
    fn unknown_badge_never_unlocks() {
        let mut h = harness();
        set_up(&mut h);
        h.controller.lock("test");

        for _ in 0..3 {
            h.controller.handle_transport_event(line("RFID_READ:DEADBEEF"));
            assert_eq!(h.controller.phase(), LockPhase::Locked);
        }
        assert_eq!(h.sink.sent(), vec![OutboundCommand::AuthFail; 3]);
    }

    #[test]
    fn badge_while_unlocked_only_replies() {
        let mut h = harness();
        set_up(&mut h);

        h.controller.handle_transport_event(line("RFID_READ:DEADBEEF"));
        h.controller.handle_transport_event(line(&format!("RFID_READ:{}", BADGE)));
        assert!(h.controller.is_unlocked());
        assert_eq!(
            h.sink.sent(),
            vec![OutboundCommand::AuthFail, OutboundCommand::AuthOk]
        );
    }

    #[test]
    fn corrupt_vault_keeps_locked() {
        let mut h = harness();
        set_up(&mut h);
        h.controller.lock("test");

        std::fs::write(h.controller.dir.vault_path(), "{\"nonce\":\"x\"}").unwrap();
        h.controller.handle_transport_event(line(&format!("RFID_READ:{}", BADGE)));

        assert_eq!(h.controller.phase(), LockPhase::Locked);
        assert!(!h.controller.crypto.is_loaded());
        assert_eq!(h.sink.sent(), vec![OutboundCommand::AuthFail]);
    }

    #[test]
    fn recovery_unlock() {
        let mut h = harness();
        set_up(&mut h);
        h.controller.lock("test");

        let reply = h.controller.handle_request(Request::RecoveryUnlock {
            answers: secrets(&["rex", "smith", "porto"]),
        });
        match reply {
            Reply::Now(Response::Error { code, message }) => {
                assert_eq!(code, ErrorCode::Unauthorized);
                assert_eq!(message, "recovery failed");
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(h.controller.phase(), LockPhase::Locked);

        done(h.controller.handle_request(Request::RecoveryUnlock {
            answers: secrets(&[" REX", "smith ", "Lisbon"]),
        }));
        assert!(h.controller.is_unlocked());
        assert!(h.sink.sent().is_empty());
    }

    #[test]
    fn recovery_before_setup_is_invalid() {
        let mut h = harness();
        let code = error_code(h.controller.handle_request(Request::RecoveryUnlock {
            answers: secrets(&ANSWERS),
        }));
        assert_eq!(code, ErrorCode::InvalidState);
    }

    #[test]
    fn device_unlock_requires_trust() {
        let mut h = harness();
        set_up(&mut h);
        h.controller.lock("test");

        h.controller.handle_transport_event(line("RFID_UNLOCK_OK"));
        assert_eq!(h.controller.phase(), LockPhase::Locked);

        h.controller.settings.trust_device_unlock = true;
        h.controller.handle_transport_event(line("RFID_UNLOCK_OK"));
        assert_eq!(h.controller.phase(), LockPhase::Unlocked);
        assert!(h.sink.sent().is_empty());
    }

    #[test]
    fn launches_while_locked_never_reach_automation() {
        let mut h = harness();
        set_up(&mut h);
        done(h.controller.handle_request(Request::SetApp {
            key: key('A'),
            target: "https://example.com".to_string(),
        }));
        done(h.controller.handle_request(Request::SetCredential {
            key: key('B'),
            username: "alice".to_string(),
            password: SecretString::from("pw".to_string()),
        }));
        h.controller.lock("test");

        h.controller.handle_transport_event(line("APP_LAUNCH:A"));
        h.controller.handle_transport_event(line("PASS_LAUNCH:B"));
        assert!(h.recorder.actions().is_empty());
    }

    #[test]
    fn app_launch_forwards_target() {
        let mut h = harness();
        set_up(&mut h);
        done(h.controller.handle_request(Request::SetApp {
            key: key('C'),
            target: "/usr/bin/firefox".to_string(),
        }));

        h.controller.handle_transport_event(line("APP_LAUNCH:C"));
        h.controller.handle_transport_event(line("APP_LAUNCH:D"));
        assert_eq!(
            h.recorder.actions(),
            vec![Action::Launch("/usr/bin/firefox".to_string())]
        );
    }

    #[test]
    fn free_text_target_falls_back_to_search() {
        let mut h = harness();
        h.recorder.set_launches_unsupported(true);
        set_up(&mut h);
        done(h.controller.handle_request(Request::SetApp {
            key: key('5'),
            target: " spotify ".to_string(),
        }));

        h.controller.handle_transport_event(line("APP_LAUNCH:5"));
        assert_eq!(
            h.recorder.actions(),
            vec![
                Action::Launch("spotify".to_string()),
                Action::Press(KeyPress::Super),
                Action::Type("spotify".to_string()),
                Action::Press(KeyPress::Enter),
            ]
        );
        assert!(h
            .controller
            .status()
            .recent
            .iter()
            .any(|e| e.message.starts_with("Searched for")));
    }

    #[test]
    fn password_launch_types_username_then_password() {
        let mut h = harness();
        set_up(&mut h);
        done(h.controller.handle_request(Request::SetCredential {
            key: key('1'),
            username: " alice ".to_string(),
            password: SecretString::from("wonderland".to_string()),
        }));
        done(h.controller.handle_request(Request::SetCredential {
            key: key('2'),
            username: String::new(),
            password: SecretString::from("pin".to_string()),
        }));

        h.controller.handle_transport_event(line("PASS_LAUNCH:1"));
        h.controller.handle_transport_event(line("PASS_LAUNCH:2"));
        assert_eq!(
            h.recorder.actions(),
            vec![
                Action::Type("alice".to_string()),
                Action::Press(KeyPress::Tab),
                Action::Type("wonderland".to_string()),
                Action::Press(KeyPress::Enter),
                Action::Type("pin".to_string()),
                Action::Press(KeyPress::Enter),
            ]
        );
    }

    #[test]
    fn password_paste_via_clipboard() {
        let settings = ControllerSettings {
            paste_via_clipboard: true,
            ..ControllerSettings::default()
        };
        let mut h = harness_with(settings, None);
        set_up(&mut h);
        done(h.controller.handle_request(Request::SetCredential {
            key: key('9'),
            username: String::new(),
            password: SecretString::from("s3cret".to_string()),
        }));

        h.controller.handle_transport_event(line("PASS_LAUNCH:9"));
        assert_eq!(
            h.recorder.actions(),
            vec![
                Action::Copy("s3cret".to_string()),
                Action::Press(KeyPress::Paste),
                Action::Press(KeyPress::Enter),
            ]
        );
    }

    #[test]
    fn idle_timeout_locks_and_clears_key() {
        let mut h = harness();
        set_up(&mut h);
        let start = Instant::now();

        h.controller.on_tick(start + Duration::from_secs(60));
        assert!(h.controller.is_unlocked());

        h.controller.on_tick(start + Duration::from_secs(15 * 60 + 1));
        assert_eq!(h.controller.phase(), LockPhase::Locked);
        assert!(!h.controller.crypto.is_loaded());
        assert!(!h.controller.store.is_unlocked());

        let code = error_code(h.controller.handle_request(Request::SetCredential {
            key: key('A'),
            username: String::new(),
            password: SecretString::from("x".to_string()),
        }));
        assert_eq!(code, ErrorCode::Locked);
    }

    #[test]
    fn keypad_activity_defers_auto_lock() {
        let mut h = harness();
        set_up(&mut h);

        let later = Instant::now() + Duration::from_secs(10 * 60);
        h.controller.last_activity = later;
        h.controller.on_tick(later + Duration::from_secs(14 * 60));
        assert!(h.controller.is_unlocked());
    }

    #[test]
    fn os_idle_source() {
        let settings = ControllerSettings {
            idle_source: IdleSource::Os,
            ..ControllerSettings::default()
        };
        let probe = FixedIdleProbe::new(Some(Duration::from_secs(5)));
        let mut h = harness_with(settings, Some(probe.clone()));
        set_up(&mut h);

        let far = Instant::now() + Duration::from_secs(60 * 60);
        h.controller.on_tick(far);
        assert!(h.controller.is_unlocked());

        probe.set(Some(Duration::from_secs(16 * 60)));
        h.controller.on_tick(Instant::now());
        assert_eq!(h.controller.phase(), LockPhase::Locked);
    }

    #[test]
    fn disabled_auto_lock() {
        let settings = ControllerSettings {
            auto_lock_after: None,
            ..ControllerSettings::default()
        };
        let mut h = harness_with(settings, None);
        set_up(&mut h);

        h.controller.on_tick(Instant::now() + Duration::from_secs(24 * 60 * 60));
        assert!(h.controller.is_unlocked());
    }

    #[test]
    fn set_label_pushes_to_keypad() {
        let mut h = harness();
        set_up(&mut h);

        done(h.controller.handle_request(Request::SetLabel {
            kind: SlotKind::App,
            key: key('A'),
            name: "Mail".to_string(),
        }));
        done(h.controller.handle_request(Request::SetLabel {
            kind: SlotKind::Pass,
            key: key('A'),
            name: String::new(),
        }));

        assert_eq!(
            h.sink.sent(),
            vec![
                OutboundCommand::Label {
                    kind: SlotKind::App,
                    key: key('A'),
                    name: "Mail".to_string(),
                },
                OutboundCommand::Label {
                    kind: SlotKind::Pass,
                    key: key('A'),
                    name: "Item A".to_string(),
                },
            ]
        );
    }

    #[test]
    fn edits_rejected_while_locked() {
        let mut h = harness();
        set_up(&mut h);
        h.controller.lock("test");

        let code = error_code(h.controller.handle_request(Request::SetLabel {
            kind: SlotKind::App,
            key: key('A'),
            name: "x".to_string(),
        }));
        assert_eq!(code, ErrorCode::Locked);
        let code = error_code(h.controller.handle_request(Request::AddUid {
            uid: "AA".to_string(),
        }));
        assert_eq!(code, ErrorCode::Locked);
        assert!(h.sink.sent().is_empty());
    }

    #[test]
    fn back_key_edits_are_invalid() {
        let mut h = harness();
        set_up(&mut h);

        let code = error_code(h.controller.handle_request(Request::SetApp {
            key: KeySlot::BACK,
            target: "x".to_string(),
        }));
        assert_eq!(code, ErrorCode::InvalidRequest);
    }

    #[test]
    fn uid_management() {
        let mut h = harness();
        set_up(&mut h);

        done(h.controller.handle_request(Request::AddUid {
            uid: " bb02 ".to_string(),
        }));
        match h.controller.handle_request(Request::ListUids) {
            Reply::Now(Response::Uids { uids }) => assert_eq!(uids, vec![BADGE, "BB02"]),
            other => panic!("expected uids, got {:?}", other),
        }

        done(h.controller.handle_request(Request::RemoveUid {
            uid: BADGE.to_string(),
        }));
        let code = error_code(h.controller.handle_request(Request::RemoveUid {
            uid: "BB02".to_string(),
        }));
        assert_eq!(code, ErrorCode::InvalidState);

        h.controller.lock("test");
        h.controller.handle_transport_event(line(&format!("RFID_READ:{}", BADGE)));
        assert_eq!(h.controller.phase(), LockPhase::Locked);
        h.controller.handle_transport_event(line("RFID_READ:BB02"));
        assert_eq!(h.controller.phase(), LockPhase::Unlocked);
    }

    #[test]
    fn icon_upload_validation() {
        let mut h = harness();
        set_up(&mut h);

        let short = BASE64.encode([0u8; 10]);
        let code = error_code(h.controller.handle_request(Request::UploadIcon {
            kind: SlotKind::App,
            key: key('A'),
            payload: short,
        }));
        assert_eq!(code, ErrorCode::InvalidRequest);

        let full = BASE64.encode(vec![0u8; ICON_BYTES]);
        match h.controller.handle_request(Request::UploadIcon {
            kind: SlotKind::Pass,
            key: key('5'),
            payload: full.clone(),
        }) {
            Reply::Upload(job) => {
                assert_eq!(job.kind, SlotKind::Pass);
                assert_eq!(job.key, key('5'));
                assert_eq!(job.icon.len(), ICON_BYTES);
            }
            other => panic!("expected upload, got {:?}", other),
        }

        h.sink.set_connected(false);
        let code = error_code(h.controller.handle_request(Request::UploadIcon {
            kind: SlotKind::Pass,
            key: key('5'),
            payload: full,
        }));
        assert_eq!(code, ErrorCode::NotConnected);
    }

    #[test]
    fn status_tracks_connection_and_activity() {
        let mut h = harness();
        h.controller.handle_transport_event(TransportEvent::Connected);
        set_up(&mut h);

        let status = h.controller.status();
        assert!(status.connected);
        assert_eq!(status.state, LockState::Unlocked);
        assert_eq!(status.authorized_uids, 1);
        assert_eq!(status.auto_lock_secs, Some(900));
        assert!(status.recent.iter().any(|e| e.message == "Unlocked via badge"));

        h.controller.handle_transport_event(TransportEvent::Disconnected);
        assert!(!h.controller.status().connected);

        let reports = h.recorder.statuses();
        assert!(reports.iter().any(|s| s.connected && s.phase == LockPhase::Unlocked));
        assert!(!reports.last().unwrap().connected);
    }

    #[test]
    fn configure_changes_auto_lock_and_port() {
        let mut h = harness();
        let code = error_code(h.controller.handle_request(Request::Configure {
            port: Some("/dev/ttyACM0".to_string()),
            auto_lock_minutes: None,
        }));
        assert_eq!(code, ErrorCode::Locked);
        assert!(h.sink.ports().is_empty());

        set_up(&mut h);
        done(h.controller.handle_request(Request::Configure {
            port: Some(" /dev/ttyACM0 ".to_string()),
            auto_lock_minutes: Some(2),
        }));
        assert_eq!(h.sink.ports(), vec!["/dev/ttyACM0".to_string()]);
        assert_eq!(h.controller.status().auto_lock_secs, Some(120));

        let code = error_code(h.controller.handle_request(Request::Configure {
            port: Some("  ".to_string()),
            auto_lock_minutes: Some(0),
        }));
        assert_eq!(code, ErrorCode::InvalidRequest);
        assert_eq!(h.controller.status().auto_lock_secs, Some(120));

        done(h.controller.handle_request(Request::Configure {
            port: None,
            auto_lock_minutes: Some(0),
        }));
        assert_eq!(h.controller.status().auto_lock_secs, None);
        h.controller.on_tick(Instant::now() + Duration::from_secs(3600));
        assert!(h.controller.is_unlocked());
    }

    #[test]
    fn activity_log_is_bounded() {
        let mut h = harness();
        for i in 0..(ACTIVITY_LOG_CAPACITY + 10) {
            h.controller.record(format!("event {}", i));
        }
        let recent = h.controller.status().recent;
        assert_eq!(recent.len(), ACTIVITY_LOG_CAPACITY);
        assert_eq!(recent[0].message, "event 10");
    }

    #[test]
    fn shutdown_clears_secrets() {
        let mut h = harness();
        set_up(&mut h);
        h.controller.shutdown();
        assert_eq!(h.controller.phase(), LockPhase::Locked);
        assert!(!h.controller.crypto.is_loaded());
    }
}
