//! Default OS collaborators.
//!
//! [`ProcessLauncher`] opens paths and URLs with the desktop opener
//! (`xdg-open`, `open`). Free-text targets are left to the caller, which
//! falls back to typing them into the OS search. [`CommandIdleProbe`] asks
//! an external tool such as `xprintidle` for the OS idle time. [`LoggingAutomation`] is a headless backend for the
//! keystroke, clipboard and status seams: it logs what it would do and never
//! logs text content.

use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use orca_deck_core::config::{AutomationConfig, LockConfig};
use orca_deck_core::traits::{
    AutomationError, Clipboard, IdleProbe, KeyPress, KeystrokeAutomation, StatusChange,
    StatusSink, TargetLauncher,
};
use tracing::{debug, info, warn};

/// Classification of an app target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Url,
    Path,
    /// Anything else, e.g. an application name to search for.
    Query,
}

impl TargetKind {
    pub fn classify(target: &str) -> Self {
        let lower = target.to_ascii_lowercase();
        if ["http://", "https://", "mailto:", "file://"]
            .iter()
            .any(|scheme| lower.starts_with(scheme))
        {
            TargetKind::Url
        } else if Path::new(target).exists() {
            TargetKind::Path
        } else {
            TargetKind::Query
        }
    }
}

/// Launches targets by spawning the configured opener.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    opener: String,
}

impl ProcessLauncher {
    pub fn new(opener: impl Into<String>) -> Self {
        Self {
            opener: opener.into(),
        }
    }

    pub fn from_config(config: &AutomationConfig) -> Self {
        Self::new(config.opener.clone())
    }
}

impl TargetLauncher for ProcessLauncher {
    fn launch_target(&self, target: &str) -> Result<(), AutomationError> {
        let target = target.trim();
        match TargetKind::classify(target) {
            TargetKind::Query => Err(AutomationError::Unsupported(format!(
                "'{}' is not a path or URL",
                target
            ))),
            kind => {
                let mut child = Command::new(&self.opener)
                    .arg(target)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()?;
                let pid = child.id();
                debug!(opener = %self.opener, kind = ?kind, pid, "Spawned opener");

                // Openers usually exit quickly; reap them so none linger as zombies.
                thread::Builder::new()
                    .name("opener-reaper".to_string())
                    .spawn(move || match child.wait() {
                        Ok(status) if !status.success() => {
                            warn!(pid, status = %status, "Opener exited with failure")
                        }
                        Ok(_) => {}
                        Err(e) => warn!(pid, error = %e, "Failed to wait for opener"),
                    })?;
                Ok(())
            }
        }
    }
}

/// Reads the OS idle time from a command that prints milliseconds.
#[derive(Debug)]
pub struct CommandIdleProbe {
    program: String,
    args: Vec<String>,
    warned: AtomicBool,
}

impl CommandIdleProbe {
    /// `None` if `command` names no program.
    pub fn new(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        if program.trim().is_empty() {
            return None;
        }
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            warned: AtomicBool::new(false),
        })
    }

    pub fn from_config(config: &LockConfig) -> Option<Self> {
        Self::new(&config.idle_command)
    }

    fn query(&self) -> Result<Duration, String> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|e| e.to_string())?;
        if !output.status.success() {
            return Err(format!("exited with {}", output.status));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let millis: u64 = text
            .trim()
            .parse()
            .map_err(|_| format!("unexpected output {:?}", text.trim()))?;
        Ok(Duration::from_millis(millis))
    }
}

impl IdleProbe for CommandIdleProbe {
    fn idle_duration(&self) -> Option<Duration> {
        match self.query() {
            Ok(idle) => Some(idle),
            Err(e) => {
                // Warn once; the controller then measures keypad activity.
                if !self.warned.swap(true, Ordering::Relaxed) {
                    warn!(program = %self.program, error = %e, "OS idle probe failed");
                } else {
                    debug!(program = %self.program, error = %e, "OS idle probe failed");
                }
                None
            }
        }
    }
}

/// Headless keystroke, clipboard and status backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAutomation;

impl KeystrokeAutomation for LoggingAutomation {
    fn type_text(&self, text: &str) -> Result<(), AutomationError> {
        info!(chars = text.chars().count(), "Would type text");
        Ok(())
    }

    fn press_key(&self, key: KeyPress) -> Result<(), AutomationError> {
        info!(key = %key, "Would press key");
        Ok(())
    }
}

impl Clipboard for LoggingAutomation {
    fn copy_to_clipboard(&self, text: &str) -> Result<(), AutomationError> {
        info!(chars = text.chars().count(), "Would copy to clipboard");
        Ok(())
    }
}

impl StatusSink for LoggingAutomation {
    fn report_status(&self, status: &StatusChange) {
        info!(
            connected = status.connected,
            phase = %status.phase,
            "{}", status.message
        );
    }
}
