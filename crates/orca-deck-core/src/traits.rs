//! Trait definitions for pluggable components.
//!
//! These traits define the interfaces for:
//! - OS automation (launching targets, typing keystrokes, the clipboard)
//! - Status reporting to front ends and idle-time probing
//! - Sending wire commands to the keypad
//! - Socket provisioning for the control interface
//!
//! The lock controller only talks to these seams, so the daemon can be tested
//! with recording doubles and platform backends can be swapped freely.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::net::UnixListener;

use crate::protocol::OutboundCommand;
use crate::types::LockPhase;

/// Error type for OS automation collaborators.
#[derive(Debug, thiserror::Error)]
pub enum AutomationError {
    /// The backend cannot handle this request.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The backend tried and failed.
    #[error("automation failed: {0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error type for the serial link.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No device is connected.
    #[error("device not connected")]
    NotConnected,

    /// Another icon upload is in flight.
    #[error("an icon upload is already in progress")]
    UploadInProgress,

    /// The link dropped during an icon upload.
    #[error("icon upload aborted after {sent} of {total} lines")]
    UploadAborted { sent: usize, total: usize },

    /// Failed to open or write to the device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error type for socket provider operations.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    /// Failed to bind to the socket.
    #[error("failed to bind socket: {0}")]
    BindFailed(#[source] std::io::Error),

    /// Socket path is invalid.
    #[error("invalid socket path: {0}")]
    InvalidPath(String),

    /// Failed to create the socket directory.
    #[error("failed to create socket directory: {0}")]
    DirectoryCreationFailed(#[source] std::io::Error),

    /// Another process is accepting connections on the path.
    #[error("socket {0} is in use by a running daemon")]
    InUse(std::path::PathBuf),
}

/// Keys the automation layer can press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPress {
    Tab,
    Enter,
    /// Ctrl+V.
    Paste,
    /// The OS key that opens the launcher search.
    Super,
}

impl std::fmt::Display for KeyPress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyPress::Tab => write!(f, "tab"),
            KeyPress::Enter => write!(f, "enter"),
            KeyPress::Paste => write!(f, "ctrl+v"),
            KeyPress::Super => write!(f, "super"),
        }
    }
}

/// A state or connection change, pushed to front ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub connected: bool,
    pub phase: LockPhase,
    pub message: String,
}

/// Opens a path, URL or search query.
pub trait TargetLauncher: Send + Sync {
    fn launch_target(&self, target: &str) -> Result<(), AutomationError>;
}

/// Synthesizes keyboard input in the focused window.
pub trait KeystrokeAutomation: Send + Sync {
    fn type_text(&self, text: &str) -> Result<(), AutomationError>;

    fn press_key(&self, key: KeyPress) -> Result<(), AutomationError>;
}

/// Writes text to the system clipboard.
pub trait Clipboard: Send + Sync {
    fn copy_to_clipboard(&self, text: &str) -> Result<(), AutomationError>;
}

/// Receives state changes, e.g. a tray icon or notification backend.
pub trait StatusSink: Send + Sync {
    fn report_status(&self, status: &StatusChange);
}

/// Reports how long the user has been idle at the OS level.
pub trait IdleProbe: Send + Sync {
    /// `None` if the platform cannot tell.
    fn idle_duration(&self) -> Option<Duration>;
}

/// Sends commands to the keypad.
///
/// Sends are fire-and-forget: failures are reported but never retried.
pub trait CommandSink: Send + Sync {
    fn send(&self, command: &OutboundCommand) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Drop the current link and reconnect to `port`.
    fn switch_port(&self, port: &str);
}

/// Provides the listener for the control socket.
///
/// The daemon binds `$XDG_RUNTIME_DIR/orca-deck/socket`; tests bind a path
/// inside a temporary directory.
pub trait SocketProvider: Send + Sync {
    /// Create and return a Unix socket listener.
    fn listen(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<UnixListener, SocketError>> + Send + '_>>;

    /// Return the socket path (for logging/debugging).
    fn socket_path(&self) -> Option<&std::path::Path> {
        None
    }
}

/// An idle probe for platforms without one.
pub struct NoIdleProbe;

impl IdleProbe for NoIdleProbe {
    fn idle_duration(&self) -> Option<Duration> {
        None
    }
}
