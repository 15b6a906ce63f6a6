//! Control protocol between front ends and the daemon.
//!
//! Newline-delimited JSON over a Unix socket, one request per connection.
//! Both requests and responses are tagged by a `type` field.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{KeySlot, LockPhase, LockState, SlotKind};

/// A request from a front end to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Health check.
    Ping,

    /// Lock state, connection and recent activity.
    Status,

    /// The recovery questions, in answer order.
    Questions,

    /// Lock now.
    Lock,

    /// First-run setup: recovery answers for the three questions.
    SubmitSetup {
        #[serde(
            serialize_with = "serialize_secrets",
            deserialize_with = "deserialize_secrets"
        )]
        answers: Vec<SecretString>,
    },

    /// Unlock with recovery answers instead of a badge.
    RecoveryUnlock {
        #[serde(
            serialize_with = "serialize_secrets",
            deserialize_with = "deserialize_secrets"
        )]
        answers: Vec<SecretString>,
    },

    /// Rename a slot and push the label to the keypad. An empty name resets it.
    SetLabel {
        kind: SlotKind,
        key: KeySlot,
        name: String,
    },

    /// Bind a path, URL or search query to an app slot.
    SetApp { key: KeySlot, target: String },

    ClearApp { key: KeySlot },

    /// Store a login for a password slot. Requires Unlocked.
    SetCredential {
        key: KeySlot,
        #[serde(default)]
        username: String,
        #[serde(
            serialize_with = "serialize_secret",
            deserialize_with = "deserialize_secret"
        )]
        password: SecretString,
    },

    ClearCredential { key: KeySlot },

    /// Slot metadata (no secrets).
    ListSlots,

    /// Authorize a badge. Requires Unlocked.
    AddUid { uid: String },

    /// Revoke a badge. Requires Unlocked.
    RemoveUid { uid: String },

    /// Authorized badges. Requires Unlocked.
    ListUids,

    /// Upload a 2048-byte RGB565 icon, base64 encoded.
    UploadIcon {
        kind: SlotKind,
        key: KeySlot,
        payload: String,
    },

    /// Change runtime settings. Omitted fields keep their value; nothing is
    /// written back to the config file. Requires Unlocked.
    Configure {
        /// Serial device to reconnect to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<String>,
        /// Idle minutes before locking; zero disables auto-lock.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auto_lock_minutes: Option<u64>,
    },
}

/// A response from the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong,

    Status(StatusReport),

    Questions { questions: Vec<String> },

    /// The request was carried out.
    Done,

    Slots { slots: Vec<SlotInfo> },

    Uids { uids: Vec<String> },

    Error { code: ErrorCode, message: String },
}

impl Response {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }
}

/// Error codes for rejected requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed request or invalid argument.
    InvalidRequest,

    /// The request needs the system to be unlocked.
    Locked,

    /// Not allowed in the current phase (e.g. setup twice).
    InvalidState,

    /// Recovery answers did not match.
    Unauthorized,

    /// The keypad is not connected.
    NotConnected,

    /// Another icon upload is in flight.
    Busy,

    InternalError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::InvalidRequest => write!(f, "invalid_request"),
            ErrorCode::Locked => write!(f, "locked"),
            ErrorCode::InvalidState => write!(f, "invalid_state"),
            ErrorCode::Unauthorized => write!(f, "unauthorized"),
            ErrorCode::NotConnected => write!(f, "not_connected"),
            ErrorCode::Busy => write!(f, "busy"),
            ErrorCode::InternalError => write!(f, "internal_error"),
        }
    }
}

/// Snapshot of the controller for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub connected: bool,
    pub state: LockState,
    pub phase: LockPhase,
    /// Unix seconds of the last unlock.
    pub last_unlock: Option<u64>,
    pub authorized_uids: usize,
    pub auto_lock_secs: Option<u64>,
    /// Most recent last.
    pub recent: Vec<ActivityEntry>,
}

/// One line of the activity log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    /// Unix seconds.
    pub at: u64,
    pub message: String,
}

/// Metadata about one keypad slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub key: KeySlot,
    pub editable: bool,
    pub app_label: String,
    pub pass_label: String,
    pub app_target: Option<String>,
    /// `None` while the vault is locked.
    pub has_credential: Option<bool>,
}

/// Errors reading or writing control messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

impl Request {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(line.trim())?)
    }

    pub fn to_json_line(&self) -> Result<String, ProtocolError> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }
}

impl Response {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(line.trim())?)
    }

    pub fn to_json_line(&self) -> Result<String, ProtocolError> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }
}

// Secrets cross the socket in plain JSON; the socket is private to the user.
fn serialize_secret<S>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use secrecy::ExposeSecret;
    serializer.serialize_str(secret.expose_secret())
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(SecretString::from(s))
}

fn serialize_secrets<S>(secrets: &[SecretString], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use secrecy::ExposeSecret;
    use serde::ser::SerializeSeq;

    let mut seq = serializer.serialize_seq(Some(secrets.len()))?;
    for secret in secrets {
        seq.serialize_element(secret.expose_secret())?;
    }
    seq.end()
}

fn deserialize_secrets<'de, D>(deserializer: D) -> Result<Vec<SecretString>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let values = Vec::<String>::deserialize(deserializer)?;
    Ok(values.into_iter().map(SecretString::from).collect())
}
