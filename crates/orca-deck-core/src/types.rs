//! Core data types for the ORCA Deck host.
//!
//! This module contains the data model shared by every other component:
//! keypad slots, slot modes, badge identifiers, credential records, the
//! decrypted vault and the lock state reported to front ends.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// The keypad, row by row, as printed on the device.
pub const KEYPAD_LAYOUT: [[char; 4]; 4] = [
    ['A', 'B', 'C', 'D'],
    ['3', '6', '9', '#'],
    ['2', '5', '8', '0'],
    ['1', '4', '7', '*'],
];

/// Errors produced when parsing identifiers from the wire or from users.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    /// The symbol is not on the keypad.
    #[error("invalid key slot '{0}'")]
    InvalidKeySlot(String),

    /// The reserved back key cannot be edited.
    #[error("key slot '*' is reserved for navigation")]
    ReservedKeySlot,

    /// Unknown slot mode.
    #[error("invalid slot kind '{0}' (expected app or pass)")]
    InvalidSlotKind(String),

    /// Badge UID was empty or contained separators.
    #[error("invalid badge UID '{0}'")]
    InvalidBadgeUid(String),
}

/// One of the sixteen physical keys.
///
/// Serialized as a one-character string so it can be used as a JSON map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeySlot(char);

impl KeySlot {
    /// The reserved "Back" key.
    pub const BACK: KeySlot = KeySlot('*');

    /// Create a slot from a keypad symbol. Letters are accepted in either case.
    pub fn new(symbol: char) -> Result<Self, IdentifierError> {
        let upper = symbol.to_ascii_uppercase();
        if KEYPAD_LAYOUT.iter().flatten().any(|&c| c == upper) {
            Ok(KeySlot(upper))
        } else {
            Err(IdentifierError::InvalidKeySlot(symbol.to_string()))
        }
    }

    /// All slots in keypad order.
    pub fn all() -> impl Iterator<Item = KeySlot> {
        KEYPAD_LAYOUT.iter().flatten().map(|&c| KeySlot(c))
    }

    /// The symbol printed on the key.
    pub fn symbol(self) -> char {
        self.0
    }

    /// Whether labels and bindings of this slot may be changed.
    pub fn is_editable(self) -> bool {
        self != Self::BACK
    }

    /// Returns the slot if it is editable, `ReservedKeySlot` otherwise.
    pub fn editable(self) -> Result<Self, IdentifierError> {
        if self.is_editable() {
            Ok(self)
        } else {
            Err(IdentifierError::ReservedKeySlot)
        }
    }
}

impl FromStr for KeySlot {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let mut chars = trimmed.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => KeySlot::new(c),
            _ => Err(IdentifierError::InvalidKeySlot(trimmed.to_string())),
        }
    }
}

impl TryFrom<String> for KeySlot {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KeySlot> for String {
    fn from(slot: KeySlot) -> Self {
        slot.0.to_string()
    }
}

impl fmt::Display for KeySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two keypad modes: launching apps and typing credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotKind {
    /// App launcher mode.
    App,
    /// Password mode.
    Pass,
}

impl SlotKind {
    /// Name used in `ICON_START` and in persisted mappings.
    pub fn wire_name(self) -> &'static str {
        match self {
            SlotKind::App => "app",
            SlotKind::Pass => "pass",
        }
    }

    /// Label shown for a slot that was never named.
    pub fn default_label(self, key: KeySlot) -> String {
        if key == KeySlot::BACK {
            return "Back".to_string();
        }
        match self {
            SlotKind::App => format!("App {}", key),
            SlotKind::Pass => format!("Item {}", key),
        }
    }
}

impl FromStr for SlotKind {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "app" | "apps" => Ok(SlotKind::App),
            "pass" | "password" | "passwords" => Ok(SlotKind::Pass),
            other => Err(IdentifierError::InvalidSlotKind(other.to_string())),
        }
    }
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// An RFID badge identifier, normalized to upper case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BadgeUid(String);

impl BadgeUid {
    /// Normalize and validate a UID as reported by the reader or typed by an admin.
    pub fn parse(raw: &str) -> Result<Self, IdentifierError> {
        let normalized = raw.trim().to_ascii_uppercase();
        if normalized.is_empty()
            || normalized
                .chars()
                .any(|c| c == ':' || c.is_whitespace() || c.is_control())
        {
            return Err(IdentifierError::InvalidBadgeUid(raw.to_string()));
        }
        Ok(BadgeUid(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BadgeUid {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        BadgeUid::parse(&value)
    }
}

impl From<BadgeUid> for String {
    fn from(uid: BadgeUid) -> Self {
        uid.0
    }
}

impl fmt::Display for BadgeUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stored login for a password slot.
///
/// An empty username means the slot only types a password.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "RawCredential")]
pub struct CredentialRecord {
    pub username: String,
    #[serde(serialize_with = "serialize_secret")]
    pub password: SecretString,
}

impl CredentialRecord {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    pub fn password_only(password: impl Into<String>) -> Self {
        Self::new(String::new(), password)
    }

    pub fn is_password_only(&self) -> bool {
        self.username.is_empty()
    }
}

impl PartialEq for CredentialRecord {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username
            && self.password.expose_secret() == other.password.expose_secret()
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// On-disk shapes accepted for a credential: older vaults stored a bare
/// password string.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawCredential {
    Bare(String),
    Record {
        #[serde(default)]
        username: String,
        #[serde(default)]
        password: String,
    },
}

impl From<RawCredential> for CredentialRecord {
    fn from(raw: RawCredential) -> Self {
        match raw {
            RawCredential::Bare(password) => CredentialRecord::password_only(password),
            RawCredential::Record { username, password } => {
                CredentialRecord::new(username, password)
            }
        }
    }
}

fn serialize_secret<S>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(secret.expose_secret())
}

/// A launch target bound to an app slot: a path, a URL or a search query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppRecord {
    pub target: String,
}

impl AppRecord {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

/// The decrypted credential store.
///
/// Only exists while the system is unlocked. Passwords are held in
/// `SecretString` and zeroed when the vault is dropped.
#[derive(Clone, Default, PartialEq, Deserialize)]
#[serde(from = "BTreeMap<String, CredentialRecord>")]
pub struct Vault {
    entries: BTreeMap<KeySlot, CredentialRecord>,
}

impl Vault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: KeySlot) -> Option<&CredentialRecord> {
        self.entries.get(&key)
    }

    /// Insert or replace the record for a slot.
    pub fn insert(&mut self, key: KeySlot, record: CredentialRecord) {
        self.entries.insert(key, record);
    }

    pub fn remove(&mut self, key: KeySlot) -> bool {
        self.entries.remove(&key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = KeySlot> + '_ {
        self.entries.keys().copied()
    }
}

impl From<BTreeMap<String, CredentialRecord>> for Vault {
    fn from(raw: BTreeMap<String, CredentialRecord>) -> Self {
        let mut entries = BTreeMap::new();
        for (key, record) in raw {
            match key.parse::<KeySlot>() {
                Ok(slot) => {
                    entries.insert(slot, record);
                }
                Err(_) => warn!(key = %key, "Dropping vault entry with unknown key slot"),
            }
        }
        Self { entries }
    }
}

impl Serialize for Vault {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.entries.serialize(serializer)
    }
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault")
            .field("keys", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Whether secrets are currently reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Locked,
    Unlocked,
}

/// Controller phase, including the one-time setup steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPhase {
    /// No security profile exists yet.
    Uninitialized,
    /// Recovery answers and master key exist; waiting for the first badge.
    SetupPendingBadge,
    Locked,
    Unlocked,
}

impl LockPhase {
    pub fn lock_state(self) -> LockState {
        match self {
            LockPhase::Unlocked => LockState::Unlocked,
            _ => LockState::Locked,
        }
    }
}

impl fmt::Display for LockPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockPhase::Uninitialized => write!(f, "uninitialized"),
            LockPhase::SetupPendingBadge => write!(f, "setup_pending_badge"),
            LockPhase::Locked => write!(f, "locked"),
            LockPhase::Unlocked => write!(f, "unlocked"),
        }
    }
}
