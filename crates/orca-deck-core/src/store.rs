//! Credential store, key registry and their persistence.
//!
//! Everything except the vault is stored in plain JSON. The vault is only
//! written as an [`EncryptedPackage`] and only held decrypted while unlocked.
//!
//! # Files
//!
//! | File | Content |
//! |---|---|
//! | `vault.json` | encrypted credentials |
//! | `master.key` | vault key and salt |
//! | `security.json` | recovery answer digests |
//! | `authorized_uids.json` | authorized badge UIDs |
//! | `mappings.json` | display labels per mode |
//! | `apps.json` | app launch targets |
//!
//! Unreadable files other than the vault fall back to defaults with a
//! warning. A vault that exists but cannot be read fails the unlock instead.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::control::SlotInfo;
use crate::crypto::{CryptoError, EncryptedPackage, VaultCrypto};
use crate::types::{AppRecord, BadgeUid, CredentialRecord, IdentifierError, KeySlot, SlotKind, Vault};

pub const VAULT_FILE: &str = "vault.json";
pub const KEY_FILE: &str = "master.key";
pub const SECURITY_FILE: &str = "security.json";
pub const UIDS_FILE: &str = "authorized_uids.json";
pub const MAPPINGS_FILE: &str = "mappings.json";
pub const APPS_FILE: &str = "apps.json";

/// Errors from store mutations and vault access.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Identifier(#[from] IdentifierError),

    /// The vault is not decrypted.
    #[error("vault is locked")]
    Locked,

    #[error("invalid value: {0}")]
    Invalid(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Locations of the persisted files.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory (mode 0700 on Unix) if it is missing.
    pub fn ensure(&self) -> std::io::Result<()> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(&self.root)
    }

    pub fn vault_path(&self) -> PathBuf {
        self.root.join(VAULT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.root.join(KEY_FILE)
    }

    pub fn security_path(&self) -> PathBuf {
        self.root.join(SECURITY_FILE)
    }

    pub fn uids_path(&self) -> PathBuf {
        self.root.join(UIDS_FILE)
    }

    pub fn mappings_path(&self) -> PathBuf {
        self.root.join(MAPPINGS_FILE)
    }

    pub fn apps_path(&self) -> PathBuf {
        self.root.join(APPS_FILE)
    }
}

/// Display labels, `{"apps": {...}, "passwords": {...}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct LabelMap {
    #[serde(default)]
    apps: BTreeMap<KeySlot, String>,
    #[serde(default)]
    passwords: BTreeMap<KeySlot, String>,
}

impl LabelMap {
    fn for_kind(&self, kind: SlotKind) -> &BTreeMap<KeySlot, String> {
        match kind {
            SlotKind::App => &self.apps,
            SlotKind::Pass => &self.passwords,
        }
    }

    fn for_kind_mut(&mut self, kind: SlotKind) -> &mut BTreeMap<KeySlot, String> {
        match kind {
            SlotKind::App => &mut self.apps,
            SlotKind::Pass => &mut self.passwords,
        }
    }
}

/// Labels, app targets and, while unlocked, the decrypted vault.
#[derive(Debug)]
pub struct CredentialStore {
    dir: DataDir,
    labels: LabelMap,
    apps: BTreeMap<KeySlot, AppRecord>,
    vault: Option<Vault>,
}

impl CredentialStore {
    /// Load labels and app targets. The vault stays closed.
    pub fn load(dir: DataDir) -> Self {
        let labels = load_json_or_default(&dir.mappings_path());
        let apps = load_json_or_default(&dir.apps_path());
        Self {
            dir,
            labels,
            apps,
            vault: None,
        }
    }

    pub fn dir(&self) -> &DataDir {
        &self.dir
    }

    /// The label shown for a slot, falling back to the default.
    pub fn label(&self, kind: SlotKind, key: KeySlot) -> String {
        if !key.is_editable() {
            return kind.default_label(key);
        }
        self.labels
            .for_kind(kind)
            .get(&key)
            .cloned()
            .unwrap_or_else(|| kind.default_label(key))
    }

    /// Set a label. An empty name restores the default.
    pub fn set_label(&mut self, kind: SlotKind, key: KeySlot, name: &str) -> Result<(), StoreError> {
        let key = key.editable()?;
        let name = name.trim();

        let mut labels = self.labels.clone();
        if name.is_empty() {
            labels.for_kind_mut(kind).remove(&key);
        } else {
            labels.for_kind_mut(kind).insert(key, name.to_string());
        }
        write_json(&self.dir.mappings_path(), &labels)?;
        self.labels = labels;
        debug!(kind = %kind, key = %key, "Label updated");
        Ok(())
    }

    pub fn app(&self, key: KeySlot) -> Option<&AppRecord> {
        self.apps.get(&key)
    }

    pub fn set_app(&mut self, key: KeySlot, target: &str) -> Result<(), StoreError> {
        let key = key.editable()?;
        let target = target.trim();
        if target.is_empty() {
            return Err(StoreError::Invalid("app target must not be empty".to_string()));
        }

        let mut apps = self.apps.clone();
        apps.insert(key, AppRecord::new(target));
        write_json(&self.dir.apps_path(), &apps)?;
        self.apps = apps;
        debug!(key = %key, "App target updated");
        Ok(())
    }

    /// Remove an app target. Returns whether one existed.
    pub fn clear_app(&mut self, key: KeySlot) -> Result<bool, StoreError> {
        let key = key.editable()?;
        if !self.apps.contains_key(&key) {
            return Ok(false);
        }

        let mut apps = self.apps.clone();
        apps.remove(&key);
        write_json(&self.dir.apps_path(), &apps)?;
        self.apps = apps;
        Ok(true)
    }

    pub fn is_unlocked(&self) -> bool {
        self.vault.is_some()
    }

    /// The credential for a slot. Fails while locked.
    pub fn credential(&self, key: KeySlot) -> Result<Option<&CredentialRecord>, StoreError> {
        let vault = self.vault.as_ref().ok_or(StoreError::Locked)?;
        Ok(vault.get(key))
    }

    /// Store a credential and persist the re-encrypted vault.
    pub fn set_credential(
        &mut self,
        key: KeySlot,
        record: CredentialRecord,
        crypto: &VaultCrypto,
    ) -> Result<(), StoreError> {
        let key = key.editable()?;
        let mut vault = self.vault.clone().ok_or(StoreError::Locked)?;
        vault.insert(key, record);
        self.persist_vault(vault, crypto)?;
        debug!(key = %key, "Credential updated");
        Ok(())
    }

    /// Remove a credential. Returns whether one existed.
    pub fn clear_credential(&mut self, key: KeySlot, crypto: &VaultCrypto) -> Result<bool, StoreError> {
        let key = key.editable()?;
        let mut vault = self.vault.clone().ok_or(StoreError::Locked)?;
        if !vault.remove(key) {
            return Ok(false);
        }
        self.persist_vault(vault, crypto)?;
        Ok(true)
    }

    /// Decrypt the persisted vault into memory.
    ///
    /// A missing vault file opens as an empty vault. A file that cannot be
    /// parsed or decrypted is an error and leaves the store locked.
    pub fn open_vault(&mut self, crypto: &VaultCrypto) -> Result<(), StoreError> {
        let path = self.dir.vault_path();
        let vault = match fs::read_to_string(&path) {
            Ok(contents) => {
                let package: EncryptedPackage = serde_json::from_str(&contents)?;
                crypto.decrypt_vault(&package)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No vault file, starting with an empty vault");
                Vault::new()
            }
            Err(e) => return Err(e.into()),
        };

        debug!(entries = vault.len(), "Vault opened");
        self.vault = Some(vault);
        Ok(())
    }

    /// Write a new empty vault under the current key and open it.
    pub fn initialize_vault(&mut self, crypto: &VaultCrypto) -> Result<(), StoreError> {
        self.persist_vault(Vault::new(), crypto)
    }

    /// Drop the decrypted vault.
    pub fn close_vault(&mut self) {
        if self.vault.take().is_some() {
            debug!("Vault closed");
        }
    }

    /// Metadata for every slot, without secrets.
    pub fn slots(&self) -> Vec<SlotInfo> {
        KeySlot::all()
            .map(|key| SlotInfo {
                key,
                editable: key.is_editable(),
                app_label: self.label(SlotKind::App, key),
                pass_label: self.label(SlotKind::Pass, key),
                app_target: self.app(key).map(|a| a.target.clone()),
                has_credential: self.vault.as_ref().map(|v| v.get(key).is_some()),
            })
            .collect()
    }

    fn persist_vault(&mut self, vault: Vault, crypto: &VaultCrypto) -> Result<(), StoreError> {
        let package = crypto.encrypt_vault(&vault)?;
        write_json(&self.dir.vault_path(), &package)?;
        self.vault = Some(vault);
        Ok(())
    }
}

/// The set of badges allowed to unlock.
#[derive(Debug)]
pub struct KeyRegistry {
    path: PathBuf,
    uids: Vec<BadgeUid>,
}

impl KeyRegistry {
    /// Load the UID list. Invalid entries and duplicates are dropped.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let raw: Vec<String> = load_json_or_default(&path);

        let mut uids: Vec<BadgeUid> = Vec::with_capacity(raw.len());
        for entry in raw {
            match BadgeUid::parse(&entry) {
                Ok(uid) if !uids.contains(&uid) => uids.push(uid),
                Ok(_) => {}
                Err(_) => warn!(entry = %entry, "Ignoring invalid badge UID"),
            }
        }
        Self { path, uids }
    }

    pub fn is_authorized(&self, uid: &BadgeUid) -> bool {
        self.uids.contains(uid)
    }

    /// Add a UID. Returns false if it was already present.
    pub fn add(&mut self, uid: BadgeUid) -> Result<bool, StoreError> {
        if self.uids.contains(&uid) {
            return Ok(false);
        }
        let mut uids = self.uids.clone();
        uids.push(uid);
        write_json(&self.path, &uids)?;
        self.uids = uids;
        Ok(true)
    }

    /// Remove a UID. Returns whether it was present.
    pub fn remove(&mut self, uid: &BadgeUid) -> Result<bool, StoreError> {
        if !self.uids.contains(uid) {
            return Ok(false);
        }
        let uids: Vec<BadgeUid> = self.uids.iter().filter(|u| *u != uid).cloned().collect();
        write_json(&self.path, &uids)?;
        self.uids = uids;
        Ok(true)
    }

    pub fn list(&self) -> &[BadgeUid] {
        &self.uids
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.uids.len()
    }
}

fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "Ignoring malformed file, using defaults");
            T::default()
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => T::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read file, using defaults");
            T::default()
        }
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;

    // Write to a sibling and rename so a crash never leaves half a file.
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
