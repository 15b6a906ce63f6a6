//! AES-256-GCM encryption of the credential vault.
//!
//! The vault is stored on disk only as an [`EncryptedPackage`]. The key that
//! protects it lives in a separate key file and is only held in memory while
//! the system is unlocked.
//!
//! # Security Properties
//!
//! - **Integrity**: the GCM tag is verified before any plaintext is returned;
//!   a wrong key, a flipped bit or a truncated field is an error.
//! - **Swap Protection**: the master key is held in memory-locked (`mlock`)
//!   storage and zeroed on drop.
//! - **Unique Nonces**: every encryption draws a fresh random 96-bit nonce.
//! - **Fail Closed**: with no key loaded, encryption and decryption are
//!   rejected rather than treated as an empty vault.
//!
//! # Example
//!
//! ```
//! use orca_deck_core::crypto::{Plaintext, VaultCrypto};
//!
//! let mut crypto = VaultCrypto::new();
//! crypto.generate_key();
//!
//! let package = crypto.encrypt("hunter2").unwrap();
//! let plaintext = crypto.decrypt(&package).unwrap();
//! assert_eq!(plaintext, Plaintext::Text("hunter2".to_string()));
//! ```

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce, Tag};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::types::Vault;

/// Size of the AES-256 key in bytes.
const KEY_SIZE: usize = 32;

/// Size of the key salt in bytes.
const SALT_SIZE: usize = 16;

/// Size of the GCM nonce in bytes (96 bits).
const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes (128 bits).
const TAG_SIZE: usize = 16;

/// Errors from key handling and vault encryption.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// No master key is loaded.
    #[error("no master key loaded")]
    KeyNotLoaded,

    /// Tag verification failed: wrong key, tampering or corruption.
    #[error("decryption failed: wrong key or corrupted data")]
    Decryption,

    /// The cipher refused to encrypt.
    #[error("encryption failed")]
    Encryption,

    /// A package field is not valid base64 or has the wrong length.
    #[error("malformed encrypted package: {0}")]
    MalformedPackage(String),

    /// The key file could not be read or is invalid.
    #[error("invalid key file {}: {reason}", path.display())]
    KeyFile { path: PathBuf, reason: String },

    /// Failed to write the key file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Plaintext could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The 256-bit vault key and its 128-bit salt.
///
/// Key material is memory-locked to prevent swapping and zeroed on drop.
/// Debug output shows `[REDACTED]`.
pub struct MasterKey {
    key: Box<[u8; KEY_SIZE]>,
    salt: [u8; SALT_SIZE],
    memory_locked: bool,
}

impl MasterKey {
    /// Generate a new random key and salt.
    pub fn generate() -> Self {
        let mut key = Box::new([0u8; KEY_SIZE]);
        let mut salt = [0u8; SALT_SIZE];
        let mut rng = rand::rng();
        rng.fill_bytes(key.as_mut());
        rng.fill_bytes(&mut salt);

        let mut master = Self {
            key,
            salt,
            memory_locked: false,
        };
        master.try_lock_memory();
        master
    }

    /// Rebuild a key from persisted bytes. Lengths must match exactly.
    fn from_parts(key: &[u8], salt: &[u8]) -> Option<Self> {
        if key.len() != KEY_SIZE || salt.len() != SALT_SIZE {
            return None;
        }

        let mut master = Self {
            key: Box::new([0u8; KEY_SIZE]),
            salt: [0u8; SALT_SIZE],
            memory_locked: false,
        };
        master.key.copy_from_slice(key);
        master.salt.copy_from_slice(salt);
        master.try_lock_memory();
        Some(master)
    }

    fn try_lock_memory(&mut self) {
        let ptr = self.key.as_ptr() as *mut u8;

        // Safety: the box is owned by self and unlocked on drop
        let result = unsafe { memsec::mlock(ptr, KEY_SIZE) };

        if result {
            self.memory_locked = true;
        } else {
            warn!(
                "Failed to lock master key memory - key may be swapped to disk. \
                 Grant CAP_IPC_LOCK capability or increase RLIMIT_MEMLOCK to fix."
            );
        }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_ref()))
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.key.zeroize();
        self.salt.zeroize();

        if self.memory_locked {
            let ptr = self.key.as_ptr() as *mut u8;
            // Safety: unlocking memory locked in try_lock_memory
            unsafe {
                memsec::munlock(ptr, KEY_SIZE);
            }
        }
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("key", &"[REDACTED]")
            .field("memory_locked", &self.memory_locked)
            .finish()
    }
}

/// On-disk key file record.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct KeyFile {
    key: String,
    salt: String,
}

/// The only on-disk representation of the vault. All fields are base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPackage {
    pub nonce: String,
    pub tag: String,
    pub ciphertext: String,
    pub salt: String,
}

/// Result of a successful decryption.
#[derive(Debug, Clone, PartialEq)]
pub enum Plaintext {
    /// The bytes parsed as JSON.
    Structured(serde_json::Value),
    /// Anything else, as text.
    Text(String),
}

/// Key lifecycle and authenticated encryption for the vault.
#[derive(Debug, Default)]
pub struct VaultCrypto {
    key: Option<MasterKey>,
}

impl VaultCrypto {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any loaded key with a freshly generated one. Nothing is persisted.
    pub fn generate_key(&mut self) {
        self.key = Some(MasterKey::generate());
        debug!("Generated new master key");
    }

    pub fn is_loaded(&self) -> bool {
        self.key.is_some()
    }

    /// Zero and drop the key.
    pub fn clear_key(&mut self) {
        if self.key.take().is_some() {
            debug!("Master key cleared");
        }
    }

    /// Persist the loaded key as `{"key": ..., "salt": ...}`, mode 0600.
    pub fn save_key(&self, path: &Path) -> Result<(), CryptoError> {
        let master = self.key.as_ref().ok_or(CryptoError::KeyNotLoaded)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let record = KeyFile {
            key: BASE64.encode(master.key.as_ref()),
            salt: BASE64.encode(master.salt),
        };
        let json = Zeroizing::new(serde_json::to_vec(&record)?);

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(&json)?;
        file.sync_all()?;

        debug!(path = %path.display(), "Master key saved");
        Ok(())
    }

    /// Load a persisted key. On any failure the key is left unset.
    pub fn load_key(&mut self, path: &Path) -> Result<(), CryptoError> {
        self.clear_key();

        let key_file_error = |reason: String| CryptoError::KeyFile {
            path: path.to_path_buf(),
            reason,
        };

        let contents = Zeroizing::new(fs::read(path).map_err(|e| key_file_error(e.to_string()))?);
        let record: KeyFile =
            serde_json::from_slice(&contents).map_err(|e| key_file_error(e.to_string()))?;

        let key = Zeroizing::new(
            BASE64
                .decode(record.key.as_bytes())
                .map_err(|e| key_file_error(format!("key: {}", e)))?,
        );
        let salt = BASE64
            .decode(record.salt.as_bytes())
            .map_err(|e| key_file_error(format!("salt: {}", e)))?;

        let master = MasterKey::from_parts(&key, &salt)
            .ok_or_else(|| key_file_error("wrong key or salt length".to_string()))?;
        self.key = Some(master);

        debug!(path = %path.display(), "Master key loaded");
        Ok(())
    }

    /// Encrypt a value.
    ///
    /// Strings are encrypted as their raw text; everything else as canonical
    /// JSON with sorted object keys.
    pub fn encrypt<T: Serialize + ?Sized>(&self, value: &T) -> Result<EncryptedPackage, CryptoError> {
        let plaintext = match serde_json::to_value(value)? {
            serde_json::Value::String(text) => Zeroizing::new(text.into_bytes()),
            other => Zeroizing::new(serde_json::to_vec(&other)?),
        };
        self.encrypt_bytes(&plaintext)
    }

    /// Encrypt raw bytes with a fresh nonce.
    pub fn encrypt_bytes(&self, plaintext: &[u8]) -> Result<EncryptedPackage, CryptoError> {
        let master = self.key.as_ref().ok_or(CryptoError::KeyNotLoaded)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut buffer = plaintext.to_vec();
        let tag = master
            .cipher()
            .encrypt_in_place_detached(nonce, b"", &mut buffer)
            .map_err(|_| CryptoError::Encryption)?;

        Ok(EncryptedPackage {
            nonce: BASE64.encode(nonce_bytes),
            tag: BASE64.encode(tag),
            ciphertext: BASE64.encode(&buffer),
            salt: BASE64.encode(master.salt),
        })
    }

    /// Decrypt and verify a package, returning the raw plaintext bytes.
    pub fn decrypt_bytes(
        &self,
        package: &EncryptedPackage,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let master = self.key.as_ref().ok_or(CryptoError::KeyNotLoaded)?;

        let nonce_bytes = decode_field("nonce", &package.nonce, Some(NONCE_SIZE))?;
        let tag_bytes = decode_field("tag", &package.tag, Some(TAG_SIZE))?;
        let mut buffer = Zeroizing::new(decode_field("ciphertext", &package.ciphertext, None)?);

        master
            .cipher()
            .decrypt_in_place_detached(
                Nonce::from_slice(&nonce_bytes),
                b"",
                &mut buffer,
                Tag::from_slice(&tag_bytes),
            )
            .map_err(|_| {
                warn!("Vault decryption failed - wrong key or corrupted data");
                CryptoError::Decryption
            })?;

        Ok(buffer)
    }

    /// Decrypt a package, parsing the result as JSON when possible.
    pub fn decrypt(&self, package: &EncryptedPackage) -> Result<Plaintext, CryptoError> {
        let bytes = self.decrypt_bytes(package)?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Plaintext::Structured(value)),
            Err(_) => Ok(Plaintext::Text(String::from_utf8_lossy(&bytes).into_owned())),
        }
    }

    pub fn encrypt_vault(&self, vault: &Vault) -> Result<EncryptedPackage, CryptoError> {
        self.encrypt(vault)
    }

    pub fn decrypt_vault(&self, package: &EncryptedPackage) -> Result<Vault, CryptoError> {
        let bytes = self.decrypt_bytes(package)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn decode_field(name: &str, value: &str, expected_len: Option<usize>) -> Result<Vec<u8>, CryptoError> {
    let bytes = BASE64
        .decode(value.as_bytes())
        .map_err(|e| CryptoError::MalformedPackage(format!("{}: {}", name, e)))?;

    if let Some(expected) = expected_len {
        if bytes.len() != expected {
            return Err(CryptoError::MalformedPackage(format!(
                "{}: expected {} bytes, got {}",
                name,
                expected,
                bytes.len()
            )));
        }
    }
    Ok(bytes)
}
