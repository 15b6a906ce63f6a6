//! Core types and utilities for the ORCA Deck host.
//!
//! This crate provides the UI-agnostic building blocks shared by the daemon
//! and its front ends. It performs no I/O on the serial link itself.
//!
//! # Modules
//!
//! - [`types`]: Core data types (`KeySlot`, `CredentialRecord`, `Vault`, `LockPhase`)
//! - [`protocol`]: Serial wire commands (`InboundCommand`, `OutboundCommand`)
//! - [`control`]: Control IPC types (`Request`, `Response`, `ErrorCode`)
//! - [`crypto`]: Vault encryption and master key handling (`VaultCrypto`)
//! - [`recovery`]: Security-question recovery (`RecoveryManager`)
//! - [`store`]: Credential store, badge registry and persistence
//! - [`icon`]: RGB565 icon payloads
//! - [`config`]: TOML configuration
//! - [`traits`]: Pluggable component traits (`CommandSink`, `TargetLauncher`, ...)
//!
//! # Example
//!
//! ```
//! use orca_deck_core::protocol::{InboundCommand, OutboundCommand};
//! use orca_deck_core::types::{KeySlot, SlotKind};
//!
//! let key = KeySlot::new('A').unwrap();
//! assert_eq!(
//!     InboundCommand::parse("APP_LAUNCH:A"),
//!     Some(InboundCommand::AppLaunch(key))
//! );
//!
//! let label = OutboundCommand::Label {
//!     kind: SlotKind::App,
//!     key,
//!     name: "Browser".to_string(),
//! };
//! assert_eq!(label.to_line(), "LABEL_APP:A:Browser\n");
//! ```

pub mod config;
pub mod control;
pub mod crypto;
pub mod icon;
pub mod protocol;
pub mod recovery;
pub mod store;
pub mod traits;
pub mod types;

// Re-export commonly used types at the crate root for convenience
pub use config::{Config, ConfigError};
pub use control::{ErrorCode, ProtocolError, Request, Response};
pub use crypto::{CryptoError, EncryptedPackage, Plaintext, VaultCrypto};
pub use icon::{IconError, IconPayload};
pub use protocol::{InboundCommand, OutboundCommand};
pub use recovery::{RecoveryError, RecoveryManager};
pub use store::{CredentialStore, DataDir, KeyRegistry, StoreError};
pub use traits::{
    AutomationError, Clipboard, CommandSink, IdleProbe, KeyPress, KeystrokeAutomation,
    SocketError, SocketProvider, StatusChange, StatusSink, TargetLauncher, TransportError,
};
pub use types::{BadgeUid, CredentialRecord, KeySlot, LockPhase, LockState, SlotKind, Vault};
