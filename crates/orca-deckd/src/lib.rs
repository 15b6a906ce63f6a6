//! ORCA Deck host daemon.
//!
//! This crate wires the building blocks from `orca-deck-core` into a running
//! service: the serial link to the keypad, the lock state machine, the default
//! OS collaborators and the control socket that front ends talk to.

pub mod automation;
pub mod controller;
pub mod daemon;
pub mod mock;
pub mod serial;
pub mod socket;

pub use automation::{CommandIdleProbe, LoggingAutomation, ProcessLauncher};
pub use controller::{Collaborators, ControlError, ControllerSettings, LockController, Reply};
pub use daemon::Daemon;
pub use serial::{SerialPortOpener, SerialTransport, TransportEvent, TransportHandle};
pub use socket::{default_socket_path, UnixSocketProvider};
