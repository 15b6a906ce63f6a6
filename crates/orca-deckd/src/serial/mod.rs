//! Serial link to the keypad.
//!
//! A dedicated reader thread owns the connect/read/reconnect cycle and
//! forwards parsed lines to the daemon loop over a channel. Writes go through
//! a cloneable [`TransportHandle`], which shares the write half of the link
//! with the reader thread.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use orca_deck_core::config::{Config, IconConfig};
use orca_deck_core::icon::IconPayload;
use orca_deck_core::protocol::{InboundCommand, OutboundCommand};
use orca_deck_core::traits::{CommandSink, TransportError};
use orca_deck_core::types::{KeySlot, SlotKind};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, trace, warn};

#[cfg(test)]
pub mod memory;

/// Default baud rate of the keypad firmware.
pub const SERIAL_BAUD_RATE: u32 = 115_200;

/// Longest line accepted before the buffer is discarded.
const MAX_LINE_BYTES: usize = 4096;

/// Granularity of interruptible sleeps in the reader thread.
const STOP_POLL: Duration = Duration::from_millis(50);

pub type LinkReader = Box<dyn Read + Send>;
pub type LinkWriter = Box<dyn Write + Send>;

/// Opens the physical link, returning independent read and write halves.
pub trait LinkOpener: Send + 'static {
    fn open(&self) -> io::Result<(LinkReader, LinkWriter)>;

    /// Human-readable name of the link, for logs.
    fn describe(&self) -> String;

    /// Point later opens at another device.
    fn retarget(&mut self, port: &str);
}

/// Opens a serial device with the `serialport` crate.
#[derive(Debug, Clone)]
pub struct SerialPortOpener {
    path: Option<String>,
    baud_rate: u32,
    read_timeout: Duration,
}

impl SerialPortOpener {
    pub fn new(path: Option<String>, baud_rate: u32, read_timeout: Duration) -> Self {
        Self {
            path,
            baud_rate,
            read_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.device.port.clone(),
            config.device.baud_rate,
            config.device.read_timeout(),
        )
    }
}

impl LinkOpener for SerialPortOpener {
    fn open(&self) -> io::Result<(LinkReader, LinkWriter)> {
        let path = self.path.as_deref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no serial port configured")
        })?;

        let port = serialport::new(path, self.baud_rate)
            .timeout(self.read_timeout)
            .open()
            .map_err(io::Error::from)?;
        let writer = port.try_clone().map_err(io::Error::from)?;

        Ok((Box::new(port), Box::new(writer)))
    }

    fn describe(&self) -> String {
        match &self.path {
            Some(path) => format!("{} @ {} baud", path, self.baud_rate),
            None => "<unconfigured>".to_string(),
        }
    }

    fn retarget(&mut self, port: &str) {
        self.path = Some(port.to_string());
    }
}

/// Events emitted by the reader thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Line(InboundCommand),
}

/// Timing knobs for the transport.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub reconnect_backoff: Duration,
    pub icon: IconConfig,
}

impl TransportSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            reconnect_backoff: config.device.reconnect_backoff(),
            icon: config.icon.clone(),
        }
    }
}

struct Shared {
    writer: Mutex<Option<LinkWriter>>,
    /// Port to switch to, picked up by the reader thread.
    next_port: Mutex<Option<String>>,
    connected: AtomicBool,
    stop: AtomicBool,
    uploading: AtomicBool,
    icon: IconConfig,
}

impl Shared {
    fn writer(&self) -> MutexGuard<'_, Option<LinkWriter>> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_port(&self) -> MutexGuard<'_, Option<String>> {
        self.next_port.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn switch_pending(&self) -> bool {
        self.next_port().is_some()
    }
}

/// Owner of the reader thread.
pub struct SerialTransport {
    handle: TransportHandle,
    thread: Option<JoinHandle<()>>,
}

impl SerialTransport {
    /// Spawn the reader thread. It keeps trying to connect until [`stop`](Self::stop).
    pub fn start<O: LinkOpener>(
        opener: O,
        settings: TransportSettings,
        events: UnboundedSender<TransportEvent>,
    ) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            writer: Mutex::new(None),
            next_port: Mutex::new(None),
            connected: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            uploading: AtomicBool::new(false),
            icon: settings.icon,
        });

        let thread_shared = Arc::clone(&shared);
        let backoff = settings.reconnect_backoff;
        let thread = thread::Builder::new()
            .name("serial-reader".to_string())
            .spawn(move || run_link(opener, thread_shared, events, backoff))?;

        Ok(Self {
            handle: TransportHandle { shared },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    /// Stop the reader thread and close the link. Blocks until the thread exits.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        self.handle.shared.stop.store(true, Ordering::SeqCst);
        if thread.join().is_err() {
            warn!("Serial reader thread panicked");
        }
        self.handle.shared.writer().take();
        self.handle.shared.connected.store(false, Ordering::SeqCst);
        info!("Serial transport stopped");
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Cloneable sending side of the transport.
#[derive(Clone)]
pub struct TransportHandle {
    shared: Arc<Shared>,
}

impl TransportHandle {
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_uploading(&self) -> bool {
        self.shared.uploading.load(Ordering::SeqCst)
    }

    /// Send one command.
    pub fn send(&self, command: &OutboundCommand) -> Result<(), TransportError> {
        match self.write_line(&command.to_line()) {
            Ok(()) => {
                debug!(command = %command, "Sent command");
                Ok(())
            }
            Err(e) => {
                warn!(command = %command, error = %e, "Failed to send command");
                Err(e)
            }
        }
    }

    /// Close the current link and reconnect to `port`.
    ///
    /// The reader thread applies the switch at its next read or retry, so
    /// this returns immediately.
    pub fn switch_port(&self, port: &str) {
        info!(port = %port, "Switching serial port");
        *self.shared.next_port() = Some(port.to_string());
    }

    /// Upload an icon using the `ICON_START` / `ICON_DATA` / `ICON_END` sequence.
    ///
    /// Blocks for the whole transfer. Only one upload may run at a time; a
    /// concurrent call fails immediately without sending anything.
    pub fn upload_icon(
        &self,
        kind: SlotKind,
        key: KeySlot,
        icon: &IconPayload,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if self
            .shared
            .uploading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TransportError::UploadInProgress);
        }
        let _guard = UploadGuard(&self.shared.uploading);

        let settings = &self.shared.icon;
        let chunks: Vec<&[u8]> = icon.as_bytes().chunks(settings.chunk_size.max(1)).collect();
        let total = chunks.len() + 2;
        let mut sent = 0;

        info!(kind = %kind, key = %key, bytes = icon.len(), "Uploading icon");

        self.upload_line(
            &OutboundCommand::IconStart {
                kind,
                key,
                byte_count: icon.len(),
            },
            &mut sent,
            total,
        )?;
        thread::sleep(settings.settle_delay());

        for chunk in chunks {
            self.upload_line(&OutboundCommand::IconData(chunk.to_vec()), &mut sent, total)?;
            thread::sleep(settings.chunk_delay());
        }

        thread::sleep(settings.settle_delay());
        self.upload_line(&OutboundCommand::IconEnd, &mut sent, total)?;

        info!(kind = %kind, key = %key, lines = sent, "Icon upload complete");
        Ok(())
    }

    fn upload_line(
        &self,
        command: &OutboundCommand,
        sent: &mut usize,
        total: usize,
    ) -> Result<(), TransportError> {
        if let Err(e) = self.write_line(&command.to_line()) {
            warn!(sent = *sent, total, error = %e, "Icon upload aborted");
            return Err(TransportError::UploadAborted { sent: *sent, total });
        }
        trace!(command = %command, "Sent icon line");
        *sent += 1;
        Ok(())
    }

    fn write_line(&self, line: &str) -> Result<(), TransportError> {
        let mut writer = self.shared.writer();
        let link = writer.as_mut().ok_or(TransportError::NotConnected)?;
        link.write_all(line.as_bytes())?;
        link.flush()?;
        Ok(())
    }
}

impl CommandSink for TransportHandle {
    fn send(&self, command: &OutboundCommand) -> Result<(), TransportError> {
        TransportHandle::send(self, command)
    }

    fn is_connected(&self) -> bool {
        TransportHandle::is_connected(self)
    }

    fn switch_port(&self, port: &str) {
        TransportHandle::switch_port(self, port)
    }
}

struct UploadGuard<'a>(&'a AtomicBool);

impl Drop for UploadGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Connect, read until the link fails, back off, repeat.
fn run_link<O: LinkOpener>(
    mut opener: O,
    shared: Arc<Shared>,
    events: UnboundedSender<TransportEvent>,
    backoff: Duration,
) {
    let mut link = opener.describe();
    let mut last_error: Option<String> = None;

    while !shared.stop.load(Ordering::SeqCst) {
        if let Some(port) = shared.next_port().take() {
            opener.retarget(&port);
            link = opener.describe();
            last_error = None;
        }

        match opener.open() {
            Ok((reader, writer)) => {
                last_error = None;
                *shared.writer() = Some(writer);
                shared.connected.store(true, Ordering::SeqCst);
                info!(link = %link, "Serial link connected");

                let delivered = events.send(TransportEvent::Connected).is_ok()
                    && read_lines(reader, &shared, &events);

                shared.writer().take();
                shared.connected.store(false, Ordering::SeqCst);
                info!(link = %link, "Serial link disconnected");

                if !delivered || events.send(TransportEvent::Disconnected).is_err() {
                    debug!("Event receiver dropped, stopping serial reader");
                    return;
                }
            }
            Err(e) => {
                let message = e.to_string();
                if last_error.as_deref() == Some(message.as_str()) {
                    debug!(link = %link, error = %message, "Serial link still unavailable");
                } else {
                    warn!(link = %link, error = %message, "Failed to open serial link, retrying");
                    last_error = Some(message);
                }
            }
        }

        if !shared.switch_pending() {
            sleep_unless_stopped(&shared, backoff);
        }
    }
}

/// Read lines until EOF, a read error or stop. Returns false if the event
/// receiver is gone.
fn read_lines(reader: LinkReader, shared: &Shared, events: &UnboundedSender<TransportEvent>) -> bool {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        if shared.stop.load(Ordering::SeqCst) || shared.switch_pending() {
            return true;
        }

        match (&mut reader).take(MAX_LINE_BYTES as u64).read_until(b'\n', &mut buf) {
            Ok(0) => {
                debug!("Serial link reached EOF");
                return true;
            }
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    if let Some(command) = decode_line(&buf) {
                        trace!(command = ?command, "Received line");
                        if events.send(TransportEvent::Line(command)).is_err() {
                            return false;
                        }
                    }
                    buf.clear();
                } else if buf.len() >= MAX_LINE_BYTES {
                    warn!(bytes = buf.len(), "Discarding overlong line");
                    buf.clear();
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => {
                warn!(error = %e, "Serial read failed");
                return true;
            }
        }
    }
}

/// Decode raw bytes, dropping anything that is not valid UTF-8.
fn decode_line(bytes: &[u8]) -> Option<InboundCommand> {
    let text: String = String::from_utf8_lossy(bytes)
        .chars()
        .filter(|&c| c != char::REPLACEMENT_CHARACTER)
        .collect();
    InboundCommand::parse(&text)
}

fn sleep_unless_stopped(shared: &Shared, total: Duration) {
    let mut remaining = total;
    while !remaining.is_zero() && !shared.stop.load(Ordering::SeqCst) && !shared.switch_pending() {
        let step = remaining.min(STOP_POLL);
        thread::sleep(step);
        remaining -= step;
    }
}
