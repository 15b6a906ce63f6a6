use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use super::{LinkOpener, LinkReader, LinkWriter};

/// How long an empty read waits before reporting a timeout.
const READ_TIMEOUT: Duration = Duration::from_millis(5);

#[derive(Default)]
struct LinkState {
    inbound: VecDeque<u8>,
    written: Vec<u8>,
    closed: bool,
    unplugged: bool,
    writes_before_failure: Option<usize>,
    opens: usize,
    targets: Vec<String>,
}

/// In-memory serial link that records written bytes and replays queued input.
///
/// Clones share the same state, so a test can keep one clone while the
/// transport owns another.
#[derive(Clone, Default)]
pub struct MemoryLink {
    state: Arc<Mutex<LinkState>>,
}

impl MemoryLink {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap()
    }

    /// Queue bytes for the reader.
    pub fn push_bytes(&self, bytes: &[u8]) {
        self.state().inbound.extend(bytes);
    }

    /// Close the current session and refuse new ones until [`plug_in`](Self::plug_in).
    pub fn unplug(&self) {
        let mut state = self.state();
        state.closed = true;
        state.unplugged = true;
    }

    pub fn plug_in(&self) {
        self.state().unplugged = false;
    }

    /// Let `n` more writes succeed, then fail every write.
    pub fn fail_writes_after(&self, n: usize) {
        self.state().writes_before_failure = Some(n);
    }

    /// Ports the transport was told to switch to, in order.
    pub fn targets(&self) -> Vec<String> {
        self.state().targets.clone()
    }

    pub fn open_count(&self) -> usize {
        self.state().opens
    }

    /// Everything written so far, split into lines without terminators.
    pub fn written_lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.state().written)
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl LinkOpener for MemoryLink {
    fn open(&self) -> io::Result<(LinkReader, LinkWriter)> {
        let mut state = self.state();
        if state.unplugged {
            return Err(io::Error::new(io::ErrorKind::NotFound, "memory link unplugged"));
        }
        state.closed = false;
        state.opens += 1;

        Ok((
            Box::new(MemoryReader {
                state: Arc::clone(&self.state),
            }),
            Box::new(MemoryWriter {
                state: Arc::clone(&self.state),
            }),
        ))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn retarget(&mut self, port: &str) {
        self.state().targets.push(port.to_string());
    }
}

struct MemoryReader {
    state: Arc<Mutex<LinkState>>,
}

impl Read for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.inbound.is_empty() {
                let n = buf.len().min(state.inbound.len());
                for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if state.closed {
                return Ok(0);
            }
        }

        thread::sleep(READ_TIMEOUT);
        Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
    }
}

struct MemoryWriter {
    state: Arc<Mutex<LinkState>>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "memory link closed"));
        }
        match state.writes_before_failure {
            Some(0) => {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "memory link dropped"))
            }
            Some(n) => state.writes_before_failure = Some(n - 1),
            None => {}
        }
        state.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_times_out_until_data_or_close() {
        let link = MemoryLink::new();
        let (mut reader, _writer) = link.open().unwrap();
        let mut buf = [0u8; 8];

        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        link.push_bytes(b"hi");
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"hi");

        link.unplug();
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        assert!(link.open().is_err());
    }

    #[test]
    fn writer_records_and_fails_on_demand() {
        let link = MemoryLink::new();
        let (_reader, mut writer) = link.open().unwrap();

        writer.write_all(b"A\n").unwrap();
        link.fail_writes_after(1);
        writer.write_all(b"B\n").unwrap();
        assert!(writer.write_all(b"C\n").is_err());

        assert_eq!(link.written_lines(), vec!["A", "B"]);
    }
}
