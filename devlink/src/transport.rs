use std::{
    collections::VecDeque,
    fmt,
    time::{Duration, Instant, SystemTime},
};

use devlink_protocol::{PACKET_END, Port, codec::Framer};

use crate::error::TransportError;

const READ_LINE_CHUNK: usize = 64;

/// An open link to one device: raw port plus the line framer.
///
/// Lines that were framed but not yet handed out stay buffered here, so no data is
/// lost when the transport moves from the handshake to a session.
pub struct Transport {
    port: Box<dyn Port>,
    framer: Framer,
    pending: VecDeque<String>,
    buf: Vec<u8>,
}

impl Transport {
    pub fn new(port: impl Port + 'static) -> Transport {
        Transport::from_boxed(Box::new(port))
    }

    pub fn from_boxed(port: Box<dyn Port>) -> Transport {
        Transport {
            port,
            framer: Framer::new(),
            pending: VecDeque::new(),
            buf: Vec::new(),
        }
    }

    pub fn address(&self) -> &str {
        self.port.name()
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.port.is_open() {
            Ok(())
        } else {
            Err(TransportError::closed(self.address()))
        }
    }

    fn io_error(&self, error: std::io::Error) -> TransportError {
        TransportError::from_io(self.address(), error)
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.check_open()?;
        self.port.write_all(bytes).map_err(|e| self.io_error(e))
    }

    /// Writes `line` followed by the packet terminator.
    pub fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(PACKET_END);
        self.write(&bytes)
    }

    /// Number of raw bytes waiting on the port.
    pub fn bytes_available(&mut self) -> Result<usize, TransportError> {
        self.check_open()?;
        match self.port.bytes_to_read() {
            Ok(n) => Ok(n),
            Err(e) => {
                log::error!(
                    "Failed to check serial '{}'. Is there a loose connection?",
                    self.address()
                );
                Err(self.io_error(e))
            }
        }
    }

    /// Whether complete lines are buffered that no read returned yet.
    pub fn has_pending_lines(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Blocks until a complete line arrives or `timeout` elapses.
    /// Returns the time the read started and the line without its terminator.
    pub fn read_line(
        &mut self,
        timeout: Duration,
    ) -> Result<(SystemTime, Option<String>), TransportError> {
        let receive_time = SystemTime::now();
        self.check_open()?;
        if let Some(line) = self.pending.pop_front() {
            return Ok((receive_time, Some(line)));
        }

        let deadline = Instant::now() + timeout;
        loop {
            let n = self.fill(READ_LINE_CHUNK)?;
            let mut lines = self.framer.push(&self.buf[..n]).into_iter();
            if let Some(line) = lines.next() {
                self.pending.extend(lines);
                return Ok((receive_time, Some(line)));
            }
            if Instant::now() >= deadline {
                return Ok((receive_time, None));
            }
        }
    }

    /// Reads up to `n` bytes and returns every line completed so far, including lines
    /// buffered by earlier reads. A trailing partial line is kept for the next call.
    pub fn read_chunk(&mut self, n: usize) -> Result<(SystemTime, Vec<String>), TransportError> {
        let receive_time = SystemTime::now();
        self.check_open()?;

        let mut lines: Vec<String> = self.pending.drain(..).collect();
        let mut remaining = n;
        while remaining > 0 {
            let read = self.fill(remaining)?;
            if read == 0 {
                break;
            }
            lines.extend(self.framer.push(&self.buf[..read]));
            remaining -= read;
        }
        Ok((receive_time, lines))
    }

    /// Reads at most `max` bytes into the scratch buffer.
    fn fill(&mut self, max: usize) -> Result<usize, TransportError> {
        self.buf.resize(max, 0);
        match self.port.read(&mut self.buf[..max]) {
            Ok(n) => Ok(n),
            Err(e) => Err(self.io_error(e)),
        }
    }

    pub fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), TransportError> {
        self.check_open()?;
        self.port
            .set_baud_rate(baud_rate)
            .map_err(|e| self.io_error(e))
    }

    pub fn baud_rate(&self) -> u32 {
        self.port.baud_rate()
    }

    pub fn is_open(&self) -> bool {
        self.port.is_open()
    }

    pub fn close(&mut self) -> Result<(), TransportError> {
        self.check_open()?;
        self.port.close().map_err(|e| self.io_error(e))
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("address", &self.address())
            .field("open", &self.is_open())
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use devlink_protocol::MemoryPort;

    fn pair() -> (Transport, MemoryPort) {
        let (host, device) = MemoryPort::pair("mem0");
        (
            Transport::new(host.with_read_timeout(Duration::from_millis(2))),
            device,
        )
    }

    #[test]
    fn read_chunk_splits_across_calls() {
        let (mut transport, mut device) = pair();
        device.write_all(b"a\tb").unwrap();
        let n = transport.bytes_available().unwrap();
        let (_, lines) = transport.read_chunk(n).unwrap();
        assert!(lines.is_empty());

        device.write_all(b"\nc\td\n").unwrap();
        let n = transport.bytes_available().unwrap();
        let (_, lines) = transport.read_chunk(n).unwrap();
        assert_eq!(lines, vec!["a\tb", "c\td"]);
    }

    #[test]
    fn read_line_keeps_extra_lines() {
        let (mut transport, mut device) = pair();
        device.write_all(b"~hello!\n~ready!\npartial").unwrap();
        let (_, line) = transport.read_line(Duration::from_millis(50)).unwrap();
        assert_eq!(line.as_deref(), Some("~hello!"));
        assert!(transport.has_pending_lines());

        let (_, lines) = transport.read_chunk(0).unwrap();
        assert_eq!(lines, vec!["~ready!"]);
        device.write_all(b"\n").unwrap();
        let (_, lines) = transport.read_chunk(1).unwrap();
        assert_eq!(lines, vec!["partial"]);
    }

    #[test]
    fn read_line_times_out() {
        let (mut transport, _device) = pair();
        let (_, line) = transport.read_line(Duration::from_millis(5)).unwrap();
        assert_eq!(line, None);
    }

    #[test]
    fn write_line_appends_terminator() {
        let (mut transport, mut device) = pair();
        transport.write_line("~?").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(device.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"~?\n");
    }

    #[test]
    fn closed_transport_fails() {
        let (mut transport, _device) = pair();
        transport.close().unwrap();
        assert!(!transport.is_open());
        let error = transport.write_line("~<").unwrap_err();
        assert_eq!(error.kind(), std::io::ErrorKind::NotConnected);
        assert!(transport.bytes_available().is_err());
        assert!(transport.read_chunk(1).is_err());
        assert!(transport.close().is_err());
    }
}
