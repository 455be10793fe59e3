//! Byte level access to a device link.
//!
//! [`Port`] is the seam between the protocol engine and the operating system:
//! the host crate implements it for serial ports, and [`MemoryPort`] provides an
//! in-process duplex pair for simulation and tests.
use std::{
    collections::VecDeque,
    io,
    sync::{
        Arc, Condvar, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use crate::protocol::DEFAULT_BAUD_RATE;

/// Raw byte I/O over an open link to a device.
pub trait Port: Send {
    /// The address the port was opened with, e.g. `/dev/ttyACM0`.
    fn name(&self) -> &str;

    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Number of bytes that can be read without blocking.
    fn bytes_to_read(&mut self) -> io::Result<usize>;

    /// Reads at most `buf.len()` bytes.
    /// Blocks up to the port's read timeout and returns `Ok(0)` if nothing arrived.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()>;

    fn baud_rate(&self) -> u32;

    fn is_open(&self) -> bool;

    fn close(&mut self) -> io::Result<()>;
}

impl<P: Port + ?Sized> Port for Box<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).write_all(data)
    }

    fn bytes_to_read(&mut self) -> io::Result<usize> {
        (**self).bytes_to_read()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()> {
        (**self).set_baud_rate(baud_rate)
    }

    fn baud_rate(&self) -> u32 {
        (**self).baud_rate()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

#[derive(Default)]
struct Pipe {
    bytes: Mutex<VecDeque<u8>>,
    readable: Condvar,
}

impl Pipe {
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<u8>> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One end of an in-memory duplex link.
///
/// Bytes written to one end become readable on the other. Closing either end
/// closes the link for both; bytes already in flight can still be drained.
/// The baud rate belongs to the link, so a change on one end shows on the other.
pub struct MemoryPort {
    name: String,
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
    open: Arc<AtomicBool>,
    read_timeout: Duration,
    baud_rate: Arc<AtomicU32>,
}

impl MemoryPort {
    /// Creates a connected pair. The first end is usually handed to the host,
    /// the second to a simulated device.
    pub fn pair(name: impl Into<String>) -> (MemoryPort, MemoryPort) {
        let name = name.into();
        let a = Arc::new(Pipe::default());
        let b = Arc::new(Pipe::default());
        let open = Arc::new(AtomicBool::new(true));
        let baud_rate = Arc::new(AtomicU32::new(DEFAULT_BAUD_RATE));
        let read_timeout = Duration::from_millis(10);
        (
            MemoryPort {
                name: name.clone(),
                rx: Arc::clone(&a),
                tx: Arc::clone(&b),
                open: Arc::clone(&open),
                read_timeout,
                baud_rate: Arc::clone(&baud_rate),
            },
            MemoryPort {
                name,
                rx: b,
                tx: a,
                open,
                read_timeout,
                baud_rate,
            },
        )
    }

    /// Sets how long [`Port::read`] waits for data before returning `Ok(0)`.
    pub fn with_read_timeout(mut self, timeout: Duration) -> MemoryPort {
        self.read_timeout = timeout;
        self
    }

    fn closed() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "memory port is closed")
    }
}

impl Port for MemoryPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        if !self.is_open() {
            return Err(MemoryPort::closed());
        }
        self.tx.lock().extend(data);
        self.tx.readable.notify_all();
        Ok(())
    }

    fn bytes_to_read(&mut self) -> io::Result<usize> {
        let pending = self.rx.lock().len();
        if pending == 0 && !self.is_open() {
            return Err(MemoryPort::closed());
        }
        Ok(pending)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.read_timeout;
        let mut bytes = self.rx.lock();
        while bytes.is_empty() {
            if !self.is_open() {
                return Err(MemoryPort::closed());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(0);
            }
            bytes = self
                .rx
                .readable
                .wait_timeout(bytes, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        let n = buf.len().min(bytes.len());
        for (slot, byte) in buf.iter_mut().zip(bytes.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()> {
        if !self.is_open() {
            return Err(MemoryPort::closed());
        }
        self.baud_rate.store(baud_rate, Ordering::Release);
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate.load(Ordering::Acquire)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&mut self) -> io::Result<()> {
        self.open.store(false, Ordering::Release);
        self.rx.readable.notify_all();
        self.tx.readable.notify_all();
        Ok(())
    }
}
