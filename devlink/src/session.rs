use std::{
    fmt::Display,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use devlink_protocol::{Ask, DEFAULT_BAUD_RATE, Packet, codec::decode_first_packet};
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::{
    ExitSignal, LogScope,
    error::Error,
    handshake::DeviceRecord,
    queue::{PauseCommand, WriteCommand, WriteQueue},
    registry::Registry,
    worker::Worker,
};

/// Where the session worker runs. Both backends run the same loop over the same queues.
#[derive(Debug, Clone, Default)]
pub enum WorkerBackend {
    /// A dedicated OS thread named after the device.
    #[default]
    Thread,
    /// A blocking task on an existing tokio runtime.
    Tokio(Handle),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Baud rate to switch to after the start token. No switch if it is the boot rate.
    pub baud_rate: u32,
    /// Worker loop iterations per second.
    pub tick_rate_hz: u32,
    /// Delay between the start token and the baud rate switch.
    pub baud_settle: Duration,
    /// Timeout used by [`Session::recv`].
    pub read_timeout: Duration,
    /// Ends the session once more misplaced protocol headers than this were received.
    /// `None` only counts them.
    pub violation_limit: Option<u64>,
    pub backend: WorkerBackend,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            tick_rate_hz: 1000,
            baud_settle: Duration::from_millis(10),
            read_timeout: Duration::from_secs(1),
            violation_limit: None,
            backend: WorkerBackend::Thread,
        }
    }
}

/// Builder to create a [Session] and modify configuration options
///
/// # Example
///
/// ```ignore
/// use devlink::session::Session;
///
/// let mut lidar = Session::builder()
///     .baud_rate(230_400)
///     .violation_limit(Some(10))
///     .build(&registry, "lidar");
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.config.baud_rate = baud_rate;
        self
    }

    pub fn tick_rate_hz(mut self, hz: u32) -> Self {
        self.config.tick_rate_hz = hz;
        self
    }

    pub fn baud_settle(mut self, delay: Duration) -> Self {
        self.config.baud_settle = delay;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn violation_limit(mut self, limit: Option<u64>) -> Self {
        self.config.violation_limit = limit;
        self
    }

    pub fn backend(mut self, backend: WorkerBackend) -> Self {
        self.config.backend = backend;
        self
    }

    /// Build the session. Nothing is claimed until [`Session::start`].
    pub fn build<'r>(self, registry: &'r Registry, whoiam: &str) -> Session<'r> {
        Session::new(registry, whoiam, self.config)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionState {
    NotStarted,
    Running,
    Stopped,
}

/// Why a session worker ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExitReason {
    /// [`Session::stop`] was called or the session was dropped.
    Requested,
    /// The device sent the stop header.
    PeerStopped,
    /// The port failed or closed underneath the session.
    TransportLost(String),
    /// More misplaced protocol headers arrived than the configured limit.
    ViolationLimit(u64),
    WorkerPanicked,
}

impl Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Requested => write!(f, "stop requested"),
            ExitReason::PeerStopped => write!(f, "device signalled to stop"),
            ExitReason::TransportLost(e) => write!(f, "transport lost: {}", e),
            ExitReason::ViolationLimit(n) => write!(f, "{} protocol violations", n),
            ExitReason::WorkerPanicked => write!(f, "worker panicked"),
        }
    }
}

/// State shared between a session and its worker.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub(crate) exit: ExitSignal,
    pub(crate) writes: Mutex<WriteQueue>,
    pub(crate) violations: AtomicU64,
    pub(crate) decode_failures: AtomicU64,
    exit_reason: Mutex<Option<ExitReason>>,
}

impl Shared {
    /// Records the first exit reason and raises the exit signal.
    pub(crate) fn finish(&self, reason: ExitReason) {
        self.exit_reason.lock().get_or_insert(reason);
        self.exit.set();
    }

    pub(crate) fn exit_reason(&self) -> Option<ExitReason> {
        self.exit_reason.lock().clone()
    }
}

/// One claimed device and its background worker.
///
/// Packets are read from an unbounded queue filled by the worker. Commands are written
/// to a queue the worker drains every tick, see [`PauseCommand`] for delaying them.
pub struct Session<'r> {
    registry: &'r Registry,
    whoiam: String,
    config: Config,
    log: LogScope,
    shared: Arc<Shared>,
    started: bool,
    packets: Option<Receiver<Packet>>,
    done: Option<Receiver<()>>,
    address: Option<String>,
    start_time: Option<SystemTime>,
    first_packet: Option<Packet>,
}

impl<'r> Session<'r> {
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Creates a session for the device identified by `whoiam`. Its exit signal is
    /// registered with `registry` right away.
    pub fn new(registry: &'r Registry, whoiam: &str, config: Config) -> Session<'r> {
        let shared = Arc::new(Shared::default());
        registry.register_exit_signal(shared.exit.clone());
        Session {
            registry,
            whoiam: whoiam.to_string(),
            config,
            log: registry.log().clone(),
            shared,
            started: false,
            packets: None,
            done: None,
            address: None,
            start_time: None,
            first_packet: None,
        }
    }

    /// Claims a device, sends the start token and launches the worker.
    ///
    /// Returns the initialization packet the device sent during the handshake. Its data
    /// is `None` if the device sent no initialization payload.
    pub fn start(&mut self) -> Result<Packet, Error> {
        if self.started || self.shared.exit.is_set() {
            log::warn!(target: self.log.target(), "Start already called for '{}'", self.whoiam);
            return Err(Error::AlreadyStarted {
                identity: self.whoiam.clone(),
            });
        }

        let mut record = self.registry.claim(&self.whoiam)?;
        self.started = true;
        if let Err(e) = self.begin_stream(&mut record) {
            // the worker never ran, clean up in its place
            self.shared.finish(ExitReason::TransportLost(e.to_string()));
            let _ = record.transport.close();
            return Err(e);
        }

        let first_packet = self.build_first_packet(&record);
        self.address = Some(record.address.clone());
        self.start_time = Some(record.start_time.unwrap_or_else(SystemTime::now));
        self.first_packet = Some(first_packet.clone());

        let (packet_tx, packet_rx) = channel::unbounded();
        let (done_tx, done_rx) = channel::bounded(0);
        self.packets = Some(packet_rx);
        self.done = Some(done_rx);

        let worker = Worker::new(
            record,
            Arc::clone(&self.shared),
            packet_tx,
            done_tx,
            &self.config,
            self.log.clone(),
        );
        match &self.config.backend {
            WorkerBackend::Thread => {
                thread::Builder::new()
                    .name(format!("devlink-{}", self.whoiam))
                    .spawn(move || worker.run())
                    .map_err(Error::WorkerSpawn)?;
            }
            WorkerBackend::Tokio(handle) => {
                drop(handle.spawn_blocking(move || worker.run()));
            }
        }
        log::info!(
            target: self.log.target(),
            "Started '{}' at '{}'",
            self.whoiam,
            self.address.as_deref().unwrap_or_default()
        );
        Ok(first_packet)
    }

    /// Sends the start token and switches the baud rate if the session asks for a new one.
    fn begin_stream(&self, record: &mut DeviceRecord) -> Result<(), Error> {
        let start_secs = record
            .start_time
            .unwrap_or_else(SystemTime::now)
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        record
            .transport
            .write_line(&format!("{}{}", Ask::Start.token(), start_secs))?;

        if self.config.baud_rate != record.transport.baud_rate() {
            thread::sleep(self.config.baud_settle);
            record.transport.set_baud_rate(self.config.baud_rate)?;
            log::info!(
                target: self.log.target(),
                "Device named '{}' at '{}' is now at baud rate '{}'",
                record.whoiam,
                record.address,
                self.config.baud_rate
            );
        }
        Ok(())
    }

    fn build_first_packet(&self, record: &DeviceRecord) -> Packet {
        let data = if record.first_packet.is_empty() {
            None
        } else {
            match decode_first_packet(&record.first_packet) {
                Ok(values) => Some(values),
                Err(e) => {
                    self.shared.decode_failures.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        target: self.log.target(),
                        "Invalid initialization data from '{}': {}",
                        record.address,
                        e
                    );
                    None
                }
            }
        };
        Packet {
            name: Some(Packet::FIRST_PACKET_NAME.to_string()),
            data,
            receive_time: SystemTime::now(),
            timestamp: 0.0,
            global_sequence_num: -1,
            sequence_num: -1,
        }
    }

    /// Takes the next packet from the read queue.
    ///
    /// Without `block` only an already queued packet is returned. With `block` the call
    /// waits up to `timeout`, or until the worker exits if `timeout` is `None`.
    /// Returns [`Packet::null`] if nothing arrived.
    pub fn read(&self, block: bool, timeout: Option<Duration>) -> Packet {
        let Some(packets) = &self.packets else {
            return Packet::null();
        };
        let packet = match (block, timeout) {
            (false, _) => packets.try_recv().ok(),
            (true, None) => packets.recv().ok(),
            (true, Some(timeout)) => match packets.recv_timeout(timeout) {
                Ok(packet) => Some(packet),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
            },
        };
        packet.unwrap_or_else(Packet::null)
    }

    /// Blocking read with the configured read timeout.
    pub fn recv(&self) -> Packet {
        self.read(true, Some(self.config.read_timeout))
    }

    pub fn is_empty(&self) -> bool {
        self.packets.as_ref().is_none_or(Receiver::is_empty)
    }

    /// Queues a command line. The terminator is added when it is sent.
    pub fn write(&self, command: impl Into<String>) {
        self.shared.writes.lock().push(WriteCommand::Line(command.into()));
    }

    /// Queues a pause. Commands queued after it wait until it expires.
    pub fn write_pause(&self, pause: PauseCommand) {
        self.shared.writes.lock().push(WriteCommand::Pause(pause));
    }

    /// Discards every queued command. Returns how many were dropped.
    pub fn clear_write_queue(&self) -> usize {
        let cleared = self.shared.writes.lock().clear();
        if !cleared.is_empty() {
            log::debug!(target: self.log.target(), "Clearing write queue for '{}'", self.whoiam);
            for command in &cleared {
                log::debug!(target: self.log.target(), "Cleared command: {:?}", command);
            }
        }
        cleared.len()
    }

    /// Signals the worker to stop after its current tick.
    pub fn stop(&self) {
        self.shared.exit.set();
    }

    /// Waits until the worker finished its cleanup. Returns false on timeout.
    /// Returns true right away for a session that never started.
    pub fn join(&self, timeout: Duration) -> bool {
        match &self.done {
            Some(done) => !matches!(done.recv_timeout(timeout), Err(RecvTimeoutError::Timeout)),
            None => true,
        }
    }

    pub fn state(&self) -> SessionState {
        if self.shared.exit.is_set() {
            SessionState::Stopped
        } else if self.started {
            SessionState::Running
        } else {
            SessionState::NotStarted
        }
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.shared.exit_reason()
    }

    /// Misplaced protocol headers received so far.
    pub fn violations(&self) -> u64 {
        self.shared.violations.load(Ordering::Relaxed)
    }

    /// Lines that failed to decode and were skipped.
    pub fn decode_failures(&self) -> u64 {
        self.shared.decode_failures.load(Ordering::Relaxed)
    }

    pub fn whoiam(&self) -> &str {
        &self.whoiam
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn start_time(&self) -> Option<SystemTime> {
        self.start_time
    }

    /// The packet returned by [`Session::start`].
    pub fn first_packet(&self) -> Option<&Packet> {
        self.first_packet.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if self.started {
            self.stop();
        }
    }
}
