use std::{
    thread,
    time::{Duration, Instant, SystemTime},
};

use devlink_protocol::{Ask, DEFAULT_BAUD_RATE, Header};

use crate::{
    LogScope,
    error::{Error, TransportError},
    transport::Transport,
};

/// How long to sleep while no bytes are waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct Config {
    /// Timeout for the hello, whoiam and first packet steps.
    pub timeout: Duration,
    /// Timeout for the ready step. Devices may take a while to boot.
    pub ready_timeout: Duration,
    /// Delay between opening the port and the first ask.
    pub boot_delay: Duration,
    /// Baud rate every port is opened with.
    pub baud_rate: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(10),
            boot_delay: Duration::from_millis(500),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HandshakeState {
    AwaitHello,
    AwaitReady,
    AwaitWhoiam,
    AwaitFirstPacket,
    Ready,
    Failed,
}

/// A device that completed the handshake. Owned by the registry until a session claims it.
#[derive(Debug)]
pub struct DeviceRecord {
    pub(crate) address: String,
    pub(crate) whoiam: String,
    pub(crate) first_packet: String,
    pub(crate) start_time: Option<SystemTime>,
    pub(crate) transport: Transport,
}

impl DeviceRecord {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn whoiam(&self) -> &str {
        &self.whoiam
    }

    /// Initialization payload, `format\tfield\t...\t`. Empty if the device sent none.
    pub fn first_packet(&self) -> &str {
        &self.first_packet
    }

    /// When the port first produced data.
    pub fn start_time(&self) -> Option<SystemTime> {
        self.start_time
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }
}

/// Drives a freshly opened port through hello, ready, whoiam and first packet.
///
/// Each step sends its ask and waits for a line starting with the expected header.
/// A device that missed the ask gets a stop token and the ask again every fifth of
/// the step timeout.
pub struct Handshake {
    transport: Transport,
    config: Config,
    log: LogScope,
    state: HandshakeState,
    start_time: Option<SystemTime>,
    whoiam: Option<String>,
    first_packet: Option<String>,
    // header of the step that timed out, if a timeout is what failed it
    failed_on: Option<Header>,
}

impl Handshake {
    pub fn new(transport: Transport, config: Config, log: LogScope) -> Handshake {
        Handshake {
            transport,
            config,
            log,
            state: HandshakeState::AwaitHello,
            start_time: None,
            whoiam: None,
            first_packet: None,
            failed_on: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn address(&self) -> &str {
        self.transport.address()
    }

    /// Runs every remaining step. On failure the transport is closed.
    pub fn run(mut self) -> Result<DeviceRecord, Error> {
        if !self.config.boot_delay.is_zero() {
            thread::sleep(self.config.boot_delay);
        }
        while self.state != HandshakeState::Ready {
            self.step()?;
        }
        self.into_record()
    }

    /// Performs the step for the current state and returns the new state.
    /// A failed handshake keeps returning the error it failed with.
    pub fn step(&mut self) -> Result<HandshakeState, Error> {
        let (ask, header, timeout, next) = match self.state {
            HandshakeState::AwaitHello => (
                Ask::Hello,
                Header::Hello,
                self.config.timeout,
                HandshakeState::AwaitReady,
            ),
            HandshakeState::AwaitReady => (
                Ask::Ready,
                Header::Ready,
                self.config.ready_timeout,
                HandshakeState::AwaitWhoiam,
            ),
            HandshakeState::AwaitWhoiam => (
                Ask::Whoiam,
                Header::Whoiam,
                self.config.timeout,
                HandshakeState::AwaitFirstPacket,
            ),
            HandshakeState::AwaitFirstPacket => (
                Ask::FirstPacket,
                Header::FirstPacket,
                self.config.timeout,
                HandshakeState::Ready,
            ),
            HandshakeState::Ready => return Ok(self.state),
            HandshakeState::Failed => {
                return Err(match self.failed_on {
                    Some(header) => self.timeout_error(header),
                    None => TransportError::closed(self.address()).into(),
                });
            }
        };

        let payload = match self.exchange(ask, header, timeout) {
            Ok(payload) => payload,
            Err(e) => {
                self.state = HandshakeState::Failed;
                if matches!(e, Error::ProtocolTimeout { .. }) {
                    self.failed_on = Some(header);
                }
                if self.transport.is_open() {
                    let _ = self.transport.close();
                }
                return Err(e);
            }
        };

        match self.state {
            HandshakeState::AwaitHello => {
                log::debug!(target: self.log.target(), "'{}' said hello!", self.address())
            }
            HandshakeState::AwaitReady => {
                log::debug!(target: self.log.target(), "'{}' said ready!", self.address())
            }
            HandshakeState::AwaitWhoiam => {
                log::debug!(
                    target: self.log.target(),
                    "Found ID '{}' at address '{}'",
                    payload,
                    self.address()
                );
                self.whoiam = Some(payload);
            }
            HandshakeState::AwaitFirstPacket => {
                log::debug!(
                    target: self.log.target(),
                    "Received initialization data from '{}': {:?}",
                    self.address(),
                    payload
                );
                self.first_packet = Some(payload);
            }
            HandshakeState::Ready | HandshakeState::Failed => {}
        }
        self.state = next;
        Ok(next)
    }

    /// Consumes a handshake that reached [`HandshakeState::Ready`].
    pub fn into_record(self) -> Result<DeviceRecord, Error> {
        // the first header never answered is the one to report
        let header = match (self.state, &self.whoiam, &self.first_packet) {
            (HandshakeState::Ready, Some(_), Some(_)) => None,
            (HandshakeState::Failed, _, _) => Some(self.failed_on.unwrap_or(Header::Hello)),
            (HandshakeState::AwaitHello, _, _) => Some(Header::Hello),
            (HandshakeState::AwaitReady, _, _) => Some(Header::Ready),
            (_, None, _) => Some(Header::Whoiam),
            _ => Some(Header::FirstPacket),
        };
        if let Some(header) = header {
            return Err(self.timeout_error(header));
        }
        match (self.whoiam, self.first_packet) {
            (Some(whoiam), Some(first_packet)) => Ok(DeviceRecord {
                address: self.transport.address().to_string(),
                whoiam,
                first_packet,
                start_time: self.start_time,
                transport: self.transport,
            }),
            _ => Err(TransportError::closed(self.transport.address()).into()),
        }
    }

    fn timeout_for(&self, header: Header) -> Duration {
        match header {
            Header::Ready => self.config.ready_timeout,
            _ => self.config.timeout,
        }
    }

    fn timeout_error(&self, header: Header) -> Error {
        Error::ProtocolTimeout {
            header,
            address: self.address().to_string(),
            timeout: self.timeout_for(header),
        }
    }

    /// Sends `ask` and waits for a line starting with `header`.
    /// Returns the rest of that line.
    fn exchange(&mut self, ask: Ask, header: Header, timeout: Duration) -> Result<String, Error> {
        log::debug!(
            target: self.log.target(),
            "Checking '{}' protocol at '{}'",
            ask,
            self.address()
        );
        self.transport.write_line(ask.token())?;

        let start = Instant::now();
        let resend_interval = timeout / 5;
        let mut next_resend = start + resend_interval;

        loop {
            if self.transport.has_pending_lines() || self.transport.bytes_available()? > 0 {
                if self.start_time.is_none() {
                    self.start_time = Some(SystemTime::now());
                }
                let wait = resend_interval.min(timeout.saturating_sub(start.elapsed()));
                let (_, line) = self.transport.read_line(wait)?;
                match line {
                    Some(line) if line.is_empty() => {
                        log::debug!(
                            target: self.log.target(),
                            "Empty packet from '{}'! Contained only \\n",
                            self.address()
                        );
                    }
                    Some(line) => {
                        if let Some(payload) = header.strip(&line) {
                            return Ok(payload.to_string());
                        }
                        log::debug!(
                            target: self.log.target(),
                            "Got packet {:?} from '{}' while waiting for '{}'",
                            line,
                            self.address(),
                            header
                        );
                    }
                    None => {}
                }
            } else {
                thread::sleep(POLL_INTERVAL);
            }

            let now = Instant::now();
            if now.duration_since(start) > timeout {
                return Err(self.timeout_error(header));
            }
            if now >= next_resend {
                log::debug!(
                    target: self.log.target(),
                    "Writing '{}' again to '{}'",
                    ask,
                    self.address()
                );
                self.transport.write_line(Ask::Stop.token())?;
                self.transport.write_line(ask.token())?;
                next_resend += resend_interval;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crossbeam::channel::{self, Receiver};
    use devlink_protocol::{MemoryPort, Port, codec::Framer};

    fn fast_config() -> Config {
        Config {
            timeout: Duration::from_millis(100),
            ready_timeout: Duration::from_millis(200),
            boot_delay: Duration::ZERO,
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }

    /// Answers every ask except `ignore`, reports what it received.
    fn responder(
        port: MemoryPort,
        whoiam: &'static str,
        ignore: Option<Ask>,
    ) -> Receiver<String> {
        responder_delayed(port, whoiam, ignore, Duration::ZERO)
    }

    /// Like [`responder`], but stays silent for `delay` first.
    fn responder_delayed(
        mut port: MemoryPort,
        whoiam: &'static str,
        ignore: Option<Ask>,
        delay: Duration,
    ) -> Receiver<String> {
        let (tx, rx) = channel::unbounded();
        thread::spawn(move || {
            thread::sleep(delay);
            let mut framer = Framer::new();
            let mut buf = [0u8; 64];
            while let Ok(n) = port.read(&mut buf) {
                for line in framer.push(&buf[..n]) {
                    let _ = tx.send(line.clone());
                    let reply = match Ask::parse(&line) {
                        Some((ask, _)) if Some(ask) == ignore => continue,
                        Some((Ask::Hello, _)) => "~hello!".to_string(),
                        Some((Ask::Ready, _)) => "~ready!".to_string(),
                        Some((Ask::Whoiam, _)) => format!("~iam{}", whoiam),
                        Some((Ask::FirstPacket, _)) => "~init:dd\t1\t2\t".to_string(),
                        _ => continue,
                    };
                    // blank line first, the host must skip it
                    if port.write_all(format!("\n{}\n", reply).as_bytes()).is_err() {
                        return;
                    }
                }
            }
        });
        rx
    }

    #[test]
    fn completes_all_steps_in_order() {
        let (host, device) = MemoryPort::pair("mem0");
        let received = responder(device, "lidar", None);

        let config = Config {
            timeout: Duration::from_secs(2),
            ready_timeout: Duration::from_secs(2),
            ..fast_config()
        };
        let mut handshake = Handshake::new(Transport::new(host), config, LogScope::default());
        assert_eq!(handshake.state(), HandshakeState::AwaitHello);
        assert_eq!(handshake.step().unwrap(), HandshakeState::AwaitReady);
        let record = handshake.run().unwrap();

        assert_eq!(record.whoiam(), "lidar");
        assert_eq!(record.first_packet(), "dd\t1\t2\t");
        assert_eq!(record.address(), "mem0");
        assert!(record.start_time().is_some());
        assert!(record.transport().is_open());

        let asks: Vec<String> = received.try_iter().collect();
        assert_eq!(asks, vec!["~!", "~+", "~?", "~|"]);
    }

    #[test]
    fn silent_step_times_out_and_closes() {
        let (host, device) = MemoryPort::pair("mem1");
        let received = responder(device, "imu", Some(Ask::Whoiam));

        let handshake = Handshake::new(Transport::new(host), fast_config(), LogScope::default());
        let error = handshake.run().unwrap_err();
        match error {
            Error::ProtocolTimeout { header, address, .. } => {
                assert_eq!(header, Header::Whoiam);
                assert_eq!(address, "mem1");
            }
            other => panic!("unexpected error {}", other),
        }

        // the ask was repeated after a stop token
        let lines: Vec<String> = received.try_iter().collect();
        let whoiam_asks = lines.iter().filter(|l| *l == "~?").count();
        assert!(whoiam_asks > 1, "{:?}", lines);
        assert!(lines.iter().any(|l| l == "~<"));
    }

    #[test]
    fn silent_port_fails_on_hello() {
        let (host, device) = MemoryPort::pair("mem2");
        let mut handshake = Handshake::new(Transport::new(host), fast_config(), LogScope::default());
        assert!(matches!(
            handshake.step(),
            Err(Error::ProtocolTimeout {
                header: Header::Hello,
                ..
            })
        ));
        assert_eq!(handshake.state(), HandshakeState::Failed);
        assert!(!device.is_open());
    }

    #[test]
    fn failed_handshake_stays_failed() {
        let (host, _device) = MemoryPort::pair("mem3");
        let mut handshake = Handshake::new(Transport::new(host), fast_config(), LogScope::default());
        assert!(handshake.step().is_err());

        // a second step or a full run must not retry or spin
        let (tx, rx) = channel::bounded(1);
        thread::spawn(move || {
            let again = handshake.step();
            let _ = tx.send((again, handshake.run()));
        });
        let (again, run) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(
            again,
            Err(Error::ProtocolTimeout {
                header: Header::Hello,
                ..
            })
        ));
        assert!(matches!(
            run,
            Err(Error::ProtocolTimeout {
                header: Header::Hello,
                ..
            })
        ));
    }

    #[test]
    fn ready_timeout_is_reported_for_ready() {
        let (host, device) = MemoryPort::pair("mem4");
        let _received = responder(device, "imu", Some(Ask::Ready));

        let handshake = Handshake::new(Transport::new(host), fast_config(), LogScope::default());
        match handshake.run().unwrap_err() {
            Error::ProtocolTimeout {
                header, timeout, ..
            } => {
                assert_eq!(header, Header::Ready);
                assert_eq!(timeout, fast_config().ready_timeout);
            }
            other => panic!("unexpected error {}", other),
        }
    }

    #[test]
    fn start_time_is_first_data() {
        let (host, device) = MemoryPort::pair("mem5");
        let delay = Duration::from_millis(150);
        let constructed = SystemTime::now();
        let _received = responder_delayed(device, "imu", None, delay);

        let config = Config {
            timeout: Duration::from_secs(2),
            ready_timeout: Duration::from_secs(2),
            ..fast_config()
        };
        let record = Handshake::new(Transport::new(host), config, LogScope::default())
            .run()
            .unwrap();
        let start_time = record.start_time().unwrap();
        assert!(start_time >= constructed + delay, "{:?}", start_time);
    }
}
