//! # devlink device
//!
//! The microcontroller side of the devlink protocol. A [`Bridge`] answers the host's
//! handshake asks, honours start and stop, and writes data lines preceded by the
//! time synchronization line the host uses to timestamp them.
//!
//! It runs over any [`Port`], which makes it usable as a device simulator: pair it with
//! the host through [`devlink_protocol::MemoryPort`] to exercise discovery and sessions
//! without hardware.
//!
//! ## Basic Usage
//!
//! ```
//! use devlink_device::{Bridge, Event};
//! use devlink_protocol::{MemoryPort, Port, Value};
//!
//! let (mut host, device) = MemoryPort::pair("mem0");
//! let mut bridge = Bridge::new(device, "lidar");
//! bridge.set_init_data(&[Value::Int(360)]);
//!
//! host.write_all(b"~?\n").unwrap();
//! assert_eq!(bridge.poll().unwrap(), Some(Event::Answered(devlink_protocol::Ask::Whoiam)));
//!
//! host.write_all(b"~>\n").unwrap();
//! assert!(matches!(bridge.poll().unwrap(), Some(Event::Start { .. })));
//! bridge.write("scan", &[Value::Float(1.5)]).unwrap();
//! ```
//!
//! ## Pause State
//!
//! A bridge boots paused. The start ask unpauses it, the stop ask pauses it again and is
//! answered with the stop header only if the bridge was running. While paused, user
//! commands are dropped.
use std::{
    collections::{HashSet, VecDeque},
    io,
    time::Instant,
};

use devlink_protocol::{
    Ask, Header, Port, Value,
    codec::{Framer, encode_data_line, encode_fields, encode_time_line},
};

/// Unix timestamps older than this are not accepted as the host start time (Jan 1 2013).
pub const MIN_HOST_TIME: u64 = 1_357_041_600;

/// What a call to [`Bridge::poll`] handled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// The host started the stream. Carries the host time if it was valid.
    Start { host_time: Option<u64> },
    /// The host stopped the stream.
    Stop,
    /// A handshake ask was answered.
    Answered(Ask),
    /// A user command arrived while running.
    Command(String),
}

pub struct Bridge {
    port: Box<dyn Port>,
    framer: Framer,
    lines: VecDeque<String>,
    whoiam: String,
    init_payload: String,
    paused: bool,
    host_time: Option<u64>,
    boot: Instant,
    prev_timer: u32,
    overflow: u32,
    sequence: u64,
    ignored: HashSet<Ask>,
    received: Vec<String>,
}

impl Bridge {
    pub fn new(port: impl Port + 'static, whoiam: &str) -> Bridge {
        Bridge {
            port: Box::new(port),
            framer: Framer::new(),
            lines: VecDeque::new(),
            whoiam: whoiam.to_string(),
            init_payload: String::new(),
            paused: true,
            host_time: None,
            boot: Instant::now(),
            prev_timer: 0,
            overflow: 0,
            sequence: 0,
            ignored: HashSet::new(),
            received: Vec::new(),
        }
    }

    /// Never answer `ask`. Simulates firmware that misses part of the handshake.
    pub fn ignore(mut self, ask: Ask) -> Bridge {
        self.ignored.insert(ask);
        self
    }

    /// Sets the payload sent in answer to the first packet ask.
    pub fn set_init_data(&mut self, values: &[Value]) {
        self.init_payload = encode_fields(values);
    }

    pub fn whoiam(&self) -> &str {
        &self.whoiam
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Host time received with the last valid start ask.
    pub fn host_time(&self) -> Option<u64> {
        self.host_time
    }

    /// Every line received from the host, in order.
    pub fn received(&self) -> &[String] {
        &self.received
    }

    pub fn port(&self) -> &dyn Port {
        self.port.as_ref()
    }

    /// Handles the next line from the host, waiting up to the port's read timeout for one.
    pub fn poll(&mut self) -> io::Result<Option<Event>> {
        if self.lines.is_empty() {
            let mut buf = [0u8; 256];
            let n = self.port.read(&mut buf)?;
            self.lines.extend(self.framer.push(&buf[..n]));
        }
        match self.lines.pop_front() {
            Some(line) => self.handle(line),
            None => Ok(None),
        }
    }

    fn handle(&mut self, line: String) -> io::Result<Option<Event>> {
        self.received.push(line.clone());
        let Some((ask, argument)) = Ask::parse(&line) else {
            if line.starts_with('~') || self.paused {
                return Ok(None);
            }
            return Ok(Some(Event::Command(line)));
        };
        if self.ignored.contains(&ask) {
            log::debug!("'{}' ignoring {}", self.whoiam, ask);
            return Ok(None);
        }

        let event = match ask {
            Ask::Start => {
                let host_time = argument
                    .trim()
                    .parse::<u64>()
                    .ok()
                    .filter(|t| *t >= MIN_HOST_TIME);
                if host_time.is_some() {
                    self.host_time = host_time;
                }
                self.unpause().then_some(Event::Start { host_time })
            }
            Ask::Stop => self.pause()?.then_some(Event::Stop),
            Ask::Hello => {
                self.write_line(Header::Hello.token())?;
                Some(Event::Answered(ask))
            }
            Ask::Ready => {
                self.write_line(Header::Ready.token())?;
                Some(Event::Answered(ask))
            }
            Ask::Whoiam => {
                let line = format!("{}{}", Header::Whoiam.token(), self.whoiam);
                self.write_line(&line)?;
                Some(Event::Answered(ask))
            }
            Ask::FirstPacket => {
                let line = format!("{}{}", Header::FirstPacket.token(), self.init_payload);
                self.write_line(&line)?;
                Some(Event::Answered(ask))
            }
        };
        Ok(event)
    }

    /// Returns true if the bridge was paused.
    pub fn unpause(&mut self) -> bool {
        std::mem::replace(&mut self.paused, false)
    }

    /// Pauses the bridge and tells the host. Returns false if it already was paused.
    pub fn pause(&mut self) -> io::Result<bool> {
        if self.paused {
            return Ok(false);
        }
        self.port
            .write_all(format!("\n{}\n", Header::Stopping.token()).as_bytes())?;
        self.paused = true;
        Ok(true)
    }

    /// Writes a data packet stamped with the time since the bridge was created.
    pub fn write(&mut self, name: &str, values: &[Value]) -> io::Result<()> {
        let timer = self.boot.elapsed().as_micros() as u32;
        self.write_at(timer, name, values)
    }

    /// Writes a data packet stamped with a raw 32-bit microsecond timer value.
    /// A timer smaller than the previous one counts as an overflow.
    pub fn write_at(&mut self, timer: u32, name: &str, values: &[Value]) -> io::Result<()> {
        self.write_time(timer)?;
        self.write_line(&encode_data_line(name, values))
    }

    fn write_time(&mut self, timer: u32) -> io::Result<()> {
        if timer < self.prev_timer {
            self.overflow += 1;
        }
        let line = encode_time_line(self.overflow, timer, self.sequence);
        self.write_line(&line)?;
        self.prev_timer = timer;
        self.sequence += 1;
        Ok(())
    }

    /// Writes a raw line, terminator added.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(devlink_protocol::PACKET_END);
        self.port.write_all(&bytes)
    }

    pub fn close(&mut self) -> io::Result<()> {
        self.port.close()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use devlink_protocol::{MemoryPort, codec::ClockSample};
    use std::time::Duration;

    fn bridge(whoiam: &str) -> (Bridge, MemoryPort, Framer) {
        let (host, device) = MemoryPort::pair("mem0");
        let device = device.with_read_timeout(Duration::from_millis(2));
        (
            Bridge::new(device, whoiam),
            host.with_read_timeout(Duration::from_millis(2)),
            Framer::new(),
        )
    }

    fn host_lines(host: &mut MemoryPort, framer: &mut Framer) -> Vec<String> {
        let mut buf = [0u8; 512];
        let n = host.read(&mut buf).unwrap();
        framer.push(&buf[..n])
    }

    #[test]
    fn answers_handshake() {
        let (mut bridge, mut host, mut framer) = bridge("imu");
        bridge.set_init_data(&[Value::Int(3), Value::from("x")]);
        host.write_all(b"~!\n~+\n~?\n~|\n").unwrap();
        for ask in [Ask::Hello, Ask::Ready, Ask::Whoiam, Ask::FirstPacket] {
            assert_eq!(bridge.poll().unwrap(), Some(Event::Answered(ask)));
        }
        assert_eq!(
            host_lines(&mut host, &mut framer),
            vec!["~hello!", "~ready!", "~iamimu", "~init:ds\t3\tx\t"]
        );
    }

    #[test]
    fn empty_init_payload() {
        let (mut bridge, mut host, mut framer) = bridge("imu");
        host.write_all(b"~|\n").unwrap();
        bridge.poll().unwrap();
        assert_eq!(host_lines(&mut host, &mut framer), vec!["~init:"]);
    }

    #[test]
    fn start_and_stop() {
        let (mut bridge, mut host, mut framer) = bridge("imu");
        host.write_all(b"cmd\n~<\n~>1700000000\nled\t1\n~>\n~<\n").unwrap();

        // paused: commands and stop are dropped
        assert_eq!(bridge.poll().unwrap(), None);
        assert_eq!(bridge.poll().unwrap(), None);
        assert_eq!(
            bridge.poll().unwrap(),
            Some(Event::Start {
                host_time: Some(1_700_000_000)
            })
        );
        assert_eq!(
            bridge.poll().unwrap(),
            Some(Event::Command("led\t1".to_string()))
        );
        // already running
        assert_eq!(bridge.poll().unwrap(), None);
        assert_eq!(bridge.poll().unwrap(), Some(Event::Stop));
        assert!(bridge.is_paused());
        assert_eq!(bridge.host_time(), Some(1_700_000_000));
        assert_eq!(host_lines(&mut host, &mut framer), vec!["", "~stopping"]);
        assert_eq!(bridge.received().len(), 6);
    }

    #[test]
    fn ignored_ask_gets_no_answer() {
        let (bridge, mut host, mut framer) = bridge("imu");
        let mut bridge = bridge.ignore(Ask::Whoiam);
        host.write_all(b"~?\n").unwrap();
        assert_eq!(bridge.poll().unwrap(), None);
        assert!(host_lines(&mut host, &mut framer).is_empty());
        assert_eq!(bridge.received(), ["~?"]);
    }

    #[test]
    fn data_is_preceded_by_time() {
        let (mut bridge, mut host, mut framer) = bridge("imu");
        bridge.write_at(500_000, "numbers", &[Value::Int(3), Value::Int(4)]).unwrap();
        bridge.write_at(10, "numbers", &[Value::Int(5), Value::Int(6)]).unwrap();

        let lines = host_lines(&mut host, &mut framer);
        assert_eq!(
            lines,
            vec![
                "~ct:0:500000:0:0",
                "numbers\tdd\t3\t4\t",
                "~ct:1:10:0:1",
                "numbers\tdd\t5\t6\t",
            ]
        );
        let sample = ClockSample::from_line(&lines[2]).unwrap().unwrap();
        assert_eq!(sample.global_sequence_num, 1);
        assert_eq!(sample.device_time, ((1u64 << 32) | 10) as f64 / 1e6);
    }
}
