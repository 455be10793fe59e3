//! The per-session polling loop.
use std::{
    sync::{Arc, atomic::Ordering},
    thread,
    time::{Duration, Instant, SystemTime},
};

use crossbeam::channel::Sender;
use devlink_protocol::{
    Ask, Header, Packet,
    codec::{ClockSample, decode_data_line},
    error::DecodeError,
};

use crate::{
    LogScope,
    error::{Error, TransportError},
    handshake::DeviceRecord,
    queue::ActivePause,
    session::{Config, ExitReason, Shared},
    transport::Transport,
};

/// Latest device clock, attached to every data packet until the next time-sync line.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub(crate) struct ClockState {
    pub(crate) global_sequence_num: i64,
    pub(crate) device_time: f64,
}

impl From<ClockSample> for ClockState {
    fn from(sample: ClockSample) -> Self {
        ClockState {
            global_sequence_num: sample.global_sequence_num,
            device_time: sample.device_time,
        }
    }
}

pub(crate) struct Worker {
    transport: Transport,
    address: String,
    whoiam: String,
    shared: Arc<Shared>,
    packets: Sender<Packet>,
    // disconnects when the worker is dropped, which is what `Session::join` waits for
    _done: Sender<()>,
    clock: ClockState,
    pause: Option<ActivePause>,
    sequence_num: i64,
    tick: Duration,
    violation_limit: Option<u64>,
    log: LogScope,
}

impl Worker {
    pub(crate) fn new(
        record: DeviceRecord,
        shared: Arc<Shared>,
        packets: Sender<Packet>,
        done: Sender<()>,
        config: &Config,
        log: LogScope,
    ) -> Worker {
        Worker {
            transport: record.transport,
            address: record.address,
            whoiam: record.whoiam,
            shared,
            packets,
            _done: done,
            clock: ClockState::default(),
            pause: None,
            sequence_num: 0,
            tick: Duration::from_secs_f64(1.0 / f64::from(config.tick_rate_hz.max(1))),
            violation_limit: config.violation_limit,
            log,
        }
    }

    pub(crate) fn run(mut self) {
        log::debug!(
            target: self.log.target(),
            "Polling '{}' at '{}'",
            self.whoiam,
            self.address
        );
        while !self.shared.exit.is_set() {
            thread::sleep(self.tick);
            if let Some(reason) = self.poll() {
                self.shared.finish(reason);
                break;
            }
        }
    }

    /// One tick. Returns why the loop has to end, if it has to.
    fn poll(&mut self) -> Option<ExitReason> {
        if !self.transport.is_open() {
            let error = TransportError::closed(self.address.as_str());
            log::error!(target: self.log.target(), "Serial port isn't open for some reason... {}", error);
            return Some(ExitReason::TransportLost(error.to_string()));
        }

        let result = self.check_reads().and_then(|exit| match exit {
            Some(reason) => Ok(Some(reason)),
            None => self.check_writes().map(|()| None),
        });
        match result {
            Ok(exit) => exit,
            Err(e) => {
                log::error!(target: self.log.target(), "{}", e);
                Some(ExitReason::TransportLost(e.to_string()))
            }
        }
    }

    fn check_reads(&mut self) -> Result<Option<ExitReason>, TransportError> {
        let available = self.transport.bytes_available()?;
        if available == 0 && !self.transport.has_pending_lines() {
            return Ok(None);
        }
        let (receive_time, lines) = self.transport.read_chunk(available)?;
        for line in lines {
            if let Some(reason) = self.handle_line(&line, receive_time) {
                return Ok(Some(reason));
            }
        }
        Ok(None)
    }

    /// Classifies one line: time sync, protocol header, then data.
    fn handle_line(&mut self, line: &str, receive_time: SystemTime) -> Option<ExitReason> {
        if let Some(sample) = ClockSample::from_line(line) {
            match sample {
                Ok(sample) => self.clock = sample.into(),
                Err(e) => self.decode_failure(e),
            }
            return None;
        }

        if let Some(header) = Header::protocol_header(line) {
            return self.protocol_packet(header, line);
        }

        if line.is_empty() {
            return None;
        }

        match decode_data_line(line) {
            Ok((name, data)) => {
                let packet = Packet {
                    name: Some(name),
                    data: Some(data),
                    receive_time,
                    timestamp: self.clock.device_time,
                    global_sequence_num: self.clock.global_sequence_num,
                    sequence_num: self.sequence_num,
                };
                self.sequence_num += 1;
                if self.packets.send(packet).is_err() {
                    // the session and its receiver are gone
                    return Some(ExitReason::Requested);
                }
            }
            Err(e) => self.decode_failure(e),
        }
        None
    }

    fn protocol_packet(&self, header: Header, line: &str) -> Option<ExitReason> {
        if header == Header::Stopping {
            log::info!(
                target: self.log.target(),
                "'{}' at '{}' signalled to exit",
                self.whoiam,
                self.address
            );
            return Some(ExitReason::PeerStopped);
        }

        let count = self.shared.violations.fetch_add(1, Ordering::Relaxed) + 1;
        let violation = Error::ProtocolViolation {
            address: self.address.clone(),
            line: line.to_string(),
        };
        log::warn!(target: self.log.target(), "{}", violation);
        match self.violation_limit {
            Some(limit) if count > limit => {
                log::error!(
                    target: self.log.target(),
                    "Stopping '{}' after {} protocol violations",
                    self.whoiam,
                    count
                );
                Some(ExitReason::ViolationLimit(count))
            }
            _ => None,
        }
    }

    fn decode_failure(&self, error: DecodeError) {
        self.shared.decode_failures.fetch_add(1, Ordering::Relaxed);
        log::warn!(
            target: self.log.target(),
            "Skipping line from '{}': {}",
            self.address,
            error
        );
    }

    fn check_writes(&mut self) -> Result<(), TransportError> {
        let (transport, scope) = (&mut self.transport, &self.log);
        let mut writes = self.shared.writes.lock();
        writes.dispatch(&mut self.pause, Instant::now(), SystemTime::now(), |line| {
            log::trace!(target: scope.target(), "Writing {:?}", line);
            transport.write_line(line)
        })?;
        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let reason = if thread::panicking() {
            ExitReason::WorkerPanicked
        } else {
            ExitReason::Requested
        };
        self.shared.finish(reason);

        if self.transport.is_open() {
            if let Err(e) = self
                .transport
                .write_line(Ask::Stop.token())
                .and_then(|()| self.transport.close())
            {
                log::warn!(target: self.log.target(), "Failed to stop '{}': {}", self.address, e);
            }
        }
        log::info!(
            target: self.log.target(),
            "'{}' at '{}' stopped: {}",
            self.whoiam,
            self.address,
            self.shared
                .exit_reason()
                .map(|reason| reason.to_string())
                .unwrap_or_default()
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use devlink_protocol::{MemoryPort, Port, Value};

    fn worker(config: &Config) -> (Worker, MemoryPort, crossbeam::channel::Receiver<Packet>) {
        let (host, device) = MemoryPort::pair("mem0");
        let record = DeviceRecord {
            address: "mem0".to_string(),
            whoiam: "imu".to_string(),
            first_packet: String::new(),
            start_time: None,
            transport: Transport::new(host),
        };
        let (tx, rx) = crossbeam::channel::unbounded();
        let (done, _) = crossbeam::channel::bounded(0);
        let worker = Worker::new(
            record,
            Arc::new(Shared::default()),
            tx,
            done,
            config,
            LogScope::default(),
        );
        (worker, device, rx)
    }

    #[test]
    fn packets_carry_latest_clock() {
        let (mut worker, mut device, packets) = worker(&Config::default());
        device
            .write_all(b"~ct:1:500000:0:7\nnumbers\tdd\t3\t4\t\nx\td\t3\t4\t\n\nnumbers\tdd\t5\t6\t\n")
            .unwrap();
        assert_eq!(worker.poll(), None);

        let first = packets.try_recv().unwrap();
        assert_eq!(first.name.as_deref(), Some("numbers"));
        assert_eq!(first.data, Some(vec![Value::Int(3), Value::Int(4)]));
        assert_eq!(first.global_sequence_num, 7);
        assert_eq!(first.timestamp, ((1u64 << 32) | 500_000) as f64 / 1e6);
        assert_eq!(first.sequence_num, 0);

        // the malformed line in between is skipped
        let second = packets.try_recv().unwrap();
        assert_eq!(second.data, Some(vec![Value::Int(5), Value::Int(6)]));
        assert_eq!(second.sequence_num, 1);
        assert!(packets.try_recv().is_err());
        assert_eq!(worker.shared.decode_failures.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn partial_lines_wait_for_terminator() {
        let (mut worker, mut device, packets) = worker(&Config::default());
        device.write_all(b"numbers\tdd\t3").unwrap();
        assert_eq!(worker.poll(), None);
        assert!(packets.try_recv().is_err());
        device.write_all(b"\t4\t\n").unwrap();
        assert_eq!(worker.poll(), None);
        assert!(packets.try_recv().is_ok());
    }

    #[test]
    fn stop_header_ends_loop() {
        let (mut worker, mut device, _packets) = worker(&Config::default());
        device.write_all(b"\n~stopping\n").unwrap();
        assert_eq!(worker.poll(), Some(ExitReason::PeerStopped));
        assert_eq!(worker.shared.violations.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn violations_are_counted_and_limited() {
        let config = Config {
            violation_limit: Some(1),
            ..Config::default()
        };
        let (mut worker, mut device, _packets) = worker(&config);
        device.write_all(b"~iamimu\n").unwrap();
        assert_eq!(worker.poll(), None);
        device.write_all(b"~hello!\n").unwrap();
        assert_eq!(worker.poll(), Some(ExitReason::ViolationLimit(2)));
        assert_eq!(worker.shared.violations.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn closed_port_is_transport_loss() {
        let (mut worker, mut device, _packets) = worker(&Config::default());
        device.close().unwrap();
        assert!(matches!(worker.poll(), Some(ExitReason::TransportLost(_))));
    }

    #[test]
    fn drop_sends_stop_and_closes() {
        let (worker, mut device, _packets) = worker(&Config::default());
        let shared = Arc::clone(&worker.shared);
        drop(worker);
        assert!(shared.exit.is_set());
        assert_eq!(shared.exit_reason(), Some(ExitReason::Requested));

        let mut buf = [0u8; 8];
        let n = device.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"~<\n");
        assert!(!device.is_open());
    }

    #[test]
    fn writes_respect_pause() {
        let (mut worker, mut device, _packets) = worker(&Config::default());
        {
            let mut writes = worker.shared.writes.lock();
            writes.push(crate::queue::WriteCommand::Line("a".to_string()));
            writes.push(crate::queue::WriteCommand::Pause(
                crate::queue::PauseCommand::relative(Duration::from_secs(60)),
            ));
            writes.push(crate::queue::WriteCommand::Line("b".to_string()));
        }
        assert_eq!(worker.poll(), None);
        assert_eq!(worker.poll(), None);

        let mut buf = [0u8; 8];
        let n = device.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"a\n");
        assert!(worker.pause.is_some());
        assert_eq!(worker.shared.writes.lock().len(), 1);
    }
}
