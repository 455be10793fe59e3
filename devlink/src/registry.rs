use std::{
    collections::{HashMap, VecDeque},
    thread,
};

use devlink_protocol::{Ask, Port};
use parking_lot::Mutex;

use crate::{
    ExitSignal, LogScope,
    error::{Error, TransportError},
    handshake::{self, DeviceRecord, Handshake},
    transport::Transport,
};

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub handshake: handshake::Config,
    /// Log target used by the registry and every session created from it.
    pub log: LogScope,
}

/// Pools of identified devices keyed by whoiam ID.
///
/// Devices sharing an ID are handed out in the order their handshake completed.
/// The registry also remembers the exit signal of every session created from it,
/// which makes [`Registry::ok`] an aggregate liveness check.
#[derive(Debug)]
pub struct Registry {
    ports: Mutex<HashMap<String, VecDeque<DeviceRecord>>>,
    exit_signals: Mutex<Vec<ExitSignal>>,
    log: LogScope,
}

impl Registry {
    /// Opens every address with `opener` and runs the handshake on all of them in parallel.
    ///
    /// Addresses that fail to open or to complete the handshake are logged and skipped.
    /// Returns once every attempt finished.
    pub fn discover<A, F>(addresses: &[A], opener: F, config: Config) -> Result<Registry, Error>
    where
        A: AsRef<str> + Sync,
        F: Fn(&str, u32) -> Result<Box<dyn Port>, TransportError> + Sync,
    {
        if addresses.is_empty() {
            log::error!(target: config.log.target(), "No addresses to probe for devices");
            return Err(Error::NoDevices);
        }

        let registry = Registry::new(config.log.clone());
        thread::scope(|scope| {
            for address in addresses {
                let address = address.as_ref();
                let (registry, opener, config) = (&registry, &opener, &config);
                scope.spawn(move || {
                    match Registry::probe(address, opener, config) {
                        Ok(record) => {
                            log::info!(
                                target: registry.log.target(),
                                "Found '{}' at '{}'",
                                record.whoiam,
                                record.address
                            );
                            registry.insert(record);
                        }
                        Err(e) => {
                            log::warn!(target: registry.log.target(), "Skipping '{}': {}", address, e)
                        }
                    };
                });
            }
        });

        let identities = registry.identities();
        if identities.is_empty() {
            log::warn!(target: registry.log.target(), "No devices completed the handshake");
        } else {
            log::info!(target: registry.log.target(), "Discovered devices: {:?}", identities);
        }
        Ok(registry)
    }

    fn probe<F>(address: &str, opener: &F, config: &Config) -> Result<DeviceRecord, Error>
    where
        F: Fn(&str, u32) -> Result<Box<dyn Port>, TransportError>,
    {
        let port = opener(address, config.handshake.baud_rate)?;
        let transport = Transport::from_boxed(port);
        Handshake::new(transport, config.handshake.clone(), config.log.clone()).run()
    }

    pub fn new(log: LogScope) -> Registry {
        Registry {
            ports: Mutex::new(HashMap::new()),
            exit_signals: Mutex::new(Vec::new()),
            log,
        }
    }

    /// Builds a registry from records that already completed the handshake, in order.
    pub fn from_records(records: impl IntoIterator<Item = DeviceRecord>, log: LogScope) -> Registry {
        let registry = Registry::new(log);
        for record in records {
            registry.insert(record);
        }
        registry
    }

    fn insert(&self, record: DeviceRecord) {
        self.ports
            .lock()
            .entry(record.whoiam.clone())
            .or_default()
            .push_back(record);
    }

    /// Removes and returns the earliest discovered unclaimed record for `identity`.
    pub fn claim(&self, identity: &str) -> Result<DeviceRecord, Error> {
        let mut ports = self.ports.lock();
        match ports.get_mut(identity) {
            Some(pool) => pool.pop_front().ok_or_else(|| Error::ExhaustedPool {
                identity: identity.to_string(),
            }),
            None => {
                let mut known: Vec<String> = ports.keys().cloned().collect();
                known.sort();
                Err(Error::UnknownIdentity {
                    identity: identity.to_string(),
                    known,
                })
            }
        }
    }

    /// IDs that still have unclaimed devices, sorted.
    pub fn identities(&self) -> Vec<String> {
        let mut identities: Vec<String> = self
            .ports
            .lock()
            .iter()
            .filter(|(_, pool)| !pool.is_empty())
            .map(|(identity, _)| identity.clone())
            .collect();
        identities.sort();
        identities
    }

    /// Number of unclaimed devices with `identity`.
    pub fn available(&self, identity: &str) -> usize {
        self.ports.lock().get(identity).map_or(0, VecDeque::len)
    }

    pub fn register_exit_signal(&self, signal: ExitSignal) {
        self.exit_signals.lock().push(signal);
    }

    /// True while no session created from this registry has exited.
    pub fn ok(&self) -> bool {
        self.exit_signals.lock().iter().all(|signal| !signal.is_set())
    }

    /// Stops every session and closes every unclaimed device.
    pub fn stop_all(&self) {
        for signal in self.exit_signals.lock().iter() {
            signal.set();
        }

        let mut ports = self.ports.lock();
        for record in ports.values_mut().flat_map(|pool| pool.drain(..)) {
            let mut transport = record.transport;
            if !transport.is_open() {
                continue;
            }
            if let Err(e) = transport
                .write_line(Ask::Stop.token())
                .and_then(|()| transport.close())
            {
                log::warn!(target: self.log.target(), "Failed to stop '{}': {}", record.address, e);
            } else {
                log::debug!(target: self.log.target(), "Closed unclaimed '{}'", record.address);
            }
        }
    }

    pub fn log(&self) -> &LogScope {
        &self.log
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use devlink_protocol::MemoryPort;

    fn record(whoiam: &str, address: &str) -> (DeviceRecord, MemoryPort) {
        let (host, device) = MemoryPort::pair(address);
        let record = DeviceRecord {
            address: address.to_string(),
            whoiam: whoiam.to_string(),
            first_packet: String::new(),
            start_time: None,
            transport: Transport::new(host),
        };
        (record, device)
    }

    #[test]
    fn claims_in_discovery_order() {
        let (first, _d1) = record("lidar", "/dev/ttyACM0");
        let (second, _d2) = record("lidar", "/dev/ttyACM1");
        let registry = Registry::from_records([first, second], LogScope::default());

        assert_eq!(registry.available("lidar"), 2);
        assert_eq!(registry.claim("lidar").unwrap().address(), "/dev/ttyACM0");
        assert_eq!(registry.claim("lidar").unwrap().address(), "/dev/ttyACM1");
        assert!(matches!(
            registry.claim("lidar"),
            Err(Error::ExhaustedPool { identity }) if identity == "lidar"
        ));
        assert!(registry.identities().is_empty());
    }

    #[test]
    fn unknown_identity_lists_known() {
        let (imu, _d1) = record("imu", "mem0");
        let (gps, _d2) = record("gps", "mem1");
        let registry = Registry::from_records([imu, gps], LogScope::default());

        match registry.claim("lidar") {
            Err(Error::UnknownIdentity { identity, known }) => {
                assert_eq!(identity, "lidar");
                assert_eq!(known, vec!["gps", "imu"]);
            }
            other => panic!("unexpected {:?}", other.map(|r| r.whoiam)),
        }
    }

    #[test]
    fn discover_without_addresses() {
        let addresses: [&str; 0] = [];
        let result = Registry::discover(&addresses, crate::serial::open, Config::default());
        assert!(matches!(result, Err(Error::NoDevices)));
    }

    #[test]
    fn discover_skips_unopenable() {
        let config = Config {
            handshake: handshake::Config {
                boot_delay: std::time::Duration::ZERO,
                ..Default::default()
            },
            log: LogScope::new("devlink::test"),
        };
        let registry = Registry::discover(
            &["nowhere"],
            |address, _| {
                Err(TransportError::new(
                    address,
                    std::io::ErrorKind::NotFound,
                    "no such port",
                ))
            },
            config,
        )
        .unwrap();
        assert!(registry.identities().is_empty());
        assert_eq!(registry.log().target(), "devlink::test");
    }

    #[test]
    fn ok_tracks_exit_signals() {
        let registry = Registry::new(LogScope::default());
        assert!(registry.ok());
        let first = ExitSignal::new();
        let second = ExitSignal::new();
        registry.register_exit_signal(first.clone());
        registry.register_exit_signal(second.clone());
        assert!(registry.ok());
        second.set();
        assert!(!registry.ok());

        registry.stop_all();
        assert!(first.is_set());
    }

    #[test]
    fn stop_all_closes_unclaimed() {
        let (imu, mut device) = record("imu", "mem0");
        let registry = Registry::from_records([imu], LogScope::default());
        registry.stop_all();

        let mut buf = [0u8; 8];
        let n = device.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"~<\n");
        assert!(!device.is_open());
        assert!(registry.identities().is_empty());
    }
}
