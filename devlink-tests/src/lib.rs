//! Harness wiring the host driver to simulated devices over in-memory ports.
use std::{
    collections::HashMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam::channel::{self, Receiver};
use devlink::{
    LogScope, TransportError,
    handshake,
    registry::{Config, Registry},
};
use devlink_device::{Bridge, Event};
use devlink_protocol::{MemoryPort, Port, Value};
use parking_lot::Mutex;

/// Read timeout of the simulated device end.
const DEVICE_POLL: Duration = Duration::from_millis(1);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Handshake settings short enough for tests.
pub fn handshake_config() -> handshake::Config {
    handshake::Config {
        timeout: Duration::from_millis(500),
        ready_timeout: Duration::from_secs(1),
        boot_delay: Duration::ZERO,
        ..Default::default()
    }
}

/// Creates a linked host and device port pair.
pub fn link(address: &str) -> (MemoryPort, MemoryPort) {
    let (host, device) = MemoryPort::pair(address);
    (
        host.with_read_timeout(Duration::from_millis(2)),
        device.with_read_timeout(DEVICE_POLL),
    )
}

/// Runs discovery over host ports created by [`link`].
pub fn discover(hosts: Vec<MemoryPort>, log: &str) -> Result<Registry, devlink::Error> {
    let addresses: Vec<String> = hosts.iter().map(|port| port.name().to_string()).collect();
    let ports = Mutex::new(
        hosts
            .into_iter()
            .map(|port| (port.name().to_string(), port))
            .collect::<HashMap<_, _>>(),
    );
    let config = Config {
        handshake: handshake_config(),
        log: LogScope::new(log),
    };
    Registry::discover(
        &addresses,
        |address, _baud| {
            ports
                .lock()
                .remove(address)
                .map(|port| Box::new(port) as Box<dyn Port>)
                .ok_or_else(|| {
                    TransportError::new(address, io::ErrorKind::NotFound, "no such memory port")
                })
        },
        config,
    )
}

/// Called on every device loop iteration, with the event handled in that iteration.
pub trait Behaviour: FnMut(&mut Bridge, Option<&Event>) -> io::Result<()> + Send + 'static {}

impl<F> Behaviour for F where F: FnMut(&mut Bridge, Option<&Event>) -> io::Result<()> + Send + 'static {}

/// Only answers the host.
pub fn passive() -> impl Behaviour {
    |_: &mut Bridge, _: Option<&Event>| -> io::Result<()> { Ok(()) }
}

/// Writes a counter packet named `name` every loop iteration while running.
pub fn counter(name: &'static str) -> impl Behaviour {
    let mut count = 0i64;
    move |bridge: &mut Bridge, _: Option<&Event>| -> io::Result<()> {
        if !bridge.is_paused() {
            bridge.write(name, &[Value::Int(count), Value::Float(count as f64 / 2.0)])?;
            count += 1;
        }
        Ok(())
    }
}

/// A device bridge running its firmware loop on a thread.
pub struct SimulatedDevice {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Bridge>>,
    events: Receiver<(Instant, Event)>,
}

impl SimulatedDevice {
    pub fn spawn(bridge: Bridge, behaviour: impl Behaviour) -> SimulatedDevice {
        SimulatedDevice::spawn_delayed(bridge, Duration::ZERO, behaviour)
    }

    /// Starts answering only after `delay`, as a slowly booting device would.
    pub fn spawn_delayed(
        mut bridge: Bridge,
        delay: Duration,
        mut behaviour: impl Behaviour,
    ) -> SimulatedDevice {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, events) = channel::unbounded();
        let thread = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                thread::sleep(delay);
                while !stop.load(Ordering::SeqCst) {
                    let event = match bridge.poll() {
                        Ok(event) => event,
                        Err(_) => break,
                    };
                    if behaviour(&mut bridge, event.as_ref()).is_err() {
                        break;
                    }
                    if let Some(event) = event {
                        let _ = tx.send((Instant::now(), event));
                    }
                }
                bridge
            })
        };
        SimulatedDevice {
            stop,
            thread: Some(thread),
            events,
        }
    }

    /// Waits for the next event matching `predicate`, dropping the others.
    pub fn wait_for(
        &self,
        timeout: Duration,
        predicate: impl Fn(&Event) -> bool,
    ) -> Option<(Instant, Event)> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok((at, event)) if predicate(&event) => return Some((at, event)),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Stops the firmware loop and hands back the bridge.
    pub fn finish(self) -> Bridge {
        self.stop.store(true, Ordering::SeqCst);
        self.join()
    }

    /// Waits for the firmware loop to end on its own, which it does once the host
    /// closed the link, and hands back the bridge.
    pub fn join(mut self) -> Bridge {
        let thread = self.thread.take().expect("device thread already joined");
        thread.join().expect("device thread panicked")
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}
