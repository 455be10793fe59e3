//! # devlink
//!
//! Host side of a line-oriented serial protocol for microcontrollers. The crate finds
//! devices on candidate ports, identifies them by their self-reported whoiam ID and
//! runs one streaming session per device.
//!
//! ## Architecture
//!
//! - **[`transport::Transport`]**: an open port plus the line framer
//! - **[`handshake::Handshake`]**: the hello / ready / whoiam / first packet exchange
//!   that turns a freshly opened port into a [`DeviceRecord`]
//! - **[`registry::Registry`]**: probes every candidate address in parallel and hands
//!   out records by whoiam ID, first discovered first
//! - **[`session::Session`]**: owns one claimed record. A background worker reads
//!   packets into a queue and drains a pausable write queue
//!
//! ## How It Works
//!
//! 1. [`registry::Registry::discover`] opens each address and runs the handshake on it
//! 2. Successful handshakes are pooled by whoiam ID, failures are logged and dropped
//! 3. [`session::Session::start`] claims a record, sends the start token and spawns the worker
//! 4. The worker attaches the latest device clock to every data packet it decodes
//! 5. [`session::Session::stop`] or a stop from the device ends the worker, which always
//!    sends the stop token and closes the port on its way out
//!
//! ## Basic Usage
//!
//! ```ignore
//! use devlink::{registry::{Config, Registry}, serial, session::Session};
//! use std::time::Duration;
//!
//! let addresses = serial::usb_addresses()?;
//! let registry = Registry::discover(&addresses, serial::open, Config::default())?;
//!
//! let mut lidar = Session::builder().baud_rate(230_400).build(&registry, "lidar");
//! let first_packet = lidar.start()?;
//!
//! while registry.ok() {
//!     let packet = lidar.read(true, Some(Duration::from_millis(50)));
//!     if !packet.is_null() {
//!         println!("{:?}", packet);
//!     }
//! }
//! registry.stop_all();
//! ```
//!
//! ## Logging
//!
//! This crate uses the `log` crate. Every registry carries a [`LogScope`] that is used as
//! the log target for the registry, its handshakes and its sessions, so that the output of
//! several registries in one process can be told apart and filtered:
//!
//! ```ignore
//! env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("devlink=info")).init();
//! ```
//!
//! ## Thread Model
//!
//! Discovery uses one scoped thread per address. Each started session owns one worker,
//! either a dedicated OS thread or a blocking task on a tokio runtime, see
//! [`session::WorkerBackend`]. The session and its worker only share the read queue,
//! the write queue and an exit flag.
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

pub mod error;
pub mod handshake;
pub mod queue;
pub mod registry;
pub mod serial;
pub mod session;
pub mod transport;
mod worker;

pub use error::{Error, TransportError};
pub use handshake::DeviceRecord;
pub use queue::PauseCommand;

/// Log target shared by a registry and everything it creates.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LogScope(Arc<str>);

impl LogScope {
    pub fn new(target: &str) -> LogScope {
        LogScope(Arc::from(target))
    }

    pub fn target(&self) -> &str {
        &self.0
    }
}

impl Default for LogScope {
    fn default() -> Self {
        LogScope::new(env!("CARGO_PKG_NAME"))
    }
}

/// Flag raised when a session worker must stop, or has stopped.
///
/// Clones share the same flag. The registry keeps a clone of every session's signal
/// to report aggregate liveness.
#[derive(Clone, Debug, Default)]
pub struct ExitSignal(Arc<AtomicBool>);

impl ExitSignal {
    pub fn new() -> ExitSignal {
        ExitSignal::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[test]
fn exit_signal_is_shared() {
    let signal = ExitSignal::new();
    let clone = signal.clone();
    assert!(!clone.is_set());
    signal.set();
    assert!(clone.is_set());
}
