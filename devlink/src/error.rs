use std::{error::Error as StdError, fmt::Display, io, time::Duration};

use devlink_protocol::{Header, error::DecodeError};

/// An I/O fault on a device link, or an operation on a link that is already closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    address: String,
    kind: io::ErrorKind,
    message: String,
}

impl TransportError {
    pub fn new(address: impl Into<String>, kind: io::ErrorKind, message: impl Into<String>) -> Self {
        TransportError {
            address: address.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn closed(address: impl Into<String>) -> Self {
        TransportError::new(address, io::ErrorKind::NotConnected, "port isn't open")
    }

    pub fn from_io(address: impl Into<String>, error: io::Error) -> Self {
        TransportError::new(address, error.kind(), error.to_string())
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn kind(&self) -> io::ErrorKind {
        self.kind
    }
}

impl Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transport error on '{}': {}", self.address, self.message)
    }
}

impl StdError for TransportError {}

/// Errors raised while discovering, claiming or driving a device.
#[derive(Debug)]
pub enum Error {
    /// The link failed. Fatal to whoever owns the transport.
    Transport(TransportError),
    /// A handshake step was never answered. Fatal to that discovery task only.
    ProtocolTimeout {
        header: Header,
        address: String,
        timeout: Duration,
    },
    /// A handshake header arrived while a session was streaming data.
    ProtocolViolation { address: String, line: String },
    Decode(DecodeError),
    /// No device ever identified itself with this whoiam ID.
    UnknownIdentity { identity: String, known: Vec<String> },
    /// Every device with this whoiam ID has been claimed already.
    ExhaustedPool { identity: String },
    AlreadyStarted { identity: String },
    /// The OS refused to spawn the session worker thread.
    WorkerSpawn(io::Error),
    /// Discovery was given no address to probe.
    NoDevices,
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Transport(error) => write!(f, "{}", error),
            Error::ProtocolTimeout {
                header,
                address,
                timeout,
            } => write!(
                f,
                "Didn't receive '{}' on address '{}'. Operation timed out after {:?}",
                header, address, timeout
            ),
            Error::ProtocolViolation { address, line } => {
                write!(f, "Misplaced protocol packet from '{}': {:?}", address, line)
            }
            Error::Decode(error) => write!(f, "{}", error),
            Error::UnknownIdentity { identity, known } => write!(
                f,
                "whoiam ID '{}' not found. IDs that were found: {:?}",
                identity, known
            ),
            Error::ExhaustedPool { identity } => {
                write!(f, "All devices with whoiam ID '{}' are claimed", identity)
            }
            Error::AlreadyStarted { identity } => {
                write!(f, "Start already called for '{}'", identity)
            }
            Error::WorkerSpawn(error) => write!(f, "Failed to spawn session worker: {}", error),
            Error::NoDevices => write!(f, "Found no addresses to probe for devices"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Transport(error) => Some(error),
            Error::Decode(error) => Some(error),
            Error::WorkerSpawn(error) => Some(error),
            _ => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(value: TransportError) -> Self {
        Error::Transport(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Error::Decode(value)
    }
}
