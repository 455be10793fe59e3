use std::{
    error::Error,
    fmt::Display,
    io::{self},
    num::{ParseFloatError, ParseIntError},
};

/// Errors that may occur when turning a received line into typed values.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// The number of fields differs from the number of format characters.
    FieldCount {
        name: String,
        format: String,
        fields: Vec<String>,
    },
    /// A `d` field that is not an integer.
    InvalidInt { name: String, field: String },
    /// An `f` field that is not a floating point number.
    InvalidFloat { name: String, field: String },
    /// The line ends before the name or format segment.
    MissingSegment(&'static str),
    /// A clock synchronization line with the wrong shape.
    InvalidTimeSync(String),
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::FieldCount {
                name,
                format,
                fields,
            } => write!(
                f,
                "Length of formats doesn't equal number of data segments. Name: '{}', formats: '{}', data: {:?}",
                name, format, fields
            ),
            DecodeError::InvalidInt { name, field } => {
                write!(f, "Invalid integer '{}' in packet '{}'", field, name)
            }
            DecodeError::InvalidFloat { name, field } => {
                write!(f, "Invalid float '{}' in packet '{}'", field, name)
            }
            DecodeError::MissingSegment(segment) => write!(f, "Packet has no {} segment", segment),
            DecodeError::InvalidTimeSync(line) => {
                write!(f, "Malformed time synchronization line {:?}", line)
            }
        }
    }
}

impl Error for DecodeError {}

/// Errors that may occur when reading a packet record from a stream.
#[derive(Debug)]
pub enum ReadError {
    IoError(io::Error),
    UnsupportedVersion(String),
    InvalidFormat(String),
    Decode(DecodeError),
}

impl From<io::Error> for ReadError {
    fn from(value: io::Error) -> Self {
        ReadError::IoError(value)
    }
}

impl From<ParseIntError> for ReadError {
    fn from(value: ParseIntError) -> Self {
        ReadError::InvalidFormat(format!("Invalid integer: {}", value))
    }
}

impl From<ParseFloatError> for ReadError {
    fn from(value: ParseFloatError) -> Self {
        ReadError::InvalidFormat(format!("Invalid float: {}", value))
    }
}

impl From<DecodeError> for ReadError {
    fn from(value: DecodeError) -> Self {
        ReadError::Decode(value)
    }
}

impl Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadError::IoError(error) => write!(f, "{}", error),
            ReadError::UnsupportedVersion(version) => write!(f, "Unsupported version {}", version),
            ReadError::InvalidFormat(format) => write!(f, "{}", format),
            ReadError::Decode(error) => write!(f, "{}", error),
        }
    }
}

impl Error for ReadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReadError::IoError(error) => Some(error),
            ReadError::Decode(error) => Some(error),
            _ => None,
        }
    }
}
