//! # devlink protocol
//!
//! Wire format of the devlink serial protocol, spoken between a host and
//! microcontrollers running the devlink bridge firmware.
//!
//! ## Overview
//!
//! Every message is an ASCII line terminated by `\n`. Lines starting with `~`
//! belong to the protocol itself, everything else is a data packet.
//!
//! - **Handshake**: the host sends an [`Ask`] token and waits for the matching
//!   [`Header`]: hello, ready, whoiam and the initialization payload.
//! - **Session**: `~>` starts the data stream, `~<` stops it. The device answers
//!   a stop with `~stopping`.
//! - **Clock synchronization**: before each data packet the device sends
//!   `~ct:<overflow>:<timer>:<seq_hi>:<seq_lo>`, carrying its microsecond clock and
//!   a 64-bit global sequence number, each split into two 32-bit halves.
//! - **Data**: `<name>\t<format>\t<field>\t...\t`, one format character per field.
//!
//! ## Basic Usage
//!
//! ### Framing a byte stream
//!
//! ```
//! use devlink_protocol::codec::Framer;
//!
//! let mut framer = Framer::new();
//! assert!(framer.push(b"numbers\tdd\t3").is_empty());
//! assert_eq!(framer.push(b"\t4\t\n"), vec!["numbers\tdd\t3\t4\t"]);
//! ```
//!
//! ### Decoding a data line
//!
//! ```
//! use devlink_protocol::{Value, codec::decode_data_line};
//!
//! let (name, data) = decode_data_line("numbers\tdd\t3\t4\t").expect("Line should decode");
//! assert_eq!(name, "numbers");
//! assert_eq!(data, vec![Value::Int(3), Value::Int(4)]);
//! ```
//!
//! ### Synchronizing the device clock
//!
//! ```
//! use devlink_protocol::codec::ClockSample;
//!
//! let sample = ClockSample::from_line("~ct:0:2500000:0:42").unwrap().unwrap();
//! assert_eq!(sample.device_time, 2.5);
//! assert_eq!(sample.global_sequence_num, 42);
//! ```
//!
//! ## Error Handling
//!
//! Decoding failures are reported as [`error::DecodeError`], packet record
//! parsing failures as [`error::ReadError`].
//!
//! ## Features
//!
//! - `tokio`: adds [`codec::LineCodec`] for `tokio_util::codec::Framed`.
pub mod protocol;
pub use protocol::*;
pub mod codec;
pub mod error;
pub mod port;
pub use port::{MemoryPort, Port};
