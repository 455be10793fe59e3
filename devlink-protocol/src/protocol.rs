use std::{
    fmt::Display,
    time::{SystemTime, UNIX_EPOCH},
};

/// Every line on the wire ends with this byte.
pub const PACKET_END: u8 = b'\n';

/// Baud rate every device boots with. Sessions may switch to a different rate after start.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Packet record format version, written as `major.minor` after the record prefix.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Version {
    major: u16,
    minor: u16,
}

impl Version {
    /// The only record format written and read.
    pub const CURRENT: Version = Version { major: 1, minor: 0 };
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A request token sent from the host to the device.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Ask {
    /// Asks the device to announce itself. Answered by [`Header::Hello`].
    Hello,
    /// Asks whether the device finished booting. Answered by [`Header::Ready`].
    Ready,
    /// Asks for the identity of the device. Answered by [`Header::Whoiam`].
    Whoiam,
    /// Asks for the initialization payload. Answered by [`Header::FirstPacket`].
    FirstPacket,
    /// Starts the data stream. Followed by the host start time in unix seconds.
    Start,
    /// Stops the data stream. Answered by [`Header::Stopping`].
    Stop,
}

impl Ask {
    pub const ALL: [Ask; 6] = [
        Ask::Hello,
        Ask::Ready,
        Ask::Whoiam,
        Ask::FirstPacket,
        Ask::Start,
        Ask::Stop,
    ];

    pub const fn token(self) -> &'static str {
        match self {
            Ask::Hello => "~!",
            Ask::Ready => "~+",
            Ask::Whoiam => "~?",
            Ask::FirstPacket => "~|",
            Ask::Start => "~>",
            Ask::Stop => "~<",
        }
    }

    /// The header the device answers this ask with, if any.
    pub const fn response(self) -> Option<Header> {
        match self {
            Ask::Hello => Some(Header::Hello),
            Ask::Ready => Some(Header::Ready),
            Ask::Whoiam => Some(Header::Whoiam),
            Ask::FirstPacket => Some(Header::FirstPacket),
            Ask::Start => None,
            Ask::Stop => Some(Header::Stopping),
        }
    }

    /// Splits a command line into the ask it carries and the remaining argument.
    pub fn parse(line: &str) -> Option<(Ask, &str)> {
        Ask::ALL
            .into_iter()
            .find_map(|ask| line.strip_prefix(ask.token()).map(|rest| (ask, rest)))
    }
}

impl Display for Ask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

/// A response header sent from the device to the host.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Header {
    Hello,
    Ready,
    Whoiam,
    FirstPacket,
    Stopping,
    /// Runtime clock synchronization, `~ct:<overflow>:<timer>:<seq_hi>:<seq_lo>`
    Time,
}

impl Header {
    /// Headers that belong to the handshake or to the stop exchange.
    /// Seeing any of these while a session is streaming data is either a
    /// peer-initiated stop or a protocol violation.
    pub const PROTOCOL: [Header; 5] = [
        Header::Hello,
        Header::Ready,
        Header::Whoiam,
        Header::FirstPacket,
        Header::Stopping,
    ];

    pub const fn token(self) -> &'static str {
        match self {
            Header::Hello => "~hello!",
            Header::Ready => "~ready!",
            Header::Whoiam => "~iam",
            Header::FirstPacket => "~init:",
            Header::Stopping => "~stopping",
            Header::Time => "~ct:",
        }
    }

    /// Returns the rest of the line if it starts with this header.
    pub fn strip<'a>(&self, line: &'a str) -> Option<&'a str> {
        line.strip_prefix(self.token())
    }

    /// Finds the handshake or stop header a line starts with.
    pub fn protocol_header(line: &str) -> Option<Header> {
        Header::PROTOCOL
            .into_iter()
            .find(|header| line.starts_with(header.token()))
    }
}

impl Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

#[test]
fn protocol_header_lookup() {
    assert_eq!(Header::protocol_header("~iamlidar"), Some(Header::Whoiam));
    assert_eq!(Header::protocol_header("~stopping"), Some(Header::Stopping));
    assert_eq!(Header::protocol_header("~ct:0:1:0:1"), None);
    assert_eq!(Header::protocol_header("numbers\tdd\t3\t4\t"), None);
    assert_eq!(Ask::parse("~>1700000000"), Some((Ask::Start, "1700000000")));
    assert_eq!(Ask::parse("d"), None);
}

/// A single typed field of a data packet.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Format character `d`
    Int(i64),
    /// Format character `f`
    Float(f64),
    /// Any other format character. Encoded as `s`.
    Text(String),
}

impl Value {
    /// The format character this value is encoded with.
    pub fn format_char(&self) -> char {
        match self {
            Value::Int(_) => 'd',
            Value::Float(_) => 'f',
            Value::Text(_) => 's',
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

/// A named, typed data packet received from a device.
///
/// `timestamp` and `global_sequence_num` come from the most recent clock
/// synchronization line the device sent before this packet.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub name: Option<String>,
    pub data: Option<Vec<Value>>,
    /// Host wall-clock time at which the chunk carrying this packet was read.
    pub receive_time: SystemTime,
    /// Device clock in seconds.
    pub timestamp: f64,
    pub global_sequence_num: i64,
    /// Index of this packet among the data packets of its session.
    pub sequence_num: i64,
}

impl Packet {
    /// Name given to the initialization payload a device sends during the handshake.
    pub const FIRST_PACKET_NAME: &str = "first_packet";

    /// The sentinel returned when no data arrived within a read timeout.
    pub fn null() -> Packet {
        Packet {
            name: None,
            data: None,
            receive_time: UNIX_EPOCH,
            timestamp: 0.0,
            global_sequence_num: -1,
            sequence_num: -1,
        }
    }

    pub fn is_null(&self) -> bool {
        self.name.is_none() && self.global_sequence_num == -1
    }

    /// Returns the field at `index`, if the packet carries data.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.data.as_ref()?.get(index)
    }
}

impl Default for Packet {
    fn default() -> Self {
        Packet::null()
    }
}

#[test]
fn null_packet_is_sentinel() {
    let packet = Packet::null();
    assert!(packet.is_null());
    assert_eq!(packet.global_sequence_num, -1);
    assert_eq!(packet.get(0), None);
}
