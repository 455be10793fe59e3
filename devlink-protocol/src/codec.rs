/// Framing, decoding and encoding of protocol lines
use std::{
    io::{self, BufRead, Write},
    time::{Duration, UNIX_EPOCH},
};

use crate::{
    error::{DecodeError, ReadError},
    protocol::{Header, PACKET_END, Packet, Value, Version},
};

const FIELD_DELIMITER: char = '\t';
const RECORD_PREFIX: &str = "packet_v";
const NO_DATA: &str = "-";

/// Accumulates raw bytes and splits them into lines.
///
/// Bytes are buffered rather than decoded text, so a multi-byte character that
/// arrives split across two chunks still decodes correctly once the line is complete.
/// Invalid UTF-8 is replaced, never rejected.
#[derive(Debug, Default, Clone)]
pub struct Framer {
    buffer: Vec<u8>,
}

impl Framer {
    pub fn new() -> Framer {
        Framer::default()
    }

    /// Appends `bytes` and returns every line completed by them, terminator stripped.
    /// A trailing partial line is kept for the next call.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == PACKET_END) {
            let end = start + offset;
            lines.push(String::from_utf8_lossy(&self.buffer[start..end]).into_owned());
            start = end + 1;
        }
        self.buffer.drain(..start);
        lines
    }

    /// The bytes of the incomplete line currently buffered.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Splits a line into its tab separated segments.
/// The empty segment produced by the final delimiter is dropped.
fn segments(line: &str) -> Vec<&str> {
    let mut segments: Vec<&str> = line.split(FIELD_DELIMITER).collect();
    if segments.last() == Some(&"") {
        segments.pop();
    }
    segments
}

/// Converts the string fields of a packet into typed values using one format character per field.
///
/// `d` parses an integer, `f` a floating point number and any other character keeps the field as text.
pub fn decode(name: &str, format: &str, fields: &[&str]) -> Result<Vec<Value>, DecodeError> {
    if format.chars().count() != fields.len() {
        return Err(DecodeError::FieldCount {
            name: name.to_owned(),
            format: format.to_owned(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        });
    }

    format
        .chars()
        .zip(fields)
        .map(|(kind, field)| match kind {
            'd' => field
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| DecodeError::InvalidInt {
                    name: name.to_owned(),
                    field: field.to_string(),
                }),
            'f' => field
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| DecodeError::InvalidFloat {
                    name: name.to_owned(),
                    field: field.to_string(),
                }),
            _ => Ok(Value::Text(field.to_string())),
        })
        .collect()
}

/// Decodes a data line of the form `name\tformat\tfield\t...\t`.
pub fn decode_data_line(line: &str) -> Result<(String, Vec<Value>), DecodeError> {
    let segments = segments(line);
    let (name, rest) = segments
        .split_first()
        .ok_or(DecodeError::MissingSegment("name"))?;
    let (format, fields) = rest
        .split_first()
        .ok_or(DecodeError::MissingSegment("format"))?;
    let data = decode(name, format, fields)?;
    Ok((name.to_string(), data))
}

/// Decodes the initialization payload of a device, `format\tfield\t...\t`.
/// The payload carries no name segment.
pub fn decode_first_packet(payload: &str) -> Result<Vec<Value>, DecodeError> {
    let segments = segments(payload);
    let (format, fields) = segments
        .split_first()
        .ok_or(DecodeError::MissingSegment("format"))?;
    decode(Packet::FIRST_PACKET_NAME, format, fields)
}

/// Encodes values as `format\tfield\t...\t`, the payload shape shared by data
/// lines and the initialization payload.
pub fn encode_fields(values: &[Value]) -> String {
    let mut out: String = values.iter().map(Value::format_char).collect();
    out.push(FIELD_DELIMITER);
    for value in values {
        out.push_str(&value.to_string());
        out.push(FIELD_DELIMITER);
    }
    out
}

/// Encodes a data line without its terminator.
pub fn encode_data_line(name: &str, values: &[Value]) -> String {
    format!("{}{}{}", name, FIELD_DELIMITER, encode_fields(values))
}

/// Device clock and sequence number carried by a `~ct:` line.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ClockSample {
    pub global_sequence_num: i64,
    /// Seconds since the device booted.
    pub device_time: f64,
}

impl ClockSample {
    /// Combines the two 32-bit halves of the microsecond timer and of the sequence number.
    pub fn from_parts(overflow: u32, timer: u32, seq_hi: u32, seq_lo: u32) -> ClockSample {
        let micros = (u64::from(overflow) << 32) | u64::from(timer);
        let sequence = (u64::from(seq_hi) << 32) | u64::from(seq_lo);
        ClockSample {
            global_sequence_num: sequence as i64,
            device_time: micros as f64 / 1e6,
        }
    }

    /// Parses a time synchronization line.
    /// Returns `None` if the line does not start with the time header.
    pub fn from_line(line: &str) -> Option<Result<ClockSample, DecodeError>> {
        let rest = Header::Time.strip(line)?;
        let invalid = || DecodeError::InvalidTimeSync(line.to_owned());

        let parts = rest
            .split(':')
            .map(|part| part.trim().parse::<u32>())
            .collect::<Result<Vec<u32>, _>>();
        Some(match parts.as_deref() {
            Ok([overflow, timer, seq_hi, seq_lo]) => {
                Ok(ClockSample::from_parts(*overflow, *timer, *seq_hi, *seq_lo))
            }
            _ => Err(invalid()),
        })
    }
}

/// Encodes a time synchronization line without its terminator.
pub fn encode_time_line(overflow: u32, timer: u32, sequence: u64) -> String {
    format!(
        "{}{}:{}:{}:{}",
        Header::Time.token(),
        overflow,
        timer,
        sequence >> 32,
        sequence & 0xffff_ffff
    )
}

impl Packet {
    /// Writes the packet as a single versioned record line.
    ///
    /// `packet_v{version}:<name>\t<global>\t<seq>\t<timestamp>\t<receive>\t<format>\t<fields...>`
    pub fn write_record(&self, writer: &mut impl Write) -> io::Result<()> {
        let receive = self
            .receive_time
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let payload = match &self.data {
            Some(values) => encode_fields(values),
            None => format!("{}{}", NO_DATA, FIELD_DELIMITER),
        };
        writeln!(
            writer,
            "{}{}:{}\t{}\t{}\t{}\t{}\t{}",
            RECORD_PREFIX,
            Version::CURRENT,
            self.name.as_deref().unwrap_or_default(),
            self.global_sequence_num,
            self.sequence_num,
            self.timestamp,
            receive,
            payload
        )
    }

    /// Reads one record line written by [`Packet::write_record`].
    pub fn from_reader(reader: &mut impl BufRead) -> Result<Packet, ReadError> {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(ReadError::IoError(io::ErrorKind::UnexpectedEof.into()));
        }
        Packet::from_record(line.trim_end_matches(['\n', '\r']))
    }

    pub fn from_record(line: &str) -> Result<Packet, ReadError> {
        let line = line
            .strip_prefix(RECORD_PREFIX)
            .ok_or_else(|| ReadError::InvalidFormat("Invalid prefix in packet record".to_string()))?;
        let colon_index = line.find(':').ok_or_else(|| {
            ReadError::InvalidFormat("Missing ':' separator in packet record".to_string())
        })?;
        let (version_part, rest) = line.split_at(colon_index);
        if version_part != Version::CURRENT.to_string() {
            return Err(ReadError::UnsupportedVersion(version_part.to_string()));
        }

        let segments = segments(&rest[1..]);
        let [name, global, sequence, timestamp, receive, format, fields @ ..] = &segments[..]
        else {
            return Err(ReadError::InvalidFormat(format!(
                "Packet record has {} segments, expected at least 6",
                segments.len()
            )));
        };

        let name = (!name.is_empty()).then(|| name.to_string());
        let receive = Duration::try_from_secs_f64(receive.parse::<f64>()?)
            .map_err(|e| ReadError::InvalidFormat(format!("Invalid receive time: {}", e)))?;
        let data = if *format == NO_DATA && fields.is_empty() {
            None
        } else {
            Some(decode(
                name.as_deref().unwrap_or_default(),
                format,
                fields,
            )?)
        };

        Ok(Packet {
            name,
            data,
            receive_time: UNIX_EPOCH + receive,
            timestamp: timestamp.parse::<f64>()?,
            global_sequence_num: global.parse::<i64>()?,
            sequence_num: sequence.parse::<i64>()?,
        })
    }
}

#[cfg(feature = "tokio")]
pub use line_codec::LineCodec;

#[cfg(feature = "tokio")]
mod line_codec {
    use bytes::{BufMut, BytesMut};
    use std::io;
    use tokio_util::codec::{Decoder, Encoder};

    use crate::protocol::PACKET_END;

    /// Line codec for use with `tokio_util::codec::Framed` over async byte streams.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct LineCodec;

    impl Decoder for LineCodec {
        type Item = String;
        type Error = io::Error;

        fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
            match src.iter().position(|b| *b == PACKET_END) {
                Some(end) => {
                    let line = src.split_to(end + 1);
                    Ok(Some(String::from_utf8_lossy(&line[..end]).into_owned()))
                }
                None => Ok(None),
            }
        }

        /// A partial line at the end of the stream is held back, never reported as an error.
        fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
            self.decode(src)
        }
    }

    impl<'a> Encoder<&'a str> for LineCodec {
        type Error = io::Error;

        fn encode(&mut self, item: &'a str, dst: &mut BytesMut) -> Result<(), io::Error> {
            dst.reserve(item.len() + 1);
            dst.put_slice(item.as_bytes());
            dst.put_u8(PACKET_END);
            Ok(())
        }
    }

    #[cfg(test)]
    mod test {
        use super::*;

        #[test]
        fn decodes_complete_lines_only() {
            let mut codec = LineCodec;
            let mut buf = BytesMut::from(&b"a\tb"[..]);
            assert_eq!(codec.decode(&mut buf).unwrap(), None);
            buf.extend_from_slice(b"\nc\td\n");
            assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("a\tb"));
            assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("c\td"));
            assert_eq!(codec.decode(&mut buf).unwrap(), None);
            assert!(buf.is_empty());
        }

        #[test]
        fn partial_line_at_eof_is_held_back() {
            let mut codec = LineCodec;
            let mut buf = BytesMut::from(&b"a\tb\nc\t"[..]);
            assert_eq!(codec.decode_eof(&mut buf).unwrap().as_deref(), Some("a\tb"));
            assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
            assert_eq!(&buf[..], b"c\t");
        }

        #[test]
        fn encode_appends_terminator() {
            let mut codec = LineCodec;
            let mut buf = BytesMut::new();
            codec.encode("~?", &mut buf).unwrap();
            assert_eq!(&buf[..], b"~?\n");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::Value;
    use std::io::Cursor;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn framer_keeps_partial_lines() {
        let mut framer = Framer::new();
        assert!(framer.push(b"a\tb").is_empty());
        assert_eq!(framer.pending(), b"a\tb");
        assert_eq!(framer.push(b"\nc\td\n"), vec!["a\tb", "c\td"]);
        assert!(framer.pending().is_empty());
    }

    #[test]
    fn framer_is_independent_of_split_point() {
        let stream = b"a\tb\nc\td\n";
        for split in 0..=stream.len() {
            let mut framer = Framer::new();
            let mut lines = framer.push(&stream[..split]);
            lines.extend(framer.push(&stream[split..]));
            assert_eq!(lines, vec!["a\tb", "c\td"], "split at {}", split);
        }
    }

    #[test]
    fn framer_replaces_invalid_bytes() {
        let mut framer = Framer::new();
        let lines = framer.push(b"ab\xffc\n");
        assert_eq!(lines, vec!["ab\u{FFFD}c"]);
    }

    #[test]
    fn framer_joins_split_multibyte_character() {
        let mut framer = Framer::new();
        let bytes = "temp°\n".as_bytes();
        let split = bytes.len() - 2;
        assert!(framer.push(&bytes[..split]).is_empty());
        assert_eq!(framer.push(&bytes[split..]), vec!["temp°"]);
    }

    #[test]
    fn decode_typed_fields() {
        assert_eq!(
            decode("numbers", "dd", &["3", "4"]).unwrap(),
            vec![Value::Int(3), Value::Int(4)]
        );
        assert_eq!(
            decode("mixed", "dfs", &["-1", "2.5", "hi"]).unwrap(),
            vec![Value::Int(-1), Value::Float(2.5), Value::Text("hi".into())]
        );
    }

    #[test]
    fn decode_field_count_mismatch() {
        match decode("x", "d", &["3", "4"]) {
            Err(DecodeError::FieldCount { name, format, fields }) => {
                assert_eq!(name, "x");
                assert_eq!(format, "d");
                assert_eq!(fields, vec!["3", "4"]);
            }
            other => panic!("expected FieldCount, got {:?}", other),
        }
    }

    #[test]
    fn decode_invalid_number() {
        assert!(matches!(
            decode("x", "d", &["three"]),
            Err(DecodeError::InvalidInt { .. })
        ));
        assert!(matches!(
            decode("x", "f", &["1.2.3"]),
            Err(DecodeError::InvalidFloat { .. })
        ));
    }

    #[test]
    fn decode_line() {
        let (name, data) = decode_data_line("numbers\tdd\t3\t4\t").unwrap();
        assert_eq!(name, "numbers");
        assert_eq!(data, vec![Value::Int(3), Value::Int(4)]);

        assert_eq!(
            decode_data_line(""),
            Err(DecodeError::MissingSegment("name"))
        );
        assert_eq!(
            decode_data_line("lonely\t"),
            Err(DecodeError::MissingSegment("format"))
        );
    }

    #[test]
    fn decode_init_payload() {
        assert_eq!(
            decode_first_packet("ds\t12\tlidar\t").unwrap(),
            vec![Value::Int(12), Value::Text("lidar".into())]
        );
    }

    #[test]
    fn encode_matches_decode_shape() {
        let values = vec![Value::Int(3), Value::Float(0.5), Value::Text("ok".into())];
        let line = encode_data_line("status", &values);
        assert_eq!(line, "status\tdfs\t3\t0.5\tok\t");
        assert_eq!(decode_data_line(&line).unwrap().1, values);
    }

    #[test]
    fn clock_sample_combines_halves() {
        let sample = ClockSample::from_line("~ct:1:500000:0:7").unwrap().unwrap();
        assert_eq!(sample.device_time, ((1_u64 << 32) | 500_000) as f64 / 1e6);
        assert_eq!(sample.global_sequence_num, 7);

        let sample = ClockSample::from_line("~ct:0:0:1:2").unwrap().unwrap();
        assert_eq!(sample.global_sequence_num, (1 << 32) | 2);
    }

    #[test]
    fn clock_sample_rejects_malformed_lines() {
        assert!(ClockSample::from_line("numbers\tdd\t3\t4\t").is_none());
        assert!(matches!(
            ClockSample::from_line("~ct:1:2:3"),
            Some(Err(DecodeError::InvalidTimeSync(_)))
        ));
        assert!(matches!(
            ClockSample::from_line("~ct:a:2:3:4"),
            Some(Err(DecodeError::InvalidTimeSync(_)))
        ));
    }

    #[test]
    fn time_line_encoding() {
        assert_eq!(encode_time_line(1, 500_000, 7), "~ct:1:500000:0:7");
        assert_eq!(encode_time_line(0, 3, (2 << 32) | 5), "~ct:0:3:2:5");
    }

    #[test]
    fn record_round_trip() {
        let packet = Packet {
            name: Some("numbers".to_string()),
            data: Some(vec![Value::Int(3), Value::Float(1.5)]),
            receive_time: UNIX_EPOCH + Duration::from_millis(1_700_000_000_500),
            timestamp: 12.25,
            global_sequence_num: 41,
            sequence_num: 2,
        };
        let mut out = Vec::new();
        packet.write_record(&mut out).unwrap();
        assert!(out.starts_with(b"packet_v1.0:numbers\t41\t2\t12.25\t"));

        let parsed = Packet::from_reader(&mut Cursor::new(out)).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn record_of_null_packet() {
        let mut out = Vec::new();
        Packet::null().write_record(&mut out).unwrap();
        assert_eq!(out, b"packet_v1.0:\t-1\t-1\t0\t0\t-\t\n".to_vec());
        let parsed = Packet::from_reader(&mut Cursor::new(out)).unwrap();
        assert!(parsed.is_null());
        assert_eq!(parsed.data, None);
    }

    #[test]
    fn record_rejects_unknown_version() {
        match Packet::from_record("packet_v2.0:x\t0\t0\t0\t0\t-\t") {
            Err(ReadError::UnsupportedVersion(v)) => assert_eq!(v, "2.0"),
            other => panic!("expected UnsupportedVersion, got {:?}", other),
        }
        assert!(matches!(
            Packet::from_record("numbers\tdd\t3\t4\t"),
            Err(ReadError::InvalidFormat(_))
        ));
    }
}
