//! Newtmgr management messages: an 8-byte header followed by a CBOR map.
//!
//! ## Header Format
//!
//! ```text
//! +-------+-------+----------+----------+-----+----+
//! |  Op   | Flags | Len (BE) | Group(BE)| Seq | Id |
//! +-------+-------+----------+----------+-----+----+
//! |   1   |   1   |    2     |    2     |  1  |  1 |
//! +-------+-------+----------+----------+-----+----+
//! ```
//!
//! Only the low three bits of `Op` are significant. `Len` is the byte length
//! of the CBOR payload that follows the header.
//!
//! ## Payloads
//!
//! Requests are definite-length CBOR maps with text keys, emitted in a fixed
//! key order. The first entry is always `"_h"`, a byte string holding the
//! header with its length field still zero. Responses are read field by field
//! and only the integer fields `rc` and `off` are interpreted.

use byteorder::{BigEndian, ByteOrder};
use ciborium::Value;
use log::trace;

use crate::error::{Error, Result};

/// Size of the message header.
pub const HEADER_LEN: usize = 8;

const OP_MASK: u8 = 0x07;

/// Operation carried in the low three bits of the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    /// Read request.
    Read = 0,
    /// Response to a read.
    ReadResponse = 1,
    /// Write request.
    Write = 2,
    /// Response to a write.
    WriteResponse = 3,
}

impl Op {
    /// Decode an op from the first header byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte & OP_MASK {
            0 => Some(Self::Read),
            1 => Some(Self::ReadResponse),
            2 => Some(Self::Write),
            3 => Some(Self::WriteResponse),
            _ => None,
        }
    }

    /// Whether this op is sent by the device.
    pub fn is_response(self) -> bool {
        matches!(self, Self::ReadResponse | Self::WriteResponse)
    }
}

/// Command group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Group {
    /// Default/OS group.
    Default = 0,
    /// Image management.
    Image = 1,
    /// Statistics.
    Stats = 2,
    /// Configuration.
    Config = 3,
    /// Logs.
    Logs = 4,
    /// Crash test.
    Crash = 5,
    /// Split image.
    Split = 6,
    /// Run test.
    Run = 7,
    /// File system.
    Fs = 8,
    /// First group reserved for applications.
    PerUser = 64,
}

/// Command ids in [`Group::Default`].
pub mod default_id {
    /// Echo.
    pub const ECHO: u8 = 0;
    /// Console echo control.
    pub const CONS_ECHO_CTRL: u8 = 1;
    /// Task statistics.
    pub const TASKSTATS: u8 = 2;
    /// Memory pool statistics.
    pub const MPSTATS: u8 = 3;
    /// Date and time string.
    pub const DATETIME_STR: u8 = 4;
    /// Reset.
    pub const RESET: u8 = 5;
}

/// Command ids in [`Group::Image`].
pub mod image_id {
    /// Image state.
    pub const STATE: u8 = 0;
    /// Image upload.
    pub const UPLOAD: u8 = 1;
    /// File.
    pub const FILE: u8 = 2;
    /// Core list.
    pub const CORELIST: u8 = 3;
    /// Core load.
    pub const CORELOAD: u8 = 4;
    /// Erase.
    pub const ERASE: u8 = 5;
    /// Erase state.
    pub const ERASE_STATE: u8 = 6;
}

/// Message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Raw op byte; see [`Header::op`].
    pub op: u8,
    /// Flags, always zero on requests.
    pub flags: u8,
    /// Payload length.
    pub len: u16,
    /// Command group.
    pub group: u16,
    /// Sequence number.
    pub seq: u8,
    /// Command id within the group.
    pub id: u8,
}

impl Header {
    /// Create a new header with zero length and sequence.
    pub fn new(op: Op, group: Group, id: u8) -> Self {
        Self {
            op: op as u8,
            flags: 0,
            len: 0,
            group: group as u16,
            seq: 0,
            id,
        }
    }

    /// Decoded op, `None` for the reserved values 4..=7.
    pub fn op(&self) -> Option<Op> {
        Op::from_byte(self.op)
    }

    /// Serialize to wire order.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.op & OP_MASK;
        buf[1] = self.flags;
        BigEndian::write_u16(&mut buf[2..4], self.len);
        BigEndian::write_u16(&mut buf[4..6], self.group);
        buf[6] = self.seq;
        buf[7] = self.id;
        buf
    }

    /// Parse from the start of `data`.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            op: data[0] & OP_MASK,
            flags: data[1],
            len: BigEndian::read_u16(&data[2..4]),
            group: BigEndian::read_u16(&data[4..6]),
            seq: data[6],
            id: data[7],
        })
    }
}

/// Request builder.
#[derive(Debug, Clone)]
pub struct Request {
    header: Header,
    fields: Vec<(&'static str, Value)>,
}

impl Request {
    fn write(group: Group, id: u8) -> Self {
        Self {
            header: Header::new(Op::Write, group, id),
            fields: Vec::new(),
        }
    }

    fn field(mut self, key: &'static str, value: Value) -> Self {
        self.fields.push((key, value));
        self
    }

    /// Create a console echo control request.
    pub fn echo_ctl(enabled: bool) -> Self {
        Self::write(Group::Default, default_id::CONS_ECHO_CTRL)
            .field("echo", Value::Integer(u8::from(enabled).into()))
    }

    /// Create a device reset request.
    pub fn reset() -> Self {
        Self::write(Group::Default, default_id::RESET)
    }

    /// Create the first image upload request.
    ///
    /// Carries the total image length so the device can prepare its slot.
    pub fn upload_first(image_len: usize, data: &[u8]) -> Self {
        Self::write(Group::Image, image_id::UPLOAD)
            .field("sha", Value::Bytes(Vec::new()))
            .field("off", Value::Integer(0u8.into()))
            .field("len", Value::Integer((image_len as u64).into()))
            .field("data", Value::Bytes(data.to_vec()))
    }

    /// Create a follow-up image upload request at `offset`.
    pub fn upload_next(offset: usize, data: &[u8]) -> Self {
        Self::write(Group::Image, image_id::UPLOAD)
            .field("off", Value::Integer((offset as u64).into()))
            .field("data", Value::Bytes(data.to_vec()))
    }

    /// Set the sequence number.
    #[must_use]
    pub fn with_seq(mut self, seq: u8) -> Self {
        self.header.seq = seq;
        self
    }

    /// Get the request header (length not yet filled in).
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Build the complete message: header, then CBOR payload.
    pub fn build(&self) -> Result<Vec<u8>> {
        let mut map = Vec::with_capacity(self.fields.len() + 1);
        map.push((
            Value::Text("_h".into()),
            Value::Bytes(self.header.to_bytes().to_vec()),
        ));
        for (key, value) in &self.fields {
            map.push((Value::Text((*key).into()), value.clone()));
        }

        let mut payload = Vec::new();
        ciborium::into_writer(&Value::Map(map), &mut payload)
            .map_err(|e| Error::Encode(e.to_string()))?;

        let mut header = self.header;
        header.len = u16::try_from(payload.len())
            .map_err(|_| Error::Encode(format!("payload of {} bytes is too long", payload.len())))?;

        let mut message = Vec::with_capacity(HEADER_LEN + payload.len());
        message.extend_from_slice(&header.to_bytes());
        message.extend_from_slice(&payload);
        Ok(message)
    }
}

/// Decoded device response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// Response header.
    pub header: Header,
    /// Result code, zero when the device omitted it.
    pub rc: i64,
    /// Next offset the device expects, if reported.
    pub off: Option<u64>,
}

/// Whether `message` carries a response op.
pub fn is_response(message: &[u8]) -> bool {
    Header::parse(message)
        .and_then(|h| h.op())
        .is_some_and(Op::is_response)
}

/// Decode a response message.
///
/// Map entries are read in order until the first non-text key. Every
/// text-keyed value must be an integer; only `rc` and `off` are kept.
pub fn decode_response(message: &[u8]) -> Result<Response> {
    let header = Header::parse(message).ok_or_else(|| {
        Error::Decode(format!(
            "message of {} bytes is shorter than the header",
            message.len()
        ))
    })?;

    let value: Value = ciborium::from_reader(&message[HEADER_LEN..])
        .map_err(|e| Error::Decode(format!("invalid CBOR payload: {e}")))?;
    let Value::Map(entries) = value else {
        return Err(Error::Decode("payload is not a map".into()));
    };

    let mut rc = 0;
    let mut off = None;
    for (key, value) in entries {
        let Value::Text(name) = key else {
            break;
        };
        match name.as_str() {
            "rc" => rc = integer_field(&name, &value)?,
            "off" => off = Some(integer_field(&name, &value)?),
            _ => {
                integer_field::<i128>(&name, &value)?;
                trace!("Skipping response field `{name}`");
            },
        }
    }

    Ok(Response { header, rc, off })
}

fn integer_field<T: TryFrom<i128>>(name: &str, value: &Value) -> Result<T> {
    let Value::Integer(int) = value else {
        return Err(Error::Decode(format!("field `{name}` is not an integer")));
    };
    T::try_from(i128::from(*int))
        .map_err(|_| Error::Decode(format!("field `{name}` is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a response message from a list of map entries.
    fn response(entries: Vec<(Value, Value)>) -> Vec<u8> {
        let mut payload = Vec::new();
        ciborium::into_writer(&Value::Map(entries), &mut payload).unwrap();
        let mut header = Header::new(Op::WriteResponse, Group::Image, image_id::UPLOAD);
        header.len = payload.len() as u16;
        let mut message = header.to_bytes().to_vec();
        message.extend_from_slice(&payload);
        message
    }

    fn text(s: &str) -> Value {
        Value::Text(s.into())
    }

    fn int(v: i64) -> Value {
        Value::Integer(v.into())
    }

    fn payload_map(message: &[u8]) -> Vec<(Value, Value)> {
        match ciborium::from_reader::<Value, _>(&message[HEADER_LEN..]).unwrap() {
            Value::Map(entries) => entries,
            other => panic!("not a map: {other:?}"),
        }
    }

    fn keys(entries: &[(Value, Value)]) -> Vec<String> {
        entries
            .iter()
            .map(|(k, _)| k.as_text().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_header_wire_order() {
        let header = Header {
            op: Op::Write as u8,
            flags: 0,
            len: 0x0102,
            group: 0x0304,
            seq: 5,
            id: 6,
        };
        assert_eq!(header.to_bytes(), [0x02, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert_eq!(Header::parse(&header.to_bytes()), Some(header));
    }

    #[test]
    fn test_header_op_masked() {
        let header = Header::parse(&[0xFB, 0, 0, 0, 0, 1, 0, 1]).unwrap();
        assert_eq!(header.op, 3);
        assert_eq!(header.op(), Some(Op::WriteResponse));

        let reserved = Header::parse(&[0x05, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(reserved.op(), None);
    }

    #[test]
    fn test_header_too_short() {
        assert_eq!(Header::parse(&[0; 7]), None);
    }

    #[test]
    fn test_len_backfilled() {
        let message = Request::reset().build().unwrap();
        let header = Header::parse(&message).unwrap();
        assert_eq!(usize::from(header.len), message.len() - HEADER_LEN);
        assert_eq!(header.op(), Some(Op::Write));
        assert_eq!(header.group, Group::Default as u16);
        assert_eq!(header.id, default_id::RESET);
    }

    #[test]
    fn test_embedded_header_has_zero_len() {
        let message = Request::upload_next(64, &[1, 2, 3]).with_seq(9).build().unwrap();
        let entries = payload_map(&message);

        let (key, value) = &entries[0];
        assert_eq!(key.as_text(), Some("_h"));
        let embedded = Header::parse(value.as_bytes().unwrap()).unwrap();
        assert_eq!(embedded.len, 0);
        assert_eq!(embedded.seq, 9);
        assert_eq!(embedded.id, image_id::UPLOAD);
    }

    #[test]
    fn test_echo_ctl_payload() {
        let message = Request::echo_ctl(false).build().unwrap();
        let entries = payload_map(&message);
        assert_eq!(keys(&entries), ["_h", "echo"]);
        assert_eq!(entries[1].1, int(0));

        let entries = payload_map(&Request::echo_ctl(true).build().unwrap());
        assert_eq!(entries[1].1, int(1));
    }

    #[test]
    fn test_reset_payload() {
        let entries = payload_map(&Request::reset().build().unwrap());
        assert_eq!(keys(&entries), ["_h"]);
    }

    #[test]
    fn test_upload_first_payload() {
        let message = Request::upload_first(100, &[0xAA; 32]).build().unwrap();
        let header = Header::parse(&message).unwrap();
        assert_eq!(header.group, Group::Image as u16);
        assert_eq!(header.id, image_id::UPLOAD);

        let entries = payload_map(&message);
        assert_eq!(keys(&entries), ["_h", "sha", "off", "len", "data"]);
        assert_eq!(entries[1].1, Value::Bytes(Vec::new()));
        assert_eq!(entries[2].1, int(0));
        assert_eq!(entries[3].1, int(100));
        assert_eq!(entries[4].1, Value::Bytes(vec![0xAA; 32]));
    }

    #[test]
    fn test_upload_next_payload() {
        let entries = payload_map(&Request::upload_next(32, &[7; 10]).build().unwrap());
        assert_eq!(keys(&entries), ["_h", "off", "data"]);
        assert_eq!(entries[1].1, int(32));
        assert_eq!(entries[2].1, Value::Bytes(vec![7; 10]));
    }

    #[test]
    fn test_decode_rc_and_off() {
        let message = response(vec![(text("rc"), int(0)), (text("off"), int(32))]);
        let rsp = decode_response(&message).unwrap();
        assert_eq!(rsp.rc, 0);
        assert_eq!(rsp.off, Some(32));
        assert_eq!(rsp.header.op(), Some(Op::WriteResponse));
    }

    #[test]
    fn test_decode_rc_defaults_to_zero() {
        let rsp = decode_response(&response(vec![(text("off"), int(512))])).unwrap();
        assert_eq!(rsp.rc, 0);
        assert_eq!(rsp.off, Some(512));
    }

    #[test]
    fn test_decode_empty_map() {
        let rsp = decode_response(&response(Vec::new())).unwrap();
        assert_eq!(rsp.rc, 0);
        assert_eq!(rsp.off, None);
    }

    #[test]
    fn test_decode_negative_rc() {
        let rsp = decode_response(&response(vec![(text("rc"), int(-3))])).unwrap();
        assert_eq!(rsp.rc, -3);
    }

    #[test]
    fn test_decode_stops_at_non_text_key() {
        let message = response(vec![
            (text("rc"), int(0)),
            (int(1), text("ignored")),
            (text("off"), int(99)),
        ]);
        let rsp = decode_response(&message).unwrap();
        assert_eq!(rsp.off, None);
    }

    #[test]
    fn test_decode_skips_unknown_integer_fields() {
        let message = response(vec![
            (text("rc"), int(0)),
            (text("len"), int(4096)),
            (text("off"), int(64)),
        ]);
        assert_eq!(decode_response(&message).unwrap().off, Some(64));
    }

    #[test]
    fn test_decode_rejects_non_integer_unknown_field() {
        let message = response(vec![
            (text("rc"), int(0)),
            (text("match"), Value::Bool(true)),
            (text("off"), int(100)),
        ]);
        assert!(matches!(decode_response(&message), Err(Error::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_non_integer_rc() {
        let message = response(vec![(text("rc"), text("zero"))]);
        assert!(matches!(decode_response(&message), Err(Error::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_negative_off() {
        let message = response(vec![(text("off"), int(-1))]);
        assert!(matches!(decode_response(&message), Err(Error::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_non_map() {
        let mut message = Header::new(Op::WriteResponse, Group::Image, 1)
            .to_bytes()
            .to_vec();
        ciborium::into_writer(&int(5), &mut message).unwrap();
        assert!(matches!(decode_response(&message), Err(Error::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_truncated() {
        assert!(matches!(decode_response(&[0x03, 0x00]), Err(Error::Decode(_))));

        let mut message = response(vec![(text("off"), int(5))]);
        message.truncate(message.len() - 1);
        assert!(matches!(decode_response(&message), Err(Error::Decode(_))));
    }

    #[test]
    fn test_is_response() {
        assert!(is_response(&response(Vec::new())));
        assert!(!is_response(&Request::reset().build().unwrap()));
        assert!(!is_response(&[0x03]));
    }
}
