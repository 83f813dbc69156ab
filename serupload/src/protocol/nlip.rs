//! Newtmgr line protocol: framing of binary messages over a text console.
//!
//! The device shell is line oriented, so every binary message is carried as
//! one or more base64 lines. Each line starts with a 2-byte raw marker and
//! ends with `\n`:
//!
//! ```text
//! Start line:
//! +--------+--------------------------------------------------+----+
//! | 06 09  | base64( total_len (2, BE) | message[0..91] )     | \n |
//! +--------+--------------------------------------------------+----+
//!
//! Continuation line:
//! +--------+--------------------------------------------------+----+
//! | 04 14  | base64( message[n..n+93] )                       | \n |
//! +--------+--------------------------------------------------+----+
//! ```
//!
//! `total_len` counts the message plus its 2-byte big-endian CRC16-CCITT
//! trailer, which is appended to the raw bytes before any encoding. Both
//! line kinds carry at most 93 raw bytes, so an encoded line never exceeds
//! [`MAX_LINE_LEN`]. Each line is padded on its own, a base64 quantum never
//! spans two lines.

use std::cmp::Ordering;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace};

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::crc;

/// Marker opening the first line of a message.
pub const START_MARKER: u16 = 0x0609;

/// Marker opening every following line of a message.
pub const CONTINUATION_MARKER: u16 = 0x0414;

/// Upper bound of one encoded line, markers and newline included.
pub const MAX_LINE_LEN: usize = 128;

/// Width of the declared-length prefix on the start line.
pub const LENGTH_PREFIX_LEN: usize = 2;

/// Width of the checksum trailer.
pub const CRC_LEN: usize = 2;

/// Raw message bytes carried by the start line (after the length prefix).
pub const START_CHUNK: usize = 91;

/// Raw message bytes carried by a continuation line.
pub const CONTINUATION_CHUNK: usize = 93;

/// Largest message that fits the 16-bit declared length.
pub const MAX_MESSAGE_LEN: usize = u16::MAX as usize - CRC_LEN;

/// Unterminated input beyond this is console noise and gets dropped.
const MAX_PENDING_INPUT: usize = 4096;

/// Encode a message into newline-terminated wire lines.
///
/// The CRC trailer is computed and appended here. Lines must be written in
/// the returned order without anything interleaved.
pub fn encode(message: &[u8]) -> Result<Vec<Vec<u8>>> {
    let total = u16::try_from(message.len() + CRC_LEN)
        .map_err(|_| Error::Framing(format!("message of {} bytes is too long", message.len())))?;

    let mut body = Vec::with_capacity(message.len() + CRC_LEN);
    body.extend_from_slice(message);
    body.extend_from_slice(&crc::checksum(message).to_be_bytes());
    trace!("TX unencoded ({} bytes): {:02x?}", body.len(), body);

    let (first, mut rest) = body.split_at(START_CHUNK.min(body.len()));

    let mut start = Vec::with_capacity(LENGTH_PREFIX_LEN + first.len());
    start.extend_from_slice(&total.to_be_bytes());
    start.extend_from_slice(first);

    let mut lines = Vec::with_capacity(1 + rest.len().div_ceil(CONTINUATION_CHUNK));
    lines.push(encode_line(START_MARKER, &start));

    while !rest.is_empty() {
        let (chunk, tail) = rest.split_at(CONTINUATION_CHUNK.min(rest.len()));
        lines.push(encode_line(CONTINUATION_MARKER, chunk));
        rest = tail;
    }

    Ok(lines)
}

fn encode_line(marker: u16, chunk: &[u8]) -> Vec<u8> {
    let mut line = Vec::with_capacity(MAX_LINE_LEN);
    line.extend_from_slice(&marker.to_be_bytes());
    line.extend_from_slice(
        STANDARD
            .encode(chunk)
            .as_bytes(),
    );
    line.push(b'\n');
    debug_assert!(line.len() <= MAX_LINE_LEN);
    line
}

/// Encode `message` and write its lines to `port` in order.
pub fn write_message<P: Port + ?Sized>(port: &mut P, message: &[u8]) -> Result<()> {
    for line in encode(message)? {
        trace!("TX encoded ({} bytes): {:02x?}", line.len(), line);
        port.write_all_bytes(&line)?;
    }
    Ok(())
}

#[derive(Debug)]
struct Partial {
    declared: usize,
    body: Vec<u8>,
}

/// Reassembles wire lines from an unbounded byte stream into messages.
///
/// Feed transport reads with [`push`](Self::push) and drain complete
/// messages with [`next_message`](Self::next_message). Lines with an
/// unknown marker and lines of two bytes or less are skipped, so unrelated
/// console output on the same link is harmless.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    partial: Option<Partial>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the transport.
    ///
    /// Carriage returns and newlines at the very start of a fresh
    /// accumulation are line-discipline leftovers and are dropped.
    pub fn push(&mut self, mut bytes: &[u8]) {
        if self.buf.is_empty() {
            while let [b'\r' | b'\n', rest @ ..] = bytes {
                bytes = rest;
            }
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Drop all buffered input and any half-assembled message.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.partial = None;
    }

    /// Number of bytes not yet consumed as complete lines.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Return the next validated message, `Ok(None)` if more bytes are needed.
    ///
    /// The returned message has its CRC trailer stripped. A checksum or
    /// length mismatch discards the offending message and is reported as an
    /// error; the decoder stays usable afterwards.
    pub fn next_message(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let Some(end) = self
                .buf
                .iter()
                .position(|&b| b == b'\n')
            else {
                if self.buf.len() > MAX_PENDING_INPUT {
                    debug!("Dropping {} bytes of unterminated input", self.buf.len());
                    self.buf.clear();
                }
                return Ok(None);
            };

            let line: Vec<u8> = self
                .buf
                .drain(..=end)
                .collect();
            if let Some(message) = self.process_line(&line)? {
                return Ok(Some(message));
            }
        }
    }

    fn process_line(&mut self, line: &[u8]) -> Result<Option<Vec<u8>>> {
        if line.len() <= 2 {
            return Ok(None);
        }

        let mut content = &line[..line.len() - 1];
        if let [head @ .., b'\r'] = content {
            content = head;
        }
        if content.len() < 2 {
            return Ok(None);
        }

        let (marker, text) = content.split_at(2);
        match BigEndian::read_u16(marker) {
            START_MARKER => {
                if let Some(stale) = self.partial.take() {
                    debug!(
                        "Dropping incomplete message ({}/{} bytes)",
                        stale.body.len(),
                        stale.declared
                    );
                }

                let decoded = decode_text(text)?;
                if decoded.len() < LENGTH_PREFIX_LEN {
                    return Err(Error::Framing("start line without length prefix".into()));
                }
                let declared = usize::from(BigEndian::read_u16(&decoded));
                if declared < CRC_LEN {
                    return Err(Error::Framing(format!(
                        "declared length {declared} cannot hold a checksum"
                    )));
                }

                self.partial = Some(Partial {
                    declared,
                    body: decoded[LENGTH_PREFIX_LEN..].to_vec(),
                });
            },
            CONTINUATION_MARKER => {
                if self.partial.is_none() {
                    trace!("Ignoring continuation line without a start line");
                    return Ok(None);
                }
                let decoded = decode_text(text).inspect_err(|_| self.partial = None)?;
                if let Some(partial) = self.partial.as_mut() {
                    partial.body.extend_from_slice(&decoded);
                }
            },
            other => {
                trace!("Ignoring line with marker {other:#06x}");
                return Ok(None);
            },
        }

        self.complete()
    }

    fn complete(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(mut partial) = self.partial.take() else {
            return Ok(None);
        };

        match partial.body.len().cmp(&partial.declared) {
            Ordering::Less => {
                self.partial = Some(partial);
                Ok(None)
            },
            Ordering::Greater => Err(Error::Framing(format!(
                "declared length {} but received {} bytes",
                partial.declared,
                partial.body.len()
            ))),
            Ordering::Equal => {
                let split = partial.body.len() - CRC_LEN;
                let expected = BigEndian::read_u16(&partial.body[split..]);
                partial.body.truncate(split);

                let actual = crc::checksum(&partial.body);
                if expected != actual {
                    return Err(Error::CrcMismatch { expected, actual });
                }

                trace!("RX message ({} bytes): {:02x?}", partial.body.len(), partial.body);
                Ok(Some(partial.body))
            },
        }
    }
}

fn decode_text(text: &[u8]) -> Result<Vec<u8>> {
    STANDARD
        .decode(text)
        .map_err(|e| Error::Framing(format!("invalid base64: {e}")))
}
