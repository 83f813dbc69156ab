//! Scripted in-memory device for exercising the protocol stack.
//!
//! Writes are run through a real [`FrameDecoder`], so every request the code
//! under test sends is validated exactly as a device would see it. Each
//! decoded request consumes one [`Reply`] from the script (or the fallback
//! once the script runs dry). Reads never block: an empty receive queue is an
//! immediate timeout.

use std::collections::VecDeque;
use std::time::Instant;

use ciborium::Value;

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::nlip::{self, FrameDecoder};
use crate::protocol::nmgr::{Group, HEADER_LEN, Header, Op, image_id};

/// How the device answers one request.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    /// Behave like a conforming device: accept in-order segments and report
    /// the next offset it wants.
    Auto,
    /// `rc: 0` with an explicit `off`.
    Ack(u64),
    /// Result code only.
    Rc(i64),
    /// Arbitrary payload entries.
    Fields(Vec<(Value, Value)>),
    /// Swallow the request without processing it.
    Silence,
    /// Process the request like [`Reply::Auto`] but hold the response back
    /// until the next request arrives. That request is swallowed.
    Late,
    /// Process the request like [`Reply::Auto`] but lose the response.
    Lost,
    /// Queue raw bytes instead of a framed response.
    Raw(Vec<u8>),
    /// Several replies to the same request, in order.
    Multi(Vec<Reply>),
}

/// Fields of an upload request as the device parsed them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UploadRequest {
    pub off: u64,
    pub len: Option<u64>,
    pub data: Vec<u8>,
}

pub(crate) struct MockDevice {
    script: VecDeque<Reply>,
    fallback: Reply,
    echo: bool,
    max_read: usize,
    decoder: FrameDecoder,
    rx: VecDeque<u8>,
    held: Option<Vec<u8>>,
    /// Every message the device decoded, in order.
    pub requests: Vec<Vec<u8>>,
    /// Raw bytes written by the host.
    pub written: Vec<u8>,
    /// Image as assembled from accepted segments.
    pub image: Vec<u8>,
}

impl MockDevice {
    /// Device that answers every request like a conforming target.
    pub fn auto() -> Self {
        Self::scripted(Vec::new()).with_fallback(Reply::Auto)
    }

    /// Device that follows `script`, then goes silent.
    pub fn scripted(script: Vec<Reply>) -> Self {
        Self {
            script: script.into(),
            fallback: Reply::Silence,
            echo: false,
            max_read: 37,
            decoder: FrameDecoder::new(),
            rx: VecDeque::new(),
            held: None,
            requests: Vec::new(),
            written: Vec::new(),
            image: Vec::new(),
        }
    }

    pub fn with_fallback(mut self, reply: Reply) -> Self {
        self.fallback = reply;
        self
    }

    /// Echo every written byte back, like a console with echo still on.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Upload requests received so far.
    pub fn uploads(&self) -> Vec<UploadRequest> {
        self.requests
            .iter()
            .filter(|m| {
                Header::parse(m)
                    .is_some_and(|h| h.group == Group::Image as u16 && h.id == image_id::UPLOAD)
            })
            .map(|m| parse_upload(m))
            .collect()
    }

    /// Offsets of all upload requests, retransmissions included.
    pub fn upload_offsets(&self) -> Vec<u64> {
        self.uploads()
            .iter()
            .map(|u| u.off)
            .collect()
    }

    fn handle(&mut self, request: &[u8]) {
        if let Some(held) = self.held.take() {
            self.rx.extend(held);
            return;
        }

        let reply = self
            .script
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        self.respond(request, reply);
    }

    fn respond(&mut self, request: &[u8], reply: Reply) {
        let Some(header) = Header::parse(request) else {
            return;
        };

        let fields = match reply {
            Reply::Auto => self.auto_fields(&header, request),
            Reply::Ack(off) => vec![field("rc", 0), field("off", off as i64)],
            Reply::Rc(rc) => vec![field("rc", rc)],
            Reply::Fields(fields) => fields,
            Reply::Silence => return,
            Reply::Late => {
                let fields = self.auto_fields(&header, request);
                self.held = Some(frame(&response(&header, fields)));
                return;
            },
            Reply::Lost => {
                self.auto_fields(&header, request);
                return;
            },
            Reply::Raw(bytes) => {
                self.rx.extend(bytes);
                return;
            },
            Reply::Multi(replies) => {
                for reply in replies {
                    self.respond(request, reply);
                }
                return;
            },
        };

        let framed = frame(&response(&header, fields));
        self.rx.extend(framed);
    }

    fn auto_fields(&mut self, header: &Header, request: &[u8]) -> Vec<(Value, Value)> {
        if header.group != Group::Image as u16 || header.id != image_id::UPLOAD {
            return vec![field("rc", 0)];
        }

        let upload = parse_upload(request);
        if upload.off == 0 && upload.len.is_some() {
            self.image.clear();
        }
        if upload.off == self.image.len() as u64 {
            self.image.extend_from_slice(&upload.data);
        }
        vec![field("rc", 0), field("off", self.image.len() as i64)]
    }
}

impl Port for MockDevice {
    fn name(&self) -> &str {
        "mock"
    }

    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.written.extend_from_slice(buf);
        if self.echo {
            self.rx.extend(buf.iter().copied());
        }

        self.decoder.push(buf);
        while let Some(message) = self.decoder.next_message()? {
            self.requests.push(message.clone());
            self.handle(&message);
        }
        Ok(())
    }

    fn read_with_deadline(&mut self, buf: &mut [u8], _deadline: Instant) -> Result<usize> {
        if self.rx.is_empty() {
            return Err(Error::Timeout("mock: no data".into()));
        }

        let n = buf.len().min(self.rx.len()).min(self.max_read);
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

fn frame(message: &[u8]) -> Vec<u8> {
    nlip::encode(message)
        .unwrap()
        .concat()
}

pub(crate) fn field(key: &str, value: i64) -> (Value, Value) {
    (Value::Text(key.into()), Value::Integer(value.into()))
}

/// Build a write response correlated with `request`.
pub(crate) fn response(request: &Header, fields: Vec<(Value, Value)>) -> Vec<u8> {
    let mut payload = Vec::new();
    ciborium::into_writer(&Value::Map(fields), &mut payload).unwrap();

    let header = Header {
        op: Op::WriteResponse as u8,
        flags: 0,
        len: payload.len() as u16,
        group: request.group,
        seq: request.seq,
        id: request.id,
    };
    let mut message = header.to_bytes().to_vec();
    message.extend_from_slice(&payload);
    message
}

fn parse_upload(message: &[u8]) -> UploadRequest {
    let Value::Map(entries) = ciborium::from_reader::<Value, _>(&message[HEADER_LEN..]).unwrap()
    else {
        panic!("upload payload is not a map");
    };

    let mut upload = UploadRequest {
        off: 0,
        len: None,
        data: Vec::new(),
    };
    for (key, value) in entries {
        match (key.as_text().unwrap(), value) {
            ("off", Value::Integer(v)) => upload.off = u64::try_from(v).unwrap(),
            ("len", Value::Integer(v)) => upload.len = Some(u64::try_from(v).unwrap()),
            ("data", Value::Bytes(data)) => upload.data = data,
            _ => {},
        }
    }
    upload
}
