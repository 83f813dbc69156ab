//! Segmented image upload.
//!
//! The image is delivered as a series of upload requests, strictly one in
//! flight at a time. The device answers each request with the offset it
//! wants next, which drives the decision to advance or to resend.
//!
//! ```text
//! host                                             device
//!  |-- upload {off: 0, len: N, sha, data[0..32]} ---->|
//!  |<-------------------------- {rc: 0, off: 32} -----|
//!  |-- upload {off: 32, data[32..32+c]} ------------->|
//!  |<------------------------ {rc: 0, off: 32+c} -----|
//!  |                        ...                       |
//!  |<--------------------------- {rc: 0, off: N} -----|
//! ```
//!
//! Segment 0 is always short: the device may be busy erasing its image slot
//! after it sees the total length, so the first round trip also gets a much
//! longer timeout than the rest.
//!
//! While waiting for an acknowledgement the next request is already built,
//! so advancing costs nothing. Nothing is written early.

use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::nlip::{self, FrameDecoder};
use crate::protocol::nmgr::{self, Request, Response};

/// Payload bytes carried by segment 0.
pub const FIRST_SEGMENT_LEN: usize = 32;

/// Response timeout while segment 0 is in flight.
pub const FIRST_SEGMENT_TIMEOUT: Duration = Duration::from_secs(16);

/// Response timeout for every later segment.
pub const NEXT_SEGMENT_TIMEOUT: Duration = Duration::from_secs(1);

/// Response timeout for the console echo control request.
pub const ECHO_TIMEOUT: Duration = Duration::from_secs(2);

/// Response timeout for the reset request.
pub const RESET_TIMEOUT: Duration = Duration::from_secs(2);

/// Default configured chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 512;

/// Smallest accepted chunk size.
pub const MIN_CHUNK_SIZE: usize = 64;

/// Largest accepted chunk size.
pub const MAX_CHUNK_SIZE: usize = 2048;

/// Room reserved in a chunk for the non-data payload fields.
pub const PAYLOAD_OVERHEAD: usize = 16;

/// Longest uninterrupted read while an interrupt checker is installed.
const INTERRUPT_POLL: Duration = Duration::from_millis(100);

/// Receive buffer size for a single transport read.
const READ_BUF_LEN: usize = 128;

/// Per-segment data budget for a configured chunk size.
///
/// The chunk bounds the base64 text on the wire, so the raw budget is three
/// quarters of it, minus room for the other payload fields.
pub fn effective_chunk_size(chunk_size: usize) -> usize {
    (chunk_size * 3 / 4).saturating_sub(PAYLOAD_OVERHEAD)
}

/// Upload tuning.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Configured chunk size, see [`effective_chunk_size`].
    pub chunk_size: usize,
    /// Response timeout while segment 0 is in flight.
    pub first_timeout: Duration,
    /// Response timeout for later segments.
    pub next_timeout: Duration,
    /// Retransmissions allowed per segment, `None` for no limit.
    pub max_retries: Option<u32>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            first_timeout: FIRST_SEGMENT_TIMEOUT,
            next_timeout: NEXT_SEGMENT_TIMEOUT,
            max_retries: None,
        }
    }
}

impl UploadConfig {
    /// Set the chunk size.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set both response timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, first: Duration, next: Duration) -> Self {
        self.first_timeout = first;
        self.next_timeout = next;
        self
    }

    /// Set the per-segment retransmission budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Check the configuration before a transfer.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(Error::Config(format!(
                "invalid chunk size {}, has to be between {MIN_CHUNK_SIZE} and {MAX_CHUNK_SIZE} bytes",
                self.chunk_size
            )));
        }
        if self.first_timeout.is_zero() || self.next_timeout.is_zero() {
            return Err(Error::Config("response timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

/// A slice `[offset, offset + len)` of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Start offset in the image.
    pub offset: usize,
    /// Number of bytes.
    pub len: usize,
}

impl Segment {
    /// Offset one past the last byte.
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.offset, self.end())
    }
}

/// What an acknowledged offset means for the segment in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// The whole image has been received.
    Complete,
    /// The segment in flight was received.
    Expected,
    /// The device wants some other offset; resend the segment in flight.
    Unexpected,
}

/// Mutable state of one transfer.
///
/// The committed offset only moves forward, and only to the end of the
/// segment the device just confirmed.
#[derive(Debug)]
pub struct UploadSession<'a> {
    image: &'a [u8],
    chunk: usize,
    offset: usize,
    current: Segment,
    timeout: Duration,
    first_timeout: Duration,
    next_timeout: Duration,
    retries: u32,
    max_retries: Option<u32>,
}

impl<'a> UploadSession<'a> {
    /// Create a session with segment 0 in flight.
    pub fn new(image: &'a [u8], config: &UploadConfig) -> Self {
        Self {
            image,
            chunk: effective_chunk_size(config.chunk_size),
            offset: 0,
            current: Segment {
                offset: 0,
                len: FIRST_SEGMENT_LEN.min(image.len()),
            },
            timeout: config.first_timeout,
            first_timeout: config.first_timeout,
            next_timeout: config.next_timeout,
            retries: 0,
            max_retries: config.max_retries,
        }
    }

    /// Bytes confirmed by the device.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Image length.
    pub fn total(&self) -> usize {
        self.image.len()
    }

    /// Per-segment data budget.
    pub fn chunk(&self) -> usize {
        self.chunk
    }

    /// Segment in flight.
    pub fn current(&self) -> Segment {
        self.current
    }

    /// Active response timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Retransmissions of the segment in flight so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Segment following the one in flight, `None` at the end of the image.
    pub fn next_segment(&self) -> Option<Segment> {
        let offset = self.current.end();
        (offset < self.image.len()).then(|| Segment {
            offset,
            len: (self.image.len() - offset).min(self.chunk),
        })
    }

    /// Image bytes of `segment`.
    pub fn data(&self, segment: Segment) -> &'a [u8] {
        &self.image[segment.offset..segment.end()]
    }

    /// Build the upload request for `segment`.
    pub fn request(&self, segment: Segment) -> Request {
        let data = self.data(segment);
        if segment.offset == 0 {
            Request::upload_first(self.image.len(), data)
        } else {
            Request::upload_next(segment.offset, data)
        }
    }

    /// Classify the offset the device acknowledged.
    pub fn acknowledge(&mut self, acked: u64) -> Result<Ack> {
        let total = self.image.len() as u64;
        if acked == total {
            self.offset = self.image.len();
            return Ok(Ack::Complete);
        }
        if acked > total {
            return Err(Error::OffsetOverrun {
                offset: acked,
                size: self.image.len(),
            });
        }

        self.timeout = self.next_timeout;
        if acked == self.current.end() as u64 {
            Ok(Ack::Expected)
        } else {
            Ok(Ack::Unexpected)
        }
    }

    /// Commit the segment in flight and move on to the next one.
    pub fn advance(&mut self) {
        self.offset = self.current.end();
        if let Some(next) = self.next_segment() {
            self.current = next;
        }
        self.timeout = self.next_timeout;
        self.retries = 0;
    }

    /// Account for resending the segment in flight.
    pub fn retransmit(&mut self) -> Result<()> {
        if self
            .max_retries
            .is_some_and(|max| self.retries >= max)
        {
            return Err(Error::RetriesExhausted {
                offset: self.current.offset,
                attempts: self.retries,
            });
        }

        self.retries += 1;
        if self.current.offset == 0 {
            self.timeout = self.first_timeout;
        }
        Ok(())
    }

    /// Whether every byte has been confirmed.
    pub fn is_complete(&self) -> bool {
        self.offset == self.image.len()
    }
}

/// Why a segment is sent again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetransmitReason {
    /// No response before the timeout.
    Timeout,
    /// The device acknowledged an offset other than the segment end.
    UnexpectedOffset {
        /// Offset that would have confirmed the segment.
        expected: u64,
        /// Offset the device reported.
        acked: u64,
    },
}

/// Progress notifications emitted during [`Uploader::upload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadEvent {
    /// The transfer is about to start.
    Started {
        /// Image length.
        total: usize,
    },
    /// A segment was written to the port.
    Sent(Segment),
    /// The device acknowledged an offset.
    Acknowledged {
        /// Offset the device wants next.
        offset: u64,
        /// Image length.
        total: usize,
    },
    /// Bytes confirmed so far; never decreases.
    Committed {
        /// Committed offset.
        offset: usize,
        /// Image length.
        total: usize,
    },
    /// A segment is about to be resent.
    Retransmit {
        /// Segment being resent.
        segment: Segment,
        /// What triggered it.
        reason: RetransmitReason,
    },
}

/// Summary of a completed upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadReport {
    /// Image length.
    pub bytes: usize,
    /// Segments confirmed by the device.
    pub segments: usize,
    /// Segments sent again.
    pub retransmits: usize,
    /// Wall-clock duration of the transfer.
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SendAndPrepareNext,
    AwaitAck,
    Retransmit(RetransmitReason),
    Advance,
    Done,
}

type InterruptChecker = Box<dyn Fn() -> bool + Send>;

/// Drives management requests and image uploads over a [`Port`].
pub struct Uploader<P: Port> {
    port: P,
    config: UploadConfig,
    decoder: FrameDecoder,
    seq: u8,
    interrupt: Option<InterruptChecker>,
}

impl<P: Port> Uploader<P> {
    /// Create a new uploader with the default configuration.
    pub fn new(port: P) -> Self {
        Self::with_config(port, UploadConfig::default())
    }

    /// Create a new uploader with a custom configuration.
    pub fn with_config(port: P, config: UploadConfig) -> Self {
        Self {
            port,
            config,
            decoder: FrameDecoder::new(),
            seq: 0,
            interrupt: None,
        }
    }

    /// Install a checker polled between reads; returning `true` aborts the
    /// current operation with [`Error::Interrupted`].
    #[must_use]
    pub fn with_interrupt_checker<F>(mut self, checker: F) -> Self
    where
        F: Fn() -> bool + Send + 'static,
    {
        self.interrupt = Some(Box::new(checker));
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Get the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Consume the uploader and return the port.
    pub fn into_inner(self) -> P {
        self.port
    }

    /// Terminate whatever the device shell has buffered on its input line.
    pub fn flush_console(&mut self) -> Result<()> {
        trace!("Flushing device console");
        self.port.write_all_bytes(b"\n")
    }

    /// Turn the device console echo on or off.
    pub fn set_echo(&mut self, enabled: bool) -> Result<()> {
        let response = self.transact(Request::echo_ctl(enabled), ECHO_TIMEOUT)?;
        if response.rc != 0 {
            return Err(Error::Rejected { rc: response.rc });
        }
        debug!("Console echo {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Ask the device to reset.
    ///
    /// The device may reboot before it answers, so a missing response is not
    /// an error.
    pub fn reset(&mut self) -> Result<()> {
        match self.transact(Request::reset(), RESET_TIMEOUT) {
            Ok(response) if response.rc != 0 => Err(Error::Rejected { rc: response.rc }),
            Ok(_) => {
                info!("Device reset");
                Ok(())
            },
            Err(e) if e.is_timeout() => {
                warn!("No response to reset request, device is probably rebooting");
                Ok(())
            },
            Err(e) => Err(e),
        }
    }

    /// Upload `image`, reporting progress through `on_event`.
    pub fn upload<F>(&mut self, image: &[u8], mut on_event: F) -> Result<UploadReport>
    where
        F: FnMut(UploadEvent),
    {
        self.config.validate()?;
        if image.is_empty() {
            return Err(Error::Config("image is empty".into()));
        }

        let started = Instant::now();
        let mut session = UploadSession::new(image, &self.config);
        let total = session.total();
        let mut segments = 0;
        let mut retransmits = 0;

        info!(
            "Starting upload of {total} bytes ({} bytes per segment)",
            session.chunk()
        );
        on_event(UploadEvent::Started { total });

        let mut message = self.prepare(&session, session.current())?;
        let mut next_message = None;
        let mut state = State::SendAndPrepareNext;

        while state != State::Done {
            state = match state {
                State::SendAndPrepareNext => {
                    self.check_interrupted()?;
                    nlip::write_message(&mut self.port, &message)?;
                    on_event(UploadEvent::Sent(session.current()));

                    next_message = session
                        .next_segment()
                        .map(|segment| self.prepare(&session, segment))
                        .transpose()?;
                    State::AwaitAck
                },
                State::AwaitAck => match self.await_response(session.timeout()) {
                    Err(e) if e.is_timeout() => {
                        warn!(
                            "No response for segment {} within {:?}",
                            session.current(),
                            session.timeout()
                        );
                        State::Retransmit(RetransmitReason::Timeout)
                    },
                    Err(e) => return Err(e),
                    Ok(response) => {
                        let acked = upload_offset(&response)?;
                        debug!("ack to {acked}");
                        on_event(UploadEvent::Acknowledged {
                            offset: acked,
                            total,
                        });

                        match session.acknowledge(acked)? {
                            Ack::Complete => {
                                segments += 1;
                                on_event(UploadEvent::Committed {
                                    offset: session.offset(),
                                    total,
                                });
                                State::Done
                            },
                            Ack::Expected => {
                                segments += 1;
                                State::Advance
                            },
                            Ack::Unexpected => {
                                let expected = session.current().end() as u64;
                                warn!("Device acknowledged offset {acked}, expected {expected}");
                                State::Retransmit(RetransmitReason::UnexpectedOffset {
                                    expected,
                                    acked,
                                })
                            },
                        }
                    },
                },
                State::Retransmit(reason) => {
                    session.retransmit()?;
                    retransmits += 1;
                    let segment = session.current();
                    warn!(
                        "Retransmitting segment {segment} (attempt {})",
                        session.retries()
                    );
                    on_event(UploadEvent::Retransmit { segment, reason });

                    message = self.prepare(&session, segment)?;
                    State::SendAndPrepareNext
                },
                State::Advance => {
                    session.advance();
                    on_event(UploadEvent::Committed {
                        offset: session.offset(),
                        total,
                    });
                    if session.is_complete() {
                        State::Done
                    } else {
                        match next_message.take() {
                            Some(prepared) => message = prepared,
                            None => message = self.prepare(&session, session.current())?,
                        }
                        State::SendAndPrepareNext
                    }
                },
                State::Done => State::Done,
            };
        }

        let report = UploadReport {
            bytes: total,
            segments,
            retransmits,
            elapsed: started.elapsed(),
        };
        info!(
            "Upload complete: {} bytes in {:.2?} ({} retransmits)",
            report.bytes, report.elapsed, report.retransmits
        );
        Ok(report)
    }

    fn next_seq(&mut self) -> u8 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    fn prepare(&mut self, session: &UploadSession<'_>, segment: Segment) -> Result<Vec<u8>> {
        debug!("Prepared segment {segment}");
        session
            .request(segment)
            .with_seq(self.next_seq())
            .build()
    }

    fn transact(&mut self, request: Request, timeout: Duration) -> Result<Response> {
        let message = request
            .with_seq(self.next_seq())
            .build()?;
        nlip::write_message(&mut self.port, &message)?;
        self.await_response(timeout)
    }

    fn check_interrupted(&self) -> Result<()> {
        if self
            .interrupt
            .as_ref()
            .is_some_and(|checker| checker())
        {
            return Err(Error::Interrupted);
        }
        Ok(())
    }

    /// Read until a response message arrives or `timeout` elapses.
    ///
    /// Anything that decodes cleanly but is not a response (our own frames
    /// echoed back by the console) is skipped. Bytes left over after the
    /// response stay buffered for the next round trip.
    fn await_response(&mut self, timeout: Duration) -> Result<Response> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; READ_BUF_LEN];

        loop {
            while let Some(message) = self.decoder.next_message()? {
                if nmgr::is_response(&message) {
                    return nmgr::decode_response(&message);
                }
                trace!("Ignoring non-response message ({} bytes)", message.len());
            }

            self.check_interrupted()?;
            let slice_deadline = if self.interrupt.is_some() {
                deadline.min(Instant::now() + INTERRUPT_POLL)
            } else {
                deadline
            };

            match self
                .port
                .read_with_deadline(&mut buf, slice_deadline)
            {
                Ok(n) => {
                    trace!("RX ({n} bytes): {:02x?}", &buf[..n]);
                    self.decoder.push(&buf[..n]);
                },
                Err(e) if e.is_timeout() && slice_deadline < deadline => {},
                Err(e) => return Err(e),
            }
        }
    }
}

fn upload_offset(response: &Response) -> Result<u64> {
    if response.rc != 0 {
        return Err(Error::Rejected { rc: response.rc });
    }
    response
        .off
        .ok_or_else(|| Error::Decode("upload response without offset".into()))
}
