//! Error types for serupload.

use std::io;
use thiserror::Error;

/// Result type for serupload operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for serupload operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No response arrived before the deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Checksum trailer of a received message did not match its contents.
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch {
        /// CRC carried in the message trailer.
        expected: u16,
        /// CRC computed over the received bytes.
        actual: u16,
    },

    /// Malformed wire frame (bad base64, declared length mismatch, oversize message).
    #[error("Framing error: {0}")]
    Framing(String),

    /// Request payload could not be encoded.
    #[error("Encode error: {0}")]
    Encode(String),

    /// Response payload could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The device answered with a non-zero result code.
    #[error("Device rejected request with rc={rc}")]
    Rejected {
        /// Result code reported by the device.
        rc: i64,
    },

    /// The device acknowledged an offset beyond the end of the image.
    #[error("Device acknowledged offset {offset}, larger than image size {size}")]
    OffsetOverrun {
        /// Acknowledged offset.
        offset: u64,
        /// Image size in bytes.
        size: usize,
    },

    /// A segment was retransmitted more times than the configured budget allows.
    #[error("Gave up on segment at offset {offset} after {attempts} retransmissions")]
    RetriesExhausted {
        /// Offset of the segment that could not be delivered.
        offset: usize,
        /// Number of retransmissions attempted.
        attempts: u32,
    },

    /// The embedding application requested the operation to stop.
    #[error("Operation interrupted")]
    Interrupted,

    /// No usable serial device was found.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error is a recoverable read timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Whether this error means a received message failed integrity checks.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::CrcMismatch { .. } | Self::Framing(_))
    }
}
