//! Port abstraction for the byte transport underneath the upload protocol.
//!
//! The protocol layers never open or configure a serial line themselves. They
//! only need two primitives from the channel they are handed:
//!
//! - write a whole buffer, failing on any short write
//! - read whatever bytes are available, blocking no later than an absolute
//!   deadline
//!
//! ```text
//! +------------------+
//! |  Upload Engine   |
//! +--------+---------+
//!          |
//! +--------+---------+
//! | nlip / nmgr      |
//! +--------+---------+
//!          |
//! +--------+---------+
//! |   Port Trait     |
//! +--------+---------+
//!          |
//! +--------+---------+
//! | Native SerialPort|
//! |   (serialport)   |
//! +------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::{Duration, Instant};
//! use serupload::port::Port;
//!
//! fn example<P: Port>(port: &mut P) -> serupload::Result<()> {
//!     port.write_all_bytes(b"\n")?;
//!
//!     let mut buf = [0u8; 64];
//!     let n = port.read_with_deadline(&mut buf, Instant::now() + Duration::from_secs(1))?;
//!     println!("Received: {:?}", &buf[..n]);
//!
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod mock;

use std::time::{Duration, Instant};

use crate::error::Result;

/// Serial link speeds the device console is known to run at.
pub const SUPPORTED_SPEEDS: &[u32] = &[115_200, 230_400, 1_000_000];

/// Default serial link speed.
pub const DEFAULT_SPEED: u32 = 115_200;

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Longest single blocking read before the deadline is re-checked.
    pub poll_interval: Duration,
    /// Lower the USB serial adapter latency timer where the platform allows it.
    pub low_latency: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_SPEED,
            poll_interval: Duration::from_millis(50),
            low_latency: true,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Enable or disable the low-latency adapter tweak.
    #[must_use]
    pub fn with_low_latency(mut self, low_latency: bool) -> Self {
        self.low_latency = low_latency;
        self
    }
}

/// Serial port information.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

/// Byte transport consumed by the protocol layers.
///
/// Implementations exist for:
///
/// - Native platforms via the `serialport` crate
/// - An in-memory scripted device used by the unit tests
pub trait Port: Send {
    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()>;

    /// Read available bytes into `buf`.
    ///
    /// Blocks until at least one byte arrives or `deadline` passes. Returns
    /// [`Error::Timeout`](crate::Error::Timeout) once the deadline has passed
    /// without data. The same port must support repeated bounded reads while
    /// one logical frame accumulates.
    fn read_with_deadline(&mut self, buf: &mut [u8], deadline: Instant) -> Result<usize>;
}

impl<P: Port + ?Sized> Port for &mut P {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        (**self).write_all_bytes(buf)
    }

    fn read_with_deadline(&mut self, buf: &mut [u8], deadline: Instant) -> Result<usize> {
        (**self).read_with_deadline(buf, deadline)
    }
}

/// Trait for listing available serial ports.
///
/// This is separated from `Port` because it's a static operation that
/// doesn't require an open port instance.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;
}

/// Check whether `speed` is one of [`SUPPORTED_SPEEDS`].
pub fn is_supported_speed(speed: u32) -> bool {
    SUPPORTED_SPEEDS.contains(&speed)
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};
