//! # serupload
//!
//! Upload firmware images to a device over its newtmgr serial console.
//!
//! This crate provides the host side of the image upload protocol spoken by
//! the device shell:
//!
//! - Line framing of binary messages as base64 text with a CRC16 trailer
//! - Management request/response messages (8-byte header + CBOR map)
//! - A segmented upload engine with retransmission on timeout or on an
//!   unexpected acknowledgement
//! - Serial port access and USB bridge discovery
//!
//! ## Supported Platforms
//!
//! - **Native** (default): Linux, macOS, Windows via the `serialport` crate
//!
//! Any other transport can be plugged in by implementing [`Port`].
//!
//! ## Features
//!
//! - `native` (default): Native serial port support
//!
//! ## Example
//!
//! ```rust,no_run
//! use serupload::{SerialConfig, UploadConfig, UploadEvent, Uploader};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = std::fs::read("app.img")?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let port = serupload::NativePort::open(&SerialConfig::new("/dev/ttyUSB0", 115200))?;
//!         let mut uploader = Uploader::with_config(port, UploadConfig::default());
//!
//!         uploader.flush_console()?;
//!         uploader.set_echo(false)?;
//!         let report = uploader.upload(&image, |event| {
//!             if let UploadEvent::Acknowledged { offset, total } = event {
//!                 println!("{offset}/{total}");
//!             }
//!         })?;
//!         println!("Uploaded {} bytes in {:?}", report.bytes, report.elapsed);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod error;
pub mod port;
pub mod protocol;
pub mod upload;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    device::{DetectedPort, DeviceKind, detect_ports, format_port_list, select_port},
    error::{Error, Result},
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{FrameDecoder, Request, Response},
    upload::{
        RetransmitReason, Segment, UploadConfig, UploadEvent, UploadReport, UploadSession,
        Uploader,
    },
};
#[cfg(feature = "native")]
pub use device::auto_detect_port;
