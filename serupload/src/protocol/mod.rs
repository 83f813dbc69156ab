//! Protocol implementations.
//!
//! - [`crc`]: CRC16-CCITT trailer checksum
//! - [`nlip`]: base64 line framing of binary messages
//! - [`nmgr`]: management message header and CBOR payloads

pub mod crc;
pub mod nlip;
pub mod nmgr;

// Re-export common types
pub use nlip::FrameDecoder;
pub use nmgr::{Group, Header, Op, Request, Response, decode_response};
