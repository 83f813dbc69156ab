//! CRC16-CCITT checksum used by the serial line framing.
//!
//! Polynomial `0x1021`, no reflection, no final XOR. With the conventional
//! initial value of zero this is the variant also known as CRC-16/XMODEM.

/// Initial CRC value used by the framing layer.
pub const CRC16_INITIAL: u16 = 0x0000;

const POLY: u16 = 0x1021;

/// Continue a CRC16-CCITT computation from `crc` over `data`.
pub fn crc16_ccitt(mut crc: u16, data: &[u8]) -> u16 {
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// CRC16-CCITT of `data` starting from [`CRC16_INITIAL`].
pub fn checksum(data: &[u8]) -> u16 {
    crc16_ccitt(CRC16_INITIAL, data)
}
