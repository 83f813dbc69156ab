//! Serial port discovery and USB bridge classification.
//!
//! Development boards running the newtmgr shell usually sit behind a USB to
//! UART bridge or expose a CDC console through a debug probe. Knowing the
//! bridge lets `list-ports` label ports and lets the CLI pick a port when
//! none was given.

use crate::error::{Error, Result};

#[cfg(feature = "native")]
use log::{debug, info, trace};

/// Known USB bridge/probe kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// FTDI FT232/FT2232/FT4232 USB-to-Serial converter.
    Ftdi,
    /// Silicon Labs CP210x USB-to-Serial converter.
    Cp210x,
    /// CH340/CH341 USB-to-Serial converter.
    Ch340,
    /// Prolific PL2303 USB-to-Serial converter.
    Prolific,
    /// SEGGER J-Link virtual COM port.
    JLink,
    /// Unknown device.
    Unknown,
}

/// Known USB VID/PID pairs. An empty PID list matches any product.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (
        0x0403,
        &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015],
        DeviceKind::Ftdi,
    ),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71, 0xEA63], DeviceKind::Cp210x),
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x5512, 0x55D4],
        DeviceKind::Ch340,
    ),
    (0x067B, &[0x2303, 0x23A3, 0x23C3, 0x23D3], DeviceKind::Prolific),
    (0x1366, &[], DeviceKind::JLink),
];

impl DeviceKind {
    /// Classify a USB VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_USB_DEVICES
            .iter()
            .find(|(known_vid, pids, _)| vid == *known_vid && (pids.is_empty() || pids.contains(&pid)))
            .map_or(Self::Unknown, |(_, _, kind)| *kind)
    }

    /// Get a human-readable name for the device kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ftdi => "FTDI",
            Self::Cp210x => "CP210x",
            Self::Ch340 => "CH340/CH341",
            Self::Prolific => "PL2303",
            Self::JLink => "J-Link",
            Self::Unknown => "Unknown",
        }
    }

    /// Check if this is a known/expected device kind.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// Discovered serial port with metadata.
#[derive(Debug, Clone)]
pub struct DetectedPort {
    /// Port name/path (e.g., "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// Classified device kind.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    fn from_info(info: crate::port::PortInfo) -> Self {
        let device = match (info.vid, info.pid) {
            (Some(vid), Some(pid)) => DeviceKind::from_vid_pid(vid, pid),
            _ => DeviceKind::Unknown,
        };
        Self {
            name: info.name,
            device,
            vid: info.vid,
            pid: info.pid,
            manufacturer: info.manufacturer,
            product: info.product,
            serial: info.serial_number,
        }
    }
}

/// Detect all available serial ports with metadata.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    use crate::port::{NativePortEnumerator, PortEnumerator};

    match NativePortEnumerator::list_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|info| {
                let detected = DetectedPort::from_info(info);
                trace!("Found port: {} ({:?})", detected.name, detected.device);
                detected
            })
            .collect(),
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    }
}

/// Detect all available serial ports (no native backend: always empty).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Pick the single port an upload should use when none was named.
///
/// A lone port with a known bridge wins. Without any known bridge, a lone
/// port of any kind is accepted. Everything else is ambiguous.
pub fn select_port(ports: &[DetectedPort]) -> Result<&DetectedPort> {
    let known: Vec<&DetectedPort> = ports
        .iter()
        .filter(|p| p.device.is_known())
        .collect();

    match known.as_slice() {
        [only] => Ok(*only),
        [] => match ports {
            [only] => Ok(only),
            [] => Err(Error::DeviceNotFound("no serial ports found".into())),
            _ => Err(ambiguous(ports.iter())),
        },
        _ => Err(ambiguous(known.into_iter())),
    }
}

fn ambiguous<'a>(ports: impl Iterator<Item = &'a DetectedPort>) -> Error {
    let names: Vec<&str> = ports
        .map(|p| p.name.as_str())
        .collect();
    Error::DeviceNotFound(format!(
        "multiple candidate ports ({}), pass --device",
        names.join(", ")
    ))
}

/// Auto-detect a single serial port.
#[cfg(feature = "native")]
pub fn auto_detect_port() -> Result<DetectedPort> {
    let ports = detect_ports();
    let port = select_port(&ports)?;
    if port.device.is_known() {
        info!("Auto-detected {} port: {}", port.device.name(), port.name);
    } else {
        info!("Using only available port: {}", port.name);
    }
    Ok(port.clone())
}

/// Format a list of detected ports for display.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let device_info = if port.device.is_known() {
                format!(" [{}]", port.device.name())
            } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
                format!(" [VID:{vid:04X} PID:{pid:04X}]")
            } else {
                String::new()
            };

            let product_info = port
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();

            format!("{}{}{}", port.name, device_info, product_info)
        })
        .collect()
}
