//! Native serial port implementation using the `serialport` crate.
//!
//! This module provides the serial port implementation for native platforms
//! (Linux, macOS, Windows, FreeBSD, etc.). The line is always configured raw:
//! 8 data bits, no parity, one stop bit, no flow control.

use {
    crate::{
        error::{Error, Result},
        port::{Port, PortEnumerator, PortInfo, SerialConfig},
    },
    log::debug,
    std::{
        io::{ErrorKind, Read, Write},
        time::{Duration, Instant},
    },
};

/// Native serial port implementation.
pub struct NativePort {
    port: Box<dyn serialport::SerialPort>,
    name: String,
    poll_interval: Duration,
}

impl NativePort {
    /// Open a serial port with the given configuration.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.poll_interval)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()?;

        debug!(
            "Opened {} at {} baud",
            config.port_name, config.baud_rate
        );

        if config.low_latency {
            set_low_latency(&config.port_name);
        }

        Ok(Self {
            port,
            name: config
                .port_name
                .clone(),
            poll_interval: config.poll_interval,
        })
    }
}

impl Port for NativePort {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_with_deadline(&mut self, buf: &mut [u8], deadline: Instant) -> Result<usize> {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout("read timed out".into()));
            }

            // Never block past the deadline.
            let slice = (deadline - now).min(self.poll_interval);
            self.port.set_timeout(slice)?;

            match self.port.read(buf) {
                Ok(0) => {},
                Ok(n) => return Ok(n),
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) => {},
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }
}

/// Shorten the USB serial adapter's latency timer.
///
/// Best effort: adapters without the sysfs knob are left alone.
#[cfg(target_os = "linux")]
fn set_low_latency(port_name: &str) {
    let Some(dev) = std::path::Path::new(port_name).file_name() else {
        return;
    };
    let path = std::path::Path::new("/sys/bus/usb-serial/devices")
        .join(dev)
        .join("latency_timer");

    match std::fs::write(&path, "1") {
        Ok(()) => log::trace!("Set {} to 1", path.display()),
        Err(e) => log::warn!("Failed to set {} to 1: {e}", path.display()),
    }
}

#[cfg(not(target_os = "linux"))]
fn set_low_latency(_port_name: &str) {}

/// Native port enumerator.
pub struct NativePortEnumerator;

impl PortEnumerator for NativePortEnumerator {
    fn list_ports() -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(Error::Serial)?;

        Ok(ports
            .into_iter()
            .map(|p| {
                let (vid, pid, manufacturer, product, serial_number) = match &p.port_type {
                    serialport::SerialPortType::UsbPort(info) => (
                        Some(info.vid),
                        Some(info.pid),
                        info.manufacturer
                            .clone(),
                        info.product
                            .clone(),
                        info.serial_number
                            .clone(),
                    ),
                    _ => (None, None, None, None, None),
                };

                PortInfo {
                    name: p.port_name,
                    vid,
                    pid,
                    manufacturer,
                    product,
                    serial_number,
                }
            })
            .collect())
    }
}
