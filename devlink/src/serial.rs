//! Serial port backend
//!
//! Provides the [`Port`] implementation for real hardware and the discovery of
//! candidate addresses.
use std::{
    io::{self, Read, Write},
    time::Duration,
};

use devlink_protocol::Port;
use serialport::SerialPortType;

use crate::error::TransportError;

/// How long a blocking read waits for the first byte.
const READ_TIMEOUT: Duration = Duration::from_millis(10);

/// A serial port opened through the `serialport` crate.
pub struct SerialPortIo {
    name: String,
    port: Option<Box<dyn serialport::SerialPort>>,
    baud_rate: u32,
}

impl SerialPortIo {
    pub fn open(address: &str, baud_rate: u32) -> Result<SerialPortIo, TransportError> {
        log::debug!("Attempting to open address '{}'", address);
        let port = serialport::new(address, baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| TransportError::from_io(address, e.into()))?;
        Ok(SerialPortIo {
            name: address.to_string(),
            port: Some(port),
            baud_rate,
        })
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port is closed"))
    }
}

impl Port for SerialPortIo {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let port = self.port()?;
        port.write_all(data)?;
        port.flush()
    }

    fn bytes_to_read(&mut self) -> io::Result<usize> {
        Ok(self.port()?.bytes_to_read()? as usize)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port()?.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            other => other,
        }
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()> {
        self.port()?.set_baud_rate(baud_rate)?;
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn close(&mut self) -> io::Result<()> {
        // serialport closes the handle on drop
        self.port.take();
        Ok(())
    }
}

/// Opens `address` as a boxed [`Port`]. This is the default opener used by discovery.
pub fn open(address: &str, baud_rate: u32) -> Result<Box<dyn Port>, TransportError> {
    Ok(Box::new(SerialPortIo::open(address, baud_rate)?))
}

/// Lists the addresses of USB serial ports, sorted by name.
pub fn usb_addresses() -> Result<Vec<String>, TransportError> {
    let ports = serialport::available_ports().map_err(|e| {
        log::error!("Failed to enumerate serial ports: {}", e);
        TransportError::from_io("*", e.into())
    })?;
    let mut addresses: Vec<String> = ports
        .into_iter()
        .filter(|port| matches!(port.port_type, SerialPortType::UsbPort(_)))
        .map(|port| port.port_name)
        .collect();
    addresses.sort();
    Ok(addresses)
}
