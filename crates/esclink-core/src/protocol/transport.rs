//! Transport abstraction
//!
//! The connection layer talks to a [`Channel`] rather than a serial port
//! directly, so the scanner, connection manager, and uploader all run
//! unchanged against the simulated bus in tests. [`SystemPorts`] is the
//! OS-backed implementation used in the field.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::Duration;

use super::serial::{clear_buffers, list_ports, open_port, PortInfo};
use super::ProtocolError;

/// Byte-stream transport with the small extra surface the receiver loop
/// needs: timeouts, buffer clearing, byte counts, and cloning so one side
/// can read while the other writes.
pub trait Channel: Read + Write + Send {
    /// Set the timeout applied to blocking reads.
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Discard unread inbound bytes.
    fn clear_input(&mut self) -> io::Result<()>;

    /// Discard unsent outbound bytes.
    fn clear_output(&mut self) -> io::Result<()>;

    /// Number of bytes available to read without blocking.
    fn bytes_to_read(&mut self) -> io::Result<u32>;

    /// Clone the channel; both halves address the same underlying stream.
    fn try_clone(&self) -> io::Result<Box<dyn Channel>>;
}

/// Serial port implementation of [`Channel`].
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    /// Wrap an open serial port.
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Channel for SerialChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout).map_err(io::Error::other)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::other)
    }

    fn clear_output(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Output)
            .map_err(io::Error::other)
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.port.bytes_to_read().map_err(io::Error::other)
    }

    fn try_clone(&self) -> io::Result<Box<dyn Channel>> {
        let port_clone = self.port.try_clone().map_err(io::Error::other)?;
        Ok(Box::new(SerialChannel::new(port_clone)))
    }
}

/// Host-OS collaborator interface: enumerate candidate ports and open one.
pub trait PortProvider: Send + Sync {
    /// Enumerate available ports with their free-text descriptions.
    fn list(&self) -> Vec<PortInfo>;

    /// Open a port at the given baud rate. Fails fast with
    /// [`ProtocolError::PortUnavailable`] when the port is missing or held
    /// by another session.
    fn open(&self, name: &str, baud: u32) -> Result<Box<dyn Channel>, ProtocolError>;
}

/// [`PortProvider`] backed by the operating system's serial stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

impl PortProvider for SystemPorts {
    fn list(&self) -> Vec<PortInfo> {
        list_ports()
    }

    fn open(&self, name: &str, baud: u32) -> Result<Box<dyn Channel>, ProtocolError> {
        let mut port = open_port(name, baud)?;
        clear_buffers(port.as_mut())?;
        Ok(Box::new(SerialChannel::new(port)))
    }
}
