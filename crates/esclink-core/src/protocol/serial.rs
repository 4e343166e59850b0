//! Serial port handling
//!
//! Low-level serial access for ESC communication: enumeration with
//! deterministic ordering, open with 8-N-1 framing, buffer clearing.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::time::Duration;

use super::ProtocolError;

/// Read timeout applied to freshly opened ports. The receiver loop polls,
/// so this only bounds individual read calls.
const OPEN_TIMEOUT: Duration = Duration::from_millis(10);

/// Information about an available serial port.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3").
    pub name: String,

    /// USB vendor ID (if USB device).
    pub vid: Option<u16>,

    /// USB product ID (if USB device).
    pub pid: Option<u16>,

    /// Manufacturer name (if available).
    pub manufacturer: Option<String>,

    /// Product name (if available).
    pub product: Option<String>,

    /// Serial number (if available).
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// Free-text description used for candidate matching: product and
    /// manufacturer strings joined, lowercased.
    pub fn description(&self) -> String {
        let mut parts = Vec::new();
        if let Some(p) = &self.product {
            parts.push(p.as_str());
        }
        if let Some(m) = &self.manufacturer {
            parts.push(m.as_str());
        }
        parts.join(" ").to_lowercase()
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, product, serial_number) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.manufacturer,
                usb_info.product,
                usb_info.serial_number,
            ),
            _ => (None, None, None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            manufacturer,
            product,
            serial_number,
        }
    }
}

/// Helper used to sort port names so that:
///  - ttyACM* ports come first (sorted numerically by suffix)
///  - then ttyUSB* ports (sorted numerically)
///  - then other ports (sorted by name)
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List all available serial ports, with /dev fallbacks and deterministic
/// ordering.
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // Linux-only: add /dev/ttyACM* and /dev/ttyUSB* entries present on disk
    // but not reported by the API
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone()).or_insert_with(|| PortInfo {
                        name: full,
                        vid: None,
                        pid: None,
                        manufacturer: None,
                        product: None,
                        serial_number: None,
                    });
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Open a serial port at the given baud rate with an exclusive OS-level
/// lock. A port already held by another session fails immediately.
pub fn open_port(name: &str, baud: u32) -> Result<Box<dyn SerialPort>, ProtocolError> {
    let mut port = serialport::new(name, baud)
        .timeout(OPEN_TIMEOUT)
        .open()
        .map_err(|e| ProtocolError::PortUnavailable(format!("{}: {}", name, e)))?;
    configure_port(port.as_mut())?;
    Ok(port)
}

/// Configure a serial port for ESC communication: 8-N-1, no flow control.
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.set_data_bits(serialport::DataBits::Eight)
        .map_err(io_err)?;
    port.set_parity(serialport::Parity::None).map_err(io_err)?;
    port.set_stop_bits(serialport::StopBits::One).map_err(io_err)?;
    port.set_flow_control(serialport::FlowControl::None)
        .map_err(io_err)?;
    Ok(())
}

/// Clear the serial port buffers.
pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.clear(serialport::ClearBuffer::All).map_err(io_err)
}

fn io_err(e: serialport::Error) -> ProtocolError {
    ProtocolError::Io(std::io::Error::other(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_ports() {
        // just ensures enumeration doesn't panic on any host
        let ports = list_ports();
        for port in &ports {
            println!("Found port: {} - {:?}", port.name, port.product);
        }
    }

    #[test]
    fn test_port_sorting() {
        let names = vec![
            "/dev/ttyUSB1",
            "/dev/ttyACM1",
            "/dev/ttyUSB0",
            "/dev/ttyACM0",
            "/dev/someport",
            "/dev/ttyACM10",
        ];
        let mut ports: Vec<PortInfo> = names
            .into_iter()
            .map(|n| PortInfo {
                name: n.to_string(),
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
                serial_number: None,
            })
            .collect();

        ports.sort_by_key(|p| port_sort_key(&p.name));
        let ordered: Vec<String> = ports.into_iter().map(|p| p.name).collect();

        assert_eq!(
            ordered,
            vec![
                "/dev/ttyACM0",
                "/dev/ttyACM1",
                "/dev/ttyACM10",
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "/dev/someport",
            ]
        );
    }

    #[test]
    fn description_joins_and_lowercases() {
        let p = PortInfo {
            name: "/dev/ttyUSB0".into(),
            vid: Some(0x0403),
            pid: Some(0x6001),
            manufacturer: Some("FTDI".into()),
            product: Some("TTL232R USB UART".into()),
            serial_number: None,
        };
        assert_eq!(p.description(), "ttl232r usb uart ftdi");
    }
}
