//! ESC serial protocol
//!
//! Implements the dual-mode wire protocol spoken by the ESC family: the
//! firmware protocol used for normal operation (identification, telemetry,
//! power/RPM commands, configuration) and the bootloader protocol used only
//! for firmware installation. The two modes use incompatible framing and
//! must never be mixed on one open connection.

pub mod connection;
mod error;
pub mod packet;
pub mod serial;
pub mod transport;

pub use connection::{BootAck, Connection, ConnectionConfig, ConnectionState};
pub use error::ProtocolError;
pub use packet::{Frame, FrameBody, FrameDecoder};
pub use serial::{clear_buffers, configure_port, list_ports, open_port, PortInfo};
pub use transport::{Channel, PortProvider, SerialChannel, SystemPorts};

use serde::{Deserialize, Serialize};

/// Device ID addressing every ESC on the bus.
pub const BROADCAST_ID: u8 = 255;

/// Baud rates the firmware protocol is known to run at, in descending order
/// of likelihood. Scans walk this list front to back.
pub const FIRMWARE_BAUD_RATES: &[u32] = &[
    250_000, 921_600, 230_400, 57_600, 115_200, 2_000_000, 6_000_000,
];

/// Baud rates the bootloader protocol is known to run at.
pub const BOOTLOADER_BAUD_RATES: &[u32] = &[38_400, 230_400];

/// Default bootloader baud rate used by the firmware-upload flow.
pub const DEFAULT_BOOTLOADER_BAUD: u32 = 230_400;

/// Largest frame payload the protocol can express (one length byte).
pub const MAX_PAYLOAD: usize = 255;

/// Lowest permitted command rate. ESCs apply a local command-timeout
/// failsafe; sending slower than this will trip it.
pub const MIN_COMMAND_RATE_HZ: u32 = 10;

/// Default command rate for the periodic sender.
pub const DEFAULT_COMMAND_RATE_HZ: u32 = 100;

/// The two mutually exclusive operating modes of an ESC.
///
/// Framing differs per mode (distinct sync bytes and frame-type spaces), so
/// the mode is a property of the open connection, not of individual frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Normal operating protocol: telemetry and command frames.
    Firmware,
    /// Firmware-installation protocol.
    Bootloader,
}

impl Protocol {
    /// Sync byte opening every frame in this mode.
    pub fn sync_byte(self) -> u8 {
        match self {
            Protocol::Firmware => 0xAF,
            Protocol::Bootloader => 0xB5,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Firmware => write!(f, "firmware"),
            Protocol::Bootloader => write!(f, "bootloader"),
        }
    }
}
