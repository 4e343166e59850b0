//! Command implementations

pub mod led;
pub mod ports;
pub mod scan;
pub mod spin;
pub mod upload_firmware;
pub mod upload_params;
pub mod verify_params;

use anyhow::{bail, Result};
use esclink_core::protocol::{Connection, Protocol, SystemPorts};
use esclink_core::scanner::{self, ScanConfig, ScanOutcome};

use crate::cli::LinkArgs;

/// Scan with the caller's overrides and open the bus in firmware mode.
pub fn connect(link: &LinkArgs) -> Result<(Connection, ScanOutcome)> {
    let ports = SystemPorts;
    let config = ScanConfig::with_override(link.device.clone(), link.baud_rate);

    let Some(outcome) = scanner::scan(&config, &ports) else {
        bail!("no ESCs detected");
    };
    tracing::debug!(?outcome, "scan succeeded");
    println!(
        "ESC(s) detected on port: {}, baud rate: {} ({})",
        outcome.port, outcome.baud, outcome.protocol
    );

    if outcome.protocol != Protocol::Firmware {
        bail!(
            "ESCs answered in bootloader mode; run upload-firmware to \
             install firmware or power-cycle the bus"
        );
    }

    let conn = Connection::open(&ports, &outcome.port, outcome.baud)?;
    Ok((conn, outcome))
}
