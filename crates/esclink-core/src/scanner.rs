//! Discovery scanner
//!
//! Finds a responsive ESC population without any prior knowledge of port or
//! baud rate: every candidate port is probed across the firmware baud rates
//! first, then across the bootloader baud rates. The first (port, baud,
//! mode) triple that yields at least one device wins. Ports are closed
//! between unsuccessful attempts; a scan that finds nothing is a valid
//! outcome, not an error.
//!
//! All scan state lives in an explicit [`ScanConfig`] passed per call;
//! there is no process-wide configuration.

use std::time::Duration;

use serde::Serialize;

use crate::protocol::{
    Connection, ConnectionConfig, PortProvider, Protocol, BOOTLOADER_BAUD_RATES,
    FIRMWARE_BAUD_RATES,
};

/// Port-description keywords that mark a serial port as a UART candidate.
pub const PORT_DESCRIPTION_KEYWORDS: &[&str] = &["uart", "serial", "vcp", "ttl232", "stlink"];

/// Scanner configuration. [`Default`] gives the full sweep; set `device`
/// and/or `baudrate` to skip enumeration and probe a single pair.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Probe only this port, skipping enumeration.
    pub device: Option<String>,
    /// Probe only this baud rate (applies to both protocol passes).
    pub baudrate: Option<u32>,
    /// Firmware-mode baud candidates, most likely first.
    pub firmware_baudrates: Vec<u32>,
    /// Bootloader-mode baud candidates.
    pub bootloader_baudrates: Vec<u32>,
    /// Settle interval after each probe before checking for responses.
    pub settle: Duration,
    /// Probes per (port, baud, mode) attempt.
    pub probe_attempts: u32,
    /// Keywords matched against lowercased port descriptions during
    /// enumeration.
    pub description_keywords: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            device: None,
            baudrate: None,
            firmware_baudrates: FIRMWARE_BAUD_RATES.to_vec(),
            bootloader_baudrates: BOOTLOADER_BAUD_RATES.to_vec(),
            settle: Duration::from_millis(25),
            probe_attempts: 3,
            description_keywords: PORT_DESCRIPTION_KEYWORDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ScanConfig {
    /// Config for an explicit (device, baud) override, as supplied on a
    /// command line. `None` fields fall back to the full candidate lists.
    pub fn with_override(device: Option<String>, baudrate: Option<u32>) -> Self {
        Self {
            device,
            baudrate,
            ..Self::default()
        }
    }
}

/// A successful scan: where the devices answered, and in which mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanOutcome {
    /// Port name.
    pub port: String,
    /// Baud rate the devices answered at.
    pub baud: u32,
    /// Protocol mode they answered in.
    pub protocol: Protocol,
}

/// Run a scan. Returns `None` when exhaustive probing finds no device:
/// a valid "no device present" outcome, distinct from a transport fault
/// (transport faults on individual probes are logged and skipped).
pub fn scan(config: &ScanConfig, provider: &dyn PortProvider) -> Option<ScanOutcome> {
    let candidates = candidate_ports(config, provider);
    if candidates.is_empty() {
        tracing::info!("no UART port candidates found");
        return None;
    }

    let (fw_bauds, boot_bauds) = match config.baudrate {
        Some(b) => (vec![b], vec![b]),
        None => (
            config.firmware_baudrates.clone(),
            config.bootloader_baudrates.clone(),
        ),
    };
    let probe_cfg = ConnectionConfig {
        probe_attempts: config.probe_attempts,
        probe_interval: config.settle,
        ..ConnectionConfig::default()
    };

    // firmware pass across every port before any bootloader probing
    for port in &candidates {
        for &baud in &fw_bauds {
            tracing::info!(port = %port, baud, "scanning for ESC firmware");
            match Connection::open_with(provider, port, baud, probe_cfg.clone()) {
                Ok(mut conn) => {
                    conn.close();
                    return Some(ScanOutcome {
                        port: port.clone(),
                        baud,
                        protocol: Protocol::Firmware,
                    });
                }
                Err(e) => tracing::debug!(port = %port, baud, "firmware probe failed: {e}"),
            }
        }
    }

    for port in &candidates {
        for &baud in &boot_bauds {
            tracing::info!(port = %port, baud, "scanning for ESC bootloader");
            match Connection::open_bootloader_with(provider, port, baud, probe_cfg.clone()) {
                Ok(mut conn) => {
                    conn.close();
                    return Some(ScanOutcome {
                        port: port.clone(),
                        baud,
                        protocol: Protocol::Bootloader,
                    });
                }
                Err(e) => tracing::debug!(port = %port, baud, "bootloader probe failed: {e}"),
            }
        }
    }

    None
}

fn candidate_ports(config: &ScanConfig, provider: &dyn PortProvider) -> Vec<String> {
    if let Some(device) = &config.device {
        return vec![device.clone()];
    }

    let ports = provider.list();
    tracing::info!("all serial ports:");
    for p in &ports {
        tracing::info!("  {} : {}", p.name, p.description());
    }

    let candidates: Vec<String> = ports
        .iter()
        .filter(|p| {
            let desc = p.description();
            config
                .description_keywords
                .iter()
                .any(|k| desc.contains(k.as_str()))
        })
        .map(|p| p.name.clone())
        .collect();

    tracing::info!("UART port candidates: {:?}", candidates);
    candidates
}
