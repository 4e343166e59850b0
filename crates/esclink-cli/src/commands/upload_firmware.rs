//! `esclink upload-firmware` - install a firmware image on one ESC

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};

use esclink_core::protocol::{Connection, Protocol, ProtocolError, SystemPorts};
use esclink_core::scanner::{self, ScanConfig};

use crate::cli::LinkArgs;

pub fn run(
    link: &LinkArgs,
    firmware_file: &Path,
    id: u8,
    bootloader_baud: u32,
    skip_firmware_reset: bool,
) -> Result<()> {
    let image = std::fs::read(firmware_file)
        .with_context(|| format!("unable to read firmware file {}", firmware_file.display()))?;

    let ports = SystemPorts;
    let mut conn = if skip_firmware_reset {
        let Some(device) = &link.device else {
            bail!("--skip-firmware-reset requires --device");
        };
        Connection::open_bootloader(&ports, device, bootloader_baud)?
    } else {
        bootload_via_reset(&ports, link, id, bootloader_baud)?
    };

    println!(
        "Installing firmware to ESC ID {} : {}",
        id,
        firmware_file.display()
    );

    let mut failure = None;
    {
        let upload = conn.upload_firmware(&image, id)?;
        let bar = ProgressBar::new(upload.total_chunks() as u64);
        bar.set_style(
            ProgressStyle::with_template("  {percent:>3}% [{bar:50}] {pos}/{len} chunks")?
                .progress_chars("## "),
        );

        for step in upload {
            match step {
                Ok(_) => bar.inc(1),
                Err(e) => {
                    bar.abandon();
                    failure = Some(e);
                    break;
                }
            }
        }
        if failure.is_none() {
            bar.finish();
        }
    }

    conn.close();
    if let Some(e) = failure {
        return Err(e).context("an error occurred during the write process");
    }
    println!("Firmware successfully updated for ESC id {}", id);
    Ok(())
}

/// Find the bus in firmware mode, reset the target out of it, and reopen
/// in bootloader framing at the bootloader baud rate.
fn bootload_via_reset(
    ports: &SystemPorts,
    link: &LinkArgs,
    id: u8,
    bootloader_baud: u32,
) -> Result<Connection> {
    let config = ScanConfig::with_override(link.device.clone(), link.baud_rate);
    let Some(outcome) = scanner::scan(&config, ports) else {
        bail!("no ESC(s) detected");
    };
    println!(
        "ESC(s) detected on port: {}, baud rate: {} ({})",
        outcome.port, outcome.baud, outcome.protocol
    );

    // already sitting in the bootloader: nothing to reset
    if outcome.protocol == Protocol::Bootloader {
        return Ok(Connection::open_bootloader(
            ports,
            &outcome.port,
            outcome.baud,
        )?);
    }

    let mut conn = Connection::open(ports, &outcome.port, outcome.baud)?;
    std::thread::sleep(Duration::from_millis(250));

    // best-effort reset: an absent ID is a visible warning, not a hard
    // stop, because a manual power-cycle works just as well
    match conn.reset(id) {
        Ok(()) => {
            println!("Sending reset command to ESC ID {}", id);
            std::thread::sleep(Duration::from_millis(250));
        }
        Err(ProtocolError::DeviceNotFound(_)) => {
            eprintln!(
                "WARNING: ESC ID {} not detected; perform a manual power cycle now",
                id
            );
        }
        Err(e) => return Err(e.into()),
    }

    conn.switch_protocol(ports, Protocol::Bootloader, bootloader_baud)
        .context("device did not come back in bootloader mode")?;
    Ok(conn)
}
