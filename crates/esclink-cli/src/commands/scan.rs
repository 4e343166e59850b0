//! `esclink scan` - find ESCs and print their identity

use anyhow::Result;
use serde::Serialize;

use esclink_core::boards::board_description;
use esclink_core::protocol::Protocol;

use super::connect;
use crate::cli::LinkArgs;

#[derive(Serialize)]
struct EscReport {
    id: u8,
    board: String,
    hardware: u16,
    firmware: u16,
    firmware_hash: String,
    bootloader: u16,
    bootloader_hash: String,
    uid: String,
}

pub fn run(link: &LinkArgs, json: bool) -> Result<()> {
    let (mut conn, outcome) = connect(link)?;

    // give slow devices a moment to identify themselves beyond the
    // handshake probes
    std::thread::sleep(std::time::Duration::from_millis(250));

    let reports: Vec<EscReport> = conn
        .escs()
        .iter()
        .map(|esc| EscReport {
            id: esc.id,
            board: board_description(esc.version.hardware).to_string(),
            hardware: esc.version.hardware,
            firmware: esc.version.firmware,
            firmware_hash: esc.version.fw_git_hash.clone(),
            bootloader: esc.version.bootloader,
            bootloader_hash: esc.version.boot_git_hash.clone(),
            uid: esc.version.uid_hex(),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        println!("Detected protocol: {}", Protocol::Firmware);
        println!("---------------------");
        for r in &reports {
            println!("  ID         : {}", r.id);
            println!("  Board      : version {}: {}", r.hardware, r.board);
            println!("  UID        : {}", r.uid);
            println!("  Firmware   : version {:4}, hash {}", r.firmware, r.firmware_hash);
            println!("  Bootloader : version {:4}, hash {}", r.bootloader, r.bootloader_hash);
            println!();
        }
        println!("---------------------");
        println!("{} ESC(s) on {} @ {}", reports.len(), outcome.port, outcome.baud);
    }

    conn.close();
    Ok(())
}
