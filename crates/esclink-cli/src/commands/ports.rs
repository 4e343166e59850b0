//! `esclink ports` - list host serial ports

use anyhow::Result;
use esclink_core::protocol::{PortProvider, SystemPorts};
use esclink_core::scanner::PORT_DESCRIPTION_KEYWORDS;

pub fn run() -> Result<()> {
    let ports = SystemPorts.list();
    if ports.is_empty() {
        println!("No serial ports found.");
        return Ok(());
    }

    println!("All serial ports:");
    for p in &ports {
        let desc = p.description();
        let candidate = PORT_DESCRIPTION_KEYWORDS.iter().any(|k| desc.contains(k));
        println!(
            "  {}  {}  {}",
            p.name,
            if desc.is_empty() { "-" } else { &desc },
            if candidate { "[candidate]" } else { "" }
        );
    }
    Ok(())
}
